use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Built-in conflict strategies that can be selected from configuration.
/// Caller-supplied resolvers are registered in code instead.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::Merge => "merge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "server-wins" | "server_wins" | "server" => Some(ConflictStrategy::ServerWins),
            "client-wins" | "client_wins" | "client" => Some(ConflictStrategy::ClientWins),
            "merge" => Some(ConflictStrategy::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub mutations: MutationConfig,
    pub realtime: RealtimeConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
    #[serde(default)]
    pub conflict_policy: ConflictStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub retry_on_error: bool,
    pub resubscribe_delay_ms: u64,
    pub health_check_interval_secs: u64,
    pub health_retry_base_ms: u64,
    pub health_max_attempts: u32,
    pub stale_threshold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:data/condo.db?mode=rwc".to_string(),
                max_connections: 5,
            },
            mutations: MutationConfig::default(),
            realtime: RealtimeConfig::default(),
            notifications: NotificationConfig { capacity: 50 },
            logging: LoggingConfig {
                filter: "condo_realtime=debug,info".to_string(),
                json: false,
            },
        }
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            attempt_timeout_ms: None,
            conflict_policy: ConflictStrategy::ServerWins,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            retry_on_error: true,
            resubscribe_delay_ms: 2_000,
            health_check_interval_secs: 30,
            health_retry_base_ms: 2_000,
            health_max_attempts: 3,
            stale_threshold_secs: 300, // 5 minutes
        }
    }
}

impl MutationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }
}

impl RealtimeConfig {
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_retry_base(&self) -> Duration {
        Duration::from_millis(self.health_retry_base_ms)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_secs as i64)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CONDO_DATABASE_URL")
            && !v.trim().is_empty()
        {
            cfg.database.url = v.trim().to_string();
        }
        if let Ok(v) = std::env::var("CONDO_MAX_RETRIES")
            && let Some(value) = parse_u32(&v)
        {
            cfg.mutations.max_retries = value;
        }
        if let Ok(v) = std::env::var("CONDO_RETRY_DELAY_MS")
            && let Some(value) = parse_u64(&v)
        {
            cfg.mutations.retry_delay_ms = value;
        }
        if let Ok(v) = std::env::var("CONDO_ATTEMPT_TIMEOUT_MS")
            && let Some(value) = parse_u64(&v)
        {
            // 0 disables the per-attempt budget
            cfg.mutations.attempt_timeout_ms = if value == 0 { None } else { Some(value) };
        }
        if let Ok(v) = std::env::var("CONDO_CONFLICT_POLICY")
            && let Some(policy) = ConflictStrategy::parse(&v)
        {
            cfg.mutations.conflict_policy = policy;
        }
        if let Ok(v) = std::env::var("CONDO_RETRY_ON_ERROR") {
            cfg.realtime.retry_on_error = parse_bool(&v, cfg.realtime.retry_on_error);
        }
        if let Ok(v) = std::env::var("CONDO_RESUBSCRIBE_DELAY_MS")
            && let Some(value) = parse_u64(&v)
        {
            cfg.realtime.resubscribe_delay_ms = value;
        }
        if let Ok(v) = std::env::var("CONDO_HEALTH_INTERVAL_SECS")
            && let Some(value) = parse_u64(&v)
        {
            cfg.realtime.health_check_interval_secs = value.max(1);
        }
        if let Ok(v) = std::env::var("CONDO_STALE_THRESHOLD_SECS")
            && let Some(value) = parse_u64(&v)
        {
            cfg.realtime.stale_threshold_secs = value;
        }
        if let Ok(v) = std::env::var("CONDO_NOTIFICATION_CAPACITY")
            && let Some(value) = parse_u64(&v)
        {
            cfg.notifications.capacity = (value as usize).max(1);
        }
        if let Ok(v) = std::env::var("CONDO_LOG_JSON") {
            cfg.logging.json = parse_bool(&v, cfg.logging.json);
        }

        cfg
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

fn parse_u32(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok()
}
