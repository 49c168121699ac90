use crate::application::ports::ConnectivityProbe;
use crate::application::services::optimistic_update::backoff::linear_delay;
use crate::domain::entities::ConnectionState;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HealthCheckSettings {
    pub interval: Duration,
    pub retry_base: Duration,
    pub max_attempts: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retry_base: Duration::from_millis(2_000),
            max_attempts: 3,
        }
    }
}

/// Runs one health round: probes until a success or `max_attempts`
/// consecutive failures, reporting each intermediate state. Waits
/// `retry_base * attempt` between attempts.
pub async fn check_connection(
    probe: &dyn ConnectivityProbe,
    settings: &HealthCheckSettings,
    mut report: impl FnMut(ConnectionState),
) -> ConnectionState {
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match probe.probe().await {
            Ok(()) => {
                report(ConnectionState::Connected);
                return ConnectionState::Connected;
            }
            Err(err) if attempt >= max_attempts => {
                warn!(
                    target: "realtime::health",
                    attempts = attempt,
                    error = %err,
                    "health check failed repeatedly"
                );
                report(ConnectionState::Error);
                return ConnectionState::Error;
            }
            Err(err) => {
                let delay = linear_delay(settings.retry_base, attempt);
                debug!(
                    target: "realtime::health",
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "health check failed, retrying"
                );
                report(ConnectionState::Reconnecting);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::AppError;
    use async_trait::async_trait;
    use mockall::{Sequence, mock};
    use tokio::time::Instant;

    mock! {
        pub Probe {}

        #[async_trait]
        impl ConnectivityProbe for Probe {
            async fn probe(&self) -> Result<(), AppError>;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_settle_into_error() {
        let mut probe = MockProbe::new();
        probe
            .expect_probe()
            .times(3)
            .returning(|| Err(AppError::Network("unreachable".into())));
        let started = Instant::now();
        let mut seen = Vec::new();

        let state = check_connection(&probe, &HealthCheckSettings::default(), |state| {
            seen.push(state)
        })
        .await;

        assert_eq!(state, ConnectionState::Error);
        assert_eq!(
            seen,
            vec![
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Error,
            ]
        );
        // 2s after the first failure, 4s after the second
        assert_eq!(started.elapsed(), Duration::from_millis(6_000));
    }

    #[tokio::test(start_paused = true)]
    async fn one_success_resets_to_connected() {
        let mut seq = Sequence::new();
        let mut probe = MockProbe::new();
        probe
            .expect_probe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(AppError::Network("flaky".into())));
        probe
            .expect_probe()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        let mut seen = Vec::new();

        let state = check_connection(&probe, &HealthCheckSettings::default(), |state| {
            seen.push(state)
        })
        .await;

        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(
            seen,
            vec![ConnectionState::Reconnecting, ConnectionState::Connected]
        );
    }
}
