pub mod aggregator;
pub mod board;
pub mod health;

pub use aggregator::{RealtimeAggregator, RealtimeSettings, RealtimeView};
pub use board::ConnectionBoard;
pub use health::{HealthCheckSettings, check_connection};
