pub mod connection;
pub mod dispatch;
pub mod metrics;
pub mod notifier;
pub mod protocol;
pub mod server;
pub mod stats;

pub use connection::handle_connection;
pub use dispatch::dispatch_command;
pub use metrics::{LatencySnapshot, Metrics, MetricsSnapshot};
pub use notifier::Notifier;
pub use protocol::{RespError, RespParser};
pub use server::{LeaderCheck, Server};
pub use stats::{ServerInfo, ServerStats};
