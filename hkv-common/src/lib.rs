//! hkv-common - Shared error taxonomy, configuration schema, and logical
//! clocks used by every other HyperKV crate. No I/O lives here.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{CausalOrder, HlcTimestamp, HybridLogicalClock, VectorClock, VectorClockSnapshot};
pub use config::Config;
pub use error::{ErrorKind, HkvError, HkvResult};
