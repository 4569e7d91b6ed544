//! labvm-core — types shared by every labvm crate.
//!
//! - **`types`** — lifecycle operations (the queue wire format), workload
//!   status, and the status callback payload
//! - **`config`** — `labvm.toml` parser
//! - **`duration`** — `"5s"` / `"500ms"` / `"2m"` duration strings

pub mod config;
pub mod duration;
pub mod types;

pub use config::{ConfigError, LabConfig};
pub use duration::parse_duration;
pub use types::*;
