pub mod broker;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;

pub use config::{GatewayConfig, LongPollingConfig};
pub use error::{GatewayError, Result};
