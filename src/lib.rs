pub mod cli;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod signal;

pub use cli::{Command, prompt};
pub use config::{ClientConfig, ServerConfig};
pub use protocol::{Client, ClientError, Server, ServerError};
pub use service::{DemoService, Service};
pub use signal::{Shutdown, SignalKind};
