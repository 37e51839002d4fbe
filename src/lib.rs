pub mod config;
pub mod error;
pub mod host;
pub mod paths;
pub mod process;
mod shutdown;
mod supervisor;
mod timers;

pub use config::{load_config, save_config, SupervisorConfig};
pub use error::{AppError, ErrorKind, Result};
pub use supervisor::{HostBindings, ServicePorts, Supervisor};
