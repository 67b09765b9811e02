pub mod certs;
pub mod command;
pub mod config;
pub mod device;
pub mod downloader;
pub mod error;
pub mod failover;
pub mod io;
pub mod locator;
pub mod manager;
pub mod ota;
pub mod retry;
pub mod status;
pub mod topics;

#[cfg(test)]
mod testing;

pub use command::{CommandAction, CommandError, RemoteCommand};
pub use config::{ConfigOverride, NodeSettings};
pub use device::Device;
pub use error::ErrorKind;
pub use io::{
    FileStore, FirmwareInstaller, HttpResponse, HttpSession, InstallFailure, Network, Restarter,
    StatusSink,
};
pub use manager::{format_mac, ConfigManager, ParamError};
pub use topics::Topics;
