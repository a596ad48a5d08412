//! Runtime configuration.
//!
//! Settings recognised by the runtime, with their YAML paths:
//!
//! - `fiber.stack_size`: bytes per fiber stack (default 1 MiB)
//! - `tcp.connect.timeout`: default connect timeout in ms (default 5000)
//! - `tcp_server.read_time`: initial recv timeout applied to accepted
//!   sockets, in ms (default 120000)
//!
//! The configuration is loaded once, from the YAML file named by the
//! `FIBRIO_CONFIG` environment variable. A missing variable or file means
//! defaults. A malformed file is an error at first access.

use std::fs::File;
use std::path::Path;

use log::error;

use crate::error::Error;

pub const DEFAULT_FIBER_STACK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_TCP_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_TCP_SERVER_READ_TIME_MS: u64 = 120_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fiber: FiberConfig,
    pub tcp: TcpConfig,
    pub tcp_server: TcpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    pub stack_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub connect: TcpConnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConnectConfig {
    pub timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpServerConfig {
    pub read_time: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fiber: FiberConfig::default(),
            tcp: TcpConfig::default(),
            tcp_server: TcpServerConfig::default(),
        }
    }
}

impl Default for FiberConfig {
    fn default() -> Self {
        FiberConfig {
            stack_size: DEFAULT_FIBER_STACK_SIZE,
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            connect: TcpConnectConfig::default(),
        }
    }
}

impl Default for TcpConnectConfig {
    fn default() -> Self {
        TcpConnectConfig {
            timeout: DEFAULT_TCP_CONNECT_TIMEOUT_MS,
        }
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        TcpServerConfig {
            read_time: DEFAULT_TCP_SERVER_READ_TIME_MS,
        }
    }
}

impl Config {
    /// Parse a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path).map_err(Error::IO)?;
        let config = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    fn from_env() -> Self {
        let path = match std::env::var("FIBRIO_CONFIG") {
            Ok(p) => p,
            Err(_) => return Config::default(),
        };
        match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {}", path, e);
                Config::default()
            }
        }
    }
}

lazy_static! {
    static ref CONFIG: Config = Config::from_env();
}

/// The process-wide configuration.
pub fn get() -> &'static Config {
    &CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.fiber.stack_size, DEFAULT_FIBER_STACK_SIZE);
        assert_eq!(config.tcp.connect.timeout, DEFAULT_TCP_CONNECT_TIMEOUT_MS);
        assert_eq!(config.tcp_server.read_time, DEFAULT_TCP_SERVER_READ_TIME_MS);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config: Config = serde_yaml::from_str("tcp:\n  connect:\n    timeout: 250\n").unwrap();
        assert_eq!(config.tcp.connect.timeout, 250);
        assert_eq!(config.fiber.stack_size, DEFAULT_FIBER_STACK_SIZE);
    }
}
