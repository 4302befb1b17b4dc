use std::{
    env,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use thiserror::Error;

use crate::backend::ConcurrencyMode;
use crate::rpc::dispatch::DEFAULT_MOUNT_PATH;

pub const BIND_ADDR_ENV: &str = "RPC_BIND_ADDR";
pub const BIND_PORT_ENV: &str = "RPC_BIND_PORT";
pub const SERVER_NAME_ENV: &str = "RPC_SERVER_NAME";
pub const SERVER_MID_ENV: &str = "RPC_SERVER_MID";
pub const CONCURRENCY_ENV: &str = "RPC_CONCURRENCY";
pub const WORKERS_ENV: &str = "RPC_WORKERS";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "RPC_SHUTDOWN_TIMEOUT_SECS";
pub const STARTUP_TIMEOUT_ENV: &str = "RPC_STARTUP_TIMEOUT_SECS";
pub const CONTROL_ENV: &str = "RPC_CONTROL";
pub const MOUNT_PATH_ENV: &str = "RPC_MOUNT_PATH";

/// How a process talks to whoever launched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlChannel {
    None,
    Stdio,
}

impl ControlChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Stdio => "stdio",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub server_name: String,
    pub server_mid: Option<String>,
    pub mount_path: String,
    pub concurrency: ConcurrencyMode,
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub startup_timeout: Duration,
    pub control: ControlChannel,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RPC_BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("RPC_CONCURRENCY must be one of: thread, process")]
    InvalidConcurrency,
    #[error("RPC_WORKERS must be a positive integer")]
    InvalidWorkers,
    #[error("{0} must be a whole number of seconds")]
    InvalidTimeout(&'static str),
    #[error("RPC_CONTROL must be one of: none, stdio")]
    InvalidControl,
    #[error("RPC_MOUNT_PATH must start with '/'")]
    InvalidMountPath,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = value(BIND_ADDR_ENV).unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = value(BIND_PORT_ENV)
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8060);
        let server_name = value(SERVER_NAME_ENV).unwrap_or_else(|| "calculator".to_string());
        let server_mid = value(SERVER_MID_ENV);
        let mount_path = value(MOUNT_PATH_ENV).unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string());
        if !mount_path.starts_with('/') {
            return Err(ConfigError::InvalidMountPath);
        }
        let concurrency = value(CONCURRENCY_ENV)
            .map(|value| {
                value
                    .parse::<ConcurrencyMode>()
                    .map_err(|_| ConfigError::InvalidConcurrency)
            })
            .transpose()?
            .unwrap_or(ConcurrencyMode::Thread);
        let workers = value(WORKERS_ENV)
            .map(|value| match value.parse::<usize>() {
                Ok(workers) if workers > 0 => Ok(workers),
                _ => Err(ConfigError::InvalidWorkers),
            })
            .transpose()?
            .unwrap_or(crate::backend::thread::DEFAULT_WORKERS);
        let shutdown_timeout = parse_seconds(value(SHUTDOWN_TIMEOUT_ENV), SHUTDOWN_TIMEOUT_ENV)?
            .unwrap_or(crate::backend::DEFAULT_SHUTDOWN_TIMEOUT);
        let startup_timeout = parse_seconds(value(STARTUP_TIMEOUT_ENV), STARTUP_TIMEOUT_ENV)?
            .unwrap_or(crate::backend::process::DEFAULT_STARTUP_TIMEOUT);
        let control = match value(CONTROL_ENV).map(|value| value.to_ascii_lowercase()).as_deref() {
            None | Some("none") => ControlChannel::None,
            Some("stdio") => ControlChannel::Stdio,
            Some(_) => return Err(ConfigError::InvalidControl),
        };

        let config = Self {
            bind_addr,
            bind_port,
            server_name,
            server_mid,
            mount_path,
            concurrency,
            workers,
            shutdown_timeout,
            startup_timeout,
            control,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    /// Accepts IPv4 and IPv6 hosts, the latter with or without brackets.
    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        let host = self
            .bind_addr
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.bind_addr);
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidSocket)?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }
}

fn parse_seconds(value: Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    value
        .map(|value| {
            value
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidTimeout(key))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn parse_defaults() {
        let config = Config::from_lookup(lookup(&[])).expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8060);
        assert_eq!(config.server_name, "calculator");
        assert_eq!(config.concurrency, ConcurrencyMode::Thread);
        assert_eq!(config.workers, 4);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.control, ControlChannel::None);
        assert!(config.server_mid.is_none());
        assert_eq!(config.mount_path, "/");
    }

    #[test]
    fn parse_worker_settings() {
        let config = Config::from_lookup(lookup(&[
            (BIND_PORT_ENV, "0"),
            (CONCURRENCY_ENV, "process"),
            (CONTROL_ENV, "stdio"),
            (SERVER_MID_ENV, "abc123"),
            (WORKERS_ENV, "2"),
        ]))
        .expect("config should parse");

        assert_eq!(config.bind_socket().expect("socket").port(), 0);
        assert_eq!(config.concurrency, ConcurrencyMode::Process);
        assert_eq!(config.control, ControlChannel::Stdio);
        assert_eq!(config.server_mid.as_deref(), Some("abc123"));
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn ipv6_hosts_bind() {
        for host in ["::1", "[::1]"] {
            let config = Config::from_lookup(lookup(&[(BIND_ADDR_ENV, host), (BIND_PORT_ENV, "0")]))
                .expect("config should parse");
            let socket = config.bind_socket().expect("socket");
            assert!(socket.is_ipv6());
            assert_eq!(socket.to_string(), "[::1]:0");
        }
    }

    #[test]
    fn mount_path_must_be_absolute() {
        let config = Config::from_lookup(lookup(&[(MOUNT_PATH_ENV, "/rpc")]))
            .expect("config should parse");
        assert_eq!(config.mount_path, "/rpc");

        let err = Config::from_lookup(lookup(&[(MOUNT_PATH_ENV, "rpc")]))
            .expect_err("expected invalid mount path");
        assert!(matches!(err, ConfigError::InvalidMountPath));
    }

    #[test]
    fn invalid_port_fails() {
        let err = Config::from_lookup(lookup(&[(BIND_PORT_ENV, "70000")]))
            .expect_err("expected invalid port");
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn invalid_concurrency_fails() {
        let err = Config::from_lookup(lookup(&[(CONCURRENCY_ENV, "greenlet")]))
            .expect_err("expected invalid concurrency");
        assert!(matches!(err, ConfigError::InvalidConcurrency));
    }

    #[test]
    fn zero_workers_fails() {
        let err = Config::from_lookup(lookup(&[(WORKERS_ENV, "0")]))
            .expect_err("expected invalid workers");
        assert!(matches!(err, ConfigError::InvalidWorkers));
    }

    #[test]
    fn invalid_bind_addr_fails() {
        let err = Config::from_lookup(lookup(&[(BIND_ADDR_ENV, "not an address")]))
            .expect_err("expected invalid socket");
        assert!(matches!(err, ConfigError::InvalidSocket));
    }
}
