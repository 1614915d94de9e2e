//! Client configuration.

use clap::Parser;
use std::time::Duration;

/// gtun - bridge a local TUN device to a gtun tunnel server.
#[derive(Parser, Debug, Clone)]
#[command(name = "gtun")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Tunnel server address (host:port)
    #[arg(short, long, env = "GTUN_SERVER", default_value = "120.25.214.63:9621")]
    pub server: String,

    /// Local TUN device name
    #[arg(long, env = "GTUN_DEV", default_value = "gtun")]
    pub dev: String,

    /// Client authorization key
    #[arg(long, env = "GTUN_KEY", default_value = "gtun_authorize")]
    pub key: String,

    /// Delay between connection attempts in seconds
    #[arg(long, env = "GTUN_RETRY_DELAY", default_value = "3")]
    pub retry_delay: u64,

    /// Connection attempts per (re)connect before giving up
    #[arg(long, env = "GTUN_MAX_ATTEMPTS", default_value = "10",
          value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: u32,

    /// Prefix length of the assigned tunnel address
    #[arg(long, env = "GTUN_PREFIX_LEN", default_value = "24",
          value_parser = clap::value_parser!(u8).range(1..=32))]
    pub prefix_len: u8,

    /// Enable debug logging
    #[arg(long, env = "GTUN_DEBUG")]
    pub debug: bool,
}

impl ClientConfig {
    /// Freeze the settings the supervisor needs for the whole session.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            server: self.server.clone(),
            device: self.dev.clone(),
            key: self.key.clone(),
            retry_delay: Duration::from_secs(self.retry_delay),
            max_attempts: self.max_attempts,
            prefix_len: self.prefix_len,
        }
    }
}

/// Immutable settings handed to the supervisor once at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server: String,
    pub device: String,
    pub key: String,
    /// Fixed pause between two connection attempts.
    pub retry_delay: Duration,
    /// Attempts allowed in one connect cycle; dial and handshake failures both count.
    pub max_attempts: u32,
    pub prefix_len: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: "120.25.214.63:9621".to_string(),
            device: "gtun".to_string(),
            key: "gtun_authorize".to_string(),
            retry_delay: Duration::from_secs(3),
            max_attempts: 10,
            prefix_len: 24,
        }
    }
}
