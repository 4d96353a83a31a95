//! Compiled-in limits and timing defaults.
//!
//! Every value here can be overridden from the command line; nothing is read
//! from files or the environment.

use std::time::Duration;

pub const DEFAULT_CONFIG_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_SHARD_ADDR: &str = "127.0.0.1:6969";

pub const MAX_WORKERS: u16 = 10;
pub const MAX_CACHE_CAPACITY: u16 = 1000;
pub const MAX_SHARDS: usize = 100;
pub const MAX_FOLLOWERS_PER_MASTER: usize = 3;
pub const MAX_KEY_LEN: usize = 256;

/// Timer settings shared by the configuration service and shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Delay between two heartbeats from one shard.
    pub heartbeat_interval: Duration,
    /// Grace period added on top of the interval before a shard expires.
    pub heartbeat_slack: Duration,
    /// Delay between two maintenance sweeps of the registry.
    pub sweep_interval: Duration,
    /// Read/write/connect deadline for every socket.
    pub io_timeout: Duration,
}

impl Timing {
    /// How long a heartbeat keeps a shard alive.
    pub fn expiry_window(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_slack
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_slack: Duration::from_millis(2000),
            sweep_interval: Duration::from_millis(1000),
            io_timeout: Duration::from_millis(5000),
        }
    }
}
