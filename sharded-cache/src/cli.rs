use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config_service::ConfigServiceOptions;
use crate::registry::RegistryLimits;
use crate::settings::{
    Timing, DEFAULT_CONFIG_ADDR, DEFAULT_SHARD_ADDR, MAX_CACHE_CAPACITY, MAX_FOLLOWERS_PER_MASTER,
    MAX_KEY_LEN, MAX_SHARDS, MAX_WORKERS,
};
use crate::shard::{ShardOptions, ShardRole};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the configuration service that tracks shards and routes keys.
    Config(ConfigArgs),
    /// Run a cache shard, as a master or as a follower.
    Shard(ShardArgs),
    /// Read one key through the cluster.
    Get(GetArgs),
    /// Write one key through the cluster.
    Put(PutArgs),
    /// Interactive get/put prompt.
    Shell(ShellArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_CONFIG_ADDR)]
    pub listen: SocketAddr,

    /// Worker threads serving connections.
    #[arg(
        long,
        default_value_t = MAX_WORKERS,
        value_parser = clap::value_parser!(u16).range(1..=MAX_WORKERS as i64)
    )]
    pub workers: u16,

    /// Expected delay between two heartbeats of a shard.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_ms: u64,

    /// Extra time a shard may stay silent before it expires.
    #[arg(long, default_value_t = 2000)]
    pub slack_ms: u64,

    /// Delay between two registry sweeps.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub sweep_ms: u64,

    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub io_timeout_ms: u64,

    /// Promote a follower when its master stops sending heartbeats.
    #[arg(long)]
    pub promote_on_failure: bool,
}

impl ConfigArgs {
    pub fn options(&self) -> ConfigServiceOptions {
        ConfigServiceOptions {
            workers: usize::from(self.workers),
            timing: Timing {
                heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
                heartbeat_slack: Duration::from_millis(self.slack_ms),
                sweep_interval: Duration::from_millis(self.sweep_ms),
                io_timeout: Duration::from_millis(self.io_timeout_ms),
            },
            limits: RegistryLimits {
                max_masters: MAX_SHARDS,
                max_followers: MAX_FOLLOWERS_PER_MASTER,
            },
            promote_on_failure: self.promote_on_failure,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ShardArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = DEFAULT_SHARD_ADDR)]
    pub listen: SocketAddr,

    /// Address of the configuration service.
    #[arg(long, default_value = DEFAULT_CONFIG_ADDR)]
    pub config: SocketAddr,

    /// Maximum number of cached keys.
    #[arg(
        long,
        default_value_t = MAX_CACHE_CAPACITY,
        value_parser = clap::value_parser!(u16).range(1..=MAX_CACHE_CAPACITY as i64)
    )]
    pub capacity: u16,

    /// Worker threads serving connections.
    #[arg(
        long,
        default_value_t = MAX_WORKERS,
        value_parser = clap::value_parser!(u16).range(1..=MAX_WORKERS as i64)
    )]
    pub workers: u16,

    /// Register as a follower instead of a master.
    #[arg(long)]
    pub follower: bool,

    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_ms: u64,

    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub io_timeout_ms: u64,
}

impl ShardArgs {
    pub fn options(&self) -> ShardOptions {
        let role = if self.follower {
            ShardRole::Follower
        } else {
            ShardRole::Master
        };
        ShardOptions {
            config_addr: self.config,
            role,
            capacity: usize::from(self.capacity),
            workers: usize::from(self.workers),
            timing: Timing {
                heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
                io_timeout: Duration::from_millis(self.io_timeout_ms),
                ..Timing::default()
            },
            max_followers: MAX_FOLLOWERS_PER_MASTER,
            max_key_len: MAX_KEY_LEN,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the configuration service.
    #[arg(long, default_value = DEFAULT_CONFIG_ADDR)]
    pub config: SocketAddr,

    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub io_timeout_ms: u64,
}

impl ClientArgs {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct GetArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct PutArgs {
    #[command(flatten)]
    pub client: ClientArgs,

    pub key: String,

    #[arg(allow_negative_numbers = true)]
    pub value: i32,
}

#[derive(Args, Debug, Clone)]
pub struct ShellArgs {
    #[command(flatten)]
    pub client: ClientArgs,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_compiled_limits() {
        let cli = Cli::try_parse_from(["sharded-cache", "shard"]).unwrap();
        let Command::Shard(args) = cli.command else {
            panic!("expected shard subcommand");
        };
        let options = args.options();
        assert_eq!(options.role, ShardRole::Master);
        assert_eq!(options.capacity, 1000);
        assert_eq!(options.workers, 10);
        assert_eq!(options.config_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(args.listen, "127.0.0.1:6969".parse().unwrap());
    }

    #[test]
    fn out_of_range_sizes_are_rejected() {
        assert!(Cli::try_parse_from(["sharded-cache", "shard", "--capacity", "1001"]).is_err());
        assert!(Cli::try_parse_from(["sharded-cache", "shard", "--capacity", "0"]).is_err());
        assert!(Cli::try_parse_from(["sharded-cache", "config", "--workers", "11"]).is_err());
    }

    #[test]
    fn zero_durations_are_rejected() {
        for args in [
            &["config", "--io-timeout-ms", "0"][..],
            &["config", "--heartbeat-ms", "0"],
            &["config", "--sweep-ms", "0"],
            &["shard", "--io-timeout-ms", "0"],
            &["shard", "--heartbeat-ms", "0"],
            &["get", "--io-timeout-ms", "0", "apple"],
            &["put", "--io-timeout-ms", "0", "apple", "1"],
            &["shell", "--io-timeout-ms", "0"],
        ] {
            let argv = std::iter::once("sharded-cache").chain(args.iter().copied());
            assert!(Cli::try_parse_from(argv).is_err(), "accepted {args:?}");
        }

        // no grace period is still a valid setting
        let cli = Cli::try_parse_from(["sharded-cache", "config", "--slack-ms", "0"]).unwrap();
        let Command::Config(args) = cli.command else {
            panic!("expected config subcommand");
        };
        assert_eq!(args.options().timing.heartbeat_slack, Duration::ZERO);
    }

    #[test]
    fn config_flags_build_timing() {
        let cli = Cli::try_parse_from([
            "sharded-cache",
            "config",
            "--heartbeat-ms",
            "50",
            "--slack-ms",
            "25",
            "--promote-on-failure",
        ])
        .unwrap();
        let Command::Config(args) = cli.command else {
            panic!("expected config subcommand");
        };
        let options = args.options();
        assert_eq!(options.timing.expiry_window(), Duration::from_millis(75));
        assert!(options.promote_on_failure);
    }

    #[test]
    fn put_accepts_negative_values() {
        let cli = Cli::try_parse_from(["sharded-cache", "put", "apple", "-3"]).unwrap();
        let Command::Put(args) = cli.command else {
            panic!("expected put subcommand");
        };
        assert_eq!(args.key, "apple");
        assert_eq!(args.value, -3);
    }
}
