use std::io;
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sharded_cache::{
    cli::{Cli, Command},
    client::CacheClient,
    config_service::ConfigService,
    shard::ShardServer,
    shell,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Config(args) => {
            let listener = TcpListener::bind(args.listen)
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let service = Arc::new(ConfigService::new(args.options()));
            let handle = service.start(listener)?;
            info!("configuration service listening on {}", handle.local_addr());
            handle.join();
        }
        Command::Shard(args) => {
            let listener = TcpListener::bind(args.listen)
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let shard = Arc::new(ShardServer::new(args.options())?);
            let handle = shard
                .start(listener)
                .context("shard failed to join the cluster")?;
            info!("shard listening on {}", handle.local_addr());
            handle.join();
        }
        Command::Get(args) => {
            let client = CacheClient::new(args.client.config, args.client.io_timeout());
            match client.get(&args.key)? {
                Some(value) => println!("{value}"),
                None => println!("{} not found", args.key),
            }
        }
        Command::Put(args) => {
            let client = CacheClient::new(args.client.config, args.client.io_timeout());
            client.put(&args.key, args.value)?;
            println!("ok");
        }
        Command::Shell(args) => {
            let client = CacheClient::new(args.client.config, args.client.io_timeout());
            shell::run_shell(&client, io::stdin().lock(), io::stdout())?;
        }
    }

    Ok(())
}
