//! Client side of the cache: ask the configuration service where a key
//! lives, then talk to that shard directly.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::pool;
use crate::protocol::{read_message, write_message, Message, Operation};

#[derive(Debug, Clone)]
pub struct CacheClient {
    config_addr: SocketAddr,
    io_timeout: Duration,
}

impl CacheClient {
    pub fn new(config_addr: SocketAddr, io_timeout: Duration) -> Self {
        Self {
            config_addr,
            io_timeout,
        }
    }

    /// Address of the shard that should serve `op` on `key`.
    pub fn discover(&self, op: Operation, key: &str) -> Result<(String, u16)> {
        check_key(key)?;
        let mut stream = pool::connect(self.config_addr, self.io_timeout)?;
        write_message(
            &mut stream,
            &Message::ClientDiscover {
                op,
                key: key.to_string(),
            },
        )
        .context("failed to send discovery request")?;

        match read_message(&mut stream).context("failed to read discovery reply")? {
            Some(Message::DiscoverAck { addr, port }) => {
                debug!(%op, key, %addr, port, "discovered shard");
                Ok((addr, port))
            }
            Some(Message::Error { reason }) => bail!("{reason}"),
            Some(other) => bail!("unexpected discovery reply {}", other.msg_type()),
            None => bail!("configuration service closed the connection"),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<i32>> {
        let (addr, port) = self.discover(Operation::Get, key)?;
        self.get_from((addr.as_str(), port), key)
    }

    pub fn put(&self, key: &str, value: i32) -> Result<()> {
        let (addr, port) = self.discover(Operation::Put, key)?;
        self.put_to((addr.as_str(), port), key, value)
    }

    /// Reads `key` from a specific shard, bypassing discovery.
    pub fn get_from(
        &self,
        shard: impl std::net::ToSocketAddrs + std::fmt::Debug,
        key: &str,
    ) -> Result<Option<i32>> {
        check_key(key)?;
        let mut stream = pool::connect(shard, self.io_timeout)?;
        write_message(&mut stream, &Message::ClientGet { key: key.to_string() })
            .context("failed to send get")?;

        match read_message(&mut stream).context("failed to read get reply")? {
            Some(Message::GetAck { value }) => Ok(value),
            Some(Message::Error { reason }) => bail!("{reason}"),
            Some(other) => bail!("unexpected get reply {}", other.msg_type()),
            None => Err(anyhow!("shard closed the connection without replying")),
        }
    }

    /// Writes `key` to a specific shard. Returns once the shard has closed
    /// the connection, or with the shard's error.
    pub fn put_to(
        &self,
        shard: impl std::net::ToSocketAddrs + std::fmt::Debug,
        key: &str,
        value: i32,
    ) -> Result<()> {
        check_key(key)?;
        let mut stream = pool::connect(shard, self.io_timeout)?;
        write_message(
            &mut stream,
            &Message::ClientPut {
                key: key.to_string(),
                value,
            },
        )
        .context("failed to send put")?;

        match read_message(&mut stream).context("failed to wait for put")? {
            None => Ok(()),
            Some(Message::Error { reason }) => bail!("{reason}"),
            Some(other) => bail!("unexpected put reply {}", other.msg_type()),
        }
    }
}

/// Gets and discovery carry the key NUL-terminated, so a key holding a NUL
/// byte could be written but never read back.
fn check_key(key: &str) -> Result<()> {
    if key.contains('\0') {
        bail!("key must not contain NUL bytes");
    }
    Ok(())
}
