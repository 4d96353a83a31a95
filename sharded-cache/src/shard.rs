//! Shard server: an LRU cache behind the worker pool, in either the master or
//! the follower role.
//!
//! Masters accept client writes and push each one to their followers.
//! Followers accept only replicated writes. Both roles answer reads from the
//! local cache. A follower becomes a master when the configuration service
//! sends `Promote`; there is no way back.

use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::hashing::ShardId;
use crate::lru::LruCache;
use crate::pool::{self, ConnCtx, ConnectionHandler, PoolConfig, ServerHandle};
use crate::protocol::{read_message, write_message, Message};
use crate::settings::{
    Timing, MAX_CACHE_CAPACITY, MAX_FOLLOWERS_PER_MASTER, MAX_KEY_LEN, MAX_WORKERS,
};

/// Whether a shard takes client writes or replicated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRole {
    Master,
    Follower,
}

impl fmt::Display for ShardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardRole::Master => f.write_str("master"),
            ShardRole::Follower => f.write_str("follower"),
        }
    }
}

/// Settings for one shard process.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    /// Configuration service to register and heartbeat with.
    pub config_addr: SocketAddr,
    /// Role requested at registration.
    pub role: ShardRole,
    /// Entries the cache holds before evicting.
    pub capacity: usize,
    /// Worker threads serving connections.
    pub workers: usize,
    pub timing: Timing,
    /// Follower slots offered while acting as master.
    pub max_followers: usize,
    /// Longest key accepted on a write, in bytes.
    pub max_key_len: usize,
}

impl ShardOptions {
    pub fn new(config_addr: SocketAddr, role: ShardRole) -> Self {
        Self {
            config_addr,
            role,
            capacity: MAX_CACHE_CAPACITY as usize,
            workers: MAX_WORKERS as usize,
            timing: Timing::default(),
            max_followers: MAX_FOLLOWERS_PER_MASTER,
            max_key_len: MAX_KEY_LEN,
        }
    }
}

/// Identity handed out by the configuration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Master { id: ShardId },
    Follower { master_id: ShardId, slot: u32 },
}

impl Registration {
    fn heartbeat(self) -> Message {
        match self {
            Registration::Master { id } => Message::MasterHeartbeat { id },
            Registration::Follower { master_id, slot } => {
                Message::FollowerHeartbeat { master_id, slot }
            }
        }
    }
}

/// A cache shard. Shared with the worker pool through an `Arc`; every piece
/// of mutable state sits behind its own lock.
pub struct ShardServer {
    options: ShardOptions,
    role: RwLock<ShardRole>,
    cache: Mutex<LruCache>,
    followers: Mutex<Vec<Option<SocketAddr>>>,
    registration: Mutex<Option<Registration>>,
    listen_port: OnceLock<u16>,
}

impl ShardServer {
    pub fn new(options: ShardOptions) -> Result<Self> {
        let cache = LruCache::new(options.capacity)
            .context("invalid cache capacity")?
            .with_max_key_len(options.max_key_len);
        Ok(Self {
            role: RwLock::new(options.role),
            cache: Mutex::new(cache),
            followers: Mutex::new(vec![None; options.max_followers]),
            registration: Mutex::new(None),
            listen_port: OnceLock::new(),
            options,
        })
    }

    /// Starts serving, registers with the configuration service and spawns
    /// the heartbeat loop. A failed registration stops the server again.
    pub fn start(self: Arc<Self>, listener: TcpListener) -> Result<ServerHandle> {
        let port = listener
            .local_addr()
            .context("listener has no local address")?
            .port();
        let _ = self.listen_port.set(port);

        let config = PoolConfig {
            name: "shard".into(),
            workers: self.options.workers,
            io_timeout: self.options.timing.io_timeout,
        };
        let mut handle = pool::serve(listener, &config, Arc::clone(&self))?;

        if let Err(err) = self.register_with_config() {
            handle.shutdown();
            return Err(err);
        }

        let shard = Arc::clone(&self);
        handle.spawn_periodic(
            "heartbeat",
            self.options.timing.heartbeat_interval,
            move || shard.send_heartbeat(),
        )?;
        Ok(handle)
    }

    pub fn role(&self) -> ShardRole {
        *self.role.read()
    }

    pub fn registration(&self) -> Option<Registration> {
        *self.registration.lock()
    }

    /// Addresses currently in the replication fan-out.
    pub fn followers(&self) -> Vec<SocketAddr> {
        self.followers.lock().iter().flatten().copied().collect()
    }

    /// Reads straight from the local cache, as a `ClientGet` would.
    pub fn lookup(&self, key: &str) -> Option<i32> {
        self.cache.lock().get(key)
    }

    fn port(&self) -> u16 {
        self.listen_port.get().copied().unwrap_or_default()
    }

    fn register_with_config(&self) -> Result<()> {
        let port = self.port();
        let request = match self.role() {
            ShardRole::Master => Message::MasterRegister { port },
            ShardRole::Follower => Message::FollowerRegister { port },
        };

        let reply = self.call(self.options.config_addr, &request)?;
        match reply {
            Message::MasterRegisterAck { id } => {
                info!(id, port, "registered as master");
                *self.registration.lock() = Some(Registration::Master { id });
                Ok(())
            }
            Message::FollowerRegisterAck {
                master_id,
                slot,
                master_addr,
                master_port,
            } => {
                info!(master_id, slot, port, "registered as follower");
                *self.registration.lock() = Some(Registration::Follower { master_id, slot });
                self.attach_to_master(&master_addr, master_port)
            }
            Message::Error { reason } => {
                bail!("configuration service rejected registration: {reason}")
            }
            other => bail!("unexpected registration reply {}", other.msg_type()),
        }
    }

    fn attach_to_master(&self, addr: &str, port: u16) -> Result<()> {
        let target = (addr, port);
        let mut stream = pool::connect(target, self.options.timing.io_timeout)?;
        write_message(
            &mut stream,
            &Message::FollowerConnect {
                port: Some(self.port()),
            },
        )
        .with_context(|| format!("failed to reach master {addr}:{port}"))?;

        match read_message(&mut stream).context("failed to read master reply")? {
            Some(Message::FollowerConnect { port: None }) => {
                info!(master = addr, port, "attached to master");
                Ok(())
            }
            Some(Message::Error { reason }) => {
                bail!("master {addr}:{port} refused follower: {reason}")
            }
            Some(other) => bail!("unexpected master reply {}", other.msg_type()),
            None => bail!("master {addr}:{port} closed the connection"),
        }
    }

    fn send_heartbeat(&self) {
        let Some(registration) = self.registration() else {
            return;
        };
        let message = registration.heartbeat();
        let result = pool::connect(self.options.config_addr, self.options.timing.io_timeout)
            .and_then(|mut stream| {
                write_message(&mut stream, &message).context("failed to send heartbeat")
            });
        match result {
            Ok(()) => debug!(msg_type = %message.msg_type(), "heartbeat sent"),
            Err(err) => warn!(error = ?err, "heartbeat failed"),
        }
    }

    /// One request/reply exchange on a fresh connection.
    fn call(&self, addr: SocketAddr, request: &Message) -> Result<Message> {
        let mut stream = pool::connect(addr, self.options.timing.io_timeout)?;
        write_message(&mut stream, request).with_context(|| format!("failed to send to {addr}"))?;
        read_message(&mut stream)
            .with_context(|| format!("failed to read reply from {addr}"))?
            .ok_or_else(|| anyhow!("{addr} closed the connection without replying"))
    }

    fn handle_put(&self, key: String, value: i32, replicated: bool) -> Option<Message> {
        let expected = if replicated {
            ShardRole::Follower
        } else {
            ShardRole::Master
        };
        let role = self.role();
        if role != expected {
            warn!(%role, replicated, %key, "dropping write not meant for this role");
            return None;
        }

        match self.cache.lock().put(&key, value) {
            Ok(Some(evicted)) => {
                debug!(key = %evicted.key, value = evicted.value, "evicted entry");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%key, error = %err, "rejected write");
                return (!replicated).then(|| Message::error(err.to_string()));
            }
        }
        debug!(%key, value, replicated, "stored value");

        if !replicated {
            self.replicate(&key, value);
        }
        None
    }

    /// Forwards a write to every follower. Followers that cannot be reached
    /// leave the fan-out.
    fn replicate(&self, key: &str, value: i32) {
        let targets = self.followers();
        if targets.is_empty() {
            return;
        }

        let message = Message::Replicate {
            key: key.to_string(),
            value,
        };
        let mut unreachable = Vec::new();
        for follower in targets {
            let result = pool::connect(follower, self.options.timing.io_timeout).and_then(
                |mut stream| write_message(&mut stream, &message).context("replicate failed"),
            );
            if let Err(err) = result {
                warn!(%follower, error = ?err, "dropping unreachable follower");
                unreachable.push(follower);
            }
        }

        self.release_followers(&unreachable);
    }

    fn handle_follower_connect(&self, peer: SocketAddr, port: u16) -> Message {
        if self.role() != ShardRole::Master {
            return Message::error("not a master shard");
        }

        let addr = SocketAddr::new(peer.ip(), port);
        if self.attach_follower(addr) {
            return Message::FollowerConnect { port: None };
        }

        // A full fan-out may hold followers that died while no writes came in.
        if self.prune_followers() > 0 && self.attach_follower(addr) {
            return Message::FollowerConnect { port: None };
        }
        warn!(follower = %addr, "follower capacity reached");
        Message::error("follower capacity reached")
    }

    /// Puts `addr` in the first free slot. Returns `false` when every slot
    /// is taken.
    fn attach_follower(&self, addr: SocketAddr) -> bool {
        let mut slots = self.followers.lock();
        if slots.contains(&Some(addr)) {
            return true;
        }
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(addr);
                info!(follower = %addr, "follower attached");
                true
            }
            None => false,
        }
    }

    /// Dials every follower and frees the slots of those that do not answer.
    fn prune_followers(&self) -> usize {
        let unreachable: Vec<SocketAddr> = self
            .followers()
            .into_iter()
            .filter(|follower| {
                pool::connect(*follower, self.options.timing.io_timeout).is_err()
            })
            .collect();
        self.release_followers(&unreachable);
        unreachable.len()
    }

    fn release_followers(&self, gone: &[SocketAddr]) {
        if gone.is_empty() {
            return;
        }
        let mut slots = self.followers.lock();
        for slot in slots.iter_mut() {
            if slot.is_some_and(|addr| gone.contains(&addr)) {
                if let Some(addr) = slot.take() {
                    info!(follower = %addr, "follower released");
                }
            }
        }
    }

    fn handle_promote(&self) {
        let mut role = self.role.write();
        if *role == ShardRole::Master {
            debug!("ignoring promote on a master");
            return;
        }
        *role = ShardRole::Master;

        let mut registration = self.registration.lock();
        if let Some(Registration::Follower { master_id, .. }) = *registration {
            *registration = Some(Registration::Master { id: master_id });
            info!(id = master_id, "promoted to master");
        } else {
            info!("promoted to master without a registration");
        }
    }

    fn handle_redirect(&self, addr: &str, port: u16) {
        if self.role() != ShardRole::Follower {
            warn!("ignoring redirect on a master");
            return;
        }
        match self.attach_to_master(addr, port) {
            Ok(()) => info!(master = addr, port, "redirected to new master"),
            Err(err) => warn!(error = ?err, "redirect failed"),
        }
    }

    fn dispatch(&self, peer: SocketAddr, message: Message) -> Option<Message> {
        match message {
            Message::ClientGet { key } => {
                let value = self.cache.lock().get(&key);
                debug!(%key, ?value, "get");
                Some(Message::GetAck { value })
            }
            Message::ClientPut { key, value } => self.handle_put(key, value, false),
            Message::Replicate { key, value } => self.handle_put(key, value, true),
            Message::FollowerConnect { port: Some(port) } => {
                Some(self.handle_follower_connect(peer, port))
            }
            Message::Promote => {
                self.handle_promote();
                None
            }
            Message::Redirect { addr, port } => {
                self.handle_redirect(&addr, port);
                None
            }
            other => {
                warn!(%peer, msg_type = %other.msg_type(), "unexpected message");
                Some(Message::error(format!(
                    "unexpected message type {}",
                    other.msg_type()
                )))
            }
        }
    }
}

impl ConnectionHandler for ShardServer {
    fn handle(&self, mut ctx: ConnCtx) -> Result<()> {
        let message = match read_message(&mut ctx.stream) {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(()),
            Err(err) => {
                let reply = Message::error("could not receive message");
                let _ = write_message(&mut ctx.stream, &reply);
                return Err(err).context("failed to read request");
            }
        };

        if let Some(reply) = self.dispatch(ctx.peer, message) {
            write_message(&mut ctx.stream, &reply).context("failed to send reply")?;
        }
        Ok(())
    }
}
