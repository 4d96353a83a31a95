//! Configuration service: shard registration, heartbeats and key discovery.
//!
//! Every connection carries exactly one request. Registration and discovery
//! get one reply; heartbeats get none. A maintenance thread sweeps the
//! registry on a fixed interval and, when promotion is enabled, tells the
//! affected shards about the new topology after releasing the lock.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::pool::{self, ConnCtx, ConnectionHandler, PoolConfig, ServerHandle};
use crate::protocol::{read_message, write_message, Message};
use crate::registry::{MasterShard, Promotion, Registry, RegistryLimits};
use crate::settings::{Timing, MAX_FOLLOWERS_PER_MASTER, MAX_SHARDS, MAX_WORKERS};

/// Settings for the configuration service.
#[derive(Debug, Clone)]
pub struct ConfigServiceOptions {
    /// Worker threads serving connections.
    pub workers: usize,
    /// Heartbeat window, sweep interval and socket deadlines.
    pub timing: Timing,
    pub limits: RegistryLimits,
    /// Replace a failed master by one of its followers instead of dropping it.
    pub promote_on_failure: bool,
}

impl Default for ConfigServiceOptions {
    fn default() -> Self {
        Self {
            workers: MAX_WORKERS as usize,
            timing: Timing::default(),
            limits: RegistryLimits {
                max_masters: MAX_SHARDS,
                max_followers: MAX_FOLLOWERS_PER_MASTER,
            },
            promote_on_failure: false,
        }
    }
}

/// Owns the shard registry and serves registration, heartbeat and discovery
/// requests against it.
pub struct ConfigService {
    registry: RwLock<Registry>,
    options: ConfigServiceOptions,
}

impl ConfigService {
    pub fn new(options: ConfigServiceOptions) -> Self {
        let registry = Registry::new(options.limits, options.timing.expiry_window());
        Self {
            registry: RwLock::new(registry),
            options,
        }
    }

    /// Starts serving on `listener` together with the maintenance thread.
    pub fn start(self: Arc<Self>, listener: TcpListener) -> Result<ServerHandle> {
        let config = PoolConfig {
            name: "config".into(),
            workers: self.options.workers,
            io_timeout: self.options.timing.io_timeout,
        };
        let mut handle = pool::serve(listener, &config, Arc::clone(&self))?;

        let service = Arc::clone(&self);
        handle.spawn_periodic(
            "maintenance",
            self.options.timing.sweep_interval,
            move || service.run_maintenance(),
        )?;
        Ok(handle)
    }

    /// Copy of the current master list, in registry order.
    pub fn snapshot(&self) -> Vec<MasterShard> {
        self.registry.read().masters().to_vec()
    }

    /// One sweep of the registry. Promotions are announced after the write
    /// lock is dropped.
    pub fn run_maintenance(&self) {
        let report = {
            let mut registry = self.registry.write();
            registry.sweep(Instant::now(), self.options.promote_on_failure)
        };

        for master in &report.expired_masters {
            info!(id = master.id, addr = %master.addr, "master shard expired");
        }
        for addr in &report.expired_followers {
            info!(%addr, "follower shard expired");
        }
        for promotion in &report.promotions {
            self.announce(promotion);
        }
    }

    fn announce(&self, promotion: &Promotion) {
        info!(
            id = promotion.master_id,
            addr = %promotion.promoted,
            "promoting follower to master"
        );
        if let Err(err) = self.notify(promotion.promoted, &Message::Promote) {
            warn!(addr = %promotion.promoted, error = ?err, "failed to deliver promotion");
        }

        let redirect = Message::Redirect {
            addr: promotion.promoted.ip().to_string(),
            port: promotion.promoted.port(),
        };
        for follower in &promotion.redirected {
            if let Err(err) = self.notify(*follower, &redirect) {
                warn!(addr = %follower, error = ?err, "failed to redirect follower");
            }
        }
    }

    /// Sends `message` and waits for the shard to close the connection, so
    /// the next announcement sees its effect.
    fn notify(&self, addr: SocketAddr, message: &Message) -> Result<()> {
        let mut stream = pool::connect(addr, self.options.timing.io_timeout)?;
        write_message(&mut stream, message).with_context(|| format!("failed to send to {addr}"))?;
        match read_message(&mut stream).with_context(|| format!("no answer from {addr}"))? {
            None => Ok(()),
            Some(Message::Error { reason }) => Err(anyhow!("{addr} refused: {reason}")),
            Some(other) => Err(anyhow!("unexpected reply {} from {addr}", other.msg_type())),
        }
    }

    fn dispatch(&self, peer: SocketAddr, message: Message) -> Option<Message> {
        let now = Instant::now();
        match message {
            Message::MasterRegister { port } => {
                let addr = SocketAddr::new(peer.ip(), port);
                let result = self
                    .registry
                    .write()
                    .register_master(addr, now, &mut rand::thread_rng());
                Some(match result {
                    Ok(id) => {
                        info!(id, %addr, "registered master shard");
                        Message::MasterRegisterAck { id }
                    }
                    Err(err) => {
                        warn!(%addr, error = %err, "rejected master shard");
                        Message::error(err.to_string())
                    }
                })
            }
            Message::FollowerRegister { port } => {
                let addr = SocketAddr::new(peer.ip(), port);
                let result = self.registry.write().register_follower(addr, now);
                Some(match result {
                    Ok(assignment) => {
                        info!(
                            %addr,
                            master = assignment.master_id,
                            slot = assignment.slot,
                            "registered follower shard"
                        );
                        Message::FollowerRegisterAck {
                            master_id: assignment.master_id,
                            slot: assignment.slot,
                            master_addr: assignment.master_addr.ip().to_string(),
                            master_port: assignment.master_addr.port(),
                        }
                    }
                    Err(err) => {
                        warn!(%addr, error = %err, "rejected follower shard");
                        Message::error(err.to_string())
                    }
                })
            }
            Message::MasterHeartbeat { id } => {
                if !self.registry.write().heartbeat_master(id, now) {
                    debug!(id, "heartbeat from unknown master");
                }
                None
            }
            Message::FollowerHeartbeat { master_id, slot } => {
                if !self
                    .registry
                    .write()
                    .heartbeat_follower(master_id, slot, now)
                {
                    debug!(master_id, slot, "heartbeat from unknown follower");
                }
                None
            }
            Message::ClientDiscover { op, key } => {
                let result = self
                    .registry
                    .read()
                    .discover(op, &key, &mut rand::thread_rng());
                Some(match result {
                    Ok(addr) => {
                        debug!(%op, %key, %addr, "discovered shard");
                        Message::DiscoverAck {
                            addr: addr.ip().to_string(),
                            port: addr.port(),
                        }
                    }
                    Err(err) => Message::error(err.to_string()),
                })
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

impl ConnectionHandler for ConfigService {
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

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    use super::*;
    use crate::protocol::Operation;

    const IO: Duration = Duration::from_secs(2);

    fn start(options: ConfigServiceOptions) -> (Arc<ConfigService>, ServerHandle) {
        let service = Arc::new(ConfigService::new(options));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let handle = Arc::clone(&service).start(listener).unwrap();
        (service, handle)
    }

    fn request(handle: &ServerHandle, message: &Message) -> Option<Message> {
        let mut stream = pool::connect(handle.local_addr(), IO).unwrap();
        write_message(&mut stream, message).unwrap();
        read_message(&mut stream).unwrap()
    }

    #[test]
    fn master_registration_and_discovery() {
        let (service, handle) = start(ConfigServiceOptions::default());

        let Some(Message::MasterRegisterAck { id }) =
            request(&handle, &Message::MasterRegister { port: 7001 })
        else {
            panic!("expected a registration ack");
        };
        assert_eq!(service.snapshot()[0].id, id);
        assert_eq!(service.snapshot()[0].addr, "127.0.0.1:7001".parse().unwrap());

        let reply = request(
            &handle,
            &Message::ClientDiscover {
                op: Operation::Put,
                key: "anything".into(),
            },
        );
        assert_eq!(
            reply,
            Some(Message::DiscoverAck {
                addr: "127.0.0.1".into(),
                port: 7001,
            })
        );
        handle.shutdown();
    }

    #[test]
    fn follower_gets_its_master_address() {
        let (_service, handle) = start(ConfigServiceOptions::default());
        let Some(Message::MasterRegisterAck { id }) =
            request(&handle, &Message::MasterRegister { port: 7001 })
        else {
            panic!("expected a registration ack");
        };

        let reply = request(&handle, &Message::FollowerRegister { port: 7002 });
        assert_eq!(
            reply,
            Some(Message::FollowerRegisterAck {
                master_id: id,
                slot: 0,
                master_addr: "127.0.0.1".into(),
                master_port: 7001,
            })
        );
        handle.shutdown();
    }

    #[test]
    fn registry_errors_are_sent_back() {
        let mut options = ConfigServiceOptions::default();
        options.limits.max_masters = 1;
        let (_service, handle) = start(options);

        assert_eq!(
            request(&handle, &Message::FollowerRegister { port: 7002 }),
            Some(Message::error("no master shards registered"))
        );
        assert!(matches!(
            request(&handle, &Message::MasterRegister { port: 7001 }),
            Some(Message::MasterRegisterAck { .. })
        ));
        assert_eq!(
            request(&handle, &Message::MasterRegister { port: 7003 }),
            Some(Message::error("reached max shard capacity"))
        );
        handle.shutdown();
    }

    #[test]
    fn heartbeats_get_no_reply() {
        let (_service, handle) = start(ConfigServiceOptions::default());
        assert_eq!(request(&handle, &Message::MasterHeartbeat { id: 42 }), None);
        handle.shutdown();
    }

    #[test]
    fn unexpected_and_malformed_requests_get_an_error() {
        let (_service, handle) = start(ConfigServiceOptions::default());
        assert_eq!(
            request(&handle, &Message::ClientGet { key: "k".into() }),
            Some(Message::error("unexpected message type ClientGet"))
        );

        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream.set_read_timeout(Some(IO)).unwrap();
        // size 8, type 99, len 0
        stream
            .write_all(&[0, 0, 0, 8, 0, 0, 0, 99, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(
            read_message(&mut stream).unwrap(),
            Some(Message::error("could not receive message"))
        );
        handle.shutdown();
    }

    #[test]
    fn maintenance_drops_silent_masters() {
        let mut options = ConfigServiceOptions::default();
        options.timing = Timing {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_slack: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(10),
            io_timeout: IO,
        };
        let (service, handle) = start(options);
        request(&handle, &Message::MasterRegister { port: 7001 });
        assert_eq!(service.snapshot().len(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !service.snapshot().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(service.snapshot().is_empty());
        handle.shutdown();
    }
}
