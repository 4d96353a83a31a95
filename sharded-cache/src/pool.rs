//! Accept loop, connection queue and worker pool shared by both servers.
//!
//! Threading model:
//!
//! - **Accept thread**: owns the listener, wraps each accepted socket in a
//!   [`ConnCtx`] and pushes it onto the connection queue. It never blocks on
//!   the queue.
//! - **Worker threads**: a fixed number of threads pull connections in FIFO
//!   order and run the server's [`ConnectionHandler`] to completion. An idle
//!   worker parks inside the channel receive instead of spinning.
//! - **Periodic threads**: timer loops (heartbeats, maintenance) registered
//!   through [`ServerHandle::spawn_periodic`].
//!
//! The queue is an unbounded crossbeam channel. Stopping a server drops the
//! producer, so workers finish whatever was already queued and then exit.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

/// One accepted connection, owned by whichever worker dequeues it.
#[derive(Debug)]
pub struct ConnCtx {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Server logic run by the worker pool for every accepted connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, ctx: ConnCtx) -> Result<()>;
}

/// Producer half of the connection queue.
#[derive(Clone)]
pub struct ConnSender {
    tx: Sender<ConnCtx>,
}

impl ConnSender {
    /// Queues a connection without blocking. Hands the connection back if
    /// every worker is gone.
    pub fn enqueue(&self, ctx: ConnCtx) -> Result<(), ConnCtx> {
        self.tx.send(ctx).map_err(|err| err.into_inner())
    }
}

/// Consumer half of the connection queue.
#[derive(Clone)]
pub struct ConnReceiver {
    rx: Receiver<ConnCtx>,
}

impl ConnReceiver {
    /// Blocks until a connection is available. Returns `None` once the
    /// producer is gone and the queue is drained.
    pub fn dequeue(&self) -> Option<ConnCtx> {
        self.rx.recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn conn_queue() -> (ConnSender, ConnReceiver) {
    let (tx, rx) = unbounded();
    (ConnSender { tx }, ConnReceiver { rx })
}

/// Cloneable view of a server's stop request, used by long-running loops.
#[derive(Clone)]
pub struct StopSignal {
    rx: Receiver<()>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `timeout` or until stop is requested. Returns `true` when
    /// stopped.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// Sizing and socket settings for a pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread-name prefix, e.g. `"shard"` or `"config"`.
    pub name: String,
    pub workers: usize,
    /// Read and write deadline applied to every accepted socket.
    pub io_timeout: Duration,
}

/// Handle to a running server: its address, its threads and its stop switch.
///
/// Dropping the handle requests a stop without waiting for the threads.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop_tx: Option<Sender<()>>,
    stop_rx: Receiver<()>,
    threads: Vec<JoinHandle<()>>,
    name: String,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_rx.clone(),
        }
    }

    /// Runs `tick` every `interval` on a dedicated thread until the server
    /// stops. The first tick happens one interval after spawning.
    pub fn spawn_periodic<F>(&mut self, name: &str, interval: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let stop = self.stop_signal();
        let handle = thread::Builder::new()
            .name(format!("{}-{name}", self.name))
            .spawn(move || {
                while !stop.wait(interval) {
                    tick();
                }
            })
            .with_context(|| format!("failed to spawn {name} thread"))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Stops accepting, lets workers drain the queue and joins every thread.
    pub fn shutdown(mut self) {
        self.request_stop();
        self.join_threads();
        info!(name = %self.name, addr = %self.local_addr, "server stopped");
    }

    /// Blocks until every server thread exits.
    pub fn join(mut self) {
        self.join_threads();
    }

    fn request_stop(&mut self) {
        if self.stop_tx.take().is_some() {
            // Wake the accept loop so it notices the stop request.
            let _ = TcpStream::connect(wake_addr(self.local_addr));
        }
    }

    fn join_threads(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!(name = %self.name, "server thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

/// Starts the worker pool and the accept loop on `listener`.
pub fn serve<H: ConnectionHandler>(
    listener: TcpListener,
    config: &PoolConfig,
    handler: Arc<H>,
) -> Result<ServerHandle> {
    let local_addr = listener
        .local_addr()
        .context("listener has no local address")?;
    let (stop_tx, stop_rx) = unbounded();
    let (conn_tx, conn_rx) = conn_queue();
    let mut threads = Vec::with_capacity(config.workers + 1);

    for worker in 0..config.workers.max(1) {
        let rx = conn_rx.clone();
        let handler = Arc::clone(&handler);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{worker}", config.name))
            .spawn(move || worker_loop(worker, rx, handler))
            .context("failed to spawn worker thread")?;
        threads.push(handle);
    }
    drop(conn_rx);

    let stop = StopSignal { rx: stop_rx.clone() };
    let io_timeout = config.io_timeout;
    let accept = thread::Builder::new()
        .name(format!("{}-accept", config.name))
        .spawn(move || accept_loop(listener, conn_tx, stop, io_timeout))
        .context("failed to spawn accept thread")?;
    threads.push(accept);

    info!(
        name = %config.name,
        addr = %local_addr,
        workers = config.workers.max(1),
        "server listening"
    );
    Ok(ServerHandle {
        local_addr,
        stop_tx: Some(stop_tx),
        stop_rx,
        threads,
        name: config.name.clone(),
    })
}

fn accept_loop(listener: TcpListener, queue: ConnSender, stop: StopSignal, io_timeout: Duration) {
    for stream in listener.incoming() {
        if stop.is_stopped() {
            break;
        }
        match stream.and_then(|stream| prepare_stream(stream, io_timeout)) {
            Ok(ctx) => {
                if queue.enqueue(ctx).is_err() {
                    warn!("all workers exited; closing accept loop");
                    break;
                }
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

fn prepare_stream(stream: TcpStream, io_timeout: Duration) -> io::Result<ConnCtx> {
    let peer = stream.peer_addr()?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    Ok(ConnCtx { stream, peer })
}

fn worker_loop<H: ConnectionHandler>(worker: usize, queue: ConnReceiver, handler: Arc<H>) {
    while let Some(ctx) = queue.dequeue() {
        let peer = ctx.peer;
        debug!(worker, %peer, "handling connection");
        if let Err(err) = handler.handle(ctx) {
            warn!(worker, %peer, error = ?err, "connection closed with error");
        }
    }
    debug!(worker, "worker exiting");
}

/// Opens a client connection with the same deadlines servers apply.
pub fn connect(
    addr: impl std::net::ToSocketAddrs + std::fmt::Debug,
    io_timeout: Duration,
) -> Result<TcpStream> {
    let target = addr
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {addr:?}"))?
        .next()
        .with_context(|| format!("no address found for {addr:?}"))?;
    let stream = TcpStream::connect_timeout(&target, io_timeout)
        .with_context(|| format!("failed to connect to {target}"))?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;
    Ok(stream)
}
