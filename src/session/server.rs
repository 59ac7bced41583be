//! The TCP runtime: accept loop, per-connection IO tasks, and the relay
//! task that owns the [`Hub`].
//!
//! Concurrency layout:
//! 1. One accept task takes connections off the listener.
//! 2. Each connection gets a reader (this task) and a writer task. The
//!    reader performs the handshake, then pumps decoded packets into the
//!    shared relay channel. The writer drains a per-peer unbounded
//!    channel of pre-encoded frames.
//! 3. One relay task owns the hub and the writer map. All session state
//!    is mutated here and only here, so the hub needs no locks.
//!
//! A slow or dead peer never blocks the relay: delivery is a try-send
//! into its channel, and a closed channel queues the peer for removal on
//! a worklist processed before the next select.

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::hub::{HandshakeOutcome, Hub};
use super::SessionError;
use crate::protocol::{
    encode_frame, secret_digest, verdict_bytes, FrameReader, Hello, Packet, PeerId,
};

/// How long a fresh connection may dawdle before its Hello arrives.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything needed to run a session server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 binds an ephemeral port.
    pub bind: SocketAddr,
    /// Shared secret; peers present its digest in their Hello.
    pub password: String,
    /// How long a join barrier may stay open before silent peers are
    /// evicted.
    pub barrier_timeout: Duration,
    /// Append a timestamped transcript of inbound packets here.
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        return ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 57890)),
            password: String::new(),
            barrier_timeout: Duration::from_secs(30),
            log_file: None,
        };
    }
}

/// What connection tasks send the relay task.
enum Event {
    /// A completed Hello. The relay decides the verdict, registers the
    /// writer on a grant, and answers through the oneshot.
    Hello {
        host: String,
        name: String,
        digest: String,
        writer: mpsc::UnboundedSender<String>,
        verdict: oneshot::Sender<HandshakeOutcome>,
    },
    /// One decoded packet from an authenticated peer.
    Packet { id: PeerId, packet: Packet },
    /// The peer's reader saw EOF or an unrecoverable error. Carries the
    /// connection's writer handle so the relay can tell a live close
    /// from the late EOF of a connection already replaced by a
    /// reconnect.
    Closed {
        id: PeerId,
        writer: mpsc::UnboundedSender<String>,
    },
}

/// A bound, not-yet-running session server.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
}

impl Server {
    /// Bind the listener. The server accepts nothing until [`run`].
    ///
    /// [`run`]: Server::run
    pub async fn bind(config: ServerConfig) -> Result<Server, SessionError> {
        let listener = TcpListener::bind(config.bind).await?;
        return Ok(Server { listener, config });
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, SessionError> {
        return Ok(self.listener.local_addr()?);
    }

    /// Accept and relay until Ctrl-C. Resolves after the shutdown KILL
    /// has been queued to every connected peer.
    pub async fn run(self) -> Result<(), SessionError> {
        let Server { listener, config } = self;
        let digest = secret_digest(&config.password);
        let hub = Hub::new(digest, config.barrier_timeout);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let accept = tokio::spawn(accept_loop(listener, events_tx));
        relay_loop(hub, events_rx, config.log_file).await;
        accept.abort();
        return Ok(());
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, addr, events).await {
                        debug!(%addr, %err, "connection ended");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

/// Handshake, then pump frames until the peer goes away.
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), SessionError> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new();

    let hello = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        read_hello(&mut read_half, &mut frames),
    )
    .await
    .map_err(|_| SessionError::HandshakeEof)??;

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (verdict_tx, verdict_rx) = oneshot::channel();
    events
        .send(Event::Hello {
            host: addr.ip().to_string(),
            name: hello.name,
            digest: hello.digest,
            writer: writer_tx.clone(),
            verdict: verdict_tx,
        })
        .map_err(|_| SessionError::RelayGone)?;
    let outcome = verdict_rx.await.map_err(|_| SessionError::RelayGone)?;

    write_half.write_all(&verdict_bytes(outcome.code())).await?;
    write_half.flush().await?;
    let id = match outcome {
        HandshakeOutcome::Granted { id, .. } => id,
        HandshakeOutcome::Rejected(code) => return Err(SessionError::Rejected(code)),
    };

    tokio::spawn(write_frames(write_half, writer_rx));

    // The guard notifies the relay on every exit path, a reader panic
    // included; a silently vanished reader must not leave its peer
    // marked connected.
    let _guard = CloseGuard {
        id,
        writer: writer_tx,
        events: events.clone(),
    };
    return pump_packets(&mut read_half, &mut frames, id, &events).await;
}

/// Sends [`Event::Closed`] when dropped.
struct CloseGuard {
    id: PeerId,
    writer: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<Event>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Closed {
            id: self.id,
            writer: self.writer.clone(),
        });
    }
}

/// Read until the first complete frame and decode it as a Hello.
async fn read_hello(
    read_half: &mut OwnedReadHalf,
    frames: &mut FrameReader,
) -> Result<Hello, SessionError> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Err(SessionError::HandshakeEof);
        }
        if let Some(frame) = frames.feed(&chunk[..n])?.into_iter().next() {
            return Ok(serde_json::from_str(&frame)?);
        }
    }
}

/// Decode inbound frames into packets and hand them to the relay.
async fn pump_packets(
    read_half: &mut OwnedReadHalf,
    frames: &mut FrameReader,
    id: PeerId,
    events: &mpsc::UnboundedSender<Event>,
) -> Result<(), SessionError> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = read_half.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        for frame in frames.feed(&chunk[..n])? {
            let packet: Packet = serde_json::from_str(&frame)?;
            events
                .send(Event::Packet { id, packet })
                .map_err(|_| SessionError::RelayGone)?;
        }
    }
}

async fn write_frames(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

/// The single task that owns all session state.
async fn relay_loop(
    mut hub: Hub,
    mut events: mpsc::UnboundedReceiver<Event>,
    log_file: Option<PathBuf>,
) {
    let mut writers: FxHashMap<PeerId, mpsc::UnboundedSender<String>> = FxHashMap::default();
    let mut transcript = log_file.as_deref().and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => return Some(file),
            Err(err) => {
                warn!(?path, %err, "cannot open transcript, logging disabled");
                return None;
            }
        }
    });

    loop {
        let deadline = hub.barrier_deadline();
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    Event::Hello { host, name, digest, writer, verdict } => {
                        let outcome = hub.handshake(&host, &name, &digest);
                        if let HandshakeOutcome::Granted { id, .. } = &outcome {
                            // A reconnect replaces any writer left over
                            // from the dead connection.
                            writers.insert(*id, writer);
                        }
                        let _ = verdict.send(outcome);
                    }
                    Event::Packet { id, packet } => {
                        if let Some(file) = transcript.as_mut() {
                            record(file, id, &packet);
                        }
                        let outbox = hub.message(id, packet);
                        deliver(&mut hub, &mut writers, outbox);
                    }
                    Event::Closed { id, writer } => {
                        // A reconnect may already have registered a new
                        // writer for this id; only the current one's EOF
                        // removes the peer.
                        let current = writers
                            .get(&id)
                            .is_some_and(|w| w.same_channel(&writer));
                        if current {
                            writers.remove(&id);
                            let outbox = hub.drop_peer(id);
                            deliver(&mut hub, &mut writers, outbox);
                        }
                    }
                }
            }
            _ = barrier_expiry(deadline) => {
                let outbox = hub.barrier_timed_out();
                deliver(&mut hub, &mut writers, outbox);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let outbox = hub.shutdown("server shutting down");
                deliver(&mut hub, &mut writers, outbox);
                break;
            }
        }
    }
}

/// Sleep until the barrier deadline, or forever when none is armed.
async fn barrier_expiry(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

/// Push an outbox into the writer channels. Peers whose channel is gone
/// are dropped from the hub, and the packets that produces are delivered
/// in turn; the worklist keeps one dead peer from stalling the rest.
fn deliver(
    hub: &mut Hub,
    writers: &mut FxHashMap<PeerId, mpsc::UnboundedSender<String>>,
    outbox: super::hub::Outbox,
) {
    let mut worklist = vec![outbox];
    while let Some(batch) = worklist.pop() {
        for (dest, packet) in batch {
            let frame = match serde_json::to_string(&packet) {
                Ok(json) => encode_frame(&json),
                Err(err) => {
                    warn!(%err, "unencodable packet dropped");
                    continue;
                }
            };
            let alive = writers
                .get(&dest)
                .is_some_and(|writer| writer.send(frame).is_ok());
            if !alive && writers.remove(&dest).is_some() {
                debug!(%dest, "writer gone, removing peer");
                worklist.push(hub.drop_peer(dest));
            }
        }
    }
}

/// Append one inbound packet to the session transcript.
fn record(file: &mut std::fs::File, id: PeerId, packet: &Packet) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let body = serde_json::to_string(packet).unwrap_or_else(|_| "<unencodable>".to_owned());
    if let Err(err) = writeln!(file, "{stamp} {id} {body}") {
        warn!(%err, "transcript write failed");
    }
}

/// Best-effort guess at an address other machines can reach, via the
/// route a UDP socket would take to a public resolver. No packet is
/// sent. Falls back to the loopback address.
pub fn routable_ip() -> std::net::IpAddr {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            return socket.local_addr();
        })
        .map(|addr| addr.ip());
    return probe.unwrap_or_else(|_| std::net::IpAddr::from([127, 0, 0, 1]));
}
