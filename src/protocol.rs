//! The wire protocol: framing, identities, and message records.
//!
//! Messages travel as length-delimited JSON over a persistent TCP stream.
//! Each frame is `"{byte_len}|{json}"`; the payload is a [`Packet`]: a
//! monotonically increasing `msg_id` assigned by the sending session plus
//! an internally tagged [`Message`] body.
//!
//! The one exception is the handshake. The first frame on a new
//! connection is a [`Hello`] carrying the shared-secret digest and the
//! peer's name; the server answers with exactly four ASCII bytes holding
//! the granted peer id or a negative error code, before any other
//! traffic is accepted.

use serde::{Deserialize, Serialize};

/// Connection rejected: the secret digest did not match.
pub const ERR_LOGIN_FAIL: i32 = -1;
/// Connection rejected: the identity space is exhausted.
pub const ERR_MAX_LOGINS: i32 = -2;
/// Connection rejected: that name is already connected from a live session.
pub const ERR_NAME_TAKEN: i32 = -3;

/// Upper bound on the number of simultaneous identities: one per
/// character of the attribution alphabet.
pub const MAX_PEERS: i32 = 62;

/// Largest frame the decoder will accept.
pub const MAX_FRAME: usize = 1 << 20;

/// The alphabet mapping peer ids to attribution characters.
const PEER_CHARS: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// A peer identity. Real peers occupy `0..62`; [`PeerId::SERVER`] is the
/// source id on server-originated messages.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub i32);

impl PeerId {
    /// The id the server signs its own messages with.
    pub const SERVER: PeerId = PeerId(-1);

    /// The attribution character for this peer, if it is a real peer.
    pub fn attribution_char(&self) -> Option<char> {
        if (0..MAX_PEERS).contains(&self.0) {
            return Some(PEER_CHARS[self.0 as usize] as char);
        }
        return None;
    }

    /// Recover a peer id from its attribution character.
    pub fn from_attribution_char(c: char) -> Option<PeerId> {
        let pos = PEER_CHARS.iter().position(|&b| b as char == c)?;
        return Some(PeerId(pos as i32));
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.0);
    }
}

/// The statically known set of shared buffers, one per interpreter
/// target. Integers on the wire; never negotiated.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum Target {
    FoxDot = 0,
    Tidal = 1,
    SuperCollider = 2,
}

impl Target {
    /// Every buffer, in wire order.
    pub const ALL: [Target; 3] = [Target::FoxDot, Target::Tidal, Target::SuperCollider];
}

impl From<Target> for u8 {
    fn from(target: Target) -> u8 {
        return target as u8;
    }
}

impl TryFrom<u8> for Target {
    type Error = String;

    fn try_from(value: u8) -> Result<Target, String> {
        match value {
            0 => return Ok(Target::FoxDot),
            1 => return Ok(Target::Tidal),
            2 => return Ok(Target::SuperCollider),
            other => return Err(format!("unknown buffer id {other}")),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Target::FoxDot => "FoxDot",
            Target::Tidal => "TidalCycles",
            Target::SuperCollider => "SuperCollider",
        };
        return write!(f, "{name}");
    }
}

/// Framing and decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame header is not a byte count")]
    BadHeader,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    Oversized(usize),
    #[error("frame payload is not valid UTF-8")]
    BadPayload(#[from] std::string::FromUtf8Error),
}

/// Wrap a message body in the length-delimited frame format.
pub fn encode_frame(body: &str) -> String {
    return format!("{}|{}", body.len(), body);
}

/// Incremental frame decoder. Feed it whatever chunks the socket yields;
/// it returns each complete payload exactly once, tolerating frames split
/// across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        return FrameReader::default();
    }

    /// Absorb a chunk and return every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let Some(pipe) = self.buffer.iter().position(|&b| b == b'|') else {
                // An unreasonably long run of header bytes is not going
                // to turn into a length prefix.
                if self.buffer.len() > 20 {
                    return Err(FrameError::BadHeader);
                }
                break;
            };
            let header = std::str::from_utf8(&self.buffer[..pipe])
                .ok()
                .and_then(|s| s.parse::<usize>().ok());
            let Some(len) = header else {
                return Err(FrameError::BadHeader);
            };
            if len > MAX_FRAME {
                return Err(FrameError::Oversized(len));
            }
            if self.buffer.len() < pipe + 1 + len {
                break;
            }
            let payload = self.buffer[pipe + 1..pipe + 1 + len].to_vec();
            self.buffer.drain(..pipe + 1 + len);
            frames.push(String::from_utf8(payload)?);
        }
        return Ok(frames);
    }
}

/// Render a handshake verdict as the fixed-width reply bytes.
pub fn verdict_bytes(code: i32) -> [u8; 4] {
    let text = format!("{:04}", code);
    let mut reply = [b'0'; 4];
    reply.copy_from_slice(&text.as_bytes()[..4]);
    return reply;
}

/// Parse the fixed-width handshake reply back into a verdict.
pub fn parse_verdict(reply: &[u8; 4]) -> Option<i32> {
    return std::str::from_utf8(reply).ok()?.parse().ok();
}

/// Hex digest of the shared secret. Hashing happens client-side; the
/// server only ever compares digests.
pub fn secret_digest(password: &str) -> String {
    return blake3::hash(password.as_bytes()).to_hex().to_string();
}

/// The first frame on a new connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hello {
    pub digest: String,
    pub name: String,
}

/// Canonical text plus attribution for one buffer, sent in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub target: Target,
    pub text: String,
    /// One attribution character per document character.
    pub owners: String,
}

/// One peer's location, sent in snapshots. Disconnected peers are
/// included; they remain addressable for reconnection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerLocation {
    pub id: PeerId,
    pub name: String,
    pub connected: bool,
    pub target: Target,
    pub index: usize,
    pub selection: Option<(usize, usize)>,
}

fn default_reply() -> bool {
    return true;
}

/// A framed message with the sender-assigned sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub msg_id: u64,
    #[serde(flatten)]
    pub body: Message,
}

/// Every message the core understands. `reply` controls whether a
/// relayed message is echoed back to its origin; for operations that
/// echo is the acknowledgement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Connect {
        src: PeerId,
        name: String,
        host: String,
        port: u16,
    },
    ConnectAck {
        src: PeerId,
    },
    RequestAck {
        src: PeerId,
        flag: u8,
    },
    Operation {
        src: PeerId,
        target: Target,
        ops: crate::ot::Operation,
        revision: usize,
        #[serde(default = "default_reply")]
        reply: bool,
    },
    SetMark {
        src: PeerId,
        target: Target,
        index: usize,
        #[serde(default = "default_reply")]
        reply: bool,
    },
    Select {
        src: PeerId,
        target: Target,
        start: usize,
        end: usize,
        #[serde(default = "default_reply")]
        reply: bool,
    },
    EvaluateBlock {
        src: PeerId,
        target: Target,
        start_line: usize,
        end_line: usize,
        #[serde(default = "default_reply")]
        reply: bool,
    },
    EvaluateString {
        src: PeerId,
        target: Target,
        string: String,
        #[serde(default = "default_reply")]
        reply: bool,
    },
    SetAll {
        src: PeerId,
        buffers: Vec<BufferSnapshot>,
        peers: Vec<PeerLocation>,
    },
    Reset {
        src: PeerId,
        buffers: Vec<BufferSnapshot>,
        peers: Vec<PeerLocation>,
    },
    Remove {
        src: PeerId,
    },
    Kill {
        src: PeerId,
        string: String,
    },
    Response {
        src: PeerId,
        string: String,
    },
}

impl Message {
    /// The peer the message claims to come from.
    pub fn src(&self) -> PeerId {
        match self {
            Message::Connect { src, .. }
            | Message::ConnectAck { src }
            | Message::RequestAck { src, .. }
            | Message::Operation { src, .. }
            | Message::SetMark { src, .. }
            | Message::Select { src, .. }
            | Message::EvaluateBlock { src, .. }
            | Message::EvaluateString { src, .. }
            | Message::SetAll { src, .. }
            | Message::Reset { src, .. }
            | Message::Remove { src }
            | Message::Kill { src, .. }
            | Message::Response { src, .. } => return *src,
        }
    }

    /// True for message types only the server may originate.
    pub fn server_only(&self) -> bool {
        return matches!(
            self,
            Message::RequestAck { .. }
                | Message::SetAll { .. }
                | Message::Reset { .. }
                | Message::Remove { .. }
                | Message::Kill { .. }
        );
    }
}
