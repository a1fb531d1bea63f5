//! Network event stream
//!
//! Every peer-level outcome (connects, failures, received data) is
//! published as a `NetworkUpdate` and mirrored to the log.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::broadcast;

/// Buffered updates per subscriber before the slowest one starts lagging
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    fn log_level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Listening(SocketAddr),
    Connecting,
    Connected { user_agent: String, start_height: i32 },
    Disconnected { reason: String },
    FailedToConnect { error: String },
    FailedHandshake,
    FailedPing { consecutive: u32 },
    FailedGetAddr,
    FailedGetHeaders,
    ReceivedAddresses { received: usize, added: usize },
    ReceivedHeaders { accepted: usize, height: u32 },
    RejectedHeaders { reason: String },
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::Listening(addr) => write!(f, "listening on {}", addr),
            UpdateKind::Connecting => write!(f, "connecting"),
            UpdateKind::Connected {
                user_agent,
                start_height,
            } => write!(f, "connected ({}, height {})", user_agent, start_height),
            UpdateKind::Disconnected { reason } => write!(f, "disconnected: {}", reason),
            UpdateKind::FailedToConnect { error } => write!(f, "failed to connect: {}", error),
            UpdateKind::FailedHandshake => write!(f, "no verack before timeout"),
            UpdateKind::FailedPing { consecutive } => {
                write!(f, "no pong ({} consecutive)", consecutive)
            }
            UpdateKind::FailedGetAddr => write!(f, "no addr reply to getaddr"),
            UpdateKind::FailedGetHeaders => write!(f, "no headers reply to getheaders"),
            UpdateKind::ReceivedAddresses { received, added } => {
                write!(f, "received {} addresses ({} new)", received, added)
            }
            UpdateKind::ReceivedHeaders { accepted, height } => {
                write!(f, "accepted {} headers, height {}", accepted, height)
            }
            UpdateKind::RejectedHeaders { reason } => write!(f, "headers rejected: {}", reason),
        }
    }
}

/// One observable network outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkUpdate {
    pub peer: Option<SocketAddr>,
    pub kind: UpdateKind,
    pub level: Severity,
    pub at: DateTime<Utc>,
}

impl fmt::Display for NetworkUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "[{}] {}", peer, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Fan-out of `NetworkUpdate`s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NetworkUpdate>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkUpdate> {
        self.sender.subscribe()
    }

    pub fn publish(&self, peer: Option<SocketAddr>, kind: UpdateKind, level: Severity) {
        let update = NetworkUpdate {
            peer,
            kind,
            level,
            at: Utc::now(),
        };
        log::log!(level.log_level(), "{}", update);
        // No subscribers is fine
        let _ = self.sender.send(update);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}
