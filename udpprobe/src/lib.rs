//! # udpprobe
//!
//! UDP latency and loss measurement. A client streams sequenced,
//! timestamped probes to a server at a fixed rate; the server either echoes
//! them back (RTT mode) or only observes them (one-way mode). Both sides
//! derive delay and loss statistics.
//!
//! The server guards itself with per-source admission control: an optional
//! whitelist, a token-bucket rate limiter, a lightweight per-probe
//! authentication token and replay rejection. Idle sources are evicted by a
//! background reaper so the bounded client table does not fill up.
//!
//! ## Features
//!
//! - **Absolute-deadline pacing** with pluggable busy-wait or sleep waiting
//! - **RTT and one-way delay** sampling with EWMA smoothing
//! - **Loss runs** detected from sequence gaps, with duplicate/reorder rejection
//! - **Admission control** bounded by `max_clients`, with idle reclamation
//! - **Optional HMAC-SHA256 tokens** via the `hmac` feature
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use udpprobe::prelude::*;
//!
//! let config = ServerConfig::new("0.0.0.0:5000".parse().unwrap());
//! let mut server = ProbeServer::bind(config).unwrap();
//! let summary = server.run(&AtomicBool::new(false));
//! println!("{}\n{}", ServerSummary::HEADER, summary);
//! ```

pub mod admission;
pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod reaper;
pub mod sampler;
pub mod sequence;
pub mod server;
pub mod sink;
pub mod socket;
pub mod stats;
pub mod util;
pub mod wire;

#[cfg(test)]
mod tests;

pub use admission::{Admission, AdmissionControl, ClientRecord, ClientTable, TokenBucket, Whitelist};
pub use auth::{AuthError, AuthToken, Secret, TokenScheme, XorRotateScheme};
pub use client::{ClientState, ProbeClient};
pub use clock::{DeadlineWait, PacingSchedule, SleepWait, SpinWait, WallTime};
pub use config::{AdmissionConfig, ClientConfig, ConfigError, Pacing, ServerConfig};
pub use reaper::ReaperHandle;
pub use sampler::{DelaySample, DelayStats, Ewma};
pub use sequence::{Anomaly, LossRun, LossRunLog, SequenceOutcome, SequenceTracker};
pub use server::{ProbeServer, ServerEvent};
pub use sink::{NullSink, SampleSink, WriterSink};
pub use socket::{ProbeSocket, SocketError};
pub use stats::{ClientStats, ClientSummary, DropCause, ServerSummary, SessionStats, SocketStats};
pub use util::LogSampler;
pub use wire::{OpMode, ProbeHeader, WireError};

/// Unified error type for the client and server entry points.
#[derive(Debug)]
pub enum ProbeError {
    Socket(SocketError),
    Wire(WireError),
    Config(ConfigError),
    Auth(AuthError),
    Io(std::io::Error),
    /// The next sequence number would collide with the terminal marker.
    SequenceExhausted,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Socket(e) => write!(f, "Socket error: {}", e),
            ProbeError::Wire(e) => write!(f, "Wire error: {}", e),
            ProbeError::Config(e) => write!(f, "Config error: {}", e),
            ProbeError::Auth(e) => write!(f, "Auth error: {}", e),
            ProbeError::Io(e) => write!(f, "IO error: {}", e),
            ProbeError::SequenceExhausted => write!(f, "Sequence number space exhausted"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Socket(e) => Some(e),
            ProbeError::Wire(e) => Some(e),
            ProbeError::Config(e) => Some(e),
            ProbeError::Auth(e) => Some(e),
            ProbeError::Io(e) => Some(e),
            ProbeError::SequenceExhausted => None,
        }
    }
}

impl From<SocketError> for ProbeError {
    fn from(err: SocketError) -> Self {
        ProbeError::Socket(err)
    }
}

impl From<WireError> for ProbeError {
    fn from(err: WireError) -> Self {
        ProbeError::Wire(err)
    }
}

impl From<ConfigError> for ProbeError {
    fn from(err: ConfigError) -> Self {
        ProbeError::Config(err)
    }
}

impl From<AuthError> for ProbeError {
    fn from(err: AuthError) -> Self {
        ProbeError::Auth(err)
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Io(err)
    }
}

/// Prelude: import everything commonly needed.
pub mod prelude {
    pub use crate::{
        AdmissionConfig, ClientConfig, ClientSummary, DropCause, OpMode, Pacing, ProbeClient,
        ProbeError, ProbeServer, Secret, ServerConfig, ServerEvent, ServerSummary, Whitelist,
    };
}
