//! Client, server and admission configuration.
//!
//! Every config has sensible defaults, `with_*` builder methods and a
//! `validate()` check that constructors run before touching the network.
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::admission::Whitelist;
use crate::auth::Secret;
use crate::wire::{OpMode, AUTH_HEADER_SIZE, HEADER_SIZE, MAX_MESSAGE_SIZE};

pub const DEFAULT_MESSAGE_SIZE: usize = 56;
pub const DEFAULT_ITERATION_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_TERMINATE_LINGER: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CLIENTS: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_LOSS_RUN_CAPACITY: usize = 128_000;
/// Repeated per-packet warnings are logged once, then every Nth time.
pub const DEFAULT_LOG_EVERY: u64 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MessageSizeTooSmall { size: usize, min: usize },
    MessageSizeTooLarge { size: usize, max: usize },
    InvalidPacing(String),
    ZeroIterations,
    InvalidRateLimit(f64),
    ZeroMaxClients,
    ZeroDuration(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MessageSizeTooSmall { size, min } => {
                write!(f, "Message size {} is below the {} byte header", size, min)
            }
            ConfigError::MessageSizeTooLarge { size, max } => {
                write!(f, "Message size {} exceeds maximum {}", size, max)
            }
            ConfigError::InvalidPacing(msg) => write!(f, "Invalid pacing: {}", msg),
            ConfigError::ZeroIterations => {
                write!(f, "Iteration count must be positive (omit it to run forever)")
            }
            ConfigError::InvalidRateLimit(rate) => {
                write!(f, "Rate limit must be at least 1 packet/s, got {}", rate)
            }
            ConfigError::ZeroMaxClients => write!(f, "max_clients must be greater than 0"),
            ConfigError::ZeroDuration(name) => write!(f, "{} must be greater than 0", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// How the client spaces its probes. The other quantity is derived from the
/// message size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Fixed delay between consecutive sends.
    Interval(Duration),
    /// Target sending rate in bits per second.
    BitRate(f64),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub mode: OpMode,
    /// Bytes per probe, padded with zeros after the header.
    pub message_size: usize,
    /// `None` sends until interrupted.
    pub iterations: Option<u32>,
    pub pacing: Pacing,
    pub echo_timeout: Duration,
    /// Pause after sending the terminal message.
    pub terminate_linger: Duration,
    pub auth_secret: Option<Secret>,
    /// Spin until each send deadline instead of sleeping.
    pub busy_wait: bool,
}

impl ClientConfig {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            mode: OpMode::Rtt,
            message_size: DEFAULT_MESSAGE_SIZE,
            iterations: None,
            pacing: Pacing::Interval(DEFAULT_ITERATION_DELAY),
            echo_timeout: DEFAULT_ECHO_TIMEOUT,
            terminate_linger: DEFAULT_TERMINATE_LINGER,
            auth_secret: None,
            busy_wait: true,
        }
    }

    pub fn with_mode(mut self, mode: OpMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_message_size(mut self, size: usize) -> Self {
        self.message_size = size;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_echo_timeout(mut self, timeout: Duration) -> Self {
        self.echo_timeout = timeout;
        self
    }

    pub fn with_terminate_linger(mut self, linger: Duration) -> Self {
        self.terminate_linger = linger;
        self
    }

    pub fn with_auth_secret(mut self, secret: Secret) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    pub fn with_busy_wait(mut self, busy_wait: bool) -> Self {
        self.busy_wait = busy_wait;
        self
    }

    /// Bytes actually put on the wire per data probe.
    pub fn wire_size(&self) -> usize {
        let min = if self.auth_secret.is_some() {
            AUTH_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        self.message_size.max(min)
    }

    /// Delay between sends, derived from a bit rate when needed.
    pub fn iteration_delay(&self) -> Result<Duration, ConfigError> {
        match self.pacing {
            Pacing::Interval(delay) => Ok(delay),
            Pacing::BitRate(bps) => crate::clock::interval_for_rate(self.wire_size(), bps)
                .ok_or_else(|| {
                    ConfigError::InvalidPacing(format!(
                        "bit rate {} gives no representable send interval",
                        bps
                    ))
                }),
        }
    }

    /// Nominal send rate in bits per second.
    pub fn send_rate_bps(&self) -> f64 {
        match self.pacing {
            Pacing::BitRate(bps) => bps,
            Pacing::Interval(delay) => crate::clock::rate_for_interval(self.wire_size(), delay),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = if self.auth_secret.is_some() {
            AUTH_HEADER_SIZE
        } else {
            HEADER_SIZE
        };
        if self.message_size < min {
            return Err(ConfigError::MessageSizeTooSmall {
                size: self.message_size,
                min,
            });
        }
        if self.message_size > MAX_MESSAGE_SIZE {
            return Err(ConfigError::MessageSizeTooLarge {
                size: self.message_size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if self.iterations == Some(0) {
            return Err(ConfigError::ZeroIterations);
        }
        match self.pacing {
            Pacing::BitRate(bps) if !(bps.is_finite() && bps > 0.0) => {
                return Err(ConfigError::InvalidPacing(format!(
                    "bit rate must be positive, got {}",
                    bps
                )));
            }
            _ => {}
        }
        self.iteration_delay()?;
        if self.echo_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("echo_timeout"));
        }
        Ok(())
    }
}

/// Server admission policy.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_clients: usize,
    /// Packets per second per source; `None` disables rate limiting.
    pub rate_limit: Option<f64>,
    pub whitelist: Option<Whitelist>,
    /// Enables per-probe token checks.
    pub auth_secret: Option<Secret>,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            rate_limit: None,
            whitelist: None,
            auth_secret: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

impl AdmissionConfig {
    pub fn with_max_clients(mut self, max: usize) -> Self {
        self.max_clients = max;
        self
    }

    pub fn with_rate_limit(mut self, packets_per_second: f64) -> Self {
        self.rate_limit = Some(packets_per_second);
        self
    }

    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = Some(whitelist);
        self
    }

    pub fn with_auth_secret(mut self, secret: Secret) -> Self {
        self.auth_secret = Some(secret);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::ZeroMaxClients);
        }
        if let Some(rate) = self.rate_limit {
            if !(rate.is_finite() && rate >= 1.0) {
                return Err(ConfigError::InvalidRateLimit(rate));
            }
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("idle_timeout"));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("reaper_interval"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Socket read timeout; bounds how long shutdown takes to be noticed.
    pub poll_interval: Duration,
    /// Stop after the first terminal message, as a single-session server.
    pub exit_on_terminate: bool,
    /// Closed loss runs kept for output.
    pub loss_run_capacity: usize,
    pub log_every: u64,
    /// File the summary line is appended to on finish.
    pub results_log: Option<PathBuf>,
    /// File closed loss runs are written to on finish.
    pub loss_run_log: Option<PathBuf>,
    pub admission: AdmissionConfig,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            poll_interval: DEFAULT_POLL_INTERVAL,
            exit_on_terminate: true,
            loss_run_capacity: DEFAULT_LOSS_RUN_CAPACITY,
            log_every: DEFAULT_LOG_EVERY,
            results_log: None,
            loss_run_log: None,
            admission: AdmissionConfig::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_exit_on_terminate(mut self, exit: bool) -> Self {
        self.exit_on_terminate = exit;
        self
    }

    pub fn with_loss_run_capacity(mut self, capacity: usize) -> Self {
        self.loss_run_capacity = capacity;
        self
    }

    pub fn with_log_every(mut self, every: u64) -> Self {
        self.log_every = every;
        self
    }

    pub fn with_results_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_log = Some(path.into());
        self
    }

    pub fn with_loss_run_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.loss_run_log = Some(path.into());
        self
    }

    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll_interval"));
        }
        self.admission.validate()
    }
}
