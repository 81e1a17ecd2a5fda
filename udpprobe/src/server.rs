//! Server-side receive loop.
//!
//! [`ProbeServer`] receives probes, runs each through admission control,
//! samples one-way delay for the ones it accepts and echoes RTT-mode probes
//! back to their sender. A background reaper evicts idle sources while the
//! loop runs. The session summary is computed and emitted exactly once.
use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::admission::{Admission, AdmissionControl};
use crate::clock::wall_clock_secs;
use crate::config::ServerConfig;
use crate::reaper::{self, ReaperHandle};
use crate::sampler::DelaySample;
use crate::sequence::SequenceOutcome;
use crate::sink::{self, NullSink, OwdSampleLine, SampleSink};
use crate::socket::{ProbeSocket, SocketError, MAX_DATAGRAM_SIZE};
use crate::stats::{DropCause, ServerSummary, SessionStats, SocketStats};
use crate::util::LogSampler;
use crate::wire::{self, OpMode, ProbeHeader};
use crate::ProbeError;

/// Result of processing one receive attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The poll interval elapsed with nothing received.
    Idle,
    Accepted {
        addr: SocketAddr,
        sequence: u32,
        sample: DelaySample,
        outcome: SequenceOutcome,
    },
    Dropped {
        addr: SocketAddr,
        cause: DropCause,
    },
    Terminated {
        addr: SocketAddr,
    },
    ReceiveError,
}

pub struct ProbeServer {
    socket: ProbeSocket,
    config: ServerConfig,
    admission: Arc<AdmissionControl>,
    stats: SessionStats,
    reaper: Option<ReaperHandle>,
    sink: Box<dyn SampleSink>,
    drop_log: [LogSampler; DropCause::COUNT],
    error_log: LogSampler,
    rx_buffer: Vec<u8>,
    tx_buffer: Vec<u8>,
    finished: bool,
    summary: Option<ServerSummary>,
}

impl ProbeServer {
    /// Validates `config`, binds the socket and starts the reaper.
    pub fn bind(config: ServerConfig) -> Result<Self, ProbeError> {
        config.validate()?;
        let socket = ProbeSocket::bind(config.bind)?;
        socket.set_read_timeout(Some(config.poll_interval))?;

        let admission = Arc::new(AdmissionControl::new(&config.admission));
        let reaper = reaper::spawn(Arc::clone(&admission), config.admission.reaper_interval)?;

        log::info!(
            "Probe server on {} (max clients {}, rate limit {}, whitelist {}, auth {})",
            socket.local_addr()?,
            config.admission.max_clients,
            config
                .admission
                .rate_limit
                .map_or_else(|| "off".to_string(), |r| format!("{}/s", r)),
            config
                .admission
                .whitelist
                .as_ref()
                .map_or_else(|| "off".to_string(), |w| format!("{} entries", w.len())),
            if admission.requires_auth() { "on" } else { "off" },
        );

        let log_every = config.log_every;
        Ok(Self {
            socket,
            stats: SessionStats::new(config.loss_run_capacity),
            config,
            admission,
            reaper: Some(reaper),
            sink: Box::new(NullSink),
            drop_log: std::array::from_fn(|_| LogSampler::new(log_every)),
            error_log: LogSampler::new(log_every),
            rx_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
            tx_buffer: Vec::new(),
            finished: false,
            summary: None,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.socket.local_addr()
    }

    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn socket_stats(&self) -> &SocketStats {
        self.socket.stats()
    }

    /// True once a terminal message ended the session.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn summary(&self) -> Option<&ServerSummary> {
        self.summary.as_ref()
    }

    /// Waits up to one poll interval for a datagram and handles it.
    pub fn process_next(&mut self) -> ServerEvent {
        let mut buf = std::mem::take(&mut self.rx_buffer);
        let event = match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                self.handle_datagram(&buf[..len], from, Instant::now(), wall_clock_secs())
            }
            Err(SocketError::Timeout) => ServerEvent::Idle,
            Err(e) => {
                self.stats.record_rx_error();
                if self.error_log.should_log() {
                    log::warn!("Receive failed: {}", e);
                }
                ServerEvent::ReceiveError
            }
        };
        self.rx_buffer = buf;
        event
    }

    /// Runs one datagram through admission, sampling and echo.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
        recv_wall: f64,
    ) -> ServerEvent {
        match self.admission.admit(from.ip(), datagram, now, recv_wall) {
            Admission::Accepted {
                header,
                outcome,
                first_contact,
            } => {
                if first_contact {
                    log::info!("New client {} ({} mode)", from, header.mode);
                }
                self.accept(datagram, from, &header, outcome, recv_wall)
            }
            Admission::Terminate { header } => {
                self.stats.record_terminate();
                log::info!(
                    "Client {} sent terminal message ({} mode)",
                    from,
                    header.mode
                );
                if self.config.exit_on_terminate {
                    self.finished = true;
                }
                ServerEvent::Terminated { addr: from }
            }
            Admission::Dropped(cause) => {
                self.stats.record_drop(cause);
                if self.drop_log[cause.index()].should_log() {
                    log::warn!(
                        "Dropped datagram from {}: {} ({} so far)",
                        from,
                        cause,
                        self.stats.drops().get(cause)
                    );
                }
                ServerEvent::Dropped { addr: from, cause }
            }
        }
    }

    fn accept(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        header: &ProbeHeader,
        outcome: SequenceOutcome,
        recv_wall: f64,
    ) -> ServerEvent {
        match outcome {
            SequenceOutcome::GapOpened { start, length } => {
                log::debug!("{}: {} probes missing from {}", from, length, start);
            }
            SequenceOutcome::GapClosed(run) => {
                log::debug!(
                    "{}: loss run of {} from {} closed",
                    from,
                    run.length,
                    run.start_sequence
                );
            }
            SequenceOutcome::InOrder | SequenceOutcome::GapExtended { .. } => {}
        }

        let sample = self
            .stats
            .record_accepted(header, datagram.len(), recv_wall, &outcome);
        let line = OwdSampleLine {
            mode: header.mode,
            size: datagram.len(),
            largest_sequence: self.stats.largest_sequence(),
            sequence: header.sequence,
            sent: header.send_time(),
            sample,
        };
        if let Err(e) = self.sink.write_sample(&line) {
            if self.error_log.should_log() {
                log::warn!("Failed to write OWD sample: {}", e);
            }
        }

        if header.mode == OpMode::Rtt {
            self.echo(datagram, header.sequence, from);
        }

        ServerEvent::Accepted {
            addr: from,
            sequence: header.sequence,
            sample,
            outcome,
        }
    }

    /// Sends the probe back unchanged apart from a fresh auth token.
    fn echo(&mut self, datagram: &[u8], sequence: u32, to: SocketAddr) {
        self.tx_buffer.clear();
        self.tx_buffer.extend_from_slice(datagram);
        if let Some(token) = self.admission.derive_token(sequence) {
            // Admission already checked the trailer is present
            let _ = wire::write_token(&mut self.tx_buffer, &token);
        }
        match self.socket.send_to(&self.tx_buffer, to) {
            Ok(_) => self.stats.record_echo(),
            Err(e) => {
                self.stats.record_tx_error();
                if self.error_log.should_log() {
                    log::warn!("Failed to echo probe {} to {}: {}", sequence, to, e);
                }
            }
        }
    }

    /// Receives until `stop` is set or the session finishes, then finalizes.
    pub fn run(&mut self, stop: &AtomicBool) -> ServerSummary {
        while !self.finished && !stop.load(Ordering::Relaxed) {
            self.process_next();
        }
        self.finalize()
    }

    /// Stops the reaper and emits the summary. Later calls return the same
    /// summary without emitting it again.
    pub fn finalize(&mut self) -> ServerSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        self.shutdown();

        let summary = self.stats.summarize(self.admission.trials());
        if let Err(e) = self.sink.write_summary(ServerSummary::HEADER, &summary) {
            log::warn!("Failed to write server summary: {}", e);
        }
        if let Some(path) = &self.config.results_log {
            if let Err(e) = sink::append_results(path, &summary) {
                log::warn!("Failed to append results to {}: {}", path.display(), e);
            }
        }
        if let Some(path) = &self.config.loss_run_log {
            if let Err(e) = self.write_loss_runs(path) {
                log::warn!("Failed to write loss runs to {}: {}", path.display(), e);
            }
        }

        for (cause, count) in summary.drops.iter().filter(|(_, count)| *count > 0) {
            log::info!("Dropped {} datagrams: {}", count, cause);
        }
        log::info!(
            "Session complete: {} received, {} echoed, {} lost in {} loss runs, {} evictions",
            summary.received,
            summary.echoed,
            summary.lost_in_gaps,
            summary.gap_events,
            self.admission.evictions()
        );
        log::info!("Socket totals: {}", self.socket.stats());

        self.summary = Some(summary.clone());
        summary
    }

    fn write_loss_runs(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        sink::write_loss_runs(&mut writer, self.stats.loss_runs())
    }

    /// Stops the reaper thread. Called by `finalize` and on drop.
    pub fn shutdown(&mut self) {
        if let Some(mut reaper) = self.reaper.take() {
            reaper.stop();
        }
    }
}

impl Drop for ProbeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallTime;
    use crate::wire::{build_probe, build_terminal};
    use std::net::UdpSocket;
    use std::time::Duration;

    fn server(config: ServerConfig) -> ProbeServer {
        ProbeServer::bind(config.with_poll_interval(Duration::from_millis(20))).unwrap()
    }

    fn local_config() -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap())
    }

    fn probe(sequence: u32, mode: OpMode) -> Vec<u8> {
        let header = ProbeHeader::data(sequence, WallTime::now(), mode);
        build_probe(&header, 64, None).unwrap()
    }

    #[test]
    fn test_idle_when_nothing_arrives() {
        let mut server = server(local_config());
        assert_eq!(server.process_next(), ServerEvent::Idle);
    }

    #[test]
    fn test_rtt_probe_is_echoed() {
        let mut server = server(local_config());
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let datagram = probe(1, OpMode::Rtt);
        client.send_to(&datagram, server_addr).unwrap();
        let event = server.process_next();
        assert!(matches!(event, ServerEvent::Accepted { sequence: 1, .. }));

        let mut buf = [0u8; 128];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &datagram[..]);
        assert_eq!(server.stats().echoed(), 1);
        assert_eq!(server.socket_stats().packets_received, 1);
        assert_eq!(server.socket_stats().packets_sent, 1);
        assert_eq!(server.socket_stats().bytes_sent, datagram.len() as u64);
    }

    #[test]
    fn test_terminal_finishes_session() {
        let mut server = server(local_config());
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let now = Instant::now();

        server.handle_datagram(&probe(1, OpMode::OneWay), from, now, wall_clock_secs());
        let terminal = build_terminal(WallTime::now(), OpMode::OneWay);
        assert_eq!(
            server.handle_datagram(&terminal, from, now, wall_clock_secs()),
            ServerEvent::Terminated { addr: from }
        );
        assert!(server.is_finished());

        let summary = server.run(&AtomicBool::new(false));
        assert_eq!(summary.received, 1);
    }

    #[test]
    fn test_keep_running_after_terminal() {
        let mut server = server(local_config().with_exit_on_terminate(false));
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let now = Instant::now();
        server.handle_datagram(&probe(1, OpMode::OneWay), from, now, 0.0);
        let terminal = build_terminal(WallTime::now(), OpMode::OneWay);
        server.handle_datagram(&terminal, from, now, 0.0);
        assert!(!server.is_finished());
        assert_eq!(
            server.handle_datagram(&probe(2, OpMode::OneWay), from, now, 0.0),
            ServerEvent::Dropped {
                addr: from,
                cause: DropCause::SessionEnded
            }
        );
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut server = server(local_config());
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        server.handle_datagram(&probe(1, OpMode::OneWay), from, Instant::now(), 0.0);
        server.handle_datagram(&[0u8; 3], from, Instant::now(), 0.0);

        let first = server.finalize();
        let second = server.finalize();
        assert_eq!(first, second);
        assert_eq!(first.drops.get(DropCause::Malformed), 1);
        assert!(server.summary().is_some());
    }
}
