//! Probe sender.
//!
//! [`ProbeClient`] sends sequenced, timestamped probes on an absolute-deadline
//! schedule. In RTT mode it waits for each echo up to `echo_timeout` before
//! moving on; in one-way mode it only sends. Either way the run ends with a
//! terminal message so the server can finalize its statistics.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::auth::{default_scheme, TokenScheme};
use crate::clock::{wall_clock_secs, DeadlineWait, PacingSchedule, SleepWait, SpinWait, WallTime};
use crate::config::{ClientConfig, DEFAULT_LOG_EVERY};
use crate::sink::{NullSink, RttSampleLine, SampleSink};
use crate::socket::{ProbeSocket, SocketError, MAX_DATAGRAM_SIZE};
use crate::stats::{ClientStats, ClientSummary, SocketStats};
use crate::util::LogSampler;
use crate::wire::{self, OpMode, ProbeHeader, TERMINAL_SEQUENCE};
use crate::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    Sending,
    AwaitEcho,
    Terminating,
    Done,
}

pub struct ProbeClient {
    socket: ProbeSocket,
    config: ClientConfig,
    state: ClientState,
    next_sequence: u32,
    stats: ClientStats,
    scheme: Option<Box<dyn TokenScheme>>,
    waiter: Box<dyn DeadlineWait>,
    sink: Box<dyn SampleSink>,
    timeout_log: LogSampler,
    error_log: LogSampler,
    tx_buffer: Vec<u8>,
    rx_buffer: Vec<u8>,
}

impl ProbeClient {
    /// Validates `config` and opens a socket of the server's address family.
    pub fn new(config: ClientConfig) -> Result<Self, ProbeError> {
        config.validate()?;
        let socket = ProbeSocket::bind_for(config.server)?;
        let waiter: Box<dyn DeadlineWait> = if config.busy_wait {
            Box::new(SpinWait)
        } else {
            Box::new(SleepWait)
        };
        let scheme = config.auth_secret.as_ref().map(default_scheme);
        let tx_buffer = Vec::with_capacity(config.wire_size());

        Ok(Self {
            socket,
            config,
            state: ClientState::Init,
            next_sequence: 1,
            stats: ClientStats::default(),
            scheme,
            waiter,
            sink: Box::new(NullSink),
            timeout_log: LogSampler::new(DEFAULT_LOG_EVERY),
            error_log: LogSampler::new(DEFAULT_LOG_EVERY),
            tx_buffer,
            rx_buffer: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn SampleSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_waiter(mut self, waiter: Box<dyn DeadlineWait>) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn socket_stats(&self) -> &SocketStats {
        self.socket.stats()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, SocketError> {
        self.socket.local_addr()
    }

    #[cfg(test)]
    pub(crate) fn set_next_sequence(&mut self, sequence: u32) {
        self.next_sequence = sequence;
    }

    /// Sends probes until the iteration count is reached or `stop` is set,
    /// then sends the terminal message and returns the run summary.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<ClientSummary, ProbeError> {
        let interval = self.config.iteration_delay()?;
        log::info!(
            "Probing {} in {} mode: {} byte probes every {:?} ({:.0} bit/s)",
            self.config.server,
            self.config.mode,
            self.config.wire_size(),
            interval,
            self.config.send_rate_bps()
        );

        let mut schedule = PacingSchedule::start(interval);
        let mut completed: u64 = 0;
        self.state = ClientState::Sending;

        while !stop.load(Ordering::Relaxed) {
            let Some(sequence) = self.take_sequence() else {
                log::error!("Sequence space exhausted after {} probes", self.stats.sent);
                self.terminate();
                return Err(ProbeError::SequenceExhausted);
            };

            let sent_at = self.send_probe(sequence)?;
            if let (OpMode::Rtt, Some(sent_at)) = (self.config.mode, sent_at) {
                self.state = ClientState::AwaitEcho;
                self.await_echo(sequence, sent_at);
                self.state = ClientState::Sending;
            }

            completed += 1;
            if self
                .config
                .iterations
                .is_some_and(|limit| completed >= u64::from(limit))
            {
                break;
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }
            schedule.wait_next(self.waiter.as_mut());
        }

        self.terminate();
        Ok(self.finish())
    }

    fn take_sequence(&mut self) -> Option<u32> {
        if self.next_sequence == TERMINAL_SEQUENCE {
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(sequence)
    }

    /// Builds and sends one probe. Returns the monotonic send time, or `None`
    /// if the send failed (counted, not fatal).
    fn send_probe(&mut self, sequence: u32) -> Result<Option<Instant>, ProbeError> {
        let sent_wall = WallTime::now();
        let header = ProbeHeader::data(sequence, sent_wall, self.config.mode);
        let token = self.scheme.as_ref().map(|scheme| scheme.derive(sequence));
        wire::fill_probe(
            &mut self.tx_buffer,
            &header,
            self.config.message_size,
            token.as_ref(),
        )?;

        let sent_at = Instant::now();
        match self.socket.send_to(&self.tx_buffer, self.config.server) {
            Ok(sent) => {
                if sent != self.tx_buffer.len() {
                    self.stats.size_mismatches += 1;
                }
                self.stats.record_sent(sent, sent_wall.as_secs_f64());
                Ok(Some(sent_at))
            }
            Err(e) => {
                self.stats.tx_errors += 1;
                if self.error_log.should_log() {
                    log::warn!("Failed to send probe {}: {}", sequence, e);
                }
                Ok(None)
            }
        }
    }

    /// Waits for the echo of `sequence`; stale echoes are counted and skipped.
    fn await_echo(&mut self, sequence: u32, sent_at: Instant) {
        let deadline = sent_at + self.config.echo_timeout;
        loop {
            let (len, from) = match self.socket.recv_until(&mut self.rx_buffer, deadline) {
                Ok(received) => received,
                Err(SocketError::Timeout) => {
                    self.stats.timeouts += 1;
                    if self.timeout_log.should_log() {
                        log::warn!(
                            "No echo for probe {} within {:?} ({} timeouts so far)",
                            sequence,
                            self.config.echo_timeout,
                            self.stats.timeouts
                        );
                    }
                    return;
                }
                Err(e) => {
                    self.stats.rx_errors += 1;
                    if self.error_log.should_log() {
                        log::warn!("Receive failed while awaiting echo: {}", e);
                    }
                    continue;
                }
            };
            let rtt = sent_at.elapsed().as_secs_f64();

            if from != self.config.server {
                log::debug!("Ignoring datagram from unexpected peer {}", from);
                continue;
            }
            let header = match ProbeHeader::decode(&self.rx_buffer[..len]) {
                Ok(header) => header,
                Err(e) => {
                    self.stats.rx_errors += 1;
                    log::debug!("Undecodable echo: {}", e);
                    continue;
                }
            };
            if header.sequence != sequence {
                // Late echo of an earlier probe that already timed out
                self.stats.stale_echoes += 1;
                continue;
            }
            if len != self.tx_buffer.len() {
                self.stats.size_mismatches += 1;
            }

            self.stats.received += 1;
            let sample = self.stats.rtt.record(rtt, wall_clock_secs());
            let line = RttSampleLine {
                mode: header.mode,
                size: len,
                sample,
                received: self.stats.received,
                samples: self.stats.rtt.count(),
            };
            if let Err(e) = self.sink.write_sample(&line) {
                log::warn!("Failed to write RTT sample: {}", e);
            }
            return;
        }
    }

    /// Sends the terminal message and lingers so it can drain.
    fn terminate(&mut self) {
        self.state = ClientState::Terminating;
        let terminal = wire::build_terminal(WallTime::now(), self.config.mode);
        if let Err(e) = self.socket.send_to(&terminal, self.config.server) {
            self.stats.tx_errors += 1;
            log::warn!("Failed to send terminal message: {}", e);
        }
        if !self.config.terminate_linger.is_zero() {
            std::thread::sleep(self.config.terminate_linger);
        }
        self.state = ClientState::Done;
    }

    fn finish(&mut self) -> ClientSummary {
        let summary = self.stats.summarize();
        if let Err(e) = self.sink.write_summary(ClientSummary::HEADER, &summary) {
            log::warn!("Failed to write client summary: {}", e);
        }
        log::info!(
            "Sent {} probes, {} echoes, {} timeouts, {} stale",
            summary.sent,
            self.stats.received,
            summary.lost,
            summary.stale_echoes
        );
        log::info!("Socket totals: {}", self.socket.stats());
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Pacing;
    use std::net::{SocketAddr, UdpSocket};
    use std::thread;
    use std::time::Duration;

    /// Echoes every datagram until the terminal message; returns what it saw.
    fn spawn_echo(reply: bool) -> (SocketAddr, thread::JoinHandle<Vec<ProbeHeader>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = socket.recv_from(&mut buf) {
                let header = ProbeHeader::decode(&buf[..len]).unwrap();
                seen.push(header);
                if header.is_terminal() {
                    break;
                }
                if reply {
                    socket.send_to(&buf[..len], from).unwrap();
                }
            }
            seen
        });
        (addr, handle)
    }

    fn fast_config(server: SocketAddr) -> ClientConfig {
        ClientConfig::new(server)
            .with_pacing(Pacing::Interval(Duration::from_millis(2)))
            .with_terminate_linger(Duration::ZERO)
            .with_busy_wait(false)
    }

    #[test]
    fn test_rtt_run_collects_samples() {
        let (server, echo) = spawn_echo(true);
        let mut client = ProbeClient::new(fast_config(server).with_iterations(5)).unwrap();
        assert_eq!(client.state(), ClientState::Init);

        let summary = client.run(&AtomicBool::new(false)).unwrap();
        let seen = echo.join().unwrap();

        assert_eq!(client.state(), ClientState::Done);
        assert_eq!(summary.sent, 5);
        assert_eq!(summary.samples, 5);
        assert_eq!(summary.lost, 0);
        assert!(summary.min_rtt >= 0.0);
        assert!(summary.max_rtt < 2.0);

        let sequences: Vec<u32> = seen.iter().map(|h| h.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, TERMINAL_SEQUENCE]);

        // Five probes plus the terminal message went out; five echoes came back
        assert_eq!(client.socket_stats().packets_sent, 6);
        assert_eq!(client.socket_stats().packets_received, 5);
    }

    #[test]
    fn test_missing_echoes_count_as_timeouts() {
        let (server, echo) = spawn_echo(false);
        let config = fast_config(server)
            .with_iterations(3)
            .with_echo_timeout(Duration::from_millis(20));
        let mut client = ProbeClient::new(config).unwrap();

        let summary = client.run(&AtomicBool::new(false)).unwrap();
        echo.join().unwrap();

        assert_eq!(summary.sent, 3);
        assert_eq!(summary.lost, 3);
        assert_eq!(summary.samples, 0);
        assert!((summary.loss_rate - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_one_way_probes_padded_to_message_size() {
        let (server, echo) = spawn_echo(false);
        let config = fast_config(server)
            .with_mode(OpMode::OneWay)
            .with_message_size(200)
            .with_iterations(4);
        let mut client = ProbeClient::new(config).unwrap();
        let summary = client.run(&AtomicBool::new(false)).unwrap();
        let seen = echo.join().unwrap();

        assert_eq!(summary.sent, 4);
        assert_eq!(client.stats().bytes_sent, 800);
        assert!(seen.iter().all(|h| h.mode == OpMode::OneWay));
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_stop_flag_still_terminates() {
        let (server, echo) = spawn_echo(true);
        let mut client = ProbeClient::new(fast_config(server)).unwrap();
        let summary = client.run(&AtomicBool::new(true)).unwrap();
        let seen = echo.join().unwrap();

        assert_eq!(summary.sent, 0);
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_terminal());
    }

    #[test]
    fn test_sequence_exhaustion_is_fatal() {
        let (server, echo) = spawn_echo(false);
        let config = fast_config(server).with_mode(OpMode::OneWay);
        let mut client = ProbeClient::new(config).unwrap();
        client.set_next_sequence(TERMINAL_SEQUENCE - 1);

        let result = client.run(&AtomicBool::new(false));
        let seen = echo.join().unwrap();

        assert!(matches!(result, Err(ProbeError::SequenceExhausted)));
        let sequences: Vec<u32> = seen.iter().map(|h| h.sequence).collect();
        assert_eq!(sequences, vec![TERMINAL_SEQUENCE - 1, TERMINAL_SEQUENCE]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::new("127.0.0.1:9".parse().unwrap()).with_message_size(4);
        assert!(matches!(
            ProbeClient::new(config),
            Err(ProbeError::Config(_))
        ));
    }
}
