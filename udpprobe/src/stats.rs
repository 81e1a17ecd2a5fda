// stats.rs - Session counters and end-of-run summaries
use std::fmt;

use crate::sampler::{DelaySample, DelayStats};
use crate::sequence::{LossRun, LossRunLog, SequenceOutcome};
use crate::wire::ProbeHeader;

/// Reason a datagram was refused by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropCause {
    Malformed,
    NotWhitelisted,
    TableFull,
    RateLimited,
    AuthFailed,
    Duplicate,
    OutOfOrder,
    /// Terminal message from a source with no session.
    UnknownSource,
    /// Data after the source's terminal message.
    SessionEnded,
}

impl DropCause {
    pub const COUNT: usize = 9;

    pub const ALL: [DropCause; DropCause::COUNT] = [
        DropCause::Malformed,
        DropCause::NotWhitelisted,
        DropCause::TableFull,
        DropCause::RateLimited,
        DropCause::AuthFailed,
        DropCause::Duplicate,
        DropCause::OutOfOrder,
        DropCause::UnknownSource,
        DropCause::SessionEnded,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DropCause::Malformed => "malformed",
            DropCause::NotWhitelisted => "not-whitelisted",
            DropCause::TableFull => "table-full",
            DropCause::RateLimited => "rate-limited",
            DropCause::AuthFailed => "auth-failed",
            DropCause::Duplicate => "duplicate",
            DropCause::OutOfOrder => "out-of-order",
            DropCause::UnknownSource => "unknown-source",
            DropCause::SessionEnded => "session-ended",
        }
    }
}

impl fmt::Display for DropCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cause drop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts([u64; DropCause::COUNT]);

impl DropCounts {
    pub fn get(&self, cause: DropCause) -> u64 {
        self.0[cause.index()]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    fn increment(&mut self, cause: DropCause) {
        self.0[cause.index()] += 1;
    }

    pub fn iter(&self) -> impl Iterator<Item = (DropCause, u64)> + '_ {
        DropCause::ALL.iter().map(move |&c| (c, self.get(c)))
    }
}

/// Server-side aggregate over every source.
#[derive(Debug)]
pub struct SessionStats {
    first_rx: Option<f64>,
    last_rx: Option<f64>,
    received: u64,
    bytes_received: u64,
    echoed: u64,
    rx_errors: u64,
    tx_errors: u64,
    terminations: u64,
    largest_sequence: u32,
    gap_events: u64,
    lost_in_gaps: u64,
    owd: DelayStats,
    drops: DropCounts,
    loss_runs: LossRunLog,
}

impl SessionStats {
    pub fn new(loss_run_capacity: usize) -> Self {
        Self {
            first_rx: None,
            last_rx: None,
            received: 0,
            bytes_received: 0,
            echoed: 0,
            rx_errors: 0,
            tx_errors: 0,
            terminations: 0,
            largest_sequence: 0,
            gap_events: 0,
            lost_in_gaps: 0,
            owd: DelayStats::owd(),
            drops: DropCounts::default(),
            loss_runs: LossRunLog::new(loss_run_capacity),
        }
    }

    /// Records an admitted data probe and returns its one-way delay sample.
    pub fn record_accepted(
        &mut self,
        header: &ProbeHeader,
        bytes: usize,
        recv_wall: f64,
        outcome: &SequenceOutcome,
    ) -> DelaySample {
        self.first_rx.get_or_insert(recv_wall);
        self.last_rx = Some(recv_wall);
        self.received += 1;
        self.bytes_received += bytes as u64;
        self.largest_sequence = self.largest_sequence.max(header.sequence);

        match outcome {
            SequenceOutcome::GapOpened { .. } => self.gap_events += 1,
            SequenceOutcome::GapClosed(run) => {
                self.lost_in_gaps += run.length as u64;
                self.loss_runs.push(*run);
            }
            SequenceOutcome::InOrder | SequenceOutcome::GapExtended { .. } => {}
        }

        let owd = recv_wall - header.send_time().as_secs_f64();
        self.owd.record(owd, recv_wall)
    }

    pub fn record_drop(&mut self, cause: DropCause) {
        self.drops.increment(cause);
    }

    pub fn record_terminate(&mut self) {
        self.terminations += 1;
    }

    pub fn record_echo(&mut self) {
        self.echoed += 1;
    }

    pub fn record_rx_error(&mut self) {
        self.rx_errors += 1;
    }

    pub fn record_tx_error(&mut self) {
        self.tx_errors += 1;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn largest_sequence(&self) -> u32 {
        self.largest_sequence
    }

    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    pub fn drops(&self) -> &DropCounts {
        &self.drops
    }

    pub fn owd(&self) -> &DelayStats {
        &self.owd
    }

    pub fn loss_runs(&self) -> impl Iterator<Item = &LossRun> {
        self.loss_runs.iter()
    }

    pub fn terminations(&self) -> u64 {
        self.terminations
    }

    /// Computes the end-of-run figures.
    ///
    /// `trials` is the number of probes the senders are believed to have
    /// sent: the sum over sources of each stream's largest sequence.
    pub fn summarize(&self, trials: u64) -> ServerSummary {
        let duration = match (self.first_rx, self.last_rx) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let throughput_bps = if duration > 0.0 {
            self.bytes_received as f64 * 8.0 / duration
        } else {
            0.0
        };

        let lost_by_sequence = trials.saturating_sub(self.received);
        let loss_rate_sequence = ratio(lost_by_sequence, trials);

        let observed = self.received + self.lost_in_gaps;
        let (loss_rate_gaps, loss_event_rate) = if self.received > 0 {
            (
                ratio(self.lost_in_gaps, observed),
                ratio(self.gap_events, observed),
            )
        } else {
            (0.0, 0.0)
        };

        ServerSummary {
            duration,
            mean_owd: self.owd.mean().unwrap_or(0.0),
            min_owd: self.owd.min().unwrap_or(0.0),
            max_owd: self.owd.max().unwrap_or(0.0),
            smoothed_owd: self.owd.smoothed().unwrap_or(0.0),
            throughput_bps,
            loss_rate_gaps,
            mean_run_length: ratio(self.lost_in_gaps, self.gap_events),
            loss_event_rate,
            gap_events: self.gap_events,
            lost_in_gaps: self.lost_in_gaps,
            loss_rate_sequence,
            lost_by_sequence,
            received: self.received,
            negative_owd: self.owd.negative_count(),
            echoed: self.echoed,
            rx_errors: self.rx_errors,
            tx_errors: self.tx_errors,
            drops: self.drops,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}

/// Server end-of-run record.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSummary {
    /// Seconds between first and last accepted probe.
    pub duration: f64,
    pub mean_owd: f64,
    pub min_owd: f64,
    pub max_owd: f64,
    pub smoothed_owd: f64,
    pub throughput_bps: f64,
    /// Loss estimate from summed loss-run lengths.
    pub loss_rate_gaps: f64,
    pub mean_run_length: f64,
    pub loss_event_rate: f64,
    pub gap_events: u64,
    pub lost_in_gaps: u64,
    /// Loss estimate from largest sequence seen vs probes received.
    pub loss_rate_sequence: f64,
    pub lost_by_sequence: u64,
    pub received: u64,
    pub negative_owd: u64,
    pub echoed: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub drops: DropCounts,
}

impl ServerSummary {
    pub const HEADER: &'static str = "duration\tmeanOWD\tminOWD\tmaxOWD\tavgTh\tavgLR2\tavgGapSz\tavgLER\tnumOfGps\ttotLost2\tavgLR1\ttotLost1\trxCount\tnegOWDs\tdropped";
}

impl fmt::Display for ServerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}\t{:.9}\t{:.9}\t{:.9}\t{:.0}\t{:.6}\t{:.6}\t{:.6}\t{}\t{}\t{:.6}\t{}\t{}\t{}\t{}",
            self.duration,
            self.mean_owd,
            self.min_owd,
            self.max_owd,
            self.throughput_bps,
            self.loss_rate_gaps,
            self.mean_run_length,
            self.loss_event_rate,
            self.gap_events,
            self.lost_in_gaps,
            self.loss_rate_sequence,
            self.lost_by_sequence,
            self.received,
            self.negative_owd,
            self.drops.total(),
        )
    }
}

/// Client-side counters.
#[derive(Debug)]
pub struct ClientStats {
    pub sent: u64,
    pub bytes_sent: u64,
    pub received: u64,
    pub timeouts: u64,
    pub stale_echoes: u64,
    pub size_mismatches: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub first_tx: Option<f64>,
    pub last_tx: Option<f64>,
    pub rtt: DelayStats,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self {
            sent: 0,
            bytes_sent: 0,
            received: 0,
            timeouts: 0,
            stale_echoes: 0,
            size_mismatches: 0,
            tx_errors: 0,
            rx_errors: 0,
            first_tx: None,
            last_tx: None,
            rtt: DelayStats::rtt(),
        }
    }
}

impl ClientStats {
    pub fn record_sent(&mut self, bytes: usize, wall: f64) {
        self.sent += 1;
        self.bytes_sent += bytes as u64;
        self.first_tx.get_or_insert(wall);
        self.last_tx = Some(wall);
    }

    pub fn summarize(&self) -> ClientSummary {
        let duration = match (self.first_tx, self.last_tx) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        let send_rate_bps = if duration > 0.0 {
            self.bytes_sent as f64 * 8.0 / duration
        } else {
            0.0
        };
        ClientSummary {
            duration,
            mean_rtt: self.rtt.mean().unwrap_or(0.0),
            min_rtt: self.rtt.min().unwrap_or(0.0),
            max_rtt: self.rtt.max().unwrap_or(0.0),
            smoothed_rtt: self.rtt.smoothed().unwrap_or(0.0),
            send_rate_bps,
            loss_rate: ratio(self.timeouts, self.sent),
            samples: self.rtt.count(),
            lost: self.timeouts,
            sent: self.sent,
            stale_echoes: self.stale_echoes,
            tx_errors: self.tx_errors,
            rx_errors: self.rx_errors,
        }
    }
}

/// Client end-of-run record. Loss figures are only meaningful in RTT mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSummary {
    pub duration: f64,
    pub mean_rtt: f64,
    pub min_rtt: f64,
    pub max_rtt: f64,
    pub smoothed_rtt: f64,
    pub send_rate_bps: f64,
    pub loss_rate: f64,
    pub samples: u64,
    /// Echo timeouts.
    pub lost: u64,
    pub sent: u64,
    pub stale_echoes: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
}

impl ClientSummary {
    pub const HEADER: &'static str =
        "duration\tavgRTT\tminRTT\tmaxRTT\tavgSendrate\tavgLossRate\tnumberRTTSamples\ttotalLost\ttotalPacketsSent";
}

impl fmt::Display for ClientSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6}\t{:.9}\t{:.9}\t{:.9}\t{:.0}\t{:.4}\t{}\t{}\t{}",
            self.duration,
            self.mean_rtt,
            self.min_rtt,
            self.max_rtt,
            self.send_rate_bps,
            self.loss_rate,
            self.samples,
            self.lost,
            self.sent,
        )
    }
}

/// Raw datagram totals for one socket, admitted or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl fmt::Display for SocketStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} datagrams ({} bytes) in, {} datagrams ({} bytes) out",
            self.packets_received, self.bytes_received, self.packets_sent, self.bytes_sent
        )
    }
}
