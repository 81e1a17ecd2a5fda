use crate::{
    clock::WallTime,
    config::{AdmissionConfig, ServerConfig},
    sampler::OWD_ALPHA,
    server::{ProbeServer, ServerEvent},
    sink::SampleSink,
    stats::DropCause,
    wire::{build_probe, build_terminal, OpMode, ProbeHeader},
};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BASE_SECS: u32 = 1_700_000_000;

/// Collects everything written to it so tests can inspect output.
#[derive(Clone, Default)]
struct CaptureSink {
    samples: Arc<Mutex<Vec<String>>>,
    summaries: Arc<Mutex<Vec<String>>>,
}

impl SampleSink for CaptureSink {
    fn write_sample(&mut self, line: &dyn fmt::Display) -> io::Result<()> {
        self.samples.lock().push(line.to_string());
        Ok(())
    }

    fn write_summary(&mut self, header: &str, summary: &dyn fmt::Display) -> io::Result<()> {
        self.summaries.lock().push(format!("{}\n{}", header, summary));
        Ok(())
    }
}

fn source(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn other_source(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 2], port))
}

fn one_way_server(admission: AdmissionConfig) -> ProbeServer {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_poll_interval(Duration::from_millis(20))
        .with_admission(admission);
    ProbeServer::bind(config).unwrap()
}

/// Probe stamped `send` seconds after `BASE_SECS`.
fn probe_at(sequence: u32, send_secs: u32, send_nanos: u32) -> Vec<u8> {
    let header = ProbeHeader::data(
        sequence,
        WallTime::new(BASE_SECS + send_secs, send_nanos),
        OpMode::OneWay,
    );
    build_probe(&header, 56, None).unwrap()
}

fn recv_wall(offset: f64) -> f64 {
    BASE_SECS as f64 + offset
}

#[test]
fn test_lossy_stream_yields_two_single_losses() {
    let mut server = one_way_server(AdmissionConfig::default());
    let now = Instant::now();

    for seq in [1u32, 2, 4, 5, 6, 8, 9, 10] {
        let event = server.handle_datagram(
            &probe_at(seq, seq, 0),
            source(4000),
            now,
            recv_wall(seq as f64 + 0.01),
        );
        assert!(matches!(event, ServerEvent::Accepted { .. }));
    }
    let terminal = build_terminal(WallTime::new(BASE_SECS + 11, 0), OpMode::OneWay);
    server.handle_datagram(&terminal, source(4000), now, recv_wall(11.0));
    assert!(server.is_finished());

    let summary = server.finalize();
    assert_eq!(summary.received, 8);
    assert_eq!(summary.gap_events, 2);
    assert_eq!(summary.lost_in_gaps, 2);
    assert_eq!(summary.lost_by_sequence, 2);

    let runs: Vec<(u32, u32)> = server
        .stats()
        .loss_runs()
        .map(|run| (run.start_sequence, run.length))
        .collect();
    assert_eq!(runs, vec![(3, 1), (7, 1)]);
}

#[test]
fn test_terminal_mid_stream_finalizes_once() {
    let sink = CaptureSink::default();
    let mut server = one_way_server(AdmissionConfig::default()).with_sink(Box::new(sink.clone()));
    let now = Instant::now();

    for seq in 1..=3 {
        server.handle_datagram(&probe_at(seq, seq, 0), source(4000), now, recv_wall(seq as f64));
    }
    let terminal = build_terminal(WallTime::new(BASE_SECS + 4, 0), OpMode::OneWay);
    assert_eq!(
        server.handle_datagram(&terminal, source(4000), now, recv_wall(4.0)),
        ServerEvent::Terminated {
            addr: source(4000)
        }
    );

    // Data after the terminal message is not processed
    assert_eq!(
        server.handle_datagram(&probe_at(4, 5, 0), source(4000), now, recv_wall(5.0)),
        ServerEvent::Dropped {
            addr: source(4000),
            cause: DropCause::SessionEnded
        }
    );

    let first = server.run(&AtomicBool::new(false));
    let second = server.finalize();
    assert_eq!(first, second);
    assert_eq!(first.received, 3);
    assert_eq!(sink.summaries.lock().len(), 1);
}

#[test]
fn test_rate_limited_burst() {
    let mut server = one_way_server(AdmissionConfig::default().with_rate_limit(100.0));
    let now = Instant::now();

    for seq in 1..=150 {
        server.handle_datagram(&probe_at(seq, 0, seq), source(4000), now, recv_wall(0.5));
    }

    let summary = server.finalize();
    assert_eq!(summary.received, 100);
    assert_eq!(summary.drops.get(DropCause::RateLimited), 50);
    assert_eq!(summary.drops.total(), 50);
}

#[test]
fn test_bucket_refills_over_time() {
    let mut server = one_way_server(AdmissionConfig::default().with_rate_limit(10.0));
    let start = Instant::now();
    let mut accepted = 0;

    // 40 probes spread over two seconds: 10 from the initial bucket plus
    // roughly 10 refilled per second
    for seq in 1..=40u32 {
        let now = start + Duration::from_millis(u64::from(seq) * 50);
        if let ServerEvent::Accepted { .. } =
            server.handle_datagram(&probe_at(seq, 0, 0), source(4000), now, recv_wall(0.0))
        {
            accepted += 1;
        }
    }
    assert!((29..=31).contains(&accepted), "accepted {}", accepted);
}

#[test]
fn test_owd_smoothing_follows_ewma() {
    let mut server = one_way_server(AdmissionConfig::default());
    let now = Instant::now();
    let delays = [0.010, 0.030, 0.020, 0.050];

    let mut smoothed: Option<f64> = None;
    for (i, delay) in delays.iter().enumerate() {
        let seq = i as u32 + 1;
        let event = server.handle_datagram(
            &probe_at(seq, seq, 0),
            source(4000),
            now,
            recv_wall(seq as f64 + delay),
        );
        let sample = match event {
            ServerEvent::Accepted { sample, .. } => sample,
            other => panic!("expected accepted probe, got {:?}", other),
        };
        assert!((sample.raw - delay).abs() < 1e-6);
        let expected = match smoothed {
            None => sample.raw,
            Some(prev) => OWD_ALPHA * sample.raw + (1.0 - OWD_ALPHA) * prev,
        };
        assert!((sample.smoothed - expected).abs() < 1e-9);
        smoothed = Some(sample.smoothed);
    }

    let summary = server.finalize();
    assert!((summary.min_owd - 0.010).abs() < 1e-6);
    assert!((summary.max_owd - 0.050).abs() < 1e-6);
    assert!((summary.mean_owd - 0.0275).abs() < 1e-6);
}

#[test]
fn test_negative_owd_is_kept_and_counted() {
    let mut server = one_way_server(AdmissionConfig::default());
    let now = Instant::now();
    // Sender clock half a second ahead of ours
    server.handle_datagram(&probe_at(1, 10, 500_000_000), source(4000), now, recv_wall(10.2));
    server.handle_datagram(&probe_at(2, 11, 0), source(4000), now, recv_wall(11.1));

    let summary = server.finalize();
    assert_eq!(summary.received, 2);
    assert_eq!(summary.negative_owd, 1);
    assert!(summary.min_owd < 0.0);
}

#[test]
fn test_sources_tracked_independently() {
    let mut server = one_way_server(AdmissionConfig::default());
    let now = Instant::now();

    // Interleaved streams: A is contiguous, B loses sequence 2
    let arrivals = [
        (source(4000), 1),
        (other_source(4000), 1),
        (source(4000), 2),
        (other_source(4000), 3),
        (source(4000), 3),
        (other_source(4000), 4),
    ];
    for (from, seq) in arrivals {
        assert!(matches!(
            server.handle_datagram(&probe_at(seq, seq, 0), from, now, recv_wall(seq as f64)),
            ServerEvent::Accepted { .. }
        ));
    }

    let summary = server.finalize();
    assert_eq!(summary.received, 6);
    assert_eq!(summary.gap_events, 1);
    assert_eq!(summary.lost_in_gaps, 1);
    assert_eq!(server.admission().client_count(), 2);
}

#[test]
fn test_sequence_loss_estimate_counts_every_source() {
    let mut server = one_way_server(AdmissionConfig::default());
    let now = Instant::now();

    // Both sources send 1..=10 and lose sequence 5
    for seq in (1..=10u32).filter(|seq| *seq != 5) {
        for from in [source(4000), other_source(4000)] {
            server.handle_datagram(&probe_at(seq, seq, 0), from, now, recv_wall(seq as f64));
        }
    }

    let summary = server.finalize();
    assert_eq!(summary.received, 18);
    assert_eq!(summary.lost_in_gaps, 2);
    assert_eq!(summary.lost_by_sequence, 2);
    assert!((summary.loss_rate_sequence - 0.1).abs() < 1e-12);
}

#[test]
fn test_replays_leave_loss_accounting_intact() {
    let mut server = one_way_server(AdmissionConfig::default());
    let now = Instant::now();

    let mut causes = Vec::new();
    for seq in [1u32, 2, 5, 3, 5, 6] {
        if let ServerEvent::Dropped { cause, .. } =
            server.handle_datagram(&probe_at(seq, seq, 0), source(4000), now, recv_wall(seq as f64))
        {
            causes.push(cause);
        }
    }
    assert_eq!(causes, vec![DropCause::OutOfOrder, DropCause::Duplicate]);

    let summary = server.finalize();
    assert_eq!(summary.received, 4);
    assert_eq!(summary.gap_events, 1);
    assert_eq!(summary.lost_in_gaps, 2);
}

#[test]
fn test_sample_line_per_accepted_probe() {
    let sink = CaptureSink::default();
    let mut server = one_way_server(AdmissionConfig::default()).with_sink(Box::new(sink.clone()));
    let now = Instant::now();

    server.handle_datagram(&probe_at(1, 1, 0), source(4000), now, recv_wall(1.5));
    server.handle_datagram(&probe_at(1, 1, 0), source(4000), now, recv_wall(1.6));
    server.handle_datagram(&[0u8; 4], source(4000), now, recv_wall(1.7));

    let samples = sink.samples.lock();
    assert_eq!(samples.len(), 1);
    let fields: Vec<&str> = samples[0].split(' ').collect();
    assert_eq!(fields.len(), 8);
    assert_eq!(fields[1], "1");
    assert_eq!(fields[2], "56");
    assert_eq!(fields[4], "1");
}

#[test]
fn test_table_full_counted_per_cause() {
    let mut server = one_way_server(AdmissionConfig::default().with_max_clients(1));
    let now = Instant::now();

    server.handle_datagram(&probe_at(1, 1, 0), source(4000), now, recv_wall(1.0));
    assert_eq!(
        server.handle_datagram(&probe_at(1, 1, 0), other_source(4000), now, recv_wall(1.0)),
        ServerEvent::Dropped {
            addr: other_source(4000),
            cause: DropCause::TableFull
        }
    );
    let summary = server.finalize();
    assert_eq!(summary.drops.get(DropCause::TableFull), 1);
}
