//! Paced UDP probe sender.
use std::fs::File;
use std::io::{self, BufWriter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use udpprobe::config::DEFAULT_MESSAGE_SIZE;
use udpprobe::prelude::*;
use udpprobe::{SampleSink, WriterSink};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Server echoes every probe; RTT is measured here.
    Rtt,
    /// Server only observes; one-way delay is measured there.
    OneWay,
}

impl From<Mode> for OpMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Rtt => OpMode::Rtt,
            Mode::OneWay => OpMode::OneWay,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "probe-client", version, about = "Send paced UDP probes and measure RTT")]
struct Cli {
    /// Server host name or address
    server: String,
    /// Server UDP port
    port: u16,
    #[arg(long, value_enum, default_value_t = Mode::Rtt)]
    mode: Mode,
    /// Probe size in bytes
    #[arg(long, default_value_t = DEFAULT_MESSAGE_SIZE)]
    size: usize,
    /// Number of probes; runs until interrupted when omitted
    #[arg(short = 'n', long)]
    iterations: Option<u32>,
    /// Seconds between probes
    #[arg(long, conflicts_with = "rate")]
    delay: Option<f64>,
    /// Target send rate in bits per second
    #[arg(long)]
    rate: Option<f64>,
    /// Seconds to wait for each echo
    #[arg(long, default_value_t = 2.0)]
    timeout: f64,
    /// Seconds to wait after the terminal message
    #[arg(long, default_value_t = 1.0)]
    linger: f64,
    /// Shared secret as 32 hex digits; enables probe tokens
    #[arg(long)]
    secret: Option<String>,
    /// Sleep between probes instead of busy-waiting
    #[arg(long)]
    no_busy_wait: bool,
    /// Write per-echo samples and the summary to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Print per-echo samples to stdout
    #[arg(long)]
    trace: bool,
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to an address", host),
        )
    })
}

fn seconds(value: f64, name: &str) -> Result<Duration, ProbeError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ProbeError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} must be a non-negative number of seconds", name),
        ))
    })
}

fn build_config(cli: &Cli) -> Result<ClientConfig, ProbeError> {
    let server = resolve(&cli.server, cli.port)?;
    let pacing = match (cli.delay, cli.rate) {
        (_, Some(rate)) => Pacing::BitRate(rate),
        (Some(delay), None) => Pacing::Interval(seconds(delay, "delay")?),
        (None, None) => Pacing::Interval(udpprobe::config::DEFAULT_ITERATION_DELAY),
    };

    let mut config = ClientConfig::new(server)
        .with_mode(cli.mode.into())
        .with_message_size(cli.size)
        .with_pacing(pacing)
        .with_echo_timeout(seconds(cli.timeout, "timeout")?)
        .with_terminate_linger(seconds(cli.linger, "linger")?)
        .with_busy_wait(!cli.no_busy_wait);
    if let Some(iterations) = cli.iterations {
        config = config.with_iterations(iterations);
    }
    if let Some(hex) = &cli.secret {
        config = config.with_auth_secret(Secret::from_hex(hex)?);
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), ProbeError> {
    let config = build_config(&cli)?;

    let sink: Box<dyn SampleSink> = match &cli.output {
        Some(path) => Box::new(WriterSink::new(BufWriter::new(File::create(path)?))),
        None if cli.trace => Box::new(WriterSink::new(io::stdout())),
        None => Box::new(WriterSink::summary_only(io::stdout())),
    };
    let mut client = ProbeClient::new(config)?.with_sink(sink);

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }

    let summary = client.run(&stop)?;
    if cli.output.is_some() {
        println!("{}\n{}", ClientSummary::HEADER, summary);
    }
    Ok(())
}

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
