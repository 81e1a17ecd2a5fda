//! UDP probe server: echoes or observes probes and reports delay and loss.
use std::fs::File;
use std::io::{self, BufWriter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use udpprobe::config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CLIENTS, DEFAULT_REAPER_INTERVAL};
use udpprobe::prelude::*;
use udpprobe::{SampleSink, WriterSink};

#[derive(Parser, Debug)]
#[command(name = "probe-server", version, about = "Receive UDP probes and measure one-way delay and loss")]
struct Cli {
    /// UDP port to listen on
    port: u16,
    /// Local address to bind
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
    /// Write per-probe samples and the summary to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Print per-probe samples to stdout
    #[arg(long)]
    trace: bool,
    /// Append the summary line to this file on exit
    #[arg(long)]
    results: Option<PathBuf>,
    /// Write closed loss runs to this file on exit
    #[arg(long)]
    gap_log: Option<PathBuf>,
    /// Per-source limit in packets per second
    #[arg(long)]
    rate_limit: Option<f64>,
    /// Only accept probes from these addresses (repeatable)
    #[arg(long = "whitelist", value_name = "ADDR")]
    whitelist: Vec<IpAddr>,
    /// Shared secret as 32 hex digits; enables probe tokens
    #[arg(long, conflicts_with = "auth")]
    secret: Option<String>,
    /// Enable probe tokens with a freshly generated secret
    #[arg(long)]
    auth: bool,
    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,
    /// Seconds of silence before a source is evicted
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout: u64,
    /// Seconds between reaper sweeps
    #[arg(long, default_value_t = DEFAULT_REAPER_INTERVAL.as_secs())]
    reaper_interval: u64,
    /// Keep serving after a client's terminal message
    #[arg(long)]
    keep_running: bool,
}

fn build_config(cli: &Cli) -> Result<ServerConfig, ProbeError> {
    let mut admission = AdmissionConfig::default()
        .with_max_clients(cli.max_clients)
        .with_idle_timeout(Duration::from_secs(cli.idle_timeout))
        .with_reaper_interval(Duration::from_secs(cli.reaper_interval));
    if let Some(rate) = cli.rate_limit {
        admission = admission.with_rate_limit(rate);
    }
    if !cli.whitelist.is_empty() {
        admission = admission.with_whitelist(cli.whitelist.iter().copied().collect());
    }
    if let Some(hex) = &cli.secret {
        admission = admission.with_auth_secret(Secret::from_hex(hex)?);
    } else if cli.auth {
        let secret = Secret::random();
        log::info!("Generated probe secret {}", secret.to_hex());
        admission = admission.with_auth_secret(secret);
    }

    let mut config = ServerConfig::new(SocketAddr::new(cli.bind, cli.port))
        .with_exit_on_terminate(!cli.keep_running)
        .with_admission(admission);
    if let Some(path) = &cli.results {
        config = config.with_results_log(path);
    }
    if let Some(path) = &cli.gap_log {
        config = config.with_loss_run_log(path);
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
    let mut server = ProbeServer::bind(config)?.with_sink(sink);

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        log::warn!("Could not install Ctrl-C handler: {}", e);
    }

    let summary = server.run(&stop);
    if cli.output.is_some() {
        println!("{}\n{}", ServerSummary::HEADER, summary);
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
