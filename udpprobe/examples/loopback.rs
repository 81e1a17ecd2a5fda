//! Runs a short RTT session against a server on the loopback interface and
//! prints both summaries.
//!
//! Run with: `RUST_LOG=info cargo run --example loopback`

use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;
use udpprobe::prelude::*;

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let mut server = ProbeServer::bind(ServerConfig::new("127.0.0.1:0".parse().unwrap()))
        .expect("Failed to bind server");
    let server_addr = server.local_addr().expect("Failed to read local address");
    let server_thread = thread::spawn(move || server.run(&AtomicBool::new(false)));

    let config = ClientConfig::new(server_addr)
        .with_iterations(50)
        .with_pacing(Pacing::Interval(Duration::from_millis(10)));
    let mut client = ProbeClient::new(config).expect("Failed to create client");
    let client_summary = client
        .run(&AtomicBool::new(false))
        .expect("Client session failed");
    let server_summary = server_thread.join().expect("Server thread panicked");

    println!("{}\n{}", ClientSummary::HEADER, client_summary);
    println!("{}\n{}", ServerSummary::HEADER, server_summary);
}
