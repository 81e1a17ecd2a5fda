//! Builds a hardened server config and a matching client config, validates
//! both and prints what each side will do.
//!
//! Run with: `cargo run --example configuration`

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use udpprobe::prelude::*;

fn main() {
    let secret = Secret::random();

    // Server accepting at most 64 sources from two lab hosts, each limited
    // to 200 probes per second
    let whitelist: Whitelist = [
        IpAddr::V4(Ipv4Addr::new(10, 1, 0, 10)),
        IpAddr::V4(Ipv4Addr::new(10, 1, 0, 11)),
    ]
    .into_iter()
    .collect();
    let server = ServerConfig::new("0.0.0.0:5000".parse().unwrap())
        .with_exit_on_terminate(false)
        .with_results_log("serverResults.dat")
        .with_loss_run_log("lossRuns.dat")
        .with_admission(
            AdmissionConfig::default()
                .with_max_clients(64)
                .with_rate_limit(200.0)
                .with_whitelist(whitelist)
                .with_auth_secret(secret.clone())
                .with_idle_timeout(Duration::from_secs(120)),
        );
    server.validate().expect("Server config should be valid");

    // Client probing at 1 Mbit/s with 1200-byte messages
    let client = ClientConfig::new("10.1.0.1:5000".parse().unwrap())
        .with_mode(OpMode::OneWay)
        .with_message_size(1200)
        .with_pacing(Pacing::BitRate(1_000_000.0))
        .with_iterations(10_000)
        .with_auth_secret(secret);
    client.validate().expect("Client config should be valid");

    println!("Server:");
    println!("  Bind:             {}", server.bind);
    println!("  Max clients:      {}", server.admission.max_clients);
    println!("  Rate limit:       {:?} pkt/s per source", server.admission.rate_limit);
    println!("  Idle timeout:     {:?}", server.admission.idle_timeout);
    println!("  Reaper interval:  {:?}", server.admission.reaper_interval);
    println!("  Auth:             {}", server.admission.auth_secret.is_some());
    println!();

    println!("Client:");
    println!("  Mode:             {:?}", client.mode);
    println!("  Wire size:        {} bytes", client.wire_size());
    println!(
        "  Iteration delay:  {:?}",
        client.iteration_delay().expect("Pacing was validated")
    );
    println!("  Send rate:        {:.0} bit/s", client.send_rate_bps());
}
