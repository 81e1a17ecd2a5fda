#![no_main]
use libfuzzer_sys::fuzz_target;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;
use udpprobe::{AdmissionConfig, AdmissionControl, Secret};

fuzz_target!(|data: &[u8]| {
    let config = AdmissionConfig::default()
        .with_max_clients(4)
        .with_rate_limit(50.0)
        .with_auth_secret(Secret::from_bytes([7; 16]));
    let control = AdmissionControl::new(&config);
    let now = Instant::now();
    // Split the input into datagrams from a handful of sources
    for (i, chunk) in data.chunks(40).enumerate() {
        let source = IpAddr::V4(Ipv4Addr::new(10, 0, 0, (i % 6) as u8));
        let _ = control.admit(source, chunk, now, 0.0);
    }
    assert!(control.client_count() <= 4);
});
