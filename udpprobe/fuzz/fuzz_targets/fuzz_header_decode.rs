#![no_main]
use libfuzzer_sys::fuzz_target;
use udpprobe::wire::{read_token, ProbeHeader};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must never panic, and a decoded header
    // must encode back to the same prefix
    if let Ok(header) = ProbeHeader::decode(data) {
        let encoded = header.encode();
        assert_eq!(&encoded[..], &data[..encoded.len()]);
    }
    let _ = read_token(data);
});
