//! Background eviction of idle client records.
//!
//! The reaper wakes on a fixed tick and evicts records whose last packet is
//! older than the admission idle timeout. It shares the table with the
//! receive loop through [`AdmissionControl`], which serialises access.
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};

use crate::admission::AdmissionControl;

/// Owns the reaper thread. Dropping the handle stops and joins it.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Signals the thread and waits for it to exit. Idempotent.
    pub fn stop(&mut self) {
        // Disconnecting the channel wakes the select below
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Stale connection reaper panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts the reaper thread.
pub fn spawn(admission: Arc<AdmissionControl>, interval: Duration) -> io::Result<ReaperHandle> {
    let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
    let ticker = channel::tick(interval);

    let thread = thread::Builder::new()
        .name("stale-reaper".into())
        .spawn(move || loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    let evicted = admission.evict_idle(Instant::now());
                    if evicted > 0 {
                        log::info!(
                            "Evicted {} idle clients, {} remain",
                            evicted,
                            admission.client_count()
                        );
                    }
                }
                recv(shutdown_rx) -> _ => break,
            }
        })?;

    log::debug!("Stale connection reaper running every {:?}", interval);
    Ok(ReaperHandle {
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::clock::WallTime;
    use crate::config::AdmissionConfig;
    use crate::wire::{build_probe, OpMode, ProbeHeader};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_reaper_evicts_idle_records() {
        let config = AdmissionConfig::default().with_idle_timeout(Duration::from_millis(20));
        let admission = Arc::new(AdmissionControl::new(&config));

        let header = ProbeHeader::data(1, WallTime::new(1, 0), OpMode::OneWay);
        let probe = build_probe(&header, 32, None).unwrap();
        let source = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(matches!(
            admission.admit(source, &probe, Instant::now(), 0.0),
            Admission::Accepted { .. }
        ));
        assert_eq!(admission.client_count(), 1);

        let mut reaper = spawn(Arc::clone(&admission), Duration::from_millis(10)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while admission.client_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        reaper.stop();

        assert_eq!(admission.client_count(), 0);
        assert!(!reaper.is_running());
    }

    #[test]
    fn test_stop_is_prompt_with_long_interval() {
        let admission = Arc::new(AdmissionControl::new(&AdmissionConfig::default()));
        let mut reaper = spawn(admission, Duration::from_secs(3600)).unwrap();
        let started = Instant::now();
        reaper.stop();
        reaper.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
