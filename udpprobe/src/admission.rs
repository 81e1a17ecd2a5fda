// admission.rs - Per-source admission control: whitelist, token bucket, auth, replay
//
// Every data probe passes the same short-circuiting pipeline:
//   size -> whitelist -> lookup/create -> token bucket -> auth -> sequence
// The table is shared with the reaper thread, so each decision is taken under
// a single lock acquisition.
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::auth::{default_scheme, AuthToken, TokenScheme};
use crate::config::AdmissionConfig;
use crate::sequence::{Anomaly, SequenceOutcome, SequenceTracker};
use crate::stats::DropCause;
use crate::wire::{self, ProbeHeader, AUTH_HEADER_SIZE};

/// Classic token bucket; capacity equals one second's worth of tokens.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket that starts full.
    pub fn full(rate: f64, now: Instant) -> Self {
        Self {
            tokens: rate,
            capacity: rate,
            rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Admission state for one source address.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub addr: IpAddr,
    /// `None` when rate limiting is disabled.
    pub bucket: Option<TokenBucket>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub authenticated: bool,
    pub tracker: SequenceTracker,
    pub accepted: u32,
    pub dropped: u32,
    /// Set once the source has sent its terminal message.
    pub terminated: bool,
}

impl ClientRecord {
    pub fn new(addr: IpAddr, now: Instant, rate_limit: Option<f64>) -> Self {
        Self {
            addr,
            bucket: rate_limit.map(|rate| TokenBucket::full(rate, now)),
            first_seen: now,
            last_seen: now,
            authenticated: false,
            tracker: SequenceTracker::new(),
            accepted: 0,
            dropped: 0,
            terminated: false,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Returned when no slot could be found or reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

impl std::fmt::Display for TableFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client table full")
    }
}

impl std::error::Error for TableFull {}

/// Bounded arena of client records indexed by source address.
///
/// Never holds more than `capacity` records. Freed slots are reused before
/// the arena grows; when it is at capacity the least recently seen record
/// that has been idle past the timeout is reclaimed.
#[derive(Debug)]
pub struct ClientTable {
    slots: Vec<Option<ClientRecord>>,
    index: HashMap<IpAddr, usize>,
    free: Vec<usize>,
    capacity: usize,
    evictions: u64,
    /// Largest sequences of records no longer in the table.
    retired_trials: u64,
}

impl ClientTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(4096)),
            index: HashMap::new(),
            free: Vec::new(),
            capacity,
            evictions: 0,
            retired_trials: 0,
        }
    }

    pub fn get(&self, addr: IpAddr) -> Option<&ClientRecord> {
        let slot = *self.index.get(&addr)?;
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, addr: IpAddr) -> Option<&mut ClientRecord> {
        let slot = *self.index.get(&addr)?;
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Returns the record for `addr`, creating it with `make` if absent.
    /// The flag is true when the record was created by this call.
    pub fn lookup_or_insert<F>(
        &mut self,
        addr: IpAddr,
        now: Instant,
        idle_timeout: Duration,
        make: F,
    ) -> Result<(&mut ClientRecord, bool), TableFull>
    where
        F: FnOnce() -> ClientRecord,
    {
        let (slot, created) = match self.index.get(&addr).copied() {
            Some(slot) => (slot, false),
            None => {
                let slot = self.allocate(now, idle_timeout).ok_or(TableFull)?;
                self.slots[slot] = Some(make());
                self.index.insert(addr, slot);
                (slot, true)
            }
        };
        self.slots[slot]
            .as_mut()
            .map(|record| (record, created))
            .ok_or(TableFull)
    }

    fn allocate(&mut self, now: Instant, idle_timeout: Duration) -> Option<usize> {
        if let Some(slot) = self.free.pop() {
            return Some(slot);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(None);
            return Some(self.slots.len() - 1);
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|record| (slot, record)))
            .filter(|(_, record)| record.idle_for(now) > idle_timeout)
            .min_by_key(|(_, record)| record.last_seen)
            .map(|(slot, _)| slot)?;

        let reclaimed = self.vacate(victim)?;
        self.evictions += 1;
        log::debug!("Reclaimed idle slot held by {}", reclaimed.addr);
        Some(victim)
    }

    /// Empties a slot without returning it to the free list.
    fn vacate(&mut self, slot: usize) -> Option<ClientRecord> {
        let record = self.slots.get_mut(slot)?.take()?;
        self.index.remove(&record.addr);
        self.retired_trials += u64::from(record.tracker.largest_seen());
        Some(record)
    }

    pub fn remove(&mut self, addr: IpAddr) -> Option<ClientRecord> {
        let slot = *self.index.get(&addr)?;
        let record = self.vacate(slot)?;
        self.free.push(slot);
        Some(record)
    }

    /// Removes every record idle for longer than `idle_timeout`.
    pub fn evict_idle(&mut self, now: Instant, idle_timeout: Duration) -> usize {
        let stale: Vec<IpAddr> = self
            .iter()
            .filter(|record| record.idle_for(now) > idle_timeout)
            .map(|record| record.addr)
            .collect();
        for addr in &stale {
            self.remove(*addr);
        }
        self.evictions += stale.len() as u64;
        stale.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Probes sent by every source seen so far, estimated per stream from
    /// its largest sequence. Evicted records keep contributing.
    pub fn trials(&self) -> u64 {
        self.retired_trials
            + self
                .iter()
                .map(|record| u64::from(record.tracker.largest_seen()))
                .sum::<u64>()
    }
}

/// Source addresses allowed to use the server. IPv4-mapped IPv6 addresses
/// match their IPv4 form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    entries: SmallVec<[IpAddr; 8]>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, addr: IpAddr) {
        let addr = addr.to_canonical();
        if !self.entries.contains(&addr) {
            self.entries.push(addr);
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.entries.contains(&addr.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.entries.iter()
    }
}

impl FromIterator<IpAddr> for Whitelist {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut list = Whitelist::new();
        for addr in iter {
            list.insert(addr);
        }
        list
    }
}

/// Verdict for a single datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted {
        header: ProbeHeader,
        outcome: SequenceOutcome,
        /// The source had no record before this probe.
        first_contact: bool,
    },
    /// Terminal message from a known, still-active source.
    Terminate { header: ProbeHeader },
    Dropped(DropCause),
}

impl From<Anomaly> for DropCause {
    fn from(anomaly: Anomaly) -> Self {
        match anomaly {
            Anomaly::Duplicate => DropCause::Duplicate,
            Anomaly::Reordered => DropCause::OutOfOrder,
        }
    }
}

/// Shared admission engine. The server thread calls [`admit`](Self::admit);
/// the reaper thread calls [`evict_idle`](Self::evict_idle).
pub struct AdmissionControl {
    table: Mutex<ClientTable>,
    rate_limit: Option<f64>,
    whitelist: Option<Whitelist>,
    scheme: Option<Box<dyn TokenScheme>>,
    idle_timeout: Duration,
}

impl AdmissionControl {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            table: Mutex::new(ClientTable::new(config.max_clients)),
            rate_limit: config.rate_limit,
            whitelist: config.whitelist.clone(),
            scheme: config.auth_secret.as_ref().map(default_scheme),
            idle_timeout: config.idle_timeout,
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.scheme.is_some()
    }

    /// Runs `datagram` from `source` through the pipeline.
    ///
    /// `now` drives the token bucket and idle bookkeeping; `recv_wall` is the
    /// wall-clock receive time stamped onto closed loss runs.
    ///
    /// Terminal messages never create a record. They are charged against the
    /// bucket but skip the token and sequence checks.
    pub fn admit(&self, source: IpAddr, datagram: &[u8], now: Instant, recv_wall: f64) -> Admission {
        let header = match ProbeHeader::decode(datagram) {
            Ok(header) => header,
            Err(_) => return Admission::Dropped(DropCause::Malformed),
        };
        if !header.is_terminal() && self.requires_auth() && datagram.len() < AUTH_HEADER_SIZE {
            return Admission::Dropped(DropCause::Malformed);
        }
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.contains(source) {
                return Admission::Dropped(DropCause::NotWhitelisted);
            }
        }

        let mut table = self.table.lock();

        if header.is_terminal() {
            return match table.get_mut(source) {
                None => Admission::Dropped(DropCause::UnknownSource),
                Some(record) if record.terminated => {
                    record.dropped = record.dropped.saturating_add(1);
                    Admission::Dropped(DropCause::SessionEnded)
                }
                Some(record) => {
                    record.last_seen = now;
                    // Rate limited like data; no token or sequence to check
                    if let Some(bucket) = record.bucket.as_mut() {
                        if !bucket.try_acquire(now) {
                            record.dropped = record.dropped.saturating_add(1);
                            return Admission::Dropped(DropCause::RateLimited);
                        }
                    }
                    record.terminated = true;
                    Admission::Terminate { header }
                }
            };
        }

        let rate_limit = self.rate_limit;
        let (record, first_contact) = match table.lookup_or_insert(source, now, self.idle_timeout, || {
            ClientRecord::new(source, now, rate_limit)
        }) {
            Ok(entry) => entry,
            Err(TableFull) => return Admission::Dropped(DropCause::TableFull),
        };
        record.last_seen = now;

        match self.screen(record, &header, datagram, now, recv_wall, first_contact) {
            Ok(outcome) => {
                record.accepted = record.accepted.saturating_add(1);
                Admission::Accepted {
                    header,
                    outcome,
                    first_contact,
                }
            }
            Err(cause) => {
                record.dropped = record.dropped.saturating_add(1);
                Admission::Dropped(cause)
            }
        }
    }

    fn screen(
        &self,
        record: &mut ClientRecord,
        header: &ProbeHeader,
        datagram: &[u8],
        now: Instant,
        recv_wall: f64,
        first_contact: bool,
    ) -> Result<SequenceOutcome, DropCause> {
        if record.terminated {
            return Err(DropCause::SessionEnded);
        }
        if let Some(bucket) = record.bucket.as_mut() {
            if !bucket.try_acquire(now) {
                return Err(DropCause::RateLimited);
            }
        }
        if let Some(scheme) = &self.scheme {
            let valid = wire::read_token(datagram)
                .map_or(false, |token| scheme.verify(header.sequence, &token));
            // The first probe is let through unchecked
            if valid {
                record.authenticated = true;
            } else if !first_contact {
                return Err(DropCause::AuthFailed);
            }
        }
        record
            .tracker
            .observe(header.sequence, recv_wall)
            .map_err(DropCause::from)
    }

    /// Evicts records idle past the configured timeout.
    pub fn evict_idle(&self, now: Instant) -> usize {
        self.table.lock().evict_idle(now, self.idle_timeout)
    }

    /// Token the server should place on an echo of `sequence`.
    pub fn derive_token(&self, sequence: u32) -> Option<AuthToken> {
        self.scheme.as_ref().map(|scheme| scheme.derive(sequence))
    }

    pub fn client_count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn evictions(&self) -> u64 {
        self.table.lock().evictions()
    }

    pub fn trials(&self) -> u64 {
        self.table.lock().trials()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Runs `f` with the table locked.
    pub fn with_table<R>(&self, f: impl FnOnce(&ClientTable) -> R) -> R {
        f(&self.table.lock())
    }
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("rate_limit", &self.rate_limit)
            .field("whitelist", &self.whitelist)
            .field("auth", &self.scheme.as_ref().map(|s| s.name()))
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
