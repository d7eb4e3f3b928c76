//! Bookkeeping for every live worker of one download.
//!
//! The registry lives under the coordinator lock. It records which byte
//! range each worker is streaming, how far it has got, and how fast it is
//! going. Range stealing is two calls on the registry, each a single
//! critical section: `begin_steal` picks and marks a victim, and
//! `complete_steal` either moves the boundary on both sides at once or
//! fails without touching either.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::range::Range;
use crate::source::RemoteSourceContext;

/// Identifier of one worker within a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Range a worker is responsible for writing.
///
/// `cursor` is the next byte to be reserved for writing and `end` is
/// exclusive; everything in `[cursor, end)` is still leased and unwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub low: u64,
    pub end: u64,
    pub cursor: u64,
}

impl Claim {
    pub fn new(range: Range) -> Self {
        Self {
            low: range.low(),
            end: range.high() + 1,
            cursor: range.low(),
        }
    }

    /// Unwritten part of the claim.
    pub fn remaining(&self) -> Option<Range> {
        if self.is_exhausted() {
            return None;
        }
        Range::new(self.cursor, self.end - 1).ok()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.end
    }
}

/// Answer to a write reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Write these bytes.
    Write(Range),
    /// The chunk lies entirely before the cursor; drop it and keep reading.
    Skip,
    /// Nothing more to write on this claim.
    Exhausted,
}

/// Download rate of one worker.
#[derive(Debug, Clone)]
pub struct BandwidthMeter {
    started: Option<Instant>,
    bytes: u64,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self {
            started: None,
            bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.bytes += bytes;
    }

    /// Bytes per second, once the meter has run for at least `warmup`.
    pub fn speed(&self, warmup: Duration) -> Option<f64> {
        let elapsed = self.started?.elapsed();
        if elapsed < warmup || elapsed.is_zero() {
            return None;
        }
        Some(self.bytes as f64 / elapsed.as_secs_f64())
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// One live worker.
#[derive(Debug)]
pub struct WorkerSlot {
    pub source: RemoteSourceContext,
    pub claim: Option<Claim>,
    pub meter: BandwidthMeter,
    /// Streaming bytes right now
    pub active: bool,
    /// Mid-steal as the thief
    pub stealing: bool,
    /// Being stolen from
    pub victim: bool,
    /// Remote queue position while queued
    pub queue_position: Option<u32>,
    interrupt: watch::Sender<bool>,
}

impl WorkerSlot {
    fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }
}

/// A steal that has been started but not committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealTicket {
    pub victim: WorkerId,
    /// Victim's unwritten interval when the steal began
    pub range: Range,
}

/// Thresholds used to judge slow workers.
#[derive(Debug, Clone, Copy)]
pub struct SpeedPolicy {
    pub min_acceptable_speed: f64,
    pub warmup: Duration,
}

/// Every live worker of one download.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    slots: BTreeMap<WorkerId, WorkerSlot>,
    next_id: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker for `source`; returns its id and interrupt receiver.
    pub fn register(&mut self, source: RemoteSourceContext) -> (WorkerId, watch::Receiver<bool>) {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        let (interrupt, receiver) = watch::channel(false);
        self.slots.insert(
            id,
            WorkerSlot {
                source,
                claim: None,
                meter: BandwidthMeter::new(),
                active: false,
                stealing: false,
                victim: false,
                queue_position: None,
                interrupt,
            },
        );
        (id, receiver)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerSlot> {
        let slot = self.slots.remove(&id)?;
        // a thief that disappears releases its mark on the victim
        for other in self.slots.values_mut() {
            if other.victim && slot.stealing {
                other.victim = false;
            }
        }
        Some(slot)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.slots.keys().copied().collect()
    }

    /// Workers that are not remotely queued.
    pub fn non_queued_count(&self) -> usize {
        self.slots.values().filter(|s| s.queue_position.is_none()).count()
    }

    /// Workers currently streaming.
    pub fn active_count(&self) -> usize {
        self.slots.values().filter(|s| s.active).count()
    }

    pub fn queued_count(&self) -> usize {
        self.slots.values().filter(|s| s.queue_position.is_some()).count()
    }

    /// True if a worker is already using `source`.
    pub fn uses_source(&self, source: &RemoteSourceContext) -> bool {
        self.slots.values().any(|s| s.source.address() == source.address())
    }

    pub fn interrupt(&self, id: WorkerId) {
        if let Some(slot) = self.slots.get(&id) {
            slot.interrupt();
        }
    }

    pub fn interrupt_all(&self) {
        for slot in self.slots.values() {
            slot.interrupt();
        }
    }

    /// Aggregate measured download rate in bytes per second.
    pub fn measured_bandwidth(&self, warmup: Duration) -> Option<f64> {
        let speeds: Vec<f64> = self
            .slots
            .values()
            .filter_map(|s| s.meter.speed(warmup))
            .collect();
        if speeds.is_empty() {
            None
        } else {
            Some(speeds.iter().sum())
        }
    }

    /// Starts streaming `range` for `id`.
    pub fn set_claim(&mut self, id: WorkerId, range: Range) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.claim = Some(Claim::new(range));
            slot.active = true;
        }
    }

    /// Drops the claim of `id`, returning its unwritten remainder.
    pub fn take_claim(&mut self, id: WorkerId) -> Option<Range> {
        let slot = self.slots.get_mut(&id)?;
        slot.active = false;
        slot.claim.take().and_then(|claim| claim.remaining())
    }

    /// Reserves the next part of a streamed chunk for writing.
    ///
    /// `position..position + len` is the chunk's location in the file. The
    /// reserved range is the part inside `[cursor, end)`; bytes before the
    /// cursor are skipped. The claim is exhausted once the cursor reaches
    /// its end, e.g. because its tail was stolen.
    pub fn reserve(&mut self, id: WorkerId, position: u64, len: u64) -> Reservation {
        let Some(slot) = self.slots.get_mut(&id) else {
            return Reservation::Exhausted;
        };
        let Some(claim) = slot.claim.as_mut() else {
            return Reservation::Exhausted;
        };
        if claim.is_exhausted() || position > claim.cursor {
            return Reservation::Exhausted;
        }
        let end = position + len;
        if end <= claim.cursor {
            return Reservation::Skip;
        }

        let low = claim.cursor;
        let high = end.min(claim.end) - 1;
        claim.cursor = high + 1;
        slot.meter.record(high - low + 1);
        match Range::new(low, high) {
            Ok(range) => Reservation::Write(range),
            Err(_) => Reservation::Exhausted,
        }
    }

    /// Unwritten interval of `id`, if any.
    pub fn remaining(&self, id: WorkerId) -> Option<Range> {
        self.slots.get(&id)?.claim?.remaining()
    }

    /// True if some worker is slow enough to steal from.
    pub fn has_steal_candidate(&self, policy: SpeedPolicy) -> bool {
        self.slots.values().any(|slot| {
            Self::stealable(slot)
                && slot
                    .meter
                    .speed(policy.warmup)
                    .is_some_and(|speed| speed < policy.min_acceptable_speed)
        })
    }

    fn stealable(slot: &WorkerSlot) -> bool {
        slot.active
            && !slot.stealing
            && !slot.victim
            && slot.queue_position.is_none()
            && slot
                .claim
                .and_then(|claim| claim.remaining())
                .is_some_and(|remaining| remaining.len() > 1)
    }

    /// Slowest worker `thief` may steal from.
    ///
    /// With no measurement of its own the thief takes the first worker
    /// slower than the acceptable minimum. Otherwise it takes the slowest
    /// worker below its own speed, counting unmeasured workers as just
    /// under it.
    pub fn find_slowest(&self, thief: WorkerId, policy: SpeedPolicy) -> Option<WorkerId> {
        let own_speed = self
            .slots
            .get(&thief)
            .and_then(|slot| slot.meter.speed(policy.warmup));

        let candidates = self
            .slots
            .iter()
            .filter(|(id, slot)| **id != thief && Self::stealable(slot));

        match own_speed {
            None => candidates
                .filter(|(_, slot)| {
                    slot.meter
                        .speed(policy.warmup)
                        .is_some_and(|speed| speed < policy.min_acceptable_speed)
                })
                .map(|(id, _)| *id)
                .next(),
            Some(ours) => candidates
                .map(|(id, slot)| (*id, slot.meter.speed(policy.warmup).unwrap_or(ours - 0.1)))
                .filter(|(_, speed)| *speed < ours)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(id, _)| id),
        }
    }

    /// Picks a victim and marks both sides of the steal.
    pub fn begin_steal(&mut self, thief: WorkerId, policy: SpeedPolicy) -> Option<StealTicket> {
        if self.slots.get(&thief)?.stealing {
            return None;
        }
        let victim = self.find_slowest(thief, policy)?;
        let range = self.remaining(victim)?;
        if range.len() <= 1 {
            return None;
        }

        if let Some(slot) = self.slots.get_mut(&victim) {
            slot.victim = true;
        }
        if let Some(slot) = self.slots.get_mut(&thief) {
            slot.stealing = true;
        }
        tracing::debug!("begin_steal: {thief} targets {victim} for {range}");
        Some(StealTicket { victim, range })
    }

    /// Commits a steal after the thief negotiated `negotiated` with its source.
    ///
    /// Succeeds only if the victim is still streaming with the same upper
    /// bound and the negotiated range reaches that bound. The victim then
    /// stops just before `max(victim cursor, negotiated.low)` and the thief
    /// claims from there to the end. Returns the thief's new claim.
    pub fn complete_steal(
        &mut self,
        thief: WorkerId,
        ticket: StealTicket,
        negotiated: Range,
    ) -> Option<Range> {
        let committed = self.try_commit(thief, ticket, negotiated);
        self.abort_steal(thief, ticket);
        if let Some(claim) = committed {
            tracing::debug!(
                "complete_steal: {thief} took {claim} from {}",
                ticket.victim
            );
        } else {
            tracing::debug!("complete_steal: {thief} lost the race for {}", ticket.range);
        }
        committed
    }

    fn try_commit(&mut self, thief: WorkerId, ticket: StealTicket, negotiated: Range) -> Option<Range> {
        let victim = self.slots.get(&ticket.victim)?;
        let claim = victim.claim?;
        let high = claim.end.checked_sub(1)?;
        if !victim.active || high != ticket.range.high() || negotiated.high() < high {
            return None;
        }
        let new_start = claim.cursor.max(negotiated.low());
        let stolen = Range::new(new_start, high).ok()?;

        if let Some(victim) = self.slots.get_mut(&ticket.victim)
            && let Some(claim) = victim.claim.as_mut()
        {
            claim.end = new_start;
        }
        let thief = self.slots.get_mut(&thief)?;
        thief.claim = Some(Claim::new(stolen));
        thief.active = true;
        Some(stolen)
    }

    /// Clears the steal marks without changing any claim.
    pub fn abort_steal(&mut self, thief: WorkerId, ticket: StealTicket) {
        if let Some(slot) = self.slots.get_mut(&ticket.victim) {
            slot.victim = false;
        }
        if let Some(slot) = self.slots.get_mut(&thief) {
            slot.stealing = false;
        }
    }

    /// Queued worker with the worst queue position, if worse than `position`.
    pub fn worst_queued_above(&self, position: u32, exclude: WorkerId) -> Option<WorkerId> {
        self.slots
            .iter()
            .filter(|(id, _)| **id != exclude)
            .filter_map(|(id, slot)| slot.queue_position.map(|p| (*id, p)))
            .filter(|(_, p)| *p > position)
            .max_by_key(|(_, p)| *p)
            .map(|(id, _)| id)
    }
}
