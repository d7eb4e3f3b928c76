//! Download workers.
//!
//! One worker serves one source. The pure [`WorkerMachine`] decides what to
//! do next; [`DownloadWorker`] carries those effects out against the
//! transport, the verifying file and the coordinator's shared state, and
//! feeds the results back as events. Every suspension point also watches the
//! worker's interrupt flag, so stopping a download never waits on a socket.

pub mod connect;
pub mod machine;
pub mod registry;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;

pub use self::connect::{ConnectAttempt, connect_plan, connect_source};
pub use self::machine::{
    NoRangeReason, SwarmFacts, WorkerEffect, WorkerEvent, WorkerMachine, WorkerOutcome,
    WorkerState,
};
pub use self::registry::{
    BandwidthMeter, Claim, Reservation, SpeedPolicy, StealTicket, WorkerId, WorkerRegistry,
    WorkerSlot,
};
use crate::coordinator::Shared;
use crate::range::Range;
use crate::source::RemoteSourceContext;
use crate::transport::{NegotiationOutcome, SourceConnection};
use crate::verifying_file::{VerifyingFileError, WriteRequest};

/// Completes once the interrupt flag is raised or its sender is gone.
async fn interrupted(interrupt: &mut watch::Receiver<bool>) {
    let _ = interrupt.wait_for(|stop| *stop).await;
}

/// Async driver for one worker.
pub(crate) struct DownloadWorker {
    shared: Arc<Shared>,
    id: WorkerId,
    source: RemoteSourceContext,
    machine: WorkerMachine,
    interrupt: watch::Receiver<bool>,
    connection: Option<Box<dyn SourceConnection>>,
    /// White range leased but not yet confirmed by the source
    requested: Option<Range>,
    steal: Option<StealTicket>,
    /// First byte the source will send in the current body
    stream_start: u64,
    holds_tree_request: bool,
}

impl DownloadWorker {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: WorkerId,
        source: RemoteSourceContext,
        interrupt: watch::Receiver<bool>,
    ) -> Self {
        let machine = WorkerMachine::new(shared.config.worker.clone());
        Self {
            shared,
            id,
            source,
            machine,
            interrupt,
            connection: None,
            requested: None,
            steal: None,
            stream_start: 0,
            holds_tree_request: false,
        }
    }

    /// Runs the worker until the machine reaches a terminal state.
    pub(crate) async fn run(mut self) {
        tracing::debug!("{}: starting for {}", self.id, self.source);
        let mut effects: VecDeque<WorkerEffect> = self.machine.start().into();

        while let Some(effect) = effects.pop_front() {
            let event = if *self.interrupt.borrow() && !self.machine.is_done() {
                Some(WorkerEvent::Interrupted)
            } else {
                self.execute(effect).await
            };

            if let Some(event) = event {
                if event == WorkerEvent::Interrupted {
                    effects.clear();
                }
                let facts = self.facts();
                effects.extend(self.machine.advance(event, facts));
            }
        }

        self.cleanup();
        tracing::debug!("{}: finished in {:?}", self.id, self.machine.state());
    }

    fn facts(&self) -> SwarmFacts {
        let state = self.shared.state.lock();
        let own_active = state.registry.get(self.id).is_some_and(|slot| slot.active);
        SwarmFacts {
            failures: self.source.failure_count(),
            other_active_workers: state.registry.active_count() - usize::from(own_active),
        }
    }

    async fn execute(&mut self, effect: WorkerEffect) -> Option<WorkerEvent> {
        use WorkerEffect as E;

        match effect {
            E::Connect => Some(self.connect().await),
            E::BeginIteration => Some(self.begin_iteration()),
            E::RequestHashTree => Some(self.request_hash_tree().await),
            E::ReadHashTree => Some(self.read_hash_tree().await),
            E::ClearHashTreeRequest => {
                self.clear_tree_request();
                None
            }
            E::ConsumeBody => Some(self.consume_body().await),
            E::PickRange => Some(self.pick_range()),
            E::RequestRange(range) => Some(self.request_range(range).await),
            E::Stream(range) => Some(self.stream(range).await),
            E::EnterRemoteQueue { position } => {
                self.source.set_queue_status(i32::try_from(position).unwrap_or(i32::MAX));
                if self.shared.kill_queued_if_necessary(self.id, position) {
                    Some(WorkerEvent::QueueAdmitted)
                } else {
                    Some(WorkerEvent::QueueRejected)
                }
            }
            E::LeaveRemoteQueue => {
                self.shared.leave_remote_queue(self.id);
                None
            }
            E::WaitForQueuePoll(interval) => {
                tracing::debug!("{}: remotely queued, polling again in {interval:?}", self.id);
                tokio::select! {
                    _ = interrupted(&mut self.interrupt) => Some(WorkerEvent::Interrupted),
                    _ = tokio::time::sleep(interval) => Some(WorkerEvent::QueuePollElapsed),
                }
            }
            E::ReleaseClaim => {
                self.release_claim();
                None
            }
            E::SetRetryAfter(delay) => {
                if self.source.wait_time() < delay {
                    self.source.set_retry_after(delay);
                }
                None
            }
            E::RecordFailure => {
                let failures = self.source.increment_failures();
                tracing::debug!("{}: {} has failed {failures} times", self.id, self.source);
                None
            }
            E::ResetFailures => {
                self.source.reset_failures();
                None
            }
            E::ClearAvailableRanges => {
                self.source.clear_available_ranges();
                None
            }
            E::SetAvailableRanges(ranges) => {
                self.source.set_available_ranges(ranges);
                None
            }
            E::InformMesh { good } => {
                self.inform_mesh(good);
                None
            }
            E::Repool => {
                self.shared.repool(self.source.clone());
                None
            }
            E::CancelCorrupt => {
                self.shared.mark_corrupt();
                None
            }
            E::Finish(outcome) => {
                tracing::debug!("{}: {} -> {outcome:?}", self.id, self.source);
                None
            }
        }
    }

    async fn connect(&mut self) -> WorkerEvent {
        let shared = self.shared.clone();
        let descriptor = self.source.descriptor();
        let attempt = connect_source(shared.transport.as_ref(), descriptor, &shared.config.worker);

        tokio::select! {
            _ = interrupted(&mut self.interrupt) => WorkerEvent::Interrupted,
            result = attempt => match result {
                Ok(connection) => {
                    self.connection = Some(connection);
                    WorkerEvent::Connected
                }
                Err(error) => {
                    tracing::debug!("{}: connect to {} failed: {error}", self.id, self.source);
                    WorkerEvent::ConnectFailed
                }
            },
        }
    }

    /// Claims the download's single hash tree request slot if a tree is
    /// still wanted and this source can serve one.
    fn begin_iteration(&mut self) -> WorkerEvent {
        let file = &self.shared.file;
        let have_good_tree = file.hash_tree().is_some_and(|tree| tree.is_depth_good_enough());
        let wants_hash_tree = !have_good_tree
            && self.source.descriptor().capabilities.serves_hash_tree
            && !self.source.hash_tree_failed()
            && file.try_claim_hash_tree_request();
        self.holds_tree_request = wants_hash_tree;
        WorkerEvent::IterationStarted { wants_hash_tree }
    }

    async fn request_hash_tree(&mut self) -> WorkerEvent {
        let Some(connection) = self.connection.as_mut() else {
            return WorkerEvent::HashTreeRequested { accepted: false };
        };
        let accepted = tokio::select! {
            _ = interrupted(&mut self.interrupt) => return WorkerEvent::Interrupted,
            result = connection.request_hash_tree() => result.unwrap_or_else(|error| {
                tracing::debug!("{}: hash tree request failed: {error}", self.id);
                false
            }),
        };
        if !accepted {
            self.source.set_hash_tree_failed();
        }
        WorkerEvent::HashTreeRequested { accepted }
    }

    async fn read_hash_tree(&mut self) -> WorkerEvent {
        let Some(connection) = self.connection.as_mut() else {
            return WorkerEvent::HashTreeRead;
        };
        let result = tokio::select! {
            _ = interrupted(&mut self.interrupt) => return WorkerEvent::Interrupted,
            result = connection.read_hash_tree() => result,
        };
        match result {
            Ok(tree) => {
                self.holds_tree_request = false;
                self.shared.hash_tree_read(tree);
            }
            Err(error) => {
                tracing::debug!("{}: reading hash tree from {} failed: {error}", self.id, self.source);
                self.source.set_hash_tree_failed();
            }
        }
        WorkerEvent::HashTreeRead
    }

    fn clear_tree_request(&mut self) {
        if self.holds_tree_request {
            self.shared.file.clear_hash_tree_request();
            self.holds_tree_request = false;
        }
    }

    async fn consume_body(&mut self) -> WorkerEvent {
        let Some(connection) = self.connection.as_mut() else {
            return WorkerEvent::BodyConsumed { ok: false };
        };
        let result = tokio::select! {
            _ = interrupted(&mut self.interrupt) => return WorkerEvent::Interrupted,
            result = connection.consume_body() => result,
        };
        if let Err(error) = &result {
            tracing::debug!("{}: draining previous body failed: {error}", self.id);
        }
        WorkerEvent::BodyConsumed { ok: result.is_ok() }
    }

    /// Leases a white range, or starts a steal from the slowest worker.
    fn pick_range(&mut self) -> WorkerEvent {
        let shared = self.shared.clone();
        let file = &shared.file;
        let mut state = shared.state.lock();
        let available = self.source.available_ranges();

        let free = file.has_free_blocks_to_assign();
        let chunk_hint = (free > 0 && free <= file.chunk_size() && state.registry.len() > 1)
            .then(|| (free / 2).max(shared.config.worker.min_split_size));

        match file.lease_white(available.as_ref(), chunk_hint) {
            Ok(range) => {
                tracing::debug!("{}: leased white {range} from {}", self.id, self.source);
                self.requested = Some(range);
                return WorkerEvent::RangePicked(range);
            }
            Err(VerifyingFileError::NoSuchElement) => {
                if free > 0 && self.source.is_partial_source() {
                    return WorkerEvent::NoRange(NoRangeReason::NoMatchingRanges);
                }
            }
            Err(error) => {
                tracing::warn!("{}: lease failed: {error}", self.id);
                return WorkerEvent::NoRange(NoRangeReason::NothingToDo);
            }
        }

        let policy = shared.speed_policy();
        let Some(ticket) = state.registry.begin_steal(self.id, policy) else {
            return WorkerEvent::NoRange(NoRangeReason::NothingToDo);
        };
        if let Some(ranges) = &available
            && !ranges.contains(&ticket.range)
        {
            // a partial source must cover the whole stolen tail
            state.registry.abort_steal(self.id, ticket);
            return WorkerEvent::NoRange(NoRangeReason::NothingToDo);
        }
        tracing::debug!("{}: stealing {} from {}", self.id, ticket.range, ticket.victim);
        self.steal = Some(ticket);
        WorkerEvent::RangePicked(ticket.range)
    }

    async fn request_range(&mut self, range: Range) -> WorkerEvent {
        let supports_queueing = self.source.descriptor().capabilities.supports_queueing;
        let read_timeout = self.shared.config.worker.read_timeout;
        let Some(connection) = self.connection.as_mut() else {
            return WorkerEvent::NegotiationFailed;
        };

        let result = tokio::select! {
            _ = interrupted(&mut self.interrupt) => return WorkerEvent::Interrupted,
            result = tokio::time::timeout(read_timeout, connection.negotiate_range(range, supports_queueing)) => result,
        };
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(error)) => {
                tracing::debug!("{}: requesting {range} failed: {error}", self.id);
                self.abort_steal();
                return WorkerEvent::NegotiationFailed;
            }
            Err(_) => {
                tracing::debug!("{}: requesting {range} timed out", self.id);
                self.abort_steal();
                return WorkerEvent::NegotiationFailed;
            }
        };
        if let Some(ranges) = connection.available_ranges() {
            self.source.set_available_ranges(ranges);
        }

        let NegotiationOutcome::Connected { range: negotiated } = outcome else {
            self.abort_steal();
            return WorkerEvent::Negotiated(outcome);
        };
        self.stream_start = negotiated.low();

        if let Some(ticket) = self.steal.take() {
            let committed = self
                .shared
                .state
                .lock()
                .registry
                .complete_steal(self.id, ticket, negotiated);
            return match committed {
                Some(stolen) => WorkerEvent::Negotiated(NegotiationOutcome::Connected { range: stolen }),
                None => WorkerEvent::StealAborted,
            };
        }

        let Some(requested) = self.requested.take() else {
            return WorkerEvent::NegotiationFailed;
        };
        let Some(effective) = requested.intersection(&negotiated) else {
            self.requested = Some(requested);
            return WorkerEvent::Negotiated(NegotiationOutcome::ProtocolError {
                reason: format!("asked for {requested}, source offered {negotiated}"),
            });
        };

        // the source may narrow the request; hand back what it will not send
        let file = &self.shared.file;
        let mut state = self.shared.state.lock();
        if effective.low() > requested.low()
            && let Ok(head) = Range::new(requested.low(), effective.low() - 1)
        {
            let _ = file.release_block(head);
        }
        if effective.high() < requested.high()
            && let Ok(tail) = Range::new(effective.high() + 1, requested.high())
        {
            let _ = file.release_block(tail);
        }
        state.registry.set_claim(self.id, effective);
        WorkerEvent::Negotiated(NegotiationOutcome::Connected { range: effective })
    }

    fn abort_steal(&mut self) {
        if let Some(ticket) = self.steal.take() {
            self.shared.state.lock().registry.abort_steal(self.id, ticket);
        }
    }

    /// Streams the body into the verifying file until the claim is exhausted.
    async fn stream(&mut self, range: Range) -> WorkerEvent {
        let read_timeout = self.shared.config.worker.read_timeout;
        let buffer_size = self.shared.config.disk.write_buffer_size.max(1);
        let mut position = self.stream_start;
        tracing::debug!("{}: streaming {range} from {}", self.id, self.source);

        let Some(connection) = self.connection.as_mut() else {
            return self.stream_finished(false, false);
        };

        let ok = loop {
            let chunk = tokio::select! {
                _ = interrupted(&mut self.interrupt) => return WorkerEvent::Interrupted,
                chunk = tokio::time::timeout(read_timeout, connection.next_chunk()) => chunk,
            };
            let bytes = match chunk {
                Ok(Ok(Some(bytes))) => bytes,
                Ok(Ok(None)) => {
                    let done = self.shared.state.lock().registry.remaining(self.id).is_none();
                    if !done {
                        tracing::debug!("{}: body ended early at {position}", self.id);
                    }
                    break done;
                }
                Ok(Err(error)) => {
                    tracing::debug!("{}: stream broke at {position}: {error}", self.id);
                    break false;
                }
                Err(_) => {
                    tracing::debug!("{}: read timed out at {position}", self.id);
                    break false;
                }
            };

            let len = bytes.len() as u64;
            let reservation = self.shared.state.lock().registry.reserve(self.id, position, len);
            match reservation {
                Reservation::Skip => {}
                Reservation::Exhausted => break true,
                Reservation::Write(write) => {
                    let start = (write.low() - position) as usize;
                    let end = start + write.len() as usize;
                    let mut offset = start;
                    let mut failed = false;
                    while offset < end {
                        let piece_end = (offset + buffer_size).min(end);
                        let request = WriteRequest::new(position + offset as u64, bytes.slice(offset..piece_end));
                        if let Err(error) = self.shared.file.write_block_waiting(request).await {
                            tracing::warn!("{}: write at {} failed: {error}", self.id, position + offset as u64);
                            failed = true;
                            break;
                        }
                        offset = piece_end;
                    }
                    if failed {
                        break false;
                    }
                }
            }
            position += len;

            if self.shared.state.lock().registry.remaining(self.id).is_none() {
                break true;
            }
        };

        let keep_alive = connection.is_keep_alive();
        self.stream_finished(ok, keep_alive)
    }

    fn stream_finished(&mut self, ok: bool, keep_alive: bool) -> WorkerEvent {
        self.release_claim();
        WorkerEvent::StreamFinished {
            ok,
            keep_alive,
            hopeless: self.shared.file.is_hopeless(),
        }
    }

    /// Returns every byte this worker holds but has not written.
    fn release_claim(&mut self) {
        self.abort_steal();
        let file = &self.shared.file;
        let mut state = self.shared.state.lock();
        let mut leftovers: Vec<Range> = state.registry.take_claim(self.id).into_iter().collect();
        leftovers.extend(self.requested.take());
        for range in leftovers {
            if let Err(error) = file.release_block(range) {
                tracing::warn!("{}: releasing {range} failed: {error}", self.id);
            }
        }
    }

    fn inform_mesh(&mut self, good: bool) {
        let descriptor = self.source.descriptor();
        self.shared.mesh.inform_mesh(descriptor, good);
        if good
            && let Some(connection) = &self.connection
        {
            let alternates = connection.alt_locations();
            if !alternates.is_empty() {
                self.shared.mesh.add_possible_sources(alternates);
            }
        }
    }

    fn cleanup(&mut self) {
        self.release_claim();
        self.clear_tree_request();
        self.connection = None;
        self.shared.worker_finished(self.id);
    }
}
