//! Per-source worker state machine.
//!
//! `WorkerMachine::advance` is a pure transition function: it takes the
//! current state, one event and a few facts about the source and swarm, and
//! returns the side effects the async driver must perform. Nothing here
//! touches the network, the file or the coordinator.

use std::time::Duration;

use crate::config::WorkerConfig;
use crate::range::{Range, RangeSet};
use crate::transport::NegotiationOutcome;

/// Where one worker is within an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Begin,
    RequestingThex,
    DownloadingThex,
    ConsumingBody,
    RequestingHttp,
    Queued,
    Downloading,
    Done(WorkerOutcome),
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Streamed everything it claimed and the connection is not reusable
    Finished,
    /// Nothing left for this source to do right now
    NoData,
    /// The source does not have the file, or has nothing we need
    NoFile,
    /// Connection or exchange failed
    SourceFailed,
    ConnectFailed,
    Interrupted,
}

/// Why no range could be picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoRangeReason {
    /// Partial source whose advertised ranges hold nothing we need
    NoMatchingRanges,
    /// No white bytes and nobody worth stealing from
    NothingToDo,
}

/// Input to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Connected,
    ConnectFailed,
    IterationStarted { wants_hash_tree: bool },
    HashTreeRequested { accepted: bool },
    HashTreeRead,
    BodyConsumed { ok: bool },
    RangePicked(Range),
    NoRange(NoRangeReason),
    Negotiated(NegotiationOutcome),
    NegotiationFailed,
    /// A steal was negotiated but the victim changed before it could be committed
    StealAborted,
    QueueAdmitted,
    QueueRejected,
    QueuePollElapsed,
    StreamFinished {
        ok: bool,
        keep_alive: bool,
        hopeless: bool,
    },
    Interrupted,
}

/// Work the driver performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEffect {
    Connect,
    BeginIteration,
    RequestHashTree,
    ReadHashTree,
    ClearHashTreeRequest,
    ConsumeBody,
    PickRange,
    RequestRange(Range),
    Stream(Range),
    /// Ask the coordinator for a remote queue slot at `position`
    EnterRemoteQueue { position: u32 },
    LeaveRemoteQueue,
    WaitForQueuePoll(Duration),
    ReleaseClaim,
    /// Back the source off for at least this long
    SetRetryAfter(Duration),
    RecordFailure,
    ResetFailures,
    ClearAvailableRanges,
    SetAvailableRanges(RangeSet),
    InformMesh { good: bool },
    Repool,
    CancelCorrupt,
    Finish(WorkerOutcome),
}

/// Facts the driver reads from shared state before each transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmFacts {
    /// Failures already recorded on this source
    pub failures: u32,
    /// Other workers currently streaming
    pub other_active_workers: usize,
}

/// Explicit state machine for one worker.
#[derive(Debug, Clone)]
pub struct WorkerMachine {
    state: WorkerState,
    config: WorkerConfig,
    remotely_queued: bool,
    poll_interval: Duration,
}

impl WorkerMachine {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            state: WorkerState::Connecting,
            config,
            remotely_queued: false,
            poll_interval: Duration::ZERO,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, WorkerState::Done(_))
    }

    pub fn is_remotely_queued(&self) -> bool {
        self.remotely_queued
    }

    /// Effects that start the machine.
    pub fn start(&self) -> Vec<WorkerEffect> {
        vec![WorkerEffect::Connect]
    }

    /// Applies `event` and returns the effects to run, in order.
    pub fn advance(&mut self, event: WorkerEvent, facts: SwarmFacts) -> Vec<WorkerEffect> {
        use WorkerEffect as E;
        use WorkerEvent as Ev;
        use WorkerState as S;

        if self.is_done() {
            return Vec::new();
        }

        match (self.state, event) {
            (_, Ev::Interrupted) => {
                let mut effects = vec![E::ReleaseClaim];
                if self.remotely_queued {
                    effects.push(E::LeaveRemoteQueue);
                }
                effects.extend(self.finish(WorkerOutcome::Interrupted));
                effects
            }

            (S::Connecting, Ev::Connected) => self.begin(),
            (S::Connecting, Ev::ConnectFailed) => {
                let mut effects = vec![
                    E::SetRetryAfter(self.config.failed_retry_after),
                    E::Repool,
                ];
                effects.extend(self.finish(WorkerOutcome::ConnectFailed));
                effects
            }

            (S::Begin, Ev::IterationStarted { wants_hash_tree }) => {
                if wants_hash_tree {
                    self.state = S::RequestingThex;
                    vec![E::RequestHashTree]
                } else {
                    self.consume_body()
                }
            }

            (S::RequestingThex, Ev::HashTreeRequested { accepted: true }) => {
                self.state = S::DownloadingThex;
                vec![E::ReadHashTree]
            }
            (S::RequestingThex, Ev::HashTreeRequested { accepted: false }) => {
                let mut effects = vec![E::ClearHashTreeRequest];
                effects.extend(self.consume_body());
                effects
            }
            (S::DownloadingThex, Ev::HashTreeRead) => {
                let mut effects = vec![E::ClearHashTreeRequest];
                effects.extend(self.consume_body());
                effects
            }

            (S::ConsumingBody, Ev::BodyConsumed { ok: true }) => {
                self.state = S::RequestingHttp;
                vec![E::PickRange]
            }
            (S::ConsumingBody, Ev::BodyConsumed { ok: false }) => self.source_failure(facts),

            (S::RequestingHttp | S::Queued, Ev::RangePicked(range)) => {
                self.state = S::RequestingHttp;
                vec![E::RequestRange(range)]
            }
            (S::RequestingHttp | S::Queued, Ev::NoRange(reason)) => {
                let mut effects = self.leave_queue();
                match reason {
                    NoRangeReason::NoMatchingRanges => {
                        effects.extend([
                            E::ClearAvailableRanges,
                            E::SetRetryAfter(self.config.no_ranges_retry_after),
                            E::ResetFailures,
                            E::Repool,
                        ]);
                        effects.extend(self.finish(WorkerOutcome::NoFile));
                    }
                    NoRangeReason::NothingToDo => {
                        effects.push(E::Repool);
                        effects.extend(self.finish(WorkerOutcome::NoData));
                    }
                }
                effects
            }

            (S::RequestingHttp, Ev::Negotiated(outcome)) => self.negotiated(outcome, facts),
            (S::RequestingHttp, Ev::NegotiationFailed) => self.source_failure(facts),
            (S::RequestingHttp, Ev::StealAborted) => {
                let mut effects = self.leave_queue();
                effects.push(E::Repool);
                effects.extend(self.finish(WorkerOutcome::NoData));
                effects
            }

            (S::Queued, Ev::QueueAdmitted) => vec![E::WaitForQueuePoll(self.poll_interval)],
            (S::Queued, Ev::QueueRejected) => {
                self.remotely_queued = false;
                let mut effects = vec![E::LeaveRemoteQueue, E::Repool];
                effects.extend(self.finish(WorkerOutcome::NoData));
                effects
            }
            (S::Queued, Ev::QueuePollElapsed) => self.begin(),

            (
                S::Downloading,
                Ev::StreamFinished {
                    ok,
                    keep_alive,
                    hopeless,
                },
            ) => {
                let mut effects = Vec::new();
                if hopeless {
                    effects.push(E::ReleaseClaim);
                    effects.push(E::CancelCorrupt);
                    effects.extend(self.finish(WorkerOutcome::Interrupted));
                    return effects;
                }
                if !ok {
                    return self.source_failure(facts);
                }
                effects.extend([E::ResetFailures, E::InformMesh { good: true }]);
                if keep_alive {
                    effects.extend(self.begin());
                } else {
                    effects.push(E::Repool);
                    effects.extend(self.finish(WorkerOutcome::Finished));
                }
                effects
            }

            (state, event) => {
                tracing::warn!("WorkerMachine::advance: ignoring {event:?} in {state:?}");
                Vec::new()
            }
        }
    }

    fn begin(&mut self) -> Vec<WorkerEffect> {
        self.state = WorkerState::Begin;
        vec![WorkerEffect::BeginIteration]
    }

    fn consume_body(&mut self) -> Vec<WorkerEffect> {
        self.state = WorkerState::ConsumingBody;
        vec![WorkerEffect::ConsumeBody]
    }

    fn finish(&mut self, outcome: WorkerOutcome) -> Vec<WorkerEffect> {
        self.state = WorkerState::Done(outcome);
        vec![WorkerEffect::Finish(outcome)]
    }

    fn leave_queue(&mut self) -> Vec<WorkerEffect> {
        if self.remotely_queued {
            self.remotely_queued = false;
            vec![WorkerEffect::LeaveRemoteQueue]
        } else {
            Vec::new()
        }
    }

    /// Transport or protocol failure: back off within the budget, then
    /// report the source as bad.
    fn source_failure(&mut self, facts: SwarmFacts) -> Vec<WorkerEffect> {
        use WorkerEffect as E;

        let mut effects = self.leave_queue();
        effects.extend([E::ReleaseClaim, E::RecordFailure]);
        if facts.failures + 1 < self.config.max_failures {
            effects.extend([E::SetRetryAfter(self.config.failed_retry_after), E::Repool]);
        } else {
            effects.push(E::InformMesh { good: false });
        }
        effects.extend(self.finish(WorkerOutcome::SourceFailed));
        effects
    }

    fn negotiated(&mut self, outcome: NegotiationOutcome, facts: SwarmFacts) -> Vec<WorkerEffect> {
        use NegotiationOutcome as N;
        use WorkerEffect as E;

        match outcome {
            N::Connected { range } => {
                let mut effects = self.leave_queue();
                self.state = WorkerState::Downloading;
                effects.push(E::Stream(range));
                effects
            }
            N::Queued {
                position,
                poll_interval,
            } => {
                self.state = WorkerState::Queued;
                self.remotely_queued = true;
                self.poll_interval = poll_interval;
                vec![
                    E::ReleaseClaim,
                    E::ResetFailures,
                    E::EnterRemoteQueue { position },
                ]
            }
            N::Busy { retry_after } => {
                let mut delay = retry_after.unwrap_or(self.config.busy_retry_none_active);
                if facts.other_active_workers > 0 {
                    delay = delay.max(self.config.busy_retry_some_active);
                }
                let mut effects = self.leave_queue();
                effects.extend([
                    E::ReleaseClaim,
                    E::SetRetryAfter(delay),
                    E::ResetFailures,
                    E::Repool,
                ]);
                effects.extend(self.finish(WorkerOutcome::NoData));
                effects
            }
            N::RangeUnavailable { available } => {
                let mut effects = vec![E::ReleaseClaim, E::ResetFailures, E::InformMesh { good: true }];
                match available {
                    Some(ranges) => {
                        effects.push(E::SetAvailableRanges(ranges));
                        effects.extend(self.consume_body());
                    }
                    None => {
                        effects.extend(self.leave_queue());
                        effects.push(E::Repool);
                        effects.extend(self.finish(WorkerOutcome::NoData));
                    }
                }
                effects
            }
            N::NotFound | N::NotSharing => {
                let mut effects = self.leave_queue();
                effects.extend([E::ReleaseClaim, E::InformMesh { good: false }]);
                effects.extend(self.finish(WorkerOutcome::NoFile));
                effects
            }
            N::ContentMismatch => {
                let mut effects = self.leave_queue();
                effects.push(E::ReleaseClaim);
                effects.extend(self.finish(WorkerOutcome::NoFile));
                effects
            }
            N::NoMoreDownloaders => {
                let mut effects = self.leave_queue();
                effects.extend([E::ReleaseClaim, E::Repool]);
                effects.extend(self.finish(WorkerOutcome::NoData));
                effects
            }
            N::UnknownCode { code } => {
                tracing::debug!("WorkerMachine: unknown response code {code}");
                self.source_failure(facts)
            }
            N::ProtocolError { reason } => {
                tracing::debug!("WorkerMachine: protocol error: {reason}");
                self.source_failure(facts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(low: u64, high: u64) -> Range {
        Range::new(low, high).unwrap()
    }

    fn machine() -> WorkerMachine {
        WorkerMachine::new(WorkerConfig::default())
    }

    fn no_facts() -> SwarmFacts {
        SwarmFacts::default()
    }

    /// Drives a fresh machine up to the point where it requests `range`.
    fn requesting(range: Range) -> WorkerMachine {
        let mut m = machine();
        assert_eq!(m.advance(WorkerEvent::Connected, no_facts()), vec![WorkerEffect::BeginIteration]);
        m.advance(
            WorkerEvent::IterationStarted {
                wants_hash_tree: false,
            },
            no_facts(),
        );
        assert_eq!(
            m.advance(WorkerEvent::BodyConsumed { ok: true }, no_facts()),
            vec![WorkerEffect::PickRange]
        );
        assert_eq!(
            m.advance(WorkerEvent::RangePicked(range), no_facts()),
            vec![WorkerEffect::RequestRange(range)]
        );
        m
    }

    #[test]
    fn test_happy_path_streams_and_loops_on_keep_alive() {
        let mut m = requesting(r(0, 999));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Connected { range: r(0, 999) }),
            no_facts(),
        );
        assert_eq!(effects, vec![WorkerEffect::Stream(r(0, 999))]);
        assert_eq!(m.state(), WorkerState::Downloading);

        let effects = m.advance(
            WorkerEvent::StreamFinished {
                ok: true,
                keep_alive: true,
                hopeless: false,
            },
            no_facts(),
        );
        assert_eq!(
            effects,
            vec![
                WorkerEffect::ResetFailures,
                WorkerEffect::InformMesh { good: true },
                WorkerEffect::BeginIteration,
            ]
        );
        assert_eq!(m.state(), WorkerState::Begin);
    }

    #[test]
    fn test_stream_without_keep_alive_repools_and_finishes() {
        let mut m = requesting(r(0, 9));
        m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Connected { range: r(0, 9) }),
            no_facts(),
        );
        let effects = m.advance(
            WorkerEvent::StreamFinished {
                ok: true,
                keep_alive: false,
                hopeless: false,
            },
            no_facts(),
        );
        assert_eq!(effects.last(), Some(&WorkerEffect::Finish(WorkerOutcome::Finished)));
        assert!(effects.contains(&WorkerEffect::Repool));
    }

    #[test]
    fn test_hash_tree_requested_first_when_wanted() {
        let mut m = machine();
        m.advance(WorkerEvent::Connected, no_facts());
        assert_eq!(
            m.advance(
                WorkerEvent::IterationStarted {
                    wants_hash_tree: true
                },
                no_facts()
            ),
            vec![WorkerEffect::RequestHashTree]
        );
        assert_eq!(
            m.advance(WorkerEvent::HashTreeRequested { accepted: true }, no_facts()),
            vec![WorkerEffect::ReadHashTree]
        );
        assert_eq!(
            m.advance(WorkerEvent::HashTreeRead, no_facts()),
            vec![WorkerEffect::ClearHashTreeRequest, WorkerEffect::ConsumeBody]
        );
        assert_eq!(m.state(), WorkerState::ConsumingBody);
    }

    #[test]
    fn test_busy_backoff_depends_on_active_workers() {
        let config = WorkerConfig::default();
        let mut m = requesting(r(0, 9));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Busy { retry_after: None }),
            no_facts(),
        );
        assert!(effects.contains(&WorkerEffect::SetRetryAfter(config.busy_retry_none_active)));
        assert!(effects.contains(&WorkerEffect::Repool));

        let mut m = requesting(r(0, 9));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Busy {
                retry_after: Some(Duration::from_secs(120)),
            }),
            SwarmFacts {
                failures: 0,
                other_active_workers: 2,
            },
        );
        assert!(effects.contains(&WorkerEffect::SetRetryAfter(config.busy_retry_some_active)));

        let mut m = requesting(r(0, 9));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Busy {
                retry_after: Some(Duration::from_secs(120)),
            }),
            no_facts(),
        );
        assert!(effects.contains(&WorkerEffect::SetRetryAfter(Duration::from_secs(120))));
        assert_eq!(m.state(), WorkerState::Done(WorkerOutcome::NoData));
    }

    #[test]
    fn test_failure_budget() {
        let mut m = requesting(r(0, 9));
        let effects = m.advance(WorkerEvent::NegotiationFailed, no_facts());
        assert!(effects.contains(&WorkerEffect::RecordFailure));
        assert!(effects.contains(&WorkerEffect::Repool));
        assert!(!effects.contains(&WorkerEffect::InformMesh { good: false }));

        let mut m = requesting(r(0, 9));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::UnknownCode { code: 418 }),
            SwarmFacts {
                failures: 1,
                other_active_workers: 0,
            },
        );
        assert!(effects.contains(&WorkerEffect::InformMesh { good: false }));
        assert!(!effects.contains(&WorkerEffect::Repool));
        assert_eq!(m.state(), WorkerState::Done(WorkerOutcome::SourceFailed));
    }

    #[test]
    fn test_not_found_and_mismatch_drop_source() {
        let mut m = requesting(r(0, 9));
        let effects = m.advance(WorkerEvent::Negotiated(NegotiationOutcome::NotFound), no_facts());
        assert!(effects.contains(&WorkerEffect::InformMesh { good: false }));
        assert!(!effects.contains(&WorkerEffect::Repool));

        let mut m = requesting(r(0, 9));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::ContentMismatch),
            no_facts(),
        );
        assert_eq!(
            effects,
            vec![
                WorkerEffect::ReleaseClaim,
                WorkerEffect::Finish(WorkerOutcome::NoFile)
            ]
        );
    }

    #[test]
    fn test_range_unavailable_retries_with_advertised_ranges() {
        let mut m = requesting(r(0, 9));
        let available = RangeSet::from_range(r(50, 99));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::RangeUnavailable {
                available: Some(available.clone()),
            }),
            no_facts(),
        );
        assert_eq!(
            effects,
            vec![
                WorkerEffect::ReleaseClaim,
                WorkerEffect::ResetFailures,
                WorkerEffect::InformMesh { good: true },
                WorkerEffect::SetAvailableRanges(available),
                WorkerEffect::ConsumeBody,
            ]
        );
    }

    #[test]
    fn test_remote_queue_cycle() {
        let mut m = requesting(r(0, 9));
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Queued {
                position: 3,
                poll_interval: Duration::from_secs(30),
            }),
            no_facts(),
        );
        assert_eq!(
            effects,
            vec![
                WorkerEffect::ReleaseClaim,
                WorkerEffect::ResetFailures,
                WorkerEffect::EnterRemoteQueue { position: 3 },
            ]
        );
        assert!(m.is_remotely_queued());
        assert_eq!(
            m.advance(WorkerEvent::QueueAdmitted, no_facts()),
            vec![WorkerEffect::WaitForQueuePoll(Duration::from_secs(30))]
        );
        assert_eq!(
            m.advance(WorkerEvent::QueuePollElapsed, no_facts()),
            vec![WorkerEffect::BeginIteration]
        );

        m.advance(
            WorkerEvent::IterationStarted {
                wants_hash_tree: false,
            },
            no_facts(),
        );
        m.advance(WorkerEvent::BodyConsumed { ok: true }, no_facts());
        m.advance(WorkerEvent::RangePicked(r(0, 9)), no_facts());
        let effects = m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Connected { range: r(0, 9) }),
            no_facts(),
        );
        assert_eq!(
            effects,
            vec![WorkerEffect::LeaveRemoteQueue, WorkerEffect::Stream(r(0, 9))]
        );
        assert!(!m.is_remotely_queued());
    }

    #[test]
    fn test_queue_rejection_finishes() {
        let mut m = requesting(r(0, 9));
        m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Queued {
                position: 9,
                poll_interval: Duration::from_secs(30),
            }),
            no_facts(),
        );
        let effects = m.advance(WorkerEvent::QueueRejected, no_facts());
        assert_eq!(effects.last(), Some(&WorkerEffect::Finish(WorkerOutcome::NoData)));
        assert!(effects.contains(&WorkerEffect::LeaveRemoteQueue));
    }

    #[test]
    fn test_no_matching_ranges_backs_off_partial_source() {
        let config = WorkerConfig::default();
        let mut m = machine();
        m.advance(WorkerEvent::Connected, no_facts());
        m.advance(
            WorkerEvent::IterationStarted {
                wants_hash_tree: false,
            },
            no_facts(),
        );
        m.advance(WorkerEvent::BodyConsumed { ok: true }, no_facts());
        let effects = m.advance(
            WorkerEvent::NoRange(NoRangeReason::NoMatchingRanges),
            no_facts(),
        );
        assert_eq!(
            effects,
            vec![
                WorkerEffect::ClearAvailableRanges,
                WorkerEffect::SetRetryAfter(config.no_ranges_retry_after),
                WorkerEffect::ResetFailures,
                WorkerEffect::Repool,
                WorkerEffect::Finish(WorkerOutcome::NoFile),
            ]
        );
    }

    #[test]
    fn test_interrupt_is_idempotent() {
        let mut m = requesting(r(0, 9));
        let effects = m.advance(WorkerEvent::Interrupted, no_facts());
        assert_eq!(
            effects,
            vec![
                WorkerEffect::ReleaseClaim,
                WorkerEffect::Finish(WorkerOutcome::Interrupted)
            ]
        );
        assert!(m.advance(WorkerEvent::Interrupted, no_facts()).is_empty());
    }

    #[test]
    fn test_hopeless_stream_cancels_download() {
        let mut m = requesting(r(0, 9));
        m.advance(
            WorkerEvent::Negotiated(NegotiationOutcome::Connected { range: r(0, 9) }),
            no_facts(),
        );
        let effects = m.advance(
            WorkerEvent::StreamFinished {
                ok: true,
                keep_alive: true,
                hopeless: true,
            },
            no_facts(),
        );
        assert!(effects.contains(&WorkerEffect::CancelCorrupt));
        assert!(m.is_done());
    }

    #[test]
    fn test_connect_failure_is_transient() {
        let mut m = machine();
        let effects = m.advance(WorkerEvent::ConnectFailed, no_facts());
        assert!(effects.contains(&WorkerEffect::Repool));
        assert!(!effects.contains(&WorkerEffect::RecordFailure));
        assert_eq!(m.state(), WorkerState::Done(WorkerOutcome::ConnectFailed));
    }
}
