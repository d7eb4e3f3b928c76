//! Download coordinator.
//!
//! Each download runs two tasks: an actor that serves [`DownloadHandle`]
//! commands, and a session that owns the swarm loop. Both work on one
//! [`Shared`] value; its `state` mutex guards the ranker and the worker
//! registry and is the outermost lock of the download. Workers report back
//! by mutating shared state and waking the session through `wake`.

mod commands;
mod handle;
mod retry;
mod state;
mod swarm;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use self::commands::DownloadCommand;
pub use self::handle::DownloadHandle;
pub use self::retry::RetryPolicy;
pub use self::state::{DownloadState, DownloadStatus};
pub use self::swarm::{bytes_per_sec_to_kbps, swarm_capacity};
use crate::config::ShoalConfig;
use crate::hash_tree::HashTree;
use crate::hooks::{AcceptAllHooks, CompletionHooks, NoLookup, ScanVerdict, SourceLookup};
use crate::mesh::{Mesh, NullMesh};
use crate::persistence::{DownloadSnapshot, NoPersistence, PersistenceSink};
use crate::range::Range;
use crate::ranker::{Prober, SourceRanker, ranker_for};
use crate::selection::strategy_for;
use crate::source::{ContentHash, DownloadIdentity, RemoteSourceContext, SourceDescriptor};
use crate::storage::DiskStorage;
use crate::transport::SourceTransport;
use crate::verifying_file::{VerifyingFile, VerifyingFileError};
use crate::worker::{DownloadWorker, SpeedPolicy, WorkerId, WorkerRegistry};

/// Bytes read per step while hashing the finished file.
const HASH_READ_SIZE: usize = 64 * 1024;

/// Errors returned through a [`DownloadHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
    #[error("Download actor has shut down")]
    ActorShutdown,

    #[error("Invalid source: {reason}")]
    InvalidSource { reason: String },
}

/// Application collaborators of one download.
pub struct DownloadServices {
    pub mesh: Arc<dyn Mesh>,
    /// Enables the probing ranker when present
    pub prober: Option<Arc<dyn Prober>>,
    pub hooks: Arc<dyn CompletionHooks>,
    pub lookup: Arc<dyn SourceLookup>,
    pub persistence: Arc<dyn PersistenceSink>,
    /// Verified ranges from a previous run
    pub resume: Vec<Range>,
    /// Root hash the download's hash tree must have, if known
    pub expected_root: Option<String>,
    /// Randomness for range selection; drawn from the config when None
    pub selection_rng: Option<Box<dyn RngCore + Send>>,
}

impl Default for DownloadServices {
    fn default() -> Self {
        Self {
            mesh: Arc::new(NullMesh),
            prober: None,
            hooks: Arc::new(AcceptAllHooks),
            lookup: Arc::new(NoLookup),
            persistence: Arc::new(NoPersistence),
            resume: Vec::new(),
            expected_root: None,
            selection_rng: None,
        }
    }
}

/// Mutable coordinator state, guarded by [`Shared::state`].
pub(crate) struct CoordinatorState {
    pub(crate) ranker: Box<dyn SourceRanker>,
    pub(crate) registry: WorkerRegistry,
    pub(crate) stopped: bool,
    pub(crate) paused: bool,
    /// A worker found the download hopelessly corrupt
    pub(crate) corrupt: bool,
    /// Best aggregate bandwidth measured, bytes per second
    pub(crate) best_bandwidth: Option<f64>,
    pub(crate) retry_wait: Option<Duration>,
    pub(crate) reason: Option<String>,
    /// Bumped whenever sources are added
    pub(crate) sources_generation: u64,
}

/// State shared by the session, the actor and every worker.
pub(crate) struct Shared {
    pub(crate) file: VerifyingFile,
    pub(crate) config: ShoalConfig,
    pub(crate) identity: DownloadIdentity,
    pub(crate) transport: Arc<dyn SourceTransport>,
    pub(crate) mesh: Arc<dyn Mesh>,
    pub(crate) hooks: Arc<dyn CompletionHooks>,
    pub(crate) lookup: Arc<dyn SourceLookup>,
    pub(crate) persistence: Arc<dyn PersistenceSink>,
    pub(crate) state: Mutex<CoordinatorState>,
    pub(crate) wake: Notify,
    pub(crate) status: watch::Sender<DownloadState>,
}

/// How one run of the swarm loop ended.
#[derive(Debug, Clone, PartialEq)]
enum SwarmExit {
    Complete,
    Corrupt,
    DiskProblem(String),
    Stopped,
    Paused,
    /// No worker and no usable host; `busy_wait` is the shortest backoff
    Inactive { busy_wait: Option<Duration> },
}

/// Spawns a download and returns its handle.
///
/// The download starts at once with an empty source pool; feed it with
/// [`DownloadHandle::add_sources`].
pub fn spawn_download(
    config: ShoalConfig,
    identity: DownloadIdentity,
    disk: Arc<dyn DiskStorage>,
    transport: Arc<dyn SourceTransport>,
    services: DownloadServices,
) -> DownloadHandle {
    let rng = services
        .selection_rng
        .unwrap_or_else(|| config.selection_rng());
    let strategy = strategy_for(&config.selection, rng, identity.file_size);
    let file = VerifyingFile::new(
        identity.file_size,
        disk,
        strategy,
        config.verification.clone(),
        &config.disk,
    );
    if let Some(root) = services.expected_root {
        file.set_expected_root(root);
    }

    let initial = if services.resume.is_empty() {
        DownloadState::Initializing
    } else {
        DownloadState::Queued
    };
    let (status, status_receiver) = watch::channel(initial);
    let ranker = ranker_for(&config.ranker, services.prober, services.mesh.clone());
    let shared = Arc::new(Shared {
        file,
        config,
        identity,
        transport,
        mesh: services.mesh,
        hooks: services.hooks,
        lookup: services.lookup,
        persistence: services.persistence,
        state: Mutex::new(CoordinatorState {
            ranker,
            registry: WorkerRegistry::new(),
            stopped: false,
            paused: false,
            corrupt: false,
            best_bandwidth: None,
            retry_wait: None,
            reason: None,
            sources_generation: 0,
        }),
        wake: Notify::new(),
        status,
    });

    let (sender, receiver) = mpsc::channel(100);
    let session = shared.clone();
    let resume = services.resume;
    tokio::spawn(async move {
        session.run(resume).await;
    });
    tokio::spawn(async move {
        run_actor_loop(shared, receiver).await;
    });

    DownloadHandle::new(sender, status_receiver)
}

/// Serves handle commands until every handle is dropped.
async fn run_actor_loop(shared: Arc<Shared>, mut receiver: mpsc::Receiver<DownloadCommand>) {
    tracing::debug!("Download actor started for {}", shared.identity.file_name);
    while let Some(command) = receiver.recv().await {
        handle_command(&shared, command);
    }
    tracing::debug!("Download actor stopped for {}", shared.identity.file_name);
}

fn handle_command(shared: &Arc<Shared>, command: DownloadCommand) {
    match command {
        DownloadCommand::AddSources { sources, responder } => {
            let result = shared.add_sources(sources);
            let _ = responder.send(result);
        }
        DownloadCommand::GetStatus { responder } => {
            let _ = responder.send(shared.status());
        }
        DownloadCommand::Pause { responder } => {
            shared.pause();
            let _ = responder.send(());
        }
        DownloadCommand::Resume { responder } => {
            shared.resume();
            let _ = responder.send(());
        }
        DownloadCommand::Stop { responder } => {
            shared.stop();
            let _ = responder.send(());
        }
        DownloadCommand::HashTreeRead { tree, responder } => {
            let _ = responder.send(shared.hash_tree_read(tree));
        }
    }
}

impl Shared {
    fn current_state(&self) -> DownloadState {
        *self.status.borrow()
    }

    pub(crate) fn set_state(&self, next: DownloadState) {
        let changed = self.status.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!("{}: state -> {next}", self.identity.file_name);
        }
    }

    fn fail(&self, next: DownloadState, reason: impl Into<String>) -> DownloadState {
        let reason = reason.into();
        tracing::error!("{}: {next}: {reason}", self.identity.file_name);
        self.state.lock().reason = Some(reason);
        next
    }

    pub(crate) fn speed_policy(&self) -> SpeedPolicy {
        SpeedPolicy {
            min_acceptable_speed: self.config.swarm.min_acceptable_speed as f64,
            warmup: self.config.swarm.bandwidth_warmup,
        }
    }

    /// Worker ceiling, folding the current measurement into the best seen.
    fn capacity(&self, state: &mut CoordinatorState) -> usize {
        if let Some(measured) = state
            .registry
            .measured_bandwidth(self.config.swarm.bandwidth_warmup)
        {
            let best = state.best_bandwidth.map_or(measured, |best| best.max(measured));
            state.best_bandwidth = Some(best);
        }
        swarm_capacity(&self.config.swarm, state.best_bandwidth)
    }

    // ---- session ----

    async fn run(self: Arc<Self>, resume: Vec<Range>) {
        let outcome = self.drive(resume).await;
        self.set_state(outcome);
        self.save_snapshot();
        tracing::info!(
            "{}: finished as {outcome} ({} of {} bytes verified)",
            self.identity.file_name,
            self.file.verified_size(),
            self.identity.file_size
        );
    }

    async fn drive(self: &Arc<Self>, resume: Vec<Range>) -> DownloadState {
        if self.identity.file_size == 0 {
            return self.fail(DownloadState::Invalid, "file has no content");
        }
        if let Err(error) = self.file.open(&resume).await {
            return self.fail(DownloadState::DiskProblem, error.to_string());
        }

        loop {
            self.set_state(DownloadState::Connecting);
            let exit = self.run_swarm().await;
            tracing::debug!("{}: swarm exited with {exit:?}", self.identity.file_name);

            match exit {
                SwarmExit::Complete => return self.verify_and_save().await,
                SwarmExit::Corrupt => {
                    self.discard_corrupt().await;
                    return self.fail(DownloadState::CorruptFile, "too much corrupt data");
                }
                SwarmExit::DiskProblem(reason) => {
                    let _ = self.file.close().await;
                    return self.fail(DownloadState::DiskProblem, reason);
                }
                SwarmExit::Stopped => {
                    let _ = self.file.close().await;
                    return DownloadState::Aborted;
                }
                SwarmExit::Paused => {
                    self.set_state(DownloadState::Paused);
                    if !self.wait_for_resume().await {
                        let _ = self.file.close().await;
                        return DownloadState::Aborted;
                    }
                }
                SwarmExit::Inactive { busy_wait } => {
                    let policy = RetryPolicy::decide(busy_wait, self.lookup.as_ref());
                    tracing::debug!("{}: out of sources, {policy:?}", self.identity.file_name);
                    let proceed = match policy {
                        RetryPolicy::WaitForBusy(wait) => {
                            self.state.lock().retry_wait = Some(wait);
                            self.set_state(DownloadState::Busy);
                            self.wait_for_sources(Some(wait)).await
                        }
                        RetryPolicy::LookupInFlight => {
                            self.set_state(DownloadState::WaitingForSources);
                            self.wait_for_sources(Some(self.config.swarm.worker_interval))
                                .await
                        }
                        RetryPolicy::Requery => {
                            self.lookup.requery(&self.identity);
                            self.set_state(DownloadState::WaitingForSources);
                            self.wait_for_sources(None).await
                        }
                        RetryPolicy::GiveUp => {
                            self.set_state(DownloadState::GaveUp);
                            self.save_snapshot();
                            self.wait_for_sources(None).await
                        }
                    };
                    self.state.lock().retry_wait = None;
                    if !proceed {
                        let _ = self.file.close().await;
                        return DownloadState::Aborted;
                    }
                }
            }
        }
    }

    /// Waits for new sources, a pause, or `max_wait`.
    ///
    /// Returns false if the download was stopped meanwhile.
    async fn wait_for_sources(&self, max_wait: Option<Duration>) -> bool {
        let generation = self.state.lock().sources_generation;
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        loop {
            {
                let state = self.state.lock();
                if state.stopped {
                    return false;
                }
                if state.paused || state.sources_generation != generation {
                    return true;
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, self.wake.notified()).await.is_err() {
                        return !self.state.lock().stopped;
                    }
                }
                None => self.wake.notified().await,
            }
        }
    }

    /// Waits until the download is resumed; false if it was stopped instead.
    async fn wait_for_resume(&self) -> bool {
        loop {
            {
                let state = self.state.lock();
                if state.stopped {
                    return false;
                }
                if !state.paused {
                    return true;
                }
            }
            self.wake.notified().await;
        }
    }

    /// The swarm loop: spawn workers while there is work and capacity,
    /// until the file completes or the swarm runs dry.
    async fn run_swarm(self: &Arc<Self>) -> SwarmExit {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut last_verified = self.file.verified_size();

        let exit = loop {
            {
                let state = self.state.lock();
                if state.stopped {
                    break SwarmExit::Stopped;
                }
                if state.paused {
                    break SwarmExit::Paused;
                }
                if state.corrupt {
                    break SwarmExit::Corrupt;
                }
            }

            if let Err(error) = self
                .file
                .wait_for_pending_if_needed(self.config.swarm.pending_wait)
                .await
            {
                break SwarmExit::DiskProblem(error.to_string());
            }
            if let Some(error) = self.file.stored_error() {
                break SwarmExit::DiskProblem(error.to_string());
            }
            if self.file.is_complete() {
                break SwarmExit::Complete;
            }

            {
                let mut state = self.state.lock();
                state.ranker.tick();
                if state.registry.is_empty() && !state.ranker.has_usable_hosts() {
                    let busy_wait = state
                        .ranker
                        .has_more()
                        .then(|| state.ranker.calculate_wait_time());
                    break SwarmExit::Inactive { busy_wait };
                }
                self.spawn_workers(&mut state, &mut workers);
                let next = Self::swarm_state(&state);
                drop(state);
                self.set_state(next);
            }

            let verified = self.file.verified_size();
            if verified != last_verified {
                last_verified = verified;
                self.save_snapshot();
            }
            workers.retain(|worker| !worker.is_finished());

            let _ = tokio::time::timeout(self.config.swarm.worker_interval, self.wake.notified()).await;
        };

        self.state.lock().registry.interrupt_all();
        futures::future::join_all(workers).await;
        if self.file.verified_size() != last_verified {
            self.save_snapshot();
        }
        exit
    }

    /// Starts workers while capacity allows and there is something to do.
    ///
    /// Queued workers do not count against capacity; eviction among them is
    /// settled when a worker reports its queue position.
    fn spawn_workers(self: &Arc<Self>, state: &mut CoordinatorState, workers: &mut Vec<JoinHandle<()>>) {
        let policy = self.speed_policy();
        let capacity = self.capacity(state);
        let mut in_use = Vec::new();

        while state.registry.non_queued_count() < capacity
            && (self.file.has_free_blocks_to_assign() > 0 || state.registry.has_steal_candidate(policy))
        {
            let Some(source) = state.ranker.get_best() else {
                break;
            };
            if state.registry.uses_source(&source) {
                in_use.push(source);
                continue;
            }
            if source.is_busy() {
                state.ranker.add_to_pool(vec![source]);
                break;
            }

            let (id, interrupt) = state.registry.register(source.clone());
            tracing::debug!(
                "spawn_workers: {id} for {source} ({} of {capacity} slots)",
                state.registry.non_queued_count()
            );
            let worker = DownloadWorker::new(self.clone(), id, source, interrupt);
            workers.push(tokio::spawn(worker.run()));
        }

        if !in_use.is_empty() {
            state.ranker.add_to_pool(in_use);
        }
    }

    fn swarm_state(state: &CoordinatorState) -> DownloadState {
        if state.registry.active_count() > 0 {
            DownloadState::Downloading
        } else if state.registry.queued_count() > 0 {
            DownloadState::RemoteQueued
        } else if !state.registry.is_empty() {
            DownloadState::Connecting
        } else {
            DownloadState::WaitingForConnections
        }
    }

    /// Post-download checks: scan, policy, whole-file hash, save.
    async fn verify_and_save(&self) -> DownloadState {
        if let Err(error) = self.file.close().await {
            return self.fail(DownloadState::DiskProblem, error.to_string());
        }

        let scan = self.hooks.scan(&self.identity, &self.file).await;
        if scan == ScanVerdict::ThreatFound {
            return self.fail(DownloadState::ThreatFound, "malware scan found a threat");
        }
        if self.hooks.is_dangerous(&self.identity) {
            return self.fail(DownloadState::Dangerous, "file type is not allowed");
        }

        if let Some(expected) = self.identity.content_hash {
            self.set_state(DownloadState::Hashing);
            match self.hash_file().await {
                Ok(actual) if actual == expected => {}
                Ok(actual) => {
                    self.discard_corrupt().await;
                    return self.fail(
                        DownloadState::CorruptFile,
                        format!("content hash {actual} does not match {expected}"),
                    );
                }
                Err(error) => return self.fail(DownloadState::DiskProblem, error.to_string()),
            }
        }

        self.set_state(DownloadState::Saving);
        if let Err(reason) = self.hooks.save(&self.identity, &self.file).await {
            return self.fail(DownloadState::DiskProblem, reason);
        }

        if scan == ScanVerdict::ScanFailed {
            self.fail(DownloadState::ScanFailed, "malware scan could not run")
        } else {
            DownloadState::Complete
        }
    }

    /// SHA-1 of the whole file as written.
    async fn hash_file(&self) -> Result<ContentHash, VerifyingFileError> {
        let size = self.file.size();
        let mut hasher = Sha1::new();
        let mut offset = 0u64;
        while offset < size {
            let len = (size - offset).min(HASH_READ_SIZE as u64) as usize;
            let bytes = self.file.read_at(offset, len).await?;
            hasher.update(&bytes);
            offset += len as u64;
        }
        Ok(ContentHash::new(hasher.finalize().into()))
    }

    async fn discard_corrupt(&self) {
        let result = if self.config.verification.quarantine_corrupt {
            self.file.quarantine().await
        } else {
            self.file.delete().await
        };
        if let Err(error) = result {
            tracing::warn!("{}: cleaning up corrupt file failed: {error}", self.identity.file_name);
        }
    }

    // ---- worker callbacks ----

    /// Admits a worker into a remote queue at `position`, evicting a
    /// worse-queued worker if the swarm is full.
    pub(crate) fn kill_queued_if_necessary(&self, id: WorkerId, position: u32) -> bool {
        let mut state = self.state.lock();
        let capacity = self.capacity(&mut state);
        let Some(slot) = state.registry.get(id) else {
            return false;
        };
        let already_queued = slot.queue_position.is_some();

        let admitted = if already_queued || state.registry.len() <= capacity {
            true
        } else if let Some(evicted) = state.registry.worst_queued_above(position, id) {
            tracing::debug!("kill_queued_if_necessary: {evicted} evicted for {id} at {position}");
            state.registry.interrupt(evicted);
            if let Some(slot) = state.registry.get_mut(evicted) {
                slot.queue_position = None;
            }
            true
        } else {
            false
        };

        if admitted && let Some(slot) = state.registry.get_mut(id) {
            slot.queue_position = Some(position);
        }
        let remote_queued = admitted
            && !already_queued
            && state.registry.active_count() == 0
            && state.registry.queued_count() == 1;
        drop(state);

        if remote_queued {
            self.set_state(DownloadState::RemoteQueued);
        }
        admitted
    }

    pub(crate) fn leave_remote_queue(&self, id: WorkerId) {
        if let Some(slot) = self.state.lock().registry.get_mut(id) {
            slot.queue_position = None;
        }
    }

    /// Returns a source to the pool unless the download is stopping.
    pub(crate) fn repool(&self, source: RemoteSourceContext) {
        let mut state = self.state.lock();
        if !state.stopped {
            state.ranker.add_to_pool(vec![source]);
        }
        drop(state);
        self.wake.notify_one();
    }

    pub(crate) fn mark_corrupt(&self) {
        let mut state = self.state.lock();
        if !state.corrupt {
            tracing::warn!(
                "{}: corruption budget exhausted ({} bytes lost)",
                self.identity.file_name,
                self.file.lost_size()
            );
        }
        state.corrupt = true;
        state.registry.interrupt_all();
        drop(state);
        self.wake.notify_one();
    }

    pub(crate) fn worker_finished(&self, id: WorkerId) {
        let mut state = self.state.lock();
        self.capacity(&mut state);
        state.registry.remove(id);
        drop(state);
        self.wake.notify_one();
    }

    /// Installs `tree` if it is better than the current one.
    pub(crate) fn hash_tree_read(&self, tree: Arc<dyn HashTree>) -> bool {
        self.file.clear_hash_tree_request();
        let current = self.file.hash_tree();
        if !tree.is_better_than(current.as_deref()) {
            tracing::debug!("hash_tree_read: keeping current tree over {}", tree.root());
            return false;
        }
        self.file.set_hash_tree(Some(tree))
    }

    // ---- handle commands ----

    fn add_sources(&self, sources: Vec<SourceDescriptor>) -> Result<usize, DownloadError> {
        let offered = sources.len();
        let (matching, rejected): (Vec<_>, Vec<_>) = sources
            .into_iter()
            .partition(|source| self.identity.matches(source));
        for source in &rejected {
            tracing::warn!(
                "add_sources: {} serves {} ({} bytes), not {}",
                source.address,
                source.file_name,
                source.file_size,
                self.identity.file_name
            );
        }
        if matching.is_empty() && offered > 0 {
            return Err(DownloadError::InvalidSource {
                reason: format!("none of {offered} sources serve {}", self.identity.file_name),
            });
        }

        let mut state = self.state.lock();
        if state.stopped || self.current_state().is_terminal() {
            return Ok(0);
        }
        let fresh: Vec<_> = matching
            .into_iter()
            .map(RemoteSourceContext::new)
            .filter(|source| !state.registry.uses_source(source))
            .collect();
        let added = fresh.len();
        state.ranker.add_to_pool(fresh);
        state.sources_generation += 1;
        drop(state);

        tracing::debug!("add_sources: pooled {added} of {offered}");
        self.wake.notify_one();
        Ok(added)
    }

    fn status(&self) -> DownloadStatus {
        let ranges = self.file.ranges();
        let state = self.state.lock();
        DownloadStatus {
            state: self.current_state(),
            file_size: self.identity.file_size,
            verified_bytes: ranges.verified.size(),
            pending_bytes: ranges.partial.size() + ranges.pending.size(),
            lost_bytes: self.file.lost_size(),
            free_bytes: self.file.has_free_blocks_to_assign(),
            workers: state.registry.len(),
            active_workers: state.registry.active_count(),
            queued_workers: state.registry.queued_count(),
            pooled_sources: state.ranker.len(),
            retry_wait_ms: state.retry_wait.map(|wait| wait.as_millis() as u64),
            preview_offset: self.file.preview_offset(),
            reason: state.reason.clone(),
        }
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        if state.stopped || state.paused {
            return;
        }
        state.paused = true;
        state.registry.interrupt_all();
        drop(state);
        tracing::debug!("{}: pausing", self.identity.file_name);
        self.wake.notify_one();
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        if !state.paused {
            return;
        }
        state.paused = false;
        drop(state);
        tracing::debug!("{}: resuming", self.identity.file_name);
        self.wake.notify_one();
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        state.ranker.stop();
        state.registry.interrupt_all();
        drop(state);
        tracing::debug!("{}: stopping", self.identity.file_name);
        self.wake.notify_one();
    }

    // ---- persistence ----

    fn snapshot(&self) -> DownloadSnapshot {
        let ranges = self.file.ranges();
        DownloadSnapshot {
            identity: self.identity.clone(),
            state: self.current_state().to_string(),
            verified: ranges.verified.to_vec(),
            partial: ranges.partial.to_vec(),
            corrupt: ranges.corrupt.to_vec(),
            lost_bytes: self.file.lost_size(),
            hash_tree_root: self.file.tree_info().map(|info| info.root),
            saved_at: Utc::now(),
        }
    }

    fn save_snapshot(&self) {
        if let Err(error) = self.persistence.save(&self.snapshot()) {
            tracing::warn!("{}: saving snapshot failed: {error}", self.identity.file_name);
        }
    }
}

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
pub(crate) mod test_mocks;
