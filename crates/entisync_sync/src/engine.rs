//! The reconciliation engine.
//!
//! An [`EntitySync`] converges the local entities of one scope with a
//! remote snapshot (full mode) or a remote delta (incremental mode).
//!
//! Full mode lists the scope first (identifiers only) and remembers every
//! local id as unprocessed. Each remote entity is matched by RID, or by
//! GID when it carries no RID. Unmatched entities are created; matched
//! ones are fetched and compared with the [`UpdateCheck`], then modified
//! if they differ. Once delivery is done and the last batch is applied,
//! every local id never matched is deleted.
//!
//! Incremental mode looks up each delivered RID in the mirror instead.
//! Changed entities are modified when found and created otherwise;
//! removed entities are deleted when found. Failed lookups are tolerated.
//!
//! Remote entities queue up until a batch is full or delivery is done.
//! Each batch runs inside a [`TransactionSequence`], shared by the whole
//! run or opened per batch depending on the [`TransactionMode`].

use crate::config::{SyncConfig, TransactionMode};
use crate::error::{SyncError, SyncResult};
use crate::state::{SyncEvent, SyncStats};
use crate::update::{DefaultUpdateCheck, UpdateCheck};
use entisync_core::{task_collect_flat, CoreError, CoreResult, Task};
use entisync_job::{
    create, delete, fetch, modify, FetchJob, JobHandle, JobHandler, JobId, JobParent,
    TransactionSequence,
};
use entisync_protocol::{Gid, LocalEntity, LocalId, RemoteEntity, Rid, Scope};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

/// Which kind of delivery the run received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    NotStarted,
    Running,
    Done,
}

enum Pending {
    Full(RemoteEntity),
    Changed(RemoteEntity),
    Removed(RemoteEntity),
}

enum Step {
    Wait,
    /// Input was discarded after an error; ask for more so the producer
    /// can drain.
    Discarded(usize),
    List(Scope),
    Apply { batch: Vec<Pending>, last: bool },
    Abort(Option<TransactionSequence>),
    Complete(Option<TransactionSequence>),
}

type Subscriber = Box<dyn FnMut(&SyncEvent)>;

struct SyncState {
    config: SyncConfig,
    update_check: Rc<dyn UpdateCheck>,
    mode: Option<FeedMode>,
    total: Option<usize>,
    received: usize,
    delivery_done: bool,
    queue: VecDeque<Pending>,
    listing: Listing,
    by_rid: HashMap<Rid, LocalId>,
    by_gid: HashMap<Gid, LocalId>,
    unprocessed: BTreeSet<LocalId>,
    deletions_issued: bool,
    started: bool,
    processing: bool,
    /// Operations of the running batch not settled yet, plus one while the
    /// batch is being issued.
    pending_ops: usize,
    last_batch: bool,
    transaction: Option<TransactionSequence>,
    /// Unfinished sequences, and whether each brackets a transaction.
    sequences: HashMap<JobId, bool>,
    error: Option<CoreError>,
    stats: SyncStats,
    subscribers: Vec<Subscriber>,
    finished: bool,
}

impl SyncState {
    fn new(config: SyncConfig) -> Self {
        Self {
            config,
            update_check: Rc::new(DefaultUpdateCheck),
            mode: None,
            total: None,
            received: 0,
            delivery_done: false,
            queue: VecDeque::new(),
            listing: Listing::NotStarted,
            by_rid: HashMap::new(),
            by_gid: HashMap::new(),
            unprocessed: BTreeSet::new(),
            deletions_issued: false,
            started: false,
            processing: false,
            pending_ops: 0,
            last_batch: false,
            transaction: None,
            sequences: HashMap::new(),
            error: None,
            stats: SyncStats::default(),
            subscribers: Vec::new(),
            finished: false,
        }
    }

    /// Keeps the first error.
    fn record_error(&mut self, error: CoreError) {
        if self.error.is_none() {
            tracing::debug!(%error, "sync error recorded");
            self.error = Some(error);
        }
    }

    fn total_reached(&self) -> bool {
        self.config.auto_delivery_done && self.total.is_some_and(|total| self.received >= total)
    }

    fn local_match(&self, remote: &RemoteEntity) -> Option<LocalId> {
        match remote.effective_rid() {
            Some(rid) => self.by_rid.get(rid).copied(),
            None => remote
                .effective_gid()
                .and_then(|gid| self.by_gid.get(gid).copied()),
        }
    }
}

/// A running reconciliation of one scope.
///
/// The engine is a job: it runs once it reaches the front of its parent's
/// queue, and finishes after delivery is done and every batch is applied.
/// Entities may be fed before it starts.
///
/// Cloning yields another handle to the same run.
#[derive(Clone)]
pub struct EntitySync {
    job: JobHandle,
    state: Rc<RefCell<SyncState>>,
    result: Task<SyncStats>,
}

impl EntitySync {
    /// Creates a run under `parent`.
    pub fn new(parent: &dyn JobParent, config: SyncConfig) -> CoreResult<Self> {
        let state = Rc::new(RefCell::new(SyncState::new(config)));
        let result = Task::new();
        let job = parent.add_job(Box::new(EngineHandler {
            state: Rc::clone(&state),
            result: result.clone(),
        }))?;

        let engine = Self { job, state, result };
        let observer = engine.clone();
        engine
            .job
            .result()
            .on_settled(move |outcome| observer.settle(outcome));
        Ok(engine)
    }

    /// Returns the engine's job.
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// Returns the task that settles with the run's statistics.
    pub fn result(&self) -> Task<SyncStats> {
        self.result.clone()
    }

    /// Returns the statistics gathered so far.
    pub fn stats(&self) -> SyncStats {
        self.state.borrow().stats
    }

    /// Returns the first error recorded.
    pub fn error(&self) -> Option<CoreError> {
        self.state.borrow().error.clone()
    }

    /// Returns true once the run finished.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished || self.job.is_finished()
    }

    /// Returns the number of remote entities waiting for a batch.
    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// Returns the batch size.
    pub fn batch_size(&self) -> usize {
        self.state.borrow().config.batch_size
    }

    /// Enables or disables streaming delivery.
    pub fn set_streaming(&self, streaming: bool) {
        self.state.borrow_mut().config.streaming = streaming;
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn set_batch_size(&self, batch_size: usize) {
        self.state.borrow_mut().config.batch_size = batch_size.max(1);
    }

    /// Sets the transaction mode used by batches not started yet.
    pub fn set_transaction_mode(&self, mode: TransactionMode) {
        self.state.borrow_mut().config.transaction_mode = mode;
    }

    /// Sets whether reaching the declared total implies delivery done.
    pub fn set_auto_delivery_done(&self, enabled: bool) {
        self.state.borrow_mut().config.auto_delivery_done = enabled;
    }

    /// Replaces the predicate deciding whether matched entities are
    /// modified.
    pub fn set_update_check<C>(&self, check: C)
    where
        C: UpdateCheck + 'static,
    {
        self.state.borrow_mut().update_check = Rc::new(check);
    }

    /// Registers a listener for [`SyncEvent`]s.
    ///
    /// Events are delivered from the event loop, never from inside a feed
    /// call.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: FnMut(&SyncEvent) + 'static,
    {
        self.state.borrow_mut().subscribers.push(Box::new(listener));
    }

    /// Declares how many remote entities a full delivery contains.
    ///
    /// Once that many were fed, delivery is done unless automatic delivery
    /// done was disabled.
    pub fn set_total(&self, total: usize) -> SyncResult<()> {
        if self.is_finished() {
            return Err(SyncError::Finished);
        }
        {
            let mut state = self.state.borrow_mut();
            if state.mode == Some(FeedMode::Incremental) {
                return Err(SyncError::ModeMismatch);
            }
            state.mode = Some(FeedMode::Full);
            state.total = Some(total);
            if state.total_reached() {
                state.delivery_done = true;
            }
        }
        self.job.notify();
        Ok(())
    }

    /// Feeds part of the complete remote set.
    pub fn feed_full(&self, entities: Vec<RemoteEntity>) -> SyncResult<()> {
        let count = entities.len();
        self.accept(
            FeedMode::Full,
            entities.into_iter().map(Pending::Full),
            count,
        )
    }

    /// Feeds entities changed or removed since the last run.
    pub fn feed_incremental(
        &self,
        changed: Vec<RemoteEntity>,
        removed: Vec<RemoteEntity>,
    ) -> SyncResult<()> {
        let count = changed.len() + removed.len();
        let pending = changed
            .into_iter()
            .map(Pending::Changed)
            .chain(removed.into_iter().map(Pending::Removed));
        self.accept(FeedMode::Incremental, pending, count)
    }

    /// Declares that no more entities will be fed.
    pub fn delivery_done(&self) -> SyncResult<()> {
        if self.is_finished() {
            return Err(SyncError::Finished);
        }
        self.state.borrow_mut().delivery_done = true;
        self.job.notify();
        Ok(())
    }

    /// Declares delivery done; the run commits and finishes once the last
    /// batch is applied.
    pub fn commit(&self) -> SyncResult<()> {
        self.delivery_done()
    }

    /// Aborts the run with [`CoreError::UserCanceled`].
    ///
    /// Queued entities are dropped, the open transaction is rolled back and
    /// the run finishes once operations already issued have settled.
    pub fn rollback(&self) {
        self.abort(CoreError::UserCanceled);
    }

    /// Aborts the run with `error`.
    pub(crate) fn abort(&self, error: CoreError) {
        if self.is_finished() {
            return;
        }
        {
            let mut state = self.state.borrow_mut();
            state.record_error(error);
            state.queue.clear();
            state.delivery_done = true;
        }
        self.job.notify();
    }

    fn accept<I>(&self, mode: FeedMode, pending: I, count: usize) -> SyncResult<()>
    where
        I: IntoIterator<Item = Pending>,
    {
        if self.is_finished() {
            return Err(SyncError::Finished);
        }
        {
            let mut state = self.state.borrow_mut();
            if state.delivery_done {
                return Err(SyncError::DeliveryDone);
            }
            match state.mode {
                Some(current) if current != mode => return Err(SyncError::ModeMismatch),
                _ => state.mode = Some(mode),
            }
            state.queue.extend(pending);
            state.received += count;
            if !state.config.streaming || state.total_reached() {
                state.delivery_done = true;
            }
            tracing::trace!(
                count,
                received = state.received,
                queued = state.queue.len(),
                "entities delivered"
            );
        }
        self.job.notify();
        Ok(())
    }

    /// Advances the run as far as possible.
    ///
    /// # Panics
    ///
    /// Panics if the run already finished.
    fn execute(&self) {
        match self.next_step() {
            Step::Wait => {}
            Step::Discarded(capacity) => self.emit(SyncEvent::ReadyForNextBatch(capacity)),
            Step::List(scope) => self.start_listing(scope),
            Step::Apply { batch, last } => self.apply(batch, last),
            Step::Abort(transaction) => {
                if let Some(transaction) = transaction {
                    transaction.rollback();
                }
                self.check_done();
            }
            Step::Complete(transaction) => {
                if let Some(transaction) = transaction {
                    transaction.commit();
                }
                self.check_done();
            }
        }
    }

    fn next_step(&self) -> Step {
        let mut state = self.state.borrow_mut();
        assert!(!state.finished, "EntitySync driven after it finished");
        if !state.started || state.processing || state.listing == Listing::Running {
            return Step::Wait;
        }

        if state.error.is_some() {
            let discarded = !state.queue.is_empty();
            state.queue.clear();
            if state.delivery_done {
                return Step::Abort(state.transaction.take());
            }
            if discarded && state.config.streaming {
                return Step::Discarded(state.config.batch_size);
            }
            return Step::Wait;
        }

        if state.delivery_done && state.mode.is_none() {
            state.mode = Some(FeedMode::Full);
        }
        if state.mode == Some(FeedMode::Full) && state.listing == Listing::NotStarted {
            state.listing = Listing::Running;
            return Step::List(state.config.scope);
        }

        let batch_size = state.config.batch_size;
        let queued = state.queue.len();
        if queued >= batch_size || (state.delivery_done && queued > 0) {
            let batch: Vec<Pending> = state.queue.drain(..batch_size.min(queued)).collect();
            let last = state.delivery_done && state.queue.is_empty();
            state.processing = true;
            return Step::Apply { batch, last };
        }
        if !state.delivery_done {
            return Step::Wait;
        }

        if state.mode == Some(FeedMode::Full)
            && !state.deletions_issued
            && !state.unprocessed.is_empty()
        {
            state.processing = true;
            return Step::Apply {
                batch: Vec::new(),
                last: true,
            };
        }
        Step::Complete(state.transaction.take())
    }

    fn start_listing(&self, scope: Scope) {
        tracing::debug!(sync = %self.job.id(), "listing local entities");
        let listing = fetch(&self.job, FetchJob::new(scope).projection().cache_only());
        let engine = self.clone();
        listing.then_result(move |result| engine.listing_done(result));
    }

    fn listing_done(&self, result: CoreResult<Vec<LocalEntity>>) {
        if self.is_finished() {
            return;
        }
        {
            let mut state = self.state.borrow_mut();
            state.listing = Listing::Done;
            match result {
                Ok(entities) => {
                    for entity in entities {
                        state.unprocessed.insert(entity.id);
                        if let Some(rid) = entity.rid.filter(|rid| !rid.is_empty()) {
                            state.by_rid.insert(rid, entity.id);
                        }
                        if let Some(gid) = entity.gid.filter(|gid| !gid.is_empty()) {
                            state.by_gid.insert(gid, entity.id);
                        }
                    }
                    tracing::debug!(local = state.unprocessed.len(), "local listing done");
                }
                Err(error) => state.record_error(error),
            }
        }
        self.execute();
    }

    /// Returns the sequence the next batch runs in, opening one if needed.
    fn transaction(&self) -> CoreResult<TransactionSequence> {
        let (existing, mode) = {
            let state = self.state.borrow();
            (state.transaction.clone(), state.config.transaction_mode)
        };
        if let Some(transaction) = existing {
            return Ok(transaction);
        }

        let transaction = TransactionSequence::new(&self.job)?;
        transaction.set_automatic_committing_enabled(false);
        transaction.set_transactions_disabled(mode == TransactionMode::None);

        let mut state = self.state.borrow_mut();
        let bracketed = mode != TransactionMode::None;
        state
            .sequences
            .insert(transaction.job().id(), bracketed);
        if bracketed {
            state.stats.transactions += 1;
        }
        state.transaction = Some(transaction.clone());
        Ok(transaction)
    }

    fn apply(&self, batch: Vec<Pending>, last: bool) {
        {
            let mut state = self.state.borrow_mut();
            state.pending_ops = 1;
            state.last_batch = last;
        }

        match self.transaction() {
            Ok(transaction) => {
                let mode = self.state.borrow().mode;
                match mode {
                    Some(FeedMode::Incremental) => self.apply_incremental(&transaction, batch),
                    _ => self.apply_full(&transaction, batch, last),
                }
            }
            Err(error) => self.state.borrow_mut().record_error(error),
        }
        self.op_done();
    }

    fn apply_full(&self, transaction: &TransactionSequence, batch: Vec<Pending>, last: bool) {
        let (scope, creates, matched, deletions) = {
            let mut state = self.state.borrow_mut();
            let mut creates = Vec::new();
            let mut matched = Vec::new();
            for pending in batch {
                let Pending::Full(remote) = pending else {
                    continue;
                };
                match state.local_match(&remote) {
                    Some(id) => {
                        state.unprocessed.remove(&id);
                        matched.push((id, remote));
                    }
                    None => creates.push(remote),
                }
            }
            state.stats.processed += creates.len() + matched.len();

            let deletions: Vec<LocalId> = if last && !state.deletions_issued {
                state.deletions_issued = true;
                std::mem::take(&mut state.unprocessed).into_iter().collect()
            } else {
                Vec::new()
            };
            (state.config.scope, creates, matched, deletions)
        };
        tracing::debug!(
            sync = %self.job.id(),
            creates = creates.len(),
            matched = matched.len(),
            deletions = deletions.len(),
            last,
            "applying batch"
        );

        if !matched.is_empty() {
            self.compare(transaction, scope, matched);
        }
        for remote in creates {
            self.track(create(transaction, scope, remote), |stats, _| {
                stats.created += 1
            });
        }
        if !deletions.is_empty() {
            let count = deletions.len();
            self.track(delete(transaction, deletions), move |stats, ()| {
                stats.deleted += count
            });
        }
    }

    /// Fetches matched entities and modifies those that differ.
    fn compare(
        &self,
        transaction: &TransactionSequence,
        scope: Scope,
        matched: Vec<(LocalId, RemoteEntity)>,
    ) {
        let ids: Vec<LocalId> = matched.iter().map(|(id, _)| *id).collect();
        let mut remotes: HashMap<LocalId, RemoteEntity> = matched.into_iter().collect();
        let check = Rc::clone(&self.state.borrow().update_check);
        let transaction = transaction.clone();

        let locals = fetch(&transaction, FetchJob::new(scope).ids(ids).cache_only());
        self.track_with(locals, move |engine, result| {
            let locals = match result {
                Ok(locals) => locals,
                Err(error) => {
                    engine.state.borrow_mut().record_error(error);
                    return;
                }
            };
            for local in locals {
                let Some(remote) = remotes.remove(&local.id) else {
                    continue;
                };
                if engine.state.borrow().error.is_some() {
                    return;
                }
                if check.needs_update(&local, &remote) {
                    let task = modify(&transaction, local.id, remote, Some(local.revision));
                    engine.track(task, |stats, ()| stats.modified += 1);
                } else {
                    engine.state.borrow_mut().stats.unchanged += 1;
                }
            }
        });
    }

    fn apply_incremental(&self, transaction: &TransactionSequence, batch: Vec<Pending>) {
        let mut changed = Vec::new();
        let mut removed = Vec::new();
        for pending in batch {
            match pending {
                Pending::Changed(remote) => changed.push(remote),
                Pending::Removed(remote) => removed.push(remote),
                Pending::Full(_) => {}
            }
        }

        let scope = {
            let mut state = self.state.borrow_mut();
            state.stats.processed += changed.len() + removed.len();
            state.config.scope
        };
        tracing::debug!(
            sync = %self.job.id(),
            changed = changed.len(),
            removed = removed.len(),
            "applying incremental batch"
        );

        let rids: Vec<Rid> = changed
            .iter()
            .chain(removed.iter())
            .filter_map(|remote| remote.effective_rid().cloned())
            .collect();
        let lookup_parent = transaction.clone();
        let lookups = task_collect_flat(rids, move |rid| {
            let lookup = FetchJob::new(scope).rids(vec![rid]).projection().cache_only();
            fetch(&lookup_parent.tolerant(), lookup).or_else(|error| {
                tracing::debug!(%error, "lookup failed");
                Task::ready(Vec::new())
            })
        });

        let transaction = transaction.clone();
        self.track_with(lookups, move |engine, result| {
            let found: HashMap<Rid, LocalId> = result
                .unwrap_or_default()
                .into_iter()
                .filter_map(|local| Some((local.rid?, local.id)))
                .collect();
            engine.apply_changes(&transaction, scope, changed, removed, &found);
        });
    }

    fn apply_changes(
        &self,
        transaction: &TransactionSequence,
        scope: Scope,
        changed: Vec<RemoteEntity>,
        removed: Vec<RemoteEntity>,
        found: &HashMap<Rid, LocalId>,
    ) {
        if self.state.borrow().error.is_some() {
            return;
        }
        let lookup = |remote: &RemoteEntity| {
            remote
                .effective_rid()
                .and_then(|rid| found.get(rid))
                .copied()
        };

        for remote in changed {
            match lookup(&remote) {
                Some(id) => {
                    self.track(modify(transaction, id, remote, None), |stats, ()| {
                        stats.modified += 1
                    });
                }
                None => {
                    self.track(create(transaction, scope, remote), |stats, _| {
                        stats.created += 1
                    });
                }
            }
        }

        let deletions: BTreeSet<LocalId> = removed.iter().filter_map(lookup).collect();
        if !deletions.is_empty() {
            let count = deletions.len();
            self.track(
                delete(transaction, deletions.into_iter().collect()),
                move |stats, ()| stats.deleted += count,
            );
        }
    }

    /// Counts `task` as an operation of the running batch.
    fn track<T, F>(&self, task: Task<T>, on_success: F)
    where
        T: 'static,
        F: FnOnce(&mut SyncStats, T) + 'static,
    {
        self.track_with(task, move |engine, result| {
            let mut state = engine.state.borrow_mut();
            match result {
                Ok(value) => on_success(&mut state.stats, value),
                Err(error) => state.record_error(error),
            }
        });
    }

    fn track_with<T, F>(&self, task: Task<T>, f: F)
    where
        T: 'static,
        F: FnOnce(&EntitySync, CoreResult<T>) + 'static,
    {
        self.state.borrow_mut().pending_ops += 1;
        let engine = self.clone();
        task.then_result(move |result| {
            f(&engine, result);
            engine.op_done();
        });
    }

    fn op_done(&self) {
        let drained = {
            let mut state = self.state.borrow_mut();
            state.pending_ops = state.pending_ops.saturating_sub(1);
            state.pending_ops == 0
        };
        if drained {
            self.batch_done();
        }
    }

    fn batch_done(&self) {
        let (commit, ready) = {
            let mut state = self.state.borrow_mut();
            state.processing = false;
            if state.finished {
                return;
            }
            let per_batch = state.config.transaction_mode != TransactionMode::Single;
            let commit = if state.error.is_none() && (per_batch || state.last_batch) {
                state.transaction.take()
            } else {
                None
            };
            let ready = (state.config.streaming && !state.delivery_done)
                .then(|| state.config.batch_size.saturating_sub(state.queue.len()));
            (commit, ready)
        };
        if self.job.is_finished() {
            return;
        }

        if let Some(transaction) = commit {
            transaction.commit();
        }
        if let Some(capacity) = ready {
            self.emit(SyncEvent::ReadyForNextBatch(capacity));
        }
        if !self.is_finished() {
            self.execute();
        }
    }

    fn check_done(&self) {
        let done = {
            let state = self.state.borrow();
            !state.finished
                && state.delivery_done
                && state.queue.is_empty()
                && !state.processing
                && state.listing != Listing::Running
                && state.transaction.is_none()
                && state.sequences.is_empty()
        };
        if done {
            self.finish();
        }
    }

    fn finish(&self) {
        let (error, stats) = {
            let mut state = self.state.borrow_mut();
            state.finished = true;
            (state.error.clone(), state.stats)
        };
        match error {
            Some(error) => {
                tracing::warn!(sync = %self.job.id(), %error, ?stats, "sync failed");
                self.job.set_error(error);
            }
            None => {
                tracing::info!(
                    sync = %self.job.id(),
                    processed = stats.processed,
                    created = stats.created,
                    modified = stats.modified,
                    deleted = stats.deleted,
                    "sync finished"
                );
            }
        }
        self.job.emit_result();
    }

    /// Settles the run's result once its job finished, however it ended.
    fn settle(&self, outcome: &CoreResult<()>) {
        let stats = {
            let mut state = self.state.borrow_mut();
            state.finished = true;
            state.subscribers.clear();
            state.stats
        };
        if !self.result.is_pending() {
            return;
        }
        match outcome {
            Ok(()) => self.result.set_result(stats),
            Err(error) => self.result.set_error(error.clone()),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let engine = self.clone();
        self.job
            .session()
            .event_loop()
            .post(move || engine.deliver(&event));
    }

    fn deliver(&self, event: &SyncEvent) {
        let mut subscribers = std::mem::take(&mut self.state.borrow_mut().subscribers);
        for subscriber in subscribers.iter_mut() {
            subscriber(event);
        }

        let mut state = self.state.borrow_mut();
        if state.finished {
            return;
        }
        subscribers.append(&mut state.subscribers);
        state.subscribers = subscribers;
    }
}

impl std::fmt::Debug for EntitySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("EntitySync")
            .field("job", &self.job)
            .field("queued", &state.queue.len())
            .field("delivery_done", &state.delivery_done)
            .field("stats", &state.stats)
            .field("finished", &state.finished)
            .finish()
    }
}

struct EngineHandler {
    state: Rc<RefCell<SyncState>>,
    result: Task<SyncStats>,
}

impl EngineHandler {
    fn engine(&self, job: &JobHandle) -> EntitySync {
        EntitySync {
            job: job.clone(),
            state: Rc::clone(&self.state),
            result: self.result.clone(),
        }
    }
}

impl JobHandler for EngineHandler {
    fn name(&self) -> &str {
        "entity-sync"
    }

    fn on_start(&mut self, job: &JobHandle) {
        self.state.borrow_mut().started = true;
        self.engine(job).execute();
    }

    fn on_subjob_result(&mut self, job: &JobHandle, subjob: &JobHandle, result: &CoreResult<()>) {
        let engine = self.engine(job);
        let sequence = self.state.borrow_mut().sequences.remove(&subjob.id());
        match (sequence, result) {
            (Some(true), Ok(())) => {
                tracing::debug!(sync = %job.id(), "transaction committed");
                engine.emit(SyncEvent::TransactionCommitted);
            }
            (_, Err(error)) => self.state.borrow_mut().record_error(error.clone()),
            _ => {}
        }
        if !engine.is_finished() {
            engine.execute();
        }
    }

    fn on_notify(&mut self, job: &JobHandle) {
        let engine = self.engine(job);
        if !engine.is_finished() {
            engine.execute();
        }
    }
}
