//! Transaction sequences.
//!
//! A [`TransactionSequence`] brackets its subjobs with begin and commit
//! pseudo-jobs. The first subjob added synthesizes the begin; once the
//! caller commits and the queue drains, the commit is issued. A subjob
//! failure kills the rest of the queue and issues a rollback instead.
//!
//! ```text
//! Idle -> Running -> WaitingForSubjobs -> Committing
//!            \               \
//!             +---------------+-> RollingBack
//! ```
//!
//! At most one begin and one commit or rollback is ever issued per
//! sequence.

use crate::job::{JobHandle, JobHandler, JobId, JobParent, KillMode};
use entisync_core::{CoreError, CoreResult, Task};
use entisync_protocol::{Command, Response, Tag};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// State of a transaction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No subjob was added yet.
    Idle,
    /// Subjobs are being added and run.
    Running,
    /// Committing once the queue drains.
    WaitingForSubjobs,
    /// The commit pseudo-job was issued.
    Committing,
    /// The rollback pseudo-job was issued.
    RollingBack,
}

/// Transaction pseudo-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOp {
    /// Opens the transaction.
    Begin,
    /// Commits it.
    Commit,
    /// Rolls it back.
    Rollback,
}

/// A pseudo-job issuing one transaction command.
#[derive(Debug)]
pub struct TransactionJob {
    op: TransactionOp,
}

impl TransactionJob {
    /// Creates a begin pseudo-job.
    pub fn begin() -> Self {
        Self {
            op: TransactionOp::Begin,
        }
    }

    /// Creates a commit pseudo-job.
    pub fn commit() -> Self {
        Self {
            op: TransactionOp::Commit,
        }
    }

    /// Creates a rollback pseudo-job.
    pub fn rollback() -> Self {
        Self {
            op: TransactionOp::Rollback,
        }
    }

    /// Returns the operation.
    pub fn op(&self) -> TransactionOp {
        self.op
    }
}

impl JobHandler for TransactionJob {
    fn name(&self) -> &str {
        match self.op {
            TransactionOp::Begin => "transaction-begin",
            TransactionOp::Commit => "transaction-commit",
            TransactionOp::Rollback => "transaction-rollback",
        }
    }

    fn on_start(&mut self, job: &JobHandle) {
        let command = match self.op {
            TransactionOp::Begin => Command::Begin,
            TransactionOp::Commit => Command::Commit,
            TransactionOp::Rollback => Command::Rollback,
        };
        job.send(command);
    }

    fn on_response(&mut self, job: &JobHandle, _tag: Tag, response: Response) -> bool {
        match response {
            Response::Entity(_) => false,
            Response::Ok { .. } => true,
            Response::No { message } => {
                job.set_error(CoreError::unknown(message));
                true
            }
        }
    }
}

struct SequenceState {
    state: TransactionState,
    auto_commit: bool,
    transactions_disabled: bool,
    ignored: HashSet<JobId>,
    /// Whether the begin pseudo-job was dispatched.
    begun: bool,
    commit_job: Option<JobId>,
    rollback_job: Option<JobId>,
}

/// A job bracketing its subjobs in one transaction.
///
/// Cloning yields another handle to the same sequence.
#[derive(Clone)]
pub struct TransactionSequence {
    job: JobHandle,
    shared: Rc<RefCell<SequenceState>>,
}

impl TransactionSequence {
    /// Creates a sequence under `parent`.
    pub fn new(parent: &dyn JobParent) -> CoreResult<Self> {
        let shared = Rc::new(RefCell::new(SequenceState {
            state: TransactionState::Idle,
            auto_commit: true,
            transactions_disabled: false,
            ignored: HashSet::new(),
            begun: false,
            commit_job: None,
            rollback_job: None,
        }));
        let job = parent.add_job(Box::new(SequenceHandler {
            shared: Rc::clone(&shared),
        }))?;
        Ok(Self { job, shared })
    }

    /// Returns the underlying job.
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// Returns the task that settles when the sequence finishes.
    pub fn result(&self) -> Task<()> {
        self.job.result()
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.shared.borrow().state
    }

    /// Enables or disables committing as soon as the sequence starts.
    ///
    /// Enabled by default. Callers adding subjobs after the sequence
    /// started must disable it and call [`commit`](Self::commit) once done.
    pub fn set_automatic_committing_enabled(&self, enabled: bool) {
        self.shared.borrow_mut().auto_commit = enabled;
    }

    /// Groups subjobs without issuing any transaction commands.
    pub fn set_transactions_disabled(&self, disabled: bool) {
        self.shared.borrow_mut().transactions_disabled = disabled;
    }

    /// Lets `job` fail without aborting the sequence.
    pub fn set_ignore_job_failure(&self, job: &JobHandle) {
        self.shared.borrow_mut().ignored.insert(job.id());
    }

    /// Returns a parent adapter adding subjobs whose failure is ignored.
    pub fn tolerant(&self) -> Tolerant<'_> {
        Tolerant { sequence: self }
    }

    /// Adds a subjob.
    ///
    /// The first subjob issues the begin pseudo-job ahead of it. Returns
    /// `None` once the sequence failed, committed or finished; subjobs are
    /// still accepted while rolling back.
    pub fn add_subjob<H: JobHandler>(&self, handler: H) -> Option<JobHandle> {
        self.add_boxed(Box::new(handler))
    }

    fn add_boxed(&self, handler: Box<dyn JobHandler>) -> Option<JobHandle> {
        if self.job.is_finished() {
            return None;
        }
        let state = self.shared.borrow().state;
        let begin = match state {
            TransactionState::RollingBack => return Some(self.job.add_subjob_boxed(handler)),
            TransactionState::Committing => return None,
            _ if self.job.error().is_some() => return None,
            TransactionState::Idle => {
                let mut shared = self.shared.borrow_mut();
                shared.state = TransactionState::Running;
                !shared.transactions_disabled
            }
            TransactionState::Running | TransactionState::WaitingForSubjobs => false,
        };

        if begin {
            tracing::debug!(sequence = %self.job.id(), "transaction begin");
            let begin = self.job.add_subjob(TransactionJob::begin());
            let shared = Rc::clone(&self.shared);
            begin.on_started(move || shared.borrow_mut().begun = true);
        }
        Some(self.job.add_subjob_boxed(handler))
    }

    /// Commits once every queued subjob has finished.
    ///
    /// Rolls back instead if a subjob failed. A sequence that never had a
    /// subjob finishes right away without any transaction.
    pub fn commit(&self) {
        if self.job.is_finished() {
            return;
        }
        let state = self.shared.borrow().state;
        match state {
            TransactionState::Running => {
                self.shared.borrow_mut().state = TransactionState::WaitingForSubjobs;
                self.finish_when_drained();
            }
            TransactionState::Idle => {
                if !self.job.has_subjobs() {
                    self.job.emit_result();
                }
            }
            _ => {}
        }
    }

    /// Aborts the sequence with [`CoreError::UserCanceled`].
    ///
    /// Kills every queued subjob except the current one and issues the
    /// rollback pseudo-job. A sequence that never started finishes right
    /// away.
    pub fn rollback(&self) {
        if self.job.is_finished() {
            return;
        }
        let state = self.shared.borrow().state;
        match state {
            TransactionState::RollingBack | TransactionState::Committing => return,
            TransactionState::Idle => {
                self.job.set_error(CoreError::UserCanceled);
                self.job.emit_result();
                return;
            }
            TransactionState::Running | TransactionState::WaitingForSubjobs => {}
        }

        self.job.set_error(CoreError::UserCanceled);
        let current = self.job.current_subjob();
        for subjob in self.job.subjobs() {
            if Some(&subjob) != current.as_ref() {
                subjob.kill(KillMode::Quietly);
            }
        }
        self.start_rollback();
    }

    fn start_rollback(&self) {
        let opened = {
            let mut shared = self.shared.borrow_mut();
            shared.state = TransactionState::RollingBack;
            shared.begun && !shared.transactions_disabled
        };
        if !opened {
            if !self.job.has_subjobs() {
                self.job.emit_result();
            }
            return;
        }

        tracing::debug!(sequence = %self.job.id(), "transaction rollback");
        let rollback = self.job.add_subjob(TransactionJob::rollback());
        self.shared.borrow_mut().rollback_job = Some(rollback.id());
    }

    /// Issues the terminal pseudo-job once the queue drained.
    fn finish_when_drained(&self) {
        if self.job.has_subjobs() {
            return;
        }
        let (state, disabled, rolling_back_silently) = {
            let shared = self.shared.borrow();
            (
                shared.state,
                shared.transactions_disabled,
                shared.rollback_job.is_none(),
            )
        };
        match state {
            TransactionState::WaitingForSubjobs => {}
            TransactionState::RollingBack if rolling_back_silently => {
                self.job.emit_result();
                return;
            }
            _ => return,
        }

        if disabled {
            self.shared.borrow_mut().state = TransactionState::Committing;
            self.job.emit_result();
        } else if self.job.error().is_none() {
            tracing::debug!(sequence = %self.job.id(), "transaction commit");
            self.shared.borrow_mut().state = TransactionState::Committing;
            let commit = self.job.add_subjob(TransactionJob::commit());
            self.shared.borrow_mut().commit_job = Some(commit.id());
        } else {
            self.start_rollback();
        }
    }
}

impl JobParent for TransactionSequence {
    fn add_job(&self, handler: Box<dyn JobHandler>) -> CoreResult<JobHandle> {
        self.add_boxed(handler)
            .ok_or_else(|| self.job.error().unwrap_or(CoreError::UserCanceled))
    }
}

impl std::fmt::Debug for TransactionSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSequence")
            .field("job", &self.job)
            .field("state", &self.state())
            .finish()
    }
}

/// Adds subjobs to a sequence with their failures ignored.
#[derive(Debug, Clone, Copy)]
pub struct Tolerant<'a> {
    sequence: &'a TransactionSequence,
}

impl JobParent for Tolerant<'_> {
    fn add_job(&self, handler: Box<dyn JobHandler>) -> CoreResult<JobHandle> {
        let job = self.sequence.add_job(handler)?;
        self.sequence.set_ignore_job_failure(&job);
        Ok(job)
    }
}

struct SequenceHandler {
    shared: Rc<RefCell<SequenceState>>,
}

impl SequenceHandler {
    fn sequence(&self, job: &JobHandle) -> TransactionSequence {
        TransactionSequence {
            job: job.clone(),
            shared: Rc::clone(&self.shared),
        }
    }
}

impl JobHandler for SequenceHandler {
    fn name(&self) -> &str {
        "transaction-sequence"
    }

    fn on_start(&mut self, job: &JobHandle) {
        let (auto_commit, state) = {
            let shared = self.shared.borrow();
            (shared.auto_commit, shared.state)
        };
        if !auto_commit {
            return;
        }
        if state == TransactionState::Idle {
            job.emit_result();
        } else {
            self.sequence(job).commit();
        }
    }

    fn on_subjob_result(&mut self, job: &JobHandle, subjob: &JobHandle, result: &CoreResult<()>) {
        let sequence = self.sequence(job);
        let (is_commit, is_rollback, ignored, state) = {
            let shared = self.shared.borrow();
            (
                shared.commit_job == Some(subjob.id()),
                shared.rollback_job == Some(subjob.id()),
                shared.ignored.contains(&subjob.id()),
                shared.state,
            )
        };

        if is_commit {
            if let Err(e) = result {
                job.set_error(e.clone());
            }
            job.emit_result();
            return;
        }
        if is_rollback {
            if let Err(e) = result {
                tracing::warn!(sequence = %job.id(), error = %e, "rollback failed");
                if job.error().is_none() {
                    job.set_error(e.clone());
                }
            }
            job.emit_result();
            return;
        }

        let error = match result {
            Ok(()) => None,
            Err(e) if ignored => {
                tracing::debug!(sequence = %job.id(), subjob = %subjob.id(), error = %e, "ignoring subjob failure");
                None
            }
            Err(e) => Some(e.clone()),
        };
        let Some(error) = error else {
            sequence.finish_when_drained();
            return;
        };

        if state == TransactionState::RollingBack {
            sequence.finish_when_drained();
            return;
        }
        if job.error().is_none() {
            job.set_error(error);
        }
        for pending in job.subjobs() {
            pending.kill(KillMode::Quietly);
        }
        if matches!(
            state,
            TransactionState::Running | TransactionState::WaitingForSubjobs
        ) {
            sequence.start_rollback();
        } else {
            job.emit_result();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandJob;
    use crate::config::SessionConfig;
    use crate::connection::Connection;
    use crate::session::Session;
    use entisync_core::EventLoop;
    use entisync_protocol::{Inbound, PROTOCOL_VERSION};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    type Log = Rc<RefCell<Vec<&'static str>>>;

    /// Answers every command with `Ok`, except `select_resource`.
    struct Scripted {
        log: Log,
        inbound: Option<UnboundedSender<Inbound>>,
    }

    impl Connection for Scripted {
        fn open(&mut self) -> CoreResult<UnboundedReceiver<Inbound>> {
            let (sender, receiver) = unbounded_channel();
            sender
                .send(Inbound::Hello {
                    protocol_version: PROTOCOL_VERSION,
                    server: "scripted".to_string(),
                })
                .map_err(|e| CoreError::connection_failed(e.to_string()))?;
            self.inbound = Some(sender);
            Ok(receiver)
        }

        fn send(&mut self, tag: Tag, command: &Command) -> CoreResult<()> {
            let Some(inbound) = self.inbound.as_ref() else {
                return Err(CoreError::connection_failed("not connected"));
            };
            self.log.borrow_mut().push(command.name());
            let response = match command {
                Command::SelectResource { .. } => Response::no("rejected"),
                _ => Response::ok(),
            };
            inbound
                .send(Inbound::Response { tag, response })
                .map_err(|e| CoreError::connection_failed(e.to_string()))
        }

        fn close(&mut self) {
            self.inbound = None;
        }
    }

    fn session() -> (EventLoop, Session, Log) {
        let event_loop = EventLoop::new().unwrap();
        let log = Log::default();
        let connection = Scripted {
            log: Rc::clone(&log),
            inbound: None,
        };
        let session = Session::new(&event_loop, connection, SessionConfig::new("test"));
        (event_loop, session, log)
    }

    fn count(log: &Log, names: &[&str]) -> usize {
        log.borrow().iter().filter(|name| names.contains(name)).count()
    }

    fn select(name: &str) -> CommandJob {
        CommandJob::new(Command::SelectResource {
            name: name.to_string(),
        })
    }

    #[test]
    fn test_idle_rollback_issues_no_commands() {
        let (event_loop, session, log) = session();
        let sequence = TransactionSequence::new(&session).unwrap();
        sequence.rollback();
        sequence.rollback();

        assert_eq!(
            sequence.result().wait(&event_loop),
            Err(CoreError::UserCanceled)
        );
        assert!(sequence.add_subjob(select("late")).is_none());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_failed_sequence_refuses_subjobs() {
        let (event_loop, session, log) = session();
        let sequence = TransactionSequence::new(&session).unwrap();
        sequence.set_automatic_committing_enabled(false);
        let failing = sequence.add_subjob(select("first")).unwrap();
        let skipped = sequence.add_subjob(select("second")).unwrap();

        assert_eq!(
            sequence.result().wait(&event_loop),
            Err(CoreError::unknown("rejected"))
        );
        assert_eq!(
            failing.result().wait(&event_loop),
            Err(CoreError::unknown("rejected"))
        );
        assert_eq!(skipped.result().wait(&event_loop), Err(CoreError::UserCanceled));

        assert!(sequence.add_subjob(select("third")).is_none());
        sequence.commit();
        sequence.rollback();
        assert_eq!(sequence.state(), TransactionState::RollingBack);
        assert_eq!(*log.borrow(), vec!["begin", "select_resource", "rollback"]);
        assert_eq!(count(&log, &["begin"]), 1);
        assert_eq!(count(&log, &["commit", "rollback"]), 1);
    }

    #[test]
    fn test_pseudo_job_names() {
        assert_eq!(TransactionJob::begin().name(), "transaction-begin");
        assert_eq!(TransactionJob::commit().name(), "transaction-commit");
        assert_eq!(TransactionJob::rollback().name(), "transaction-rollback");
        assert_eq!(TransactionJob::rollback().op(), TransactionOp::Rollback);
    }
}
