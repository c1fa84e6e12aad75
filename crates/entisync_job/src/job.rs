//! Job trees.
//!
//! A job is a node in a tree owned by its [`Session`]. The node's behavior
//! lives in a [`JobHandler`]; callers and handlers manipulate the node
//! through a [`JobHandle`].
//!
//! Lifecycle of a node:
//!
//! ```text
//! queued -> started -> (reading finished) -> finishing -> finished
//!    \__________________ kill ___________________/
//! ```
//!
//! - A top-level job starts when it reaches the front of the session's
//!   queue; a subjob starts when it reaches the front of its parent's queue
//!   and the parent has started. One sibling is current at a time.
//! - When `on_response` reports completion, the result is emitted on a
//!   later tick and only once the job has no subjobs left.
//! - Finishing settles the job's result task, discards any remaining
//!   subjobs and hands the result to the parent's `on_subjob_result`.

use crate::session::Session;
use entisync_core::{CoreError, CoreResult, Task};
use entisync_protocol::{Command, Response, Tag};
use std::collections::VecDeque;
use std::fmt;

/// Identifier of a job, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// How [`JobHandle::kill`] reports the killed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// The parent is not told about the killed job.
    Quietly,
    /// The parent receives the job's [`CoreError::UserCanceled`] result.
    EmitResult,
}

/// Behavior of one job.
///
/// All callbacks are delivered from the event loop. A handler is never
/// called while another of its callbacks is running.
pub trait JobHandler: 'static {
    /// Short name used in log records.
    fn name(&self) -> &str {
        "job"
    }

    /// Called once when the job starts.
    fn on_start(&mut self, job: &JobHandle);

    /// Called for each response carrying the job's tag.
    ///
    /// Returns true once the job has received everything it waits for; the
    /// result is then emitted as soon as no subjobs are left.
    fn on_response(&mut self, job: &JobHandle, tag: Tag, response: Response) -> bool {
        tracing::warn!(job = %job.name(), %tag, ?response, "unhandled response");
        false
    }

    /// Called when a subjob finished.
    ///
    /// The subjob is already removed from the queue. The default adopts the
    /// first error and finishes the job; on success the next subjob starts.
    fn on_subjob_result(&mut self, job: &JobHandle, _subjob: &JobHandle, result: &CoreResult<()>) {
        if let Err(e) = result {
            if job.error().is_none() {
                job.set_error(e.clone());
            }
            job.emit_result();
        }
    }

    /// Called right before the result is emitted.
    fn on_about_to_finish(&mut self, _job: &JobHandle) {}

    /// Called on a later tick after [`JobHandle::notify`].
    fn on_notify(&mut self, _job: &JobHandle) {}
}

pub(crate) struct JobNode {
    name: String,
    /// Taken out while one of its callbacks runs.
    handler: Option<Box<dyn JobHandler>>,
    parent: Option<JobId>,
    /// Queued subjobs; the current one stays at the front until it
    /// finishes.
    subjobs: VecDeque<JobId>,
    pub(crate) current: Option<JobId>,
    pub(crate) tag: Option<Tag>,
    error: Option<CoreError>,
    started: bool,
    pub(crate) reading_finished: bool,
    finish_pending: bool,
    pub(crate) finishing: bool,
    quiet: bool,
    pub(crate) result: Task<()>,
    start_observers: Vec<Box<dyn FnOnce()>>,
}

/// Handle to a job in a session's job tree.
///
/// Handles are cheap to clone. Operations on a finished job are no-ops;
/// [`result`](JobHandle::result) keeps working after the job is gone.
#[derive(Clone)]
pub struct JobHandle {
    session: Session,
    id: JobId,
    result: Task<()>,
}

impl JobHandle {
    pub(crate) fn from_parts(session: Session, id: JobId, result: Task<()>) -> Self {
        Self {
            session,
            id,
            result,
        }
    }

    /// Spawns a top-level job on `session`.
    ///
    /// The job starts once every job spawned before it has finished.
    pub fn spawn<H: JobHandler>(session: &Session, handler: H) -> JobHandle {
        Self::spawn_boxed(session, Box::new(handler))
    }

    /// Spawns a boxed top-level job.
    pub fn spawn_boxed(session: &Session, handler: Box<dyn JobHandler>) -> JobHandle {
        let job = Self::create(session, None, handler);
        session.enqueue(job.id);
        job
    }

    /// Adds a subjob.
    ///
    /// Subjobs start one at a time, in the order they were added, once this
    /// job has started. Adding to a finished job yields a subjob that fails
    /// with [`CoreError::UserCanceled`] without starting.
    pub fn add_subjob<H: JobHandler>(&self, handler: H) -> JobHandle {
        self.add_subjob_boxed(Box::new(handler))
    }

    /// Adds a boxed subjob.
    pub fn add_subjob_boxed(&self, handler: Box<dyn JobHandler>) -> JobHandle {
        let subjob = Self::create(&self.session, Some(self.id), handler);
        let accepted = {
            let mut state = self.session.inner.state.borrow_mut();
            match state.jobs.get_mut(&self.id) {
                Some(node) if !node.finishing => {
                    node.subjobs.push_back(subjob.id);
                    true
                }
                _ => false,
            }
        };

        if accepted {
            let parent = self.clone();
            self.session.post(move || parent.start_next());
        } else {
            subjob.set_error(CoreError::UserCanceled);
            subjob.emit_result();
        }
        subjob
    }

    fn create(session: &Session, parent: Option<JobId>, handler: Box<dyn JobHandler>) -> JobHandle {
        let id = session.next_job_id();
        let result = Task::new();
        let node = JobNode {
            name: handler.name().to_string(),
            handler: Some(handler),
            parent,
            subjobs: VecDeque::new(),
            current: None,
            tag: None,
            error: None,
            started: false,
            reading_finished: false,
            finish_pending: false,
            finishing: false,
            quiet: false,
            result: result.clone(),
            start_observers: Vec::new(),
        };
        tracing::trace!(session = %session.name(), job = %node.name, %id, "job created");
        session.inner.state.borrow_mut().jobs.insert(id, node);
        JobHandle::from_parts(session.clone(), id, result)
    }

    /// Returns the job identifier.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Returns the session the job belongs to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the handler's name, or an empty string once finished.
    pub fn name(&self) -> String {
        self.with_node(|node| node.name.clone()).unwrap_or_default()
    }

    /// Returns the parent job, if this is a live subjob.
    pub fn parent(&self) -> Option<JobHandle> {
        let parent = self.with_node(|node| node.parent)??;
        self.session.handle(parent)
    }

    /// Allocates a fresh correlation tag for this job.
    ///
    /// Responses carrying the tag are routed to this job while it is on the
    /// current chain.
    pub fn new_tag(&self) -> Tag {
        let tag = self.session.next_tag();
        self.with_node_mut(|node| node.tag = Some(tag));
        tag
    }

    /// Writes `command` under a fresh tag and returns the tag.
    pub fn send(&self, command: Command) -> Tag {
        let tag = self.new_tag();
        self.send_tagged(tag, command);
        tag
    }

    /// Writes `command` under a tag previously returned by
    /// [`new_tag`](JobHandle::new_tag).
    pub fn send_tagged(&self, tag: Tag, command: Command) {
        if !self.is_current() {
            tracing::warn!(
                session = %self.session.name(),
                job = %self.name(),
                command = command.name(),
                "writing from a job that is not current"
            );
        }
        self.session.write(tag, command);
    }

    /// Sets the job's error. The last call wins.
    pub fn set_error(&self, error: CoreError) {
        self.with_node_mut(|node| node.error = Some(error));
    }

    /// Returns the job's error.
    ///
    /// After the job finished, this is the error it finished with.
    pub fn error(&self) -> Option<CoreError> {
        match self.with_node(|node| node.error.clone()) {
            Some(error) => error,
            None => self.result.error(),
        }
    }

    /// Returns true once the job started.
    pub fn is_started(&self) -> bool {
        self.with_node(|node| node.started).unwrap_or(true)
    }

    /// Returns true once the job is finishing or finished.
    pub fn is_finished(&self) -> bool {
        self.with_node(|node| node.finishing).unwrap_or(true)
    }

    /// Returns true while subjobs are queued or running.
    pub fn has_subjobs(&self) -> bool {
        self.with_node(|node| !node.subjobs.is_empty())
            .unwrap_or(false)
    }

    /// Returns the queued subjobs, the current one first.
    pub fn subjobs(&self) -> Vec<JobHandle> {
        let ids: Vec<JobId> = self
            .with_node(|node| node.subjobs.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.session.handle(id))
            .collect()
    }

    /// Returns the subjob currently running.
    pub fn current_subjob(&self) -> Option<JobHandle> {
        let id = self.with_node(|node| node.current)??;
        self.session.handle(id)
    }

    /// Returns the task that settles when the job finishes.
    ///
    /// The task carries a single value consumer; attach further watchers
    /// with [`Task::on_settled`].
    pub fn result(&self) -> Task<()> {
        self.result.clone()
    }

    /// Registers `f` to run when the job starts.
    ///
    /// Runs immediately if the job already started.
    pub fn on_started<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        let mut f = Some(f);
        self.with_node_mut(|node| {
            if !node.started {
                if let Some(f) = f.take() {
                    node.start_observers.push(Box::new(f));
                }
            }
        });
        if let Some(f) = f {
            f();
        }
    }

    /// Schedules the handler's `on_notify` on a later tick.
    pub fn notify(&self) {
        let job = self.clone();
        self.session.post(move || {
            if !job.is_finished() {
                job.with_handler(|handler, job| handler.on_notify(job));
            }
        });
    }

    /// Finishes the job on a later tick.
    ///
    /// Calling it on a finishing job does nothing.
    pub fn emit_result(&self) {
        let scheduled = self
            .with_node_mut(|node| {
                if node.finishing {
                    false
                } else {
                    node.finishing = true;
                    true
                }
            })
            .unwrap_or(false);
        if scheduled {
            let job = self.clone();
            self.session.post(move || job.finalize());
        }
    }

    /// Kills the job.
    ///
    /// A queued job is removed from its queue. Killing a started job closes
    /// the session's connection, so the job's outstanding requests cannot
    /// reach a later job; the deepest job still current then fails with
    /// [`CoreError::ConnectionFailed`]. Either way the job's result settles
    /// with [`CoreError::UserCanceled`].
    ///
    /// Returns false if the job already finished.
    pub fn kill(&self, mode: KillMode) -> bool {
        let killed = self.with_node_mut(|node| {
            if node.finishing {
                return None;
            }
            node.finishing = true;
            node.quiet = mode == KillMode::Quietly;
            node.error = Some(CoreError::UserCanceled);
            Some((node.started, node.parent))
        });
        let Some(Some((started, parent))) = killed else {
            return false;
        };
        tracing::debug!(session = %self.session.name(), job = %self.name(), ?mode, "killing job");

        if !started {
            let mut state = self.session.inner.state.borrow_mut();
            match parent {
                Some(parent) => {
                    if let Some(parent) = state.jobs.get_mut(&parent) {
                        parent.subjobs.retain(|id| *id != self.id);
                    }
                }
                None => state.queue.retain(|id| *id != self.id),
            }
        }

        let job = self.clone();
        self.session.post(move || job.finalize());
        if started {
            self.session.force_reconnect();
        }
        true
    }

    fn is_current(&self) -> bool {
        let state = self.session.inner.state.borrow();
        crate::session::current_chain(&state).contains(&self.id)
    }

    fn with_node<R>(&self, f: impl FnOnce(&JobNode) -> R) -> Option<R> {
        let state = self.session.inner.state.borrow();
        state.jobs.get(&self.id).map(f)
    }

    fn with_node_mut<R>(&self, f: impl FnOnce(&mut JobNode) -> R) -> Option<R> {
        let mut state = self.session.inner.state.borrow_mut();
        state.jobs.get_mut(&self.id).map(f)
    }

    /// Runs `f` with the job's handler taken out of the node.
    fn with_handler<R>(&self, f: impl FnOnce(&mut dyn JobHandler, &JobHandle) -> R) -> Option<R> {
        let handler = self.with_node_mut(|node| node.handler.take()).flatten();
        let Some(mut handler) = handler else {
            tracing::trace!(job = %self.id, "handler unavailable");
            return None;
        };
        let result = f(handler.as_mut(), self);
        self.with_node_mut(|node| node.handler = Some(handler));
        Some(result)
    }

    pub(crate) fn start(&self) {
        let observers = self.with_node_mut(|node| {
            node.started = true;
            std::mem::take(&mut node.start_observers)
        });
        let Some(observers) = observers else {
            return;
        };
        tracing::debug!(session = %self.session.name(), job = %self.name(), id = %self.id, "job started");

        for observer in observers {
            observer();
        }
        self.with_handler(|handler, job| handler.on_start(job));

        let job = self.clone();
        self.session.post(move || job.start_next());
    }

    /// Starts the first queued subjob unless one is current.
    fn start_next(&self) {
        let next = self
            .with_node_mut(|node| {
                if !node.started || node.finishing || node.current.is_some() {
                    return None;
                }
                let next = *node.subjobs.front()?;
                node.current = Some(next);
                Some(next)
            })
            .flatten();
        if let Some(subjob) = next.and_then(|id| self.session.handle(id)) {
            subjob.start();
        }
    }

    pub(crate) fn deliver(&self, tag: Tag, response: Response) {
        let finished = self
            .with_handler(|handler, job| handler.on_response(job, tag, response))
            .unwrap_or(false);
        if !finished {
            return;
        }

        self.with_node_mut(|node| node.reading_finished = true);
        let job = self.clone();
        self.session.post(move || job.emit_when_idle());
    }

    fn emit_when_idle(&self) {
        let ready = self
            .with_node_mut(|node| {
                if node.finishing {
                    return false;
                }
                if node.subjobs.is_empty() {
                    true
                } else {
                    node.finish_pending = true;
                    false
                }
            })
            .unwrap_or(false);
        if ready {
            self.emit_result();
        }
    }

    fn finalize(&self) {
        if !self.with_node(|node| node.quiet).unwrap_or(true) {
            self.with_handler(|handler, job| handler.on_about_to_finish(job));
        }

        let (node, discarded) = {
            let mut state = self.session.inner.state.borrow_mut();
            let Some(node) = state.jobs.remove(&self.id) else {
                return;
            };
            match node.parent {
                Some(parent) => {
                    if let Some(parent) = state.jobs.get_mut(&parent) {
                        parent.subjobs.retain(|id| *id != self.id);
                        if parent.current == Some(self.id) {
                            parent.current = None;
                        }
                    }
                }
                None => {
                    state.queue.retain(|id| *id != self.id);
                    if state.current == Some(self.id) {
                        state.current = None;
                    }
                }
            }

            let mut discarded = Vec::new();
            let mut pending: Vec<JobId> = node.subjobs.iter().copied().collect();
            while let Some(id) = pending.pop() {
                if let Some(subjob) = state.jobs.remove(&id) {
                    pending.extend(subjob.subjobs.iter().copied());
                    if !subjob.result.is_pending() {
                        continue;
                    }
                    discarded.push(subjob.result);
                }
            }
            (node, discarded)
        };

        let outcome = match &node.error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        match &outcome {
            Ok(()) => {
                tracing::debug!(session = %self.session.name(), job = %node.name, id = %self.id, "job finished");
            }
            Err(error) => {
                tracing::debug!(session = %self.session.name(), job = %node.name, id = %self.id, %error, "job failed");
            }
        }

        let discard_error = node.error.clone().unwrap_or(CoreError::UserCanceled);
        for result in discarded {
            result.set_error(discard_error.clone());
        }
        node.result.settle(outcome.clone());

        match node.parent {
            Some(parent) => {
                let Some(parent) = self.session.handle(parent) else {
                    return;
                };
                let subjob = self.clone();
                let notify = !node.quiet;
                self.session
                    .post(move || parent.subjob_finished(&subjob, &outcome, notify));
            }
            None => self.session.schedule_dispatch(),
        }
    }

    fn subjob_finished(&self, subjob: &JobHandle, outcome: &CoreResult<()>, notify: bool) {
        if self.is_finished() {
            return;
        }
        if notify {
            self.with_handler(|handler, job| handler.on_subjob_result(job, subjob, outcome));
        }
        if self.is_finished() {
            return;
        }

        self.start_next();
        let idle = self
            .with_node(|node| node.finish_pending && node.subjobs.is_empty())
            .unwrap_or(false);
        if idle {
            self.emit_result();
        }
    }
}

impl PartialEq for JobHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.session.is_same(&other.session)
    }
}

impl Eq for JobHandle {}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("result", &self.result)
            .finish()
    }
}

/// Something jobs can be added to.
pub trait JobParent {
    /// Adds a job. Fails when the parent refuses new work.
    fn add_job(&self, handler: Box<dyn JobHandler>) -> CoreResult<JobHandle>;
}

impl JobParent for Session {
    fn add_job(&self, handler: Box<dyn JobHandler>) -> CoreResult<JobHandle> {
        Ok(JobHandle::spawn_boxed(self, handler))
    }
}

impl JobParent for JobHandle {
    fn add_job(&self, handler: Box<dyn JobHandler>) -> CoreResult<JobHandle> {
        Ok(self.add_subjob_boxed(handler))
    }
}

impl Session {
    pub(crate) fn start_job(&self, id: JobId) {
        if let Some(job) = self.handle(id) {
            job.start();
        }
    }

    pub(crate) fn deliver(&self, id: JobId, tag: Tag, response: Response) {
        if let Some(job) = self.handle(id) {
            job.deliver(tag, response);
        }
    }
}
