//! Sessions: connection ownership, tag allocation and response routing.

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::job::{JobHandle, JobId, JobNode};
use entisync_core::{CoreError, EventLoop};
use entisync_protocol::{Command, Inbound, Response, Tag, TagAllocator};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// State of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    /// Opened, waiting for the greeting.
    Connecting,
    Connected,
}

pub(crate) struct SessionState {
    pub(crate) jobs: HashMap<JobId, JobNode>,
    next_job_id: u64,
    /// Top-level jobs in dispatch order. The current one stays at the
    /// front until it finishes.
    pub(crate) queue: VecDeque<JobId>,
    pub(crate) current: Option<JobId>,
    tags: TagAllocator,
    link: LinkState,
    /// Bumped on every open and close; inbound events from an older
    /// generation are ignored.
    generation: u64,
    /// Commands written before the greeting arrived.
    outbox: Vec<(Tag, Command)>,
    fatal: Option<CoreError>,
    dispatch_scheduled: bool,
}

pub(crate) struct SessionInner {
    id: Uuid,
    config: SessionConfig,
    event_loop: EventLoop,
    pub(crate) state: RefCell<SessionState>,
    connection: RefCell<Box<dyn Connection>>,
}

/// Owns one logical connection to the store.
///
/// A session allocates correlation tags, dispatches top-level jobs in FIFO
/// order (exactly one is current at a time) and routes every response to
/// the job allowed to receive it.
///
/// The connection is opened lazily when the first command is written.
/// Losing it fails the deepest current job with
/// [`CoreError::ConnectionFailed`]; the session reconnects when the next
/// command is written. A greeting announcing a different protocol version
/// is fatal: every job fails with [`CoreError::ProtocolVersionMismatch`]
/// and so does every job spawned afterwards.
///
/// Cloning a `Session` yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Rc<SessionInner>,
}

impl Session {
    /// Creates a session over `connection`.
    pub fn new<C>(event_loop: &EventLoop, connection: C, config: SessionConfig) -> Self
    where
        C: Connection + 'static,
    {
        let id = Uuid::new_v4();
        tracing::debug!(session = %config.name, %id, "session created");
        Self {
            inner: Rc::new(SessionInner {
                id,
                config,
                event_loop: event_loop.clone(),
                state: RefCell::new(SessionState {
                    jobs: HashMap::new(),
                    next_job_id: 1,
                    queue: VecDeque::new(),
                    current: None,
                    tags: TagAllocator::new(),
                    link: LinkState::Disconnected,
                    generation: 0,
                    outbox: Vec::new(),
                    fatal: None,
                    dispatch_scheduled: false,
                }),
                connection: RefCell::new(Box::new(connection)),
            }),
        }
    }

    /// Returns the unique session identifier.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the session name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Returns the event loop the session runs on.
    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.event_loop
    }

    /// Returns true once the store's greeting was accepted on the open
    /// connection.
    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().link == LinkState::Connected
    }

    /// Returns the number of top-level jobs not yet finished, the current
    /// one included.
    pub fn jobs_pending(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    /// Returns the current top-level job.
    pub fn current_job(&self) -> Option<JobHandle> {
        let id = self.inner.state.borrow().current?;
        self.handle(id)
    }

    /// Closes the connection.
    ///
    /// The deepest current job fails with [`CoreError::ConnectionFailed`];
    /// the next command written reconnects.
    pub fn force_reconnect(&self) {
        self.lose_connection(None, "reconnect forced");
    }

    pub(crate) fn post<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.event_loop.post(f);
    }

    pub(crate) fn next_job_id(&self) -> JobId {
        let mut state = self.inner.state.borrow_mut();
        let id = JobId(state.next_job_id);
        state.next_job_id += 1;
        id
    }

    pub(crate) fn next_tag(&self) -> Tag {
        self.inner.state.borrow_mut().tags.next_tag()
    }

    pub(crate) fn handle(&self, id: JobId) -> Option<JobHandle> {
        let state = self.inner.state.borrow();
        let node = state.jobs.get(&id)?;
        Some(JobHandle::from_parts(self.clone(), id, node.result.clone()))
    }

    pub(crate) fn is_same(&self, other: &Session) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends a top-level job to the dispatch queue.
    pub(crate) fn enqueue(&self, id: JobId) {
        self.inner.state.borrow_mut().queue.push_back(id);
        self.schedule_dispatch();
    }

    pub(crate) fn schedule_dispatch(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.dispatch_scheduled {
                return;
            }
            state.dispatch_scheduled = true;
        }
        let session = self.clone();
        self.post(move || session.dispatch());
    }

    fn dispatch(&self) {
        let (next, fatal) = {
            let mut state = self.inner.state.borrow_mut();
            state.dispatch_scheduled = false;
            if state.current.is_some() {
                return;
            }
            let Some(&next) = state.queue.front() else {
                return;
            };
            state.current = Some(next);
            (next, state.fatal.clone())
        };

        let Some(job) = self.handle(next) else {
            return;
        };
        match fatal {
            Some(error) => {
                job.set_error(error);
                job.emit_result();
            }
            None => self.start_job(next),
        }
    }

    /// Writes a tagged command, opening the connection first if needed.
    pub(crate) fn write(&self, tag: Tag, command: Command) {
        let (link, fatal) = {
            let state = self.inner.state.borrow();
            (state.link, state.fatal.clone())
        };
        if let Some(error) = fatal {
            let session = self.clone();
            self.post(move || session.fail_deepest(error));
            return;
        }

        tracing::trace!(session = %self.name(), %tag, command = command.name(), "write");
        match link {
            LinkState::Connected => {
                let sent = self.inner.connection.borrow_mut().send(tag, &command);
                if let Err(e) = sent {
                    self.lose_connection(None, &e.text());
                }
            }
            LinkState::Connecting => {
                self.inner.state.borrow_mut().outbox.push((tag, command));
            }
            LinkState::Disconnected => {
                self.inner.state.borrow_mut().outbox.push((tag, command));
                self.connect();
            }
        }
    }

    fn connect(&self) {
        let generation = {
            let mut state = self.inner.state.borrow_mut();
            state.link = LinkState::Connecting;
            state.generation += 1;
            state.generation
        };
        tracing::debug!(session = %self.name(), generation, "connecting");

        let opened = self.inner.connection.borrow_mut().open();
        match opened {
            Ok(inbound) => self.spawn_reader(generation, inbound),
            Err(e) => {
                tracing::warn!(session = %self.name(), error = %e, "cannot connect");
                {
                    let mut state = self.inner.state.borrow_mut();
                    state.link = LinkState::Disconnected;
                    state.outbox.clear();
                }
                let session = self.clone();
                let error = match e {
                    CoreError::ConnectionFailed(_) => e,
                    other => CoreError::connection_failed(other.text()),
                };
                self.post(move || session.fail_deepest(error));
            }
        }
    }

    fn spawn_reader(&self, generation: u64, mut inbound: UnboundedReceiver<Inbound>) {
        let weak: Weak<SessionInner> = Rc::downgrade(&self.inner);
        self.inner.event_loop.spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !(Session { inner }).handle_inbound(generation, message) {
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                (Session { inner }).lose_connection(Some(generation), "connection closed by peer");
            }
        });
    }

    /// Processes one inbound event. Returns false once the reader should
    /// stop.
    fn handle_inbound(&self, generation: u64, message: Inbound) -> bool {
        if self.inner.state.borrow().generation != generation {
            return false;
        }
        match message {
            Inbound::Hello {
                protocol_version,
                server,
            } => {
                self.on_hello(protocol_version, &server);
                true
            }
            Inbound::Response { tag, response } => {
                self.route(tag, response);
                true
            }
            Inbound::Closed { reason } => {
                self.lose_connection(Some(generation), &reason);
                false
            }
        }
    }

    fn on_hello(&self, remote: u32, server: &str) {
        let local = self.inner.config.protocol_version;
        if remote != local {
            tracing::error!(
                session = %self.name(),
                local,
                remote,
                server,
                "protocol version mismatch"
            );
            self.fail_fatally(CoreError::ProtocolVersionMismatch { local, remote });
            return;
        }

        let outbox = {
            let mut state = self.inner.state.borrow_mut();
            state.link = LinkState::Connected;
            std::mem::take(&mut state.outbox)
        };
        tracing::debug!(session = %self.name(), server, "connected");

        for (tag, command) in outbox {
            let sent = self.inner.connection.borrow_mut().send(tag, &command);
            if let Err(e) = sent {
                self.lose_connection(None, &e.text());
                return;
            }
        }
    }

    fn fail_fatally(&self, error: CoreError) {
        let jobs: Vec<JobId> = {
            let mut state = self.inner.state.borrow_mut();
            state.fatal = Some(error.clone());
            state.link = LinkState::Disconnected;
            state.generation += 1;
            state.outbox.clear();
            state.queue.iter().copied().collect()
        };
        self.inner.connection.borrow_mut().close();

        for id in jobs {
            if let Some(job) = self.handle(id) {
                job.set_error(error.clone());
                job.emit_result();
            }
        }
    }

    /// Delivers a response to the deepest job on the current chain whose
    /// tag matches.
    fn route(&self, tag: Tag, response: Response) {
        let target = {
            let state = self.inner.state.borrow();
            let chain = current_chain(&state);
            chain.into_iter().rev().find(|id| {
                state.jobs.get(id).is_some_and(|node| {
                    node.tag == Some(tag) && !node.finishing && !node.reading_finished
                })
            })
        };

        match target {
            Some(id) => self.deliver(id, tag, response),
            None => {
                tracing::warn!(session = %self.name(), %tag, "dropping response with unexpected tag");
            }
        }
    }

    /// Handles connection loss once per connection generation.
    pub(crate) fn lose_connection(&self, generation: Option<u64>, reason: &str) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.link == LinkState::Disconnected {
                return;
            }
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            state.link = LinkState::Disconnected;
            state.generation += 1;
            state.outbox.clear();
        }
        self.inner.connection.borrow_mut().close();
        tracing::warn!(session = %self.name(), reason, "connection lost");

        let session = self.clone();
        let error = CoreError::connection_failed(reason);
        self.post(move || session.fail_deepest(error));
    }

    /// Fails the deepest current job that is not already finishing.
    fn fail_deepest(&self, error: CoreError) {
        let deepest = {
            let state = self.inner.state.borrow();
            current_chain(&state)
                .into_iter()
                .take_while(|id| state.jobs.get(id).is_some_and(|node| !node.finishing))
                .last()
        };
        if let Some(job) = deepest.and_then(|id| self.handle(id)) {
            tracing::debug!(session = %self.name(), job = %job.name(), error = %error, "aborting job");
            job.set_error(error);
            job.emit_result();
        }
    }
}

/// Returns the chain of current jobs, top-level first.
pub(crate) fn current_chain(state: &SessionState) -> Vec<JobId> {
    let mut chain = Vec::new();
    let mut next = state.current;
    while let Some(id) = next {
        chain.push(id);
        next = state.jobs.get(&id).and_then(|node| node.current);
    }
    chain
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}
