//! Standard jobs sending one command, and task-returning helpers.

use crate::job::{JobHandle, JobHandler, JobParent};
use entisync_core::{CoreError, Task};
use entisync_protocol::{
    Command, FetchDepth, FetchSelector, Gid, LocalEntity, LocalId, RemoteEntity, Response, Rid,
    Scope, Tag,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Everything a command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Entities listed before the terminal response.
    pub entities: Vec<LocalEntity>,
    /// Identifier reported by the terminal response.
    pub id: Option<LocalId>,
}

/// Sends one command and collects its responses.
///
/// A `No` response becomes [`CoreError::Unknown`] with the store's text.
pub struct CommandJob {
    name: &'static str,
    command: Option<Command>,
    output: Rc<RefCell<CommandOutput>>,
}

impl CommandJob {
    /// Creates a job sending `command`.
    pub fn new(command: Command) -> Self {
        Self {
            name: command.name(),
            command: Some(command),
            output: Rc::new(RefCell::new(CommandOutput::default())),
        }
    }
}

impl JobHandler for CommandJob {
    fn name(&self) -> &str {
        self.name
    }

    fn on_start(&mut self, job: &JobHandle) {
        if let Some(command) = self.command.take() {
            job.send(command);
        }
    }

    fn on_response(&mut self, job: &JobHandle, _tag: Tag, response: Response) -> bool {
        match response {
            Response::Entity(entity) => {
                self.output.borrow_mut().entities.push(entity);
                false
            }
            Response::Ok { id } => {
                self.output.borrow_mut().id = id;
                true
            }
            Response::No { message } => {
                job.set_error(CoreError::unknown(message));
                true
            }
        }
    }
}

/// Lists entities, optionally reporting them in coalesced chunks while the
/// listing is still running.
pub struct FetchJob {
    scope: Scope,
    selector: FetchSelector,
    depth: FetchDepth,
    cache_only: bool,
    on_partial: Option<Box<dyn FnMut(&[LocalEntity])>>,
    /// Received since the last partial report.
    pending: Vec<LocalEntity>,
    flush_scheduled: bool,
    collected: Rc<RefCell<Vec<LocalEntity>>>,
}

impl FetchJob {
    /// Creates a full listing of `scope`.
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            selector: FetchSelector::All,
            depth: FetchDepth::Full,
            cache_only: false,
            on_partial: None,
            pending: Vec::new(),
            flush_scheduled: false,
            collected: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Restricts the listing to the given local identifiers.
    #[must_use]
    pub fn ids(mut self, ids: Vec<LocalId>) -> Self {
        self.selector = FetchSelector::Ids(ids);
        self
    }

    /// Restricts the listing to the given remote identifiers.
    #[must_use]
    pub fn rids(mut self, rids: Vec<Rid>) -> Self {
        self.selector = FetchSelector::Rids(rids);
        self
    }

    /// Restricts the listing to the given global identifiers.
    #[must_use]
    pub fn gids(mut self, gids: Vec<Gid>) -> Self {
        self.selector = FetchSelector::Gids(gids);
        self
    }

    /// Lists identifiers only.
    #[must_use]
    pub fn projection(mut self) -> Self {
        self.depth = FetchDepth::Projection;
        self
    }

    /// Serves the listing from the local cache only.
    #[must_use]
    pub fn cache_only(mut self) -> Self {
        self.cache_only = true;
        self
    }

    /// Reports entities in chunks while the listing runs.
    ///
    /// Chunks are coalesced over the session's partial result interval; the
    /// last chunk is reported before the job finishes.
    #[must_use]
    pub fn on_partial<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[LocalEntity]) + 'static,
    {
        self.on_partial = Some(Box::new(f));
        self
    }

    fn flush(&mut self) {
        self.flush_scheduled = false;
        if self.pending.is_empty() {
            return;
        }
        let chunk = std::mem::take(&mut self.pending);
        if let Some(on_partial) = self.on_partial.as_mut() {
            on_partial(&chunk);
        }
    }
}

impl JobHandler for FetchJob {
    fn name(&self) -> &str {
        "fetch"
    }

    fn on_start(&mut self, job: &JobHandle) {
        job.send(Command::Fetch {
            scope: self.scope,
            selector: self.selector.clone(),
            depth: self.depth,
            cache_only: self.cache_only,
        });
    }

    fn on_response(&mut self, job: &JobHandle, _tag: Tag, response: Response) -> bool {
        match response {
            Response::Entity(entity) => {
                if self.on_partial.is_some() {
                    self.pending.push(entity.clone());
                    if !self.flush_scheduled {
                        self.flush_scheduled = true;
                        let interval = job.session().config().partial_result_interval;
                        let flush = job.clone();
                        job.session()
                            .event_loop()
                            .post_delayed(interval, move || flush.notify());
                    }
                }
                self.collected.borrow_mut().push(entity);
                false
            }
            Response::Ok { .. } => true,
            Response::No { message } => {
                job.set_error(CoreError::unknown(message));
                true
            }
        }
    }

    fn on_notify(&mut self, _job: &JobHandle) {
        self.flush();
    }

    fn on_about_to_finish(&mut self, _job: &JobHandle) {
        self.flush();
    }
}

/// Adds `job` to `parent` and resolves with its output once it finished.
pub fn run(parent: &dyn JobParent, job: CommandJob) -> Task<CommandOutput> {
    let output = Rc::clone(&job.output);
    match parent.add_job(Box::new(job)) {
        Ok(handle) => handle.result().map(move |()| output.take()),
        Err(e) => Task::failed(e),
    }
}

/// Adds `job` to `parent` and resolves with the listed entities.
pub fn fetch(parent: &dyn JobParent, job: FetchJob) -> Task<Vec<LocalEntity>> {
    let collected = Rc::clone(&job.collected);
    match parent.add_job(Box::new(job)) {
        Ok(handle) => handle.result().map(move |()| collected.take()),
        Err(e) => Task::failed(e),
    }
}

/// Creates `entity` in `scope` and resolves with its local identifier.
pub fn create(parent: &dyn JobParent, scope: Scope, entity: RemoteEntity) -> Task<LocalId> {
    run(parent, CommandJob::new(Command::Create { scope, entity })).and_then(|output| {
        match output.id {
            Some(id) => Task::ready(id),
            None => Task::failed(CoreError::unknown("store did not report the created id")),
        }
    })
}

/// Applies `entity` to the local entity `id`.
pub fn modify(
    parent: &dyn JobParent,
    id: LocalId,
    entity: RemoteEntity,
    expected_revision: Option<u64>,
) -> Task<()> {
    run(
        parent,
        CommandJob::new(Command::Modify {
            id,
            entity,
            expected_revision,
        }),
    )
    .map(|_| ())
}

/// Deletes the local entities `ids`.
pub fn delete(parent: &dyn JobParent, ids: Vec<LocalId>) -> Task<()> {
    run(parent, CommandJob::new(Command::Delete { ids })).map(|_| ())
}
