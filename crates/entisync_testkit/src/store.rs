//! In-memory store server.
//!
//! Answers commands the way a real store would: listings stream one
//! `Entity` response per match before the terminal `Ok`, mutations are
//! staged inside an open transaction and discarded on rollback.

use entisync_protocol::{
    Command, FetchDepth, FetchSelector, Inbound, LocalEntity, LocalId, RemoteEntity, Response,
    Scope, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

type CommandFilter = Box<dyn Fn(&Command) -> bool + Send + Sync>;

struct Fault {
    matches: CommandFilter,
    message: String,
}

#[derive(Clone)]
struct Snapshot {
    entities: BTreeMap<LocalId, LocalEntity>,
    next_id: i64,
}

struct StoreState {
    entities: BTreeMap<LocalId, LocalEntity>,
    next_id: i64,
    transaction: Option<Snapshot>,
    log: Vec<Command>,
    faults: Vec<Fault>,
    /// Close the connection instead of answering once this many commands
    /// were processed.
    close_after: Option<usize>,
    injected: Vec<Inbound>,
    protocol_version: u32,
    server_name: String,
    refuse_connections: bool,
    connections_opened: usize,
}

/// What the store does with one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    /// Answer with these responses.
    Respond(Vec<Response>),
    /// Close the connection without answering.
    Close(String),
}

/// An in-memory store server.
///
/// Cloning yields another handle to the same store, so a test keeps one
/// handle for assertions while the connection owns another.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Creates an empty store speaking [`PROTOCOL_VERSION`].
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                entities: BTreeMap::new(),
                next_id: 1,
                transaction: None,
                log: Vec::new(),
                faults: Vec::new(),
                close_after: None,
                injected: Vec::new(),
                protocol_version: PROTOCOL_VERSION,
                server_name: "memory-store".to_string(),
                refuse_connections: false,
                connections_opened: 0,
            })),
        }
    }

    /// Announces `version` in the greeting.
    #[must_use]
    pub fn with_protocol_version(self, version: u32) -> Self {
        self.state.lock().protocol_version = version;
        self
    }

    /// Inserts an entity directly, bypassing the command log.
    pub fn seed(&self, scope: Scope, remote: &RemoteEntity) -> LocalId {
        let mut state = self.state.lock();
        let id = LocalId(state.next_id);
        state.next_id += 1;
        state
            .entities
            .insert(id, LocalEntity::from_remote(id, scope, remote));
        id
    }

    /// Returns the entity `id`.
    pub fn get(&self, id: LocalId) -> Option<LocalEntity> {
        self.state.lock().entities.get(&id).cloned()
    }

    /// Returns every entity of `scope`, ordered by id.
    pub fn entities(&self, scope: Scope) -> Vec<LocalEntity> {
        self.state
            .lock()
            .entities
            .values()
            .filter(|entity| scope.contains(entity))
            .cloned()
            .collect()
    }

    /// Returns the entity of `scope` with remote identifier `rid`.
    pub fn find_by_rid(&self, scope: Scope, rid: &str) -> Option<LocalEntity> {
        self.entities(scope)
            .into_iter()
            .find(|entity| entity.rid.as_ref().is_some_and(|r| r.as_str() == rid))
    }

    /// Returns every command processed so far.
    pub fn log(&self) -> Vec<Command> {
        self.state.lock().log.clone()
    }

    /// Returns the names of every command processed so far.
    pub fn command_names(&self) -> Vec<&'static str> {
        self.state.lock().log.iter().map(Command::name).collect()
    }

    /// Returns how many processed commands have the given name.
    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|command| command.name() == name)
            .count()
    }

    /// Clears the command log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Returns true while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().transaction.is_some()
    }

    /// Answers matching commands with `No { message }`.
    pub fn fail_when<F>(&self, matches: F, message: impl Into<String>)
    where
        F: Fn(&Command) -> bool + Send + Sync + 'static,
    {
        self.state.lock().faults.push(Fault {
            matches: Box::new(matches),
            message: message.into(),
        });
    }

    /// Removes every injected failure.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Closes the connection instead of answering once `count` commands
    /// were processed.
    pub fn close_after(&self, count: usize) {
        self.state.lock().close_after = Some(count);
    }

    /// Sends `message` ahead of the next command's responses.
    pub fn inject(&self, message: Inbound) {
        self.state.lock().injected.push(message);
    }

    /// Makes every following connection attempt fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Returns how many connections were opened.
    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    /// Registers a new connection. Returns the greeting, or `None` when
    /// connections are refused.
    pub(crate) fn accept(&self) -> Option<Inbound> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return None;
        }
        state.connections_opened += 1;
        Some(Inbound::Hello {
            protocol_version: state.protocol_version,
            server: state.server_name.clone(),
        })
    }

    /// Drops any transaction left open by a closed connection.
    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock();
        if let Some(snapshot) = state.transaction.take() {
            state.entities = snapshot.entities;
            state.next_id = snapshot.next_id;
        }
    }

    pub(crate) fn take_injected(&self) -> Vec<Inbound> {
        std::mem::take(&mut self.state.lock().injected)
    }

    /// Processes one command.
    pub fn process(&self, command: &Command) -> StoreReply {
        let mut state = self.state.lock();
        if state.close_after.is_some_and(|limit| state.log.len() >= limit) {
            state.close_after = None;
            return StoreReply::Close("store went away".to_string());
        }
        state.log.push(command.clone());

        if let Some(fault) = state.faults.iter().find(|fault| (fault.matches)(command)) {
            return StoreReply::Respond(vec![Response::no(fault.message.clone())]);
        }
        StoreReply::Respond(state.execute(command))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("entities", &state.entities.len())
            .field("in_transaction", &state.transaction.is_some())
            .field("commands", &state.log.len())
            .finish()
    }
}

impl StoreState {
    fn execute(&mut self, command: &Command) -> Vec<Response> {
        match command {
            Command::Begin => {
                if self.transaction.is_some() {
                    return vec![Response::no("transaction already open")];
                }
                self.transaction = Some(Snapshot {
                    entities: self.entities.clone(),
                    next_id: self.next_id,
                });
                vec![Response::ok()]
            }
            Command::Commit => match self.transaction.take() {
                Some(_) => vec![Response::ok()],
                None => vec![Response::no("no transaction open")],
            },
            Command::Rollback => match self.transaction.take() {
                Some(snapshot) => {
                    self.entities = snapshot.entities;
                    self.next_id = snapshot.next_id;
                    vec![Response::ok()]
                }
                None => vec![Response::no("no transaction open")],
            },
            Command::SelectResource { .. } => vec![Response::ok()],
            Command::Fetch {
                scope,
                selector,
                depth,
                ..
            } => self.fetch(*scope, selector, *depth),
            Command::Create { scope, entity } => {
                let id = LocalId(self.next_id);
                self.next_id += 1;
                self.entities
                    .insert(id, LocalEntity::from_remote(id, *scope, entity));
                vec![Response::Ok { id: Some(id) }]
            }
            Command::Modify {
                id,
                entity,
                expected_revision,
            } => match self.entities.get_mut(id) {
                None => vec![Response::no(format!("entity {id} not found"))],
                Some(local) if expected_revision.is_some_and(|r| r != local.revision) => {
                    vec![Response::no(format!("entity {id} was modified concurrently"))]
                }
                Some(local) => {
                    local.apply(entity);
                    vec![Response::Ok { id: Some(*id) }]
                }
            },
            Command::Delete { ids } => {
                if let Some(missing) = ids.iter().find(|id| !self.entities.contains_key(id)) {
                    return vec![Response::no(format!("entity {missing} not found"))];
                }
                for id in ids {
                    self.entities.remove(id);
                }
                vec![Response::ok()]
            }
        }
    }

    fn fetch(&self, scope: Scope, selector: &FetchSelector, depth: FetchDepth) -> Vec<Response> {
        let in_scope = self.entities.values().filter(|entity| scope.contains(entity));
        let matches: Vec<&LocalEntity> = match selector {
            FetchSelector::All => in_scope.collect(),
            FetchSelector::Ids(ids) => {
                if let Some(missing) = ids.iter().find(|id| !self.entities.contains_key(id)) {
                    return vec![Response::no(format!("entity {missing} not found"))];
                }
                in_scope.filter(|entity| ids.contains(&entity.id)).collect()
            }
            FetchSelector::Rids(rids) => in_scope
                .filter(|entity| entity.rid.as_ref().is_some_and(|rid| rids.contains(rid)))
                .collect(),
            FetchSelector::Gids(gids) => in_scope
                .filter(|entity| entity.gid.as_ref().is_some_and(|gid| gids.contains(gid)))
                .collect(),
        };

        let mut responses: Vec<Response> = matches
            .into_iter()
            .map(|entity| match depth {
                FetchDepth::Projection => Response::Entity(entity.projection()),
                FetchDepth::Full => Response::Entity(entity.clone()),
            })
            .collect();
        responses.push(Response::ok());
        responses
    }
}
