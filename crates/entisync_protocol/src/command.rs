//! Requests, responses and connection events.

use crate::entity::{Gid, LocalEntity, LocalId, RemoteEntity, Rid, Scope};
use crate::tag::Tag;
use serde::{Deserialize, Serialize};

/// Which entities a fetch returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSelector {
    /// Everything in the scope.
    All,
    /// Entities with these local identifiers.
    Ids(Vec<LocalId>),
    /// Entities with these remote identifiers.
    Rids(Vec<Rid>),
    /// Entities with these global identifiers.
    Gids(Vec<Gid>),
}

/// How much of each entity a fetch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchDepth {
    /// Identifiers only.
    Projection,
    /// Identifiers, flags, payload parts and attributes.
    Full,
}

/// A request sent to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Opens a transaction.
    Begin,
    /// Commits the open transaction.
    Commit,
    /// Rolls back the open transaction.
    Rollback,
    /// Selects the resource context for RID-addressed operations.
    SelectResource {
        /// Resource name.
        name: String,
    },
    /// Lists entities.
    Fetch {
        /// Entities considered.
        scope: Scope,
        /// Which of them to return.
        selector: FetchSelector,
        /// How much of each to return.
        depth: FetchDepth,
        /// Serve from the local cache only, never from upstream.
        cache_only: bool,
    },
    /// Creates an entity.
    Create {
        /// Where the entity lives.
        scope: Scope,
        /// Its content.
        entity: RemoteEntity,
    },
    /// Modifies an entity.
    Modify {
        /// Target entity.
        id: LocalId,
        /// New content.
        entity: RemoteEntity,
        /// Reject the change unless the stored revision equals this one.
        expected_revision: Option<u64>,
    },
    /// Deletes entities.
    Delete {
        /// Target entities.
        ids: Vec<LocalId>,
    },
}

impl Command {
    /// Returns a short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Begin => "begin",
            Command::Commit => "commit",
            Command::Rollback => "rollback",
            Command::SelectResource { .. } => "select_resource",
            Command::Fetch { .. } => "fetch",
            Command::Create { .. } => "create",
            Command::Modify { .. } => "modify",
            Command::Delete { .. } => "delete",
        }
    }

    /// Returns true for commands that change the mirror.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Command::Create { .. } | Command::Modify { .. } | Command::Delete { .. }
        )
    }
}

/// A response to a tagged request.
///
/// A request may yield any number of `Entity` responses followed by one
/// terminal `Ok` or `No`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    /// One entity of a listing.
    Entity(LocalEntity),
    /// The request succeeded.
    Ok {
        /// Identifier of a created entity.
        id: Option<LocalId>,
    },
    /// The request failed.
    No {
        /// Error text reported by the store.
        message: String,
    },
}

impl Response {
    /// Creates a plain success response.
    pub fn ok() -> Self {
        Response::Ok { id: None }
    }

    /// Creates a failure response.
    pub fn no(message: impl Into<String>) -> Self {
        Response::No {
            message: message.into(),
        }
    }

    /// Returns true if no further responses follow for the same tag.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Response::Entity(_))
    }
}

/// Events a connection delivers to its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Inbound {
    /// Greeting sent once after the connection opens.
    Hello {
        /// Protocol version spoken by the store.
        protocol_version: u32,
        /// Store name.
        server: String,
    },
    /// A response to a tagged request.
    Response {
        /// Correlation tag of the request.
        tag: Tag,
        /// The response.
        response: Response,
    },
    /// The store closed the connection.
    Closed {
        /// Why the connection closed.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    #[test]
    fn terminal_responses() {
        assert!(Response::ok().is_terminal());
        assert!(Response::no("failed").is_terminal());
    }

    #[test]
    fn mutations() {
        assert!(Command::Delete { ids: vec![LocalId(1)] }.is_mutation());
        assert!(!Command::Begin.is_mutation());
        assert!(!Command::Fetch {
            scope: Scope::all(EntityKind::Tag),
            selector: FetchSelector::All,
            depth: FetchDepth::Projection,
            cache_only: true,
        }
        .is_mutation());
    }

    #[test]
    fn commands_serialize_with_their_name() {
        let command = Command::Create {
            scope: Scope::items_in(LocalId(7)),
            entity: RemoteEntity::with_rid("B"),
        };
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["command"], "create");
        assert_eq!(json["scope"]["kind"], "item");
        assert_eq!(json["entity"]["rid"], "B");
        assert_eq!(command.name(), "create");
    }
}
