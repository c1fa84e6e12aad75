//! Entity model shared by the remote snapshot and the local mirror.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Kind of entity kept in the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A leaf entity living in a collection.
    Item,
    /// A container of items.
    Collection,
    /// A label attached to items.
    Tag,
    /// A typed link between two items.
    Relation,
}

impl EntityKind {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Collection => "collection",
            EntityKind::Tag => "tag",
            EntityKind::Relation => "relation",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s {
            "item" => Ok(EntityKind::Item),
            "collection" => Ok(EntityKind::Collection),
            "tag" => Ok(EntityKind::Tag),
            "relation" => Ok(EntityKind::Relation),
            other => Err(ProtocolError::UnknownEntityKind(other.to_string())),
        }
    }
}

/// Identifier assigned by the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote identifier, assigned by the upstream store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rid(String);

impl Rid {
    /// Creates a remote identifier.
    pub fn new(rid: impl Into<String>) -> Self {
        Self(rid.into())
    }

    /// Returns the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty identifier, which never matches.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Rid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-independent identifier, usually derived from content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(String);

impl Gid {
    /// Creates a GID from an existing identifier.
    pub fn new(gid: impl Into<String>) -> Self {
        Self(gid.into())
    }

    /// Derives a GID from entity content (hex-encoded SHA-256).
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Parses a content-derived GID, rejecting anything but 64 lowercase
    /// hex digits.
    pub fn parse_digest(s: &str) -> ProtocolResult<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(ProtocolError::InvalidGid(s.to_string()))
        }
    }

    /// Returns the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty identifier, which never matches.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Gid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The set of entities one sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Entity kind.
    pub kind: EntityKind,
    /// Owning collection, when the kind is scoped by one.
    pub parent: Option<LocalId>,
}

impl Scope {
    /// Items of one collection.
    pub fn items_in(collection: LocalId) -> Self {
        Self {
            kind: EntityKind::Item,
            parent: Some(collection),
        }
    }

    /// Every entity of `kind`.
    pub fn all(kind: EntityKind) -> Self {
        Self { kind, parent: None }
    }

    /// Returns true if `entity` belongs to this scope.
    pub fn contains(&self, entity: &LocalEntity) -> bool {
        entity.kind == self.kind && (self.parent.is_none() || entity.parent == self.parent)
    }
}

/// An entity as reported by the upstream store.
///
/// May carry a full or partial payload: only the parts present in `parts`
/// were delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntity {
    /// Remote identifier.
    pub rid: Option<Rid>,
    /// Global identifier.
    pub gid: Option<Gid>,
    /// Opaque revision reported by the upstream store.
    pub remote_revision: Option<String>,
    /// Flags.
    pub flags: BTreeSet<String>,
    /// Delivered payload parts, by part name.
    pub parts: BTreeMap<String, Vec<u8>>,
    /// Attributes in their serialized form, by attribute type.
    pub attributes: BTreeMap<String, Vec<u8>>,
    /// Whether the local payload must be replaced instead of merged.
    pub clear_payload: bool,
}

impl RemoteEntity {
    /// Creates an entity addressed by remote identifier.
    pub fn with_rid(rid: impl Into<String>) -> Self {
        Self {
            rid: Some(Rid::new(rid)),
            ..Self::default()
        }
    }

    /// Creates an entity addressed only by global identifier.
    pub fn with_gid(gid: impl Into<String>) -> Self {
        Self {
            gid: Some(Gid::new(gid)),
            ..Self::default()
        }
    }

    /// Sets the global identifier.
    #[must_use]
    pub fn gid(mut self, gid: impl Into<String>) -> Self {
        self.gid = Some(Gid::new(gid));
        self
    }

    /// Sets the remote revision.
    #[must_use]
    pub fn remote_revision(mut self, revision: impl Into<String>) -> Self {
        self.remote_revision = Some(revision.into());
        self
    }

    /// Adds a flag.
    #[must_use]
    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    /// Adds a payload part.
    #[must_use]
    pub fn part(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.parts.insert(name.into(), data.into());
        self
    }

    /// Adds a serialized attribute.
    #[must_use]
    pub fn attribute(mut self, kind: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.attributes.insert(kind.into(), data.into());
        self
    }

    /// Requests that the local payload be replaced rather than merged.
    #[must_use]
    pub fn clearing_payload(mut self) -> Self {
        self.clear_payload = true;
        self
    }

    /// Returns the remote identifier unless it is absent or empty.
    pub fn effective_rid(&self) -> Option<&Rid> {
        self.rid.as_ref().filter(|rid| !rid.is_empty())
    }

    /// Returns the global identifier unless it is absent or empty.
    pub fn effective_gid(&self) -> Option<&Gid> {
        self.gid.as_ref().filter(|gid| !gid.is_empty())
    }
}

/// An entity as stored in the local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// Local identifier.
    pub id: LocalId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Owning collection.
    pub parent: Option<LocalId>,
    /// Remote identifier, once known.
    pub rid: Option<Rid>,
    /// Global identifier.
    pub gid: Option<Gid>,
    /// Local revision counter, bumped on every modification.
    pub revision: u64,
    /// Last remote revision seen.
    pub remote_revision: Option<String>,
    /// Flags.
    pub flags: BTreeSet<String>,
    /// Loaded payload parts.
    pub parts: BTreeMap<String, Vec<u8>>,
    /// Serialized attributes.
    pub attributes: BTreeMap<String, Vec<u8>>,
}

impl LocalEntity {
    /// Creates the local counterpart of `remote` inside `scope`.
    pub fn from_remote(id: LocalId, scope: Scope, remote: &RemoteEntity) -> Self {
        Self {
            id,
            kind: scope.kind,
            parent: scope.parent,
            rid: remote.effective_rid().cloned(),
            gid: remote.effective_gid().cloned(),
            revision: 0,
            remote_revision: remote.remote_revision.clone(),
            flags: remote.flags.clone(),
            parts: remote.parts.clone(),
            attributes: remote.attributes.clone(),
        }
    }

    /// Returns the names of the loaded payload parts.
    pub fn loaded_parts(&self) -> BTreeSet<&str> {
        self.parts.keys().map(String::as_str).collect()
    }

    /// Returns the cheap projection (identifiers only, no payload).
    pub fn projection(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            parent: self.parent,
            rid: self.rid.clone(),
            gid: self.gid.clone(),
            revision: self.revision,
            remote_revision: None,
            flags: BTreeSet::new(),
            parts: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Applies a remote modification and bumps the revision.
    ///
    /// Identifiers are only overwritten when the remote side carries them.
    /// Payload parts are merged unless `clear_payload` is set.
    pub fn apply(&mut self, remote: &RemoteEntity) {
        if let Some(rid) = remote.effective_rid() {
            self.rid = Some(rid.clone());
        }
        if let Some(gid) = remote.effective_gid() {
            self.gid = Some(gid.clone());
        }
        if remote.remote_revision.is_some() {
            self.remote_revision = remote.remote_revision.clone();
        }
        self.flags = remote.flags.clone();
        if remote.clear_payload {
            self.parts = remote.parts.clone();
        } else {
            self.parts
                .extend(remote.parts.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.attributes
            .extend(remote.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.revision += 1;
    }
}
