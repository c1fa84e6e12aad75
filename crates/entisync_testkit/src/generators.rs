//! Property-based test generators using proptest.
//!
//! Provides strategies for generating remote snapshots and local mirrors
//! that keep identifiers unique.

use entisync_protocol::{RemoteEntity, Rid};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Strategy for generating remote identifiers.
pub fn rid_strategy() -> impl Strategy<Value = Rid> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}")
        .expect("Invalid regex")
        .prop_map(Rid::new)
}

/// Strategy for generating payload bytes.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..32)
}

/// Strategy for generating a remote entity with the given identifier.
pub fn remote_entity_strategy(rid: Rid) -> impl Strategy<Value = RemoteEntity> {
    (
        payload_strategy(),
        prop::option::of("[0-9]{1,3}"),
        prop::bool::ANY,
    )
        .prop_map(move |(body, revision, seen)| {
            let mut entity = RemoteEntity::with_rid(rid.as_str()).part("BODY", body);
            entity.remote_revision = revision;
            if seen {
                entity = entity.flag("\\Seen");
            }
            entity
        })
}

/// Strategy for generating a set of distinct remote identifiers.
pub fn rid_set_strategy(max: usize) -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set("[a-z]{1,4}", 0..=max)
}

/// Strategy for generating a remote snapshot and a local mirror that
/// overlap on some identifiers.
///
/// Yields `(remote, local)` where both are lists of distinct identifiers;
/// each identifier lands on the remote side, the local side or both.
pub fn overlapping_rids_strategy(max: usize) -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    prop::collection::btree_map("[a-z]{1,4}", 0u8..3, 0..=max).prop_map(|sides| {
        let mut remote = Vec::new();
        let mut local = Vec::new();
        for (rid, side) in sides {
            match side {
                0 => remote.push(rid),
                1 => local.push(rid),
                _ => {
                    remote.push(rid.clone());
                    local.push(rid);
                }
            }
        }
        (remote, local)
    })
}
