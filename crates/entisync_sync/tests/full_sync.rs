//! Full-delivery reconciliation tests.

use entisync_core::CoreError;
use entisync_protocol::{Command, LocalEntity, LocalId, RemoteEntity, Rid, Scope};
use entisync_sync::{EntitySync, SyncConfig, SyncError, SyncStats, TransactionMode};
use entisync_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn scope() -> Scope {
    Scope::items_in(LocalId(7))
}

fn entity(rid: &str) -> RemoteEntity {
    RemoteEntity::with_rid(rid).part("BODY", rid)
}

fn rids(test: &TestSession) -> BTreeSet<String> {
    test.store
        .entities(scope())
        .into_iter()
        .filter_map(|local| local.rid.map(|rid| rid.as_str().to_string()))
        .collect()
}

fn run(test: &TestSession, config: SyncConfig, remote: Vec<RemoteEntity>) -> SyncStats {
    let sync = EntitySync::new(&test.session, config).unwrap();
    sync.feed_full(remote).unwrap();
    test.wait(sync.result()).unwrap()
}

#[test]
fn test_creates_missing_and_deletes_stale() {
    let test = TestSession::new();
    test.store.seed(scope(), &entity("A"));
    test.store.seed(scope(), &entity("C"));

    let stats = run(
        &test,
        SyncConfig::new(scope()),
        vec![entity("A"), entity("B")],
    );

    assert_eq!(
        test.store.command_names(),
        vec!["fetch", "begin", "fetch", "create", "delete", "commit"]
    );
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.modified, 0);
    assert_eq!(stats.transactions, 1);
    assert_eq!(rids(&test), BTreeSet::from(["A".to_string(), "B".to_string()]));
}

#[test]
fn test_second_run_changes_nothing() {
    let test = TestSession::new();
    let remote = vec![entity("A"), entity("B")];
    run(&test, SyncConfig::new(scope()), remote.clone());
    test.store.clear_log();

    let stats = run(&test, SyncConfig::new(scope()), remote);
    assert_eq!(stats.mutations(), 0);
    assert_eq!(stats.unchanged, 2);
    assert_eq!(test.store.count("create"), 0);
    assert_eq!(test.store.count("modify"), 0);
    assert_eq!(test.store.count("delete"), 0);
}

#[test]
fn test_changed_entity_is_modified() {
    let test = TestSession::new();
    let id = test
        .store
        .seed(scope(), &RemoteEntity::with_rid("A").part("BODY", "old"));

    let stats = run(
        &test,
        SyncConfig::new(scope()),
        vec![RemoteEntity::with_rid("A").part("BODY", "new")],
    );

    assert_eq!(stats.modified, 1);
    assert_eq!(
        test.store.command_names(),
        vec!["fetch", "begin", "fetch", "modify", "commit"]
    );
    let stored = test.store.get(id).unwrap();
    assert_eq!(stored.parts.get("BODY"), Some(&b"new".to_vec()));

    // The modification is conditional on the revision the engine compared.
    let modify = test
        .store
        .log()
        .into_iter()
        .find(|command| command.name() == "modify")
        .unwrap();
    assert!(matches!(
        modify,
        Command::Modify {
            expected_revision: Some(_),
            ..
        }
    ));
}

#[test]
fn test_entities_without_rid_match_by_gid() {
    let test = TestSession::new();
    test.store.seed(scope(), &RemoteEntity::with_gid("g1"));

    let stats = run(
        &test,
        SyncConfig::new(scope()),
        vec![RemoteEntity::with_gid("g1"), RemoteEntity::with_gid("g2")],
    );

    assert_eq!(stats.unchanged, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.deleted, 0);
    assert_eq!(test.store.entities(scope()).len(), 2);
}

#[test]
fn test_empty_delivery_on_empty_scope() {
    let test = TestSession::new();
    let stats = run(&test, SyncConfig::new(scope()), vec![]);
    assert_eq!(stats, SyncStats::default());
    assert_eq!(test.store.command_names(), vec!["fetch"]);
}

#[test]
fn test_delivery_done_without_entities_clears_scope() {
    let test = TestSession::new();
    test.store.seed(scope(), &entity("A"));
    test.store.seed(scope(), &entity("B"));
    let other = Scope::items_in(LocalId(8));
    test.store.seed(other, &entity("kept"));

    let sync = EntitySync::new(&test.session, SyncConfig::new(scope())).unwrap();
    sync.delivery_done().unwrap();
    let stats = test.wait(sync.result()).unwrap();

    assert_eq!(stats.deleted, 2);
    assert!(test.store.entities(scope()).is_empty());
    assert_eq!(test.store.entities(other).len(), 1);
}

#[test]
fn test_multiple_mode_commits_every_batch() {
    let test = TestSession::new();
    let remote: Vec<_> = (0..7).map(|i| entity(&format!("e{i}"))).collect();
    let config = SyncConfig::new(scope())
        .with_batch_size(3)
        .with_transaction_mode(TransactionMode::Multiple);

    let stats = run(&test, config, remote);

    assert_eq!(stats.created, 7);
    assert_eq!(stats.transactions, 3);
    assert_eq!(test.store.count("begin"), 3);
    assert_eq!(test.store.count("commit"), 3);
}

#[test]
fn test_single_mode_uses_one_transaction() {
    let test = TestSession::new();
    let remote: Vec<_> = (0..7).map(|i| entity(&format!("e{i}"))).collect();
    let stats = run(&test, SyncConfig::new(scope()).with_batch_size(3), remote);

    assert_eq!(stats.created, 7);
    assert_eq!(stats.transactions, 1);
    assert_eq!(test.store.count("begin"), 1);
    assert_eq!(test.store.count("commit"), 1);
}

#[test]
fn test_disabled_transactions() {
    let test = TestSession::new();
    let remote: Vec<_> = (0..4).map(|i| entity(&format!("e{i}"))).collect();
    let config = SyncConfig::new(scope())
        .with_batch_size(2)
        .with_transaction_mode(TransactionMode::None);

    let stats = run(&test, config, remote);

    assert_eq!(stats.created, 4);
    assert_eq!(stats.transactions, 0);
    assert_eq!(test.store.count("begin"), 0);
    assert_eq!(test.store.count("commit"), 0);
}

#[test]
fn test_failed_create_rolls_back_and_fails_run() {
    let test = TestSession::new();
    test.store.fail_when(
        |command| {
            matches!(command, Command::Create { entity, .. }
                if entity.rid == Some(Rid::new("bad")))
        },
        "denied",
    );
    let config = SyncConfig::new(scope())
        .with_batch_size(2)
        .with_transaction_mode(TransactionMode::Multiple);
    let sync = EntitySync::new(&test.session, config).unwrap();
    sync.feed_full(vec![entity("a"), entity("bad"), entity("c"), entity("d")])
        .unwrap();

    assert_eq!(
        test.wait(sync.result()),
        Err(CoreError::unknown("denied"))
    );
    assert_eq!(test.store.count("commit"), 0);
    assert_eq!(test.store.count("rollback"), 1);
    assert!(test.store.entities(scope()).is_empty());
    assert_eq!(sync.error(), Some(CoreError::unknown("denied")));
}

#[test]
fn test_custom_update_check() {
    let test = TestSession::new();
    test.store.seed(scope(), &entity("A"));

    let sync = EntitySync::new(&test.session, SyncConfig::new(scope())).unwrap();
    sync.set_update_check(|_: &LocalEntity, _: &RemoteEntity| true);
    sync.feed_full(vec![entity("A")]).unwrap();
    let stats = test.wait(sync.result()).unwrap();

    assert_eq!(stats.modified, 1);
    assert_eq!(stats.unchanged, 0);
}

#[test]
fn test_feed_errors() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, SyncConfig::new(scope())).unwrap();
    sync.feed_full(vec![entity("A")]).unwrap();

    // Without streaming the first delivery is the last one.
    assert_eq!(
        sync.feed_full(vec![entity("B")]),
        Err(SyncError::DeliveryDone)
    );

    test.wait(sync.result()).unwrap();
    assert!(sync.is_finished());
    assert_eq!(sync.feed_full(vec![]), Err(SyncError::Finished));
    assert_eq!(sync.delivery_done(), Err(SyncError::Finished));
}

#[test]
fn test_mixing_delivery_modes_is_rejected() {
    let test = TestSession::new();
    let config = SyncConfig::new(scope()).with_streaming(true);
    let sync = EntitySync::new(&test.session, config).unwrap();

    sync.feed_full(vec![entity("A")]).unwrap();
    assert_eq!(
        sync.feed_incremental(vec![entity("B")], vec![]),
        Err(SyncError::ModeMismatch)
    );

    let incremental = EntitySync::new(
        &test.session,
        SyncConfig::new(scope()).with_streaming(true),
    )
    .unwrap();
    incremental.feed_incremental(vec![], vec![]).unwrap();
    assert_eq!(incremental.set_total(3), Err(SyncError::ModeMismatch));

    sync.rollback();
    incremental.rollback();
    assert_eq!(test.wait(sync.result()), Err(CoreError::UserCanceled));
    assert_eq!(test.wait(incremental.result()), Err(CoreError::UserCanceled));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn full_sync_converges_on_remote_set(
        (remote, local) in overlapping_rids_strategy(12),
        batch_size in 1usize..5,
    ) {
        let test = TestSession::new();
        for rid in &local {
            test.store
                .seed(scope(), &RemoteEntity::with_rid(rid.as_str()).part("BODY", "stale"));
        }
        let config = SyncConfig::new(scope()).with_batch_size(batch_size);
        let stats = run(
            &test,
            config,
            remote.iter().map(|rid| entity(rid)).collect(),
        );

        let remote_set: BTreeSet<String> = remote.iter().cloned().collect();
        let local_set: BTreeSet<String> = local.iter().cloned().collect();
        prop_assert_eq!(rids(&test), remote_set.clone());
        prop_assert_eq!(stats.created, remote_set.difference(&local_set).count());
        prop_assert_eq!(stats.deleted, local_set.difference(&remote_set).count());
        prop_assert_eq!(stats.modified, remote_set.intersection(&local_set).count());
        prop_assert_eq!(stats.processed, remote.len());
        prop_assert!(!test.store.in_transaction());
    }
}
