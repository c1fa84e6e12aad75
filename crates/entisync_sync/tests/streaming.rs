//! Streaming delivery, backpressure and pull adapter tests.

use entisync_core::{CoreError, Task};
use entisync_job::KillMode;
use entisync_protocol::{LocalId, RemoteEntity, Scope};
use entisync_sync::{
    Delivery, EntitySync, RemoteSource, SyncConfig, SyncError, SyncEvent, TransactionMode,
    VecSource,
};
use entisync_testkit::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

fn scope() -> Scope {
    Scope::items_in(LocalId(3))
}

fn entity(rid: &str) -> RemoteEntity {
    RemoteEntity::with_rid(rid).part("BODY", rid)
}

fn entities(count: usize) -> Vec<RemoteEntity> {
    (0..count).map(|i| entity(&format!("e{i}"))).collect()
}

fn streaming(batch_size: usize) -> SyncConfig {
    SyncConfig::new(scope())
        .with_streaming(true)
        .with_batch_size(batch_size)
}

#[test]
fn test_ready_for_next_batch_reports_free_capacity() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, streaming(2)).unwrap();
    let events = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&events);
    let producer = sync.clone();
    sync.subscribe(move |event| {
        log.borrow_mut().push(*event);
        if matches!(event, SyncEvent::ReadyForNextBatch(_)) {
            producer.delivery_done().unwrap();
        }
    });
    sync.feed_full(vec![entity("a"), entity("b"), entity("c")])
        .unwrap();
    assert_eq!(sync.queued(), 3);

    let stats = test.wait(sync.result()).unwrap();
    assert_eq!(stats.created, 3);
    assert_eq!(events.borrow()[0], SyncEvent::ReadyForNextBatch(1));
    assert!(events.borrow().contains(&SyncEvent::TransactionCommitted));
}

#[test]
fn test_declared_total_ends_delivery() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, streaming(10)).unwrap();
    sync.set_total(2).unwrap();
    sync.feed_full(vec![entity("a")]).unwrap();
    sync.feed_full(vec![entity("b")]).unwrap();

    let stats = test.wait(sync.result()).unwrap();
    assert_eq!(stats.created, 2);
}

#[test]
fn test_total_is_ignored_without_auto_delivery_done() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, streaming(10)).unwrap();
    sync.set_auto_delivery_done(false);
    sync.set_total(1).unwrap();
    sync.feed_full(vec![entity("a")]).unwrap();

    test.settle();
    assert!(!sync.is_finished());

    sync.commit().unwrap();
    let stats = test.wait(sync.result()).unwrap();
    assert_eq!(stats.created, 1);
}

#[test]
fn test_rollback_discards_applied_batches() {
    let test = TestSession::new();
    test.store.seed(scope(), &entity("old"));
    let sync = EntitySync::new(&test.session, streaming(2)).unwrap();

    let producer = sync.clone();
    sync.subscribe(move |event| {
        if matches!(event, SyncEvent::ReadyForNextBatch(_)) {
            producer.rollback();
        }
    });
    sync.feed_full(entities(3)).unwrap();

    assert_eq!(test.wait(sync.result()), Err(CoreError::UserCanceled));
    assert_eq!(
        test.store.command_names(),
        vec!["fetch", "begin", "create", "create", "rollback"]
    );
    let remaining = test.store.entities(scope());
    assert_eq!(remaining.len(), 1);
    assert_eq!(sync.stats().created, 2);
}

#[test]
fn test_rollback_before_start() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, streaming(2)).unwrap();
    sync.feed_full(entities(1)).unwrap();
    sync.rollback();

    assert_eq!(test.wait(sync.result()), Err(CoreError::UserCanceled));
    assert_eq!(test.store.count("create"), 0);
}

#[test]
fn test_kill_while_running_discards_open_transaction() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, streaming(2)).unwrap();
    sync.feed_full(entities(3)).unwrap();

    // Both batches are applied and the run waits for more input.
    for _ in 0..16 {
        if test.store.count("create") == 3 {
            break;
        }
        test.settle();
    }
    assert_eq!(test.store.count("create"), 3);
    assert!(test.store.in_transaction());
    assert!(!sync.is_finished());

    assert!(sync.job().kill(KillMode::EmitResult));
    assert_eq!(test.wait(sync.result()), Err(CoreError::UserCanceled));
    assert!(sync.is_finished());
    assert!(!test.store.in_transaction());
    assert!(test.store.entities(scope()).is_empty());
    assert_eq!(sync.feed_full(entities(1)), Err(SyncError::Finished));

    // The session recovers on a fresh connection.
    let next = EntitySync::new(&test.session, SyncConfig::new(scope())).unwrap();
    next.feed_full(vec![entity("late")]).unwrap();
    let stats = test.wait(next.result()).unwrap();
    assert_eq!(stats.created, 1);
    assert_eq!(test.store.connections_opened(), 2);
}

#[test]
fn test_pull_from_vec_source() {
    let test = TestSession::new();
    test.store.seed(scope(), &entity("stale"));
    let sync = EntitySync::new(&test.session, SyncConfig::new(scope()).with_batch_size(2)).unwrap();
    sync.pull_from(VecSource::full(entities(5)));

    let stats = test.wait(sync.result()).unwrap();
    assert_eq!(stats.created, 5);
    assert_eq!(stats.deleted, 1);
    assert_eq!(test.store.entities(scope()).len(), 5);
    assert_eq!(test.store.count("begin"), 1);
    assert_eq!(test.store.count("commit"), 1);
}

#[test]
fn test_pull_incremental_in_multiple_mode() {
    let test = TestSession::new();
    test.store.seed(scope(), &entity("x"));
    let config = SyncConfig::new(scope())
        .with_batch_size(2)
        .with_transaction_mode(TransactionMode::Multiple);
    let sync = EntitySync::new(&test.session, config).unwrap();
    let committed = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&committed);
    sync.subscribe(move |event| {
        if *event == SyncEvent::TransactionCommitted {
            *counter.borrow_mut() += 1;
        }
    });
    sync.pull_from(VecSource::incremental(entities(3), vec![entity("x")]));

    let stats = test.wait(sync.result()).unwrap();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.transactions, 2);
    assert_eq!(test.store.count("commit"), 2);
    assert!(*committed.borrow() >= 1);
}

/// Serves one chunk, then fails.
struct FlakySource {
    served: bool,
}

impl RemoteSource for FlakySource {
    fn next_batch(&mut self, capacity: usize) -> Task<Delivery> {
        if self.served {
            return Task::failed(CoreError::connection_failed("remote went away"));
        }
        self.served = true;
        Task::ready(Delivery::full(entities(capacity)))
    }
}

#[test]
fn test_failing_source_aborts_run() {
    let test = TestSession::new();
    let sync = EntitySync::new(&test.session, SyncConfig::new(scope()).with_batch_size(2)).unwrap();
    sync.pull_from(FlakySource { served: false });

    assert_eq!(
        test.wait(sync.result()),
        Err(CoreError::connection_failed("remote went away"))
    );
    assert_eq!(test.store.count("rollback"), 1);
    assert!(test.store.entities(scope()).is_empty());
}
