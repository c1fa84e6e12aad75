//! Session and job engine integration tests.

use entisync_core::CoreError;
use entisync_job::{
    create, delete, fetch, modify, run, CommandJob, FetchJob, JobHandle, JobHandler, KillMode,
    SessionConfig,
};
use entisync_protocol::{
    Command, Inbound, LocalId, RemoteEntity, Response, Scope, Tag, PROTOCOL_VERSION,
};
use entisync_testkit::prelude::*;
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn scope() -> Scope {
    Scope::items_in(LocalId(500))
}

fn select(name: &str) -> CommandJob {
    CommandJob::new(Command::SelectResource {
        name: name.to_string(),
    })
}

/// Records its start, checks it is the current subjob, then sends one
/// command.
struct Recorder {
    label: String,
    log: Rc<RefCell<Vec<String>>>,
}

impl JobHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_start(&mut self, job: &JobHandle) {
        if let Some(parent) = job.parent() {
            assert_eq!(parent.current_subjob().as_ref(), Some(job));
        }
        self.log.borrow_mut().push(self.label.clone());
        job.send(Command::SelectResource {
            name: self.label.clone(),
        });
    }

    fn on_response(&mut self, _job: &JobHandle, _tag: Tag, response: Response) -> bool {
        response.is_terminal()
    }
}

/// Never finishes on its own.
struct Idle;

impl JobHandler for Idle {
    fn on_start(&mut self, _job: &JobHandle) {}
}

/// Does nothing but group its subjobs.
struct Group;

impl JobHandler for Group {
    fn name(&self) -> &str {
        "group"
    }

    fn on_start(&mut self, job: &JobHandle) {
        if !job.has_subjobs() {
            job.emit_result();
        }
    }

    fn on_subjob_result(
        &mut self,
        job: &JobHandle,
        _subjob: &JobHandle,
        result: &entisync_core::CoreResult<()>,
    ) {
        if let Err(e) = result {
            job.set_error(e.clone());
            job.emit_result();
        } else if !job.has_subjobs() {
            job.emit_result();
        }
    }
}

#[test]
fn test_commands_reach_store_in_spawn_order() {
    let test = TestSession::new();
    let jobs: Vec<JobHandle> = ["one", "two", "three"]
        .into_iter()
        .map(|name| JobHandle::spawn(&test.session, select(name)))
        .collect();

    test.wait(jobs[2].result()).unwrap();
    assert_eq!(
        test.store.log(),
        vec![
            Command::SelectResource { name: "one".into() },
            Command::SelectResource { name: "two".into() },
            Command::SelectResource { name: "three".into() },
        ]
    );
    assert!(test.session.is_connected());
    assert_eq!(test.store.connections_opened(), 1);
}

#[test]
fn test_unexpected_tag_is_dropped() {
    let test = TestSession::new();
    test.store.inject(Inbound::Response {
        tag: Tag(9_999),
        response: Response::no("stray"),
    });

    let output = run(&test.session, select("resource"));
    assert_eq!(test.wait(output).unwrap(), Default::default());
}

#[test]
fn test_connection_loss_fails_current_job_then_reconnects() {
    let test = TestSession::new();
    test.store.close_after(0);

    let lost = run(&test.session, select("lost"));
    let next = run(&test.session, select("next"));

    assert_eq!(
        test.wait(lost),
        Err(CoreError::connection_failed("store went away"))
    );
    test.wait(next).unwrap();
    assert_eq!(test.store.connections_opened(), 2);
    assert_eq!(test.store.command_names(), vec!["select_resource"]);
}

#[test]
fn test_refused_connection_fails_job() {
    let test = TestSession::new();
    test.store.refuse_connections(true);

    let refused = run(&test.session, select("refused"));
    assert!(matches!(
        test.wait(refused),
        Err(CoreError::ConnectionFailed(_))
    ));

    test.store.refuse_connections(false);
    test.wait(run(&test.session, select("accepted"))).unwrap();
}

#[test]
fn test_protocol_mismatch_is_fatal() {
    let store = MemoryStore::new().with_protocol_version(PROTOCOL_VERSION + 1);
    let test = TestSession::with_store(store);
    let mismatch = CoreError::ProtocolVersionMismatch {
        local: PROTOCOL_VERSION,
        remote: PROTOCOL_VERSION + 1,
    };

    let first = run(&test.session, select("first"));
    let second = run(&test.session, select("second"));
    assert_eq!(test.wait(first), Err(mismatch.clone()));
    assert_eq!(test.wait(second), Err(mismatch.clone()));

    let later = run(&test.session, select("later"));
    assert_eq!(test.wait(later), Err(mismatch));
    assert!(test.store.log().is_empty());
    assert!(!test.session.is_connected());
}

#[test]
fn test_kill_started_job_forces_reconnect() {
    let test = TestSession::new();
    test.wait(run(&test.session, select("connect"))).unwrap();

    let idle = JobHandle::spawn(&test.session, Idle);
    let after = run(&test.session, select("after"));
    test.settle();
    assert!(idle.is_started());

    assert!(idle.kill(KillMode::EmitResult));
    assert_eq!(test.wait(idle.result()), Err(CoreError::UserCanceled));
    test.wait(after).unwrap();
    assert_eq!(test.store.connections_opened(), 2);
}

#[test]
fn test_kill_queued_subjob_notifies_parent() {
    let test = TestSession::new();
    let parent = JobHandle::spawn(&test.session, Group);
    let first = parent.add_subjob(select("first"));
    let second = parent.add_subjob(select("second"));

    assert!(second.kill(KillMode::EmitResult));
    assert_eq!(test.wait(parent.result()), Err(CoreError::UserCanceled));
    // The parent finished first, discarding its running subjob.
    assert_eq!(test.wait(first.result()), Err(CoreError::UserCanceled));
    assert!(!test.store.log().contains(&Command::SelectResource {
        name: "second".into()
    }));
}

#[test]
fn test_result_waits_for_subjobs_spawned_by_last_response() {
    /// Adds a subjob while handling its final response.
    struct Spawner {
        child: Rc<RefCell<Option<JobHandle>>>,
        order: Rc<RefCell<Vec<&'static str>>>,
    }

    impl JobHandler for Spawner {
        fn on_start(&mut self, job: &JobHandle) {
            job.send(Command::SelectResource {
                name: "parent".into(),
            });
        }

        fn on_response(&mut self, job: &JobHandle, _tag: Tag, _response: Response) -> bool {
            let child = job.add_subjob(CommandJob::new(Command::SelectResource {
                name: "child".into(),
            }));
            let order = Rc::clone(&self.order);
            child
                .result()
                .on_settled(move |_| order.borrow_mut().push("child"));
            *self.child.borrow_mut() = Some(child);
            true
        }
    }

    let test = TestSession::new();
    let child = Rc::new(RefCell::new(None));
    let order = Rc::new(RefCell::new(Vec::new()));
    let parent = JobHandle::spawn(
        &test.session,
        Spawner {
            child: Rc::clone(&child),
            order: Rc::clone(&order),
        },
    );

    let log = Rc::clone(&order);
    parent.result().on_settled(move |_| log.borrow_mut().push("parent"));

    test.wait(parent.result()).unwrap();
    let child = child.borrow().clone().unwrap();
    assert!(child.is_finished());
    assert_eq!(child.error(), None);
    assert_eq!(test.store.command_names().len(), 2);
    assert_eq!(*order.borrow(), vec!["child", "parent"]);
}

#[test]
fn test_crud_helpers() {
    let test = TestSession::new();

    let id = test
        .wait(create(&test.session, scope(), RemoteEntity::with_rid("A").part("BODY", "v1")))
        .unwrap();
    test.wait(modify(
        &test.session,
        id,
        RemoteEntity::with_rid("A").part("BODY", "v2"),
        Some(0),
    ))
    .unwrap();
    assert_eq!(test.store.get(id).unwrap().parts["BODY"], b"v2".to_vec());

    let stale = modify(&test.session, id, RemoteEntity::with_rid("A"), Some(0));
    assert!(matches!(test.wait(stale), Err(CoreError::Unknown(_))));

    let listed = test
        .wait(fetch(&test.session, FetchJob::new(scope()).rids(vec!["A".into()])))
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);

    test.wait(delete(&test.session, vec![id])).unwrap();
    assert!(test.store.get(id).is_none());

    let missing = delete(&test.session, vec![id]);
    assert_eq!(
        test.wait(missing),
        Err(CoreError::unknown(format!("entity {id} not found")))
    );
}

#[test]
fn test_fetch_reports_partial_results() {
    let store = MemoryStore::new();
    for rid in ["a", "b", "c"] {
        store.seed(scope(), &RemoteEntity::with_rid(rid));
    }
    let config =
        SessionConfig::new("partial").with_partial_result_interval(Duration::from_millis(5));
    let test = TestSession::with_config(store, config);

    let chunks = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&chunks);
    let job = FetchJob::new(scope())
        .projection()
        .cache_only()
        .on_partial(move |chunk| sink.borrow_mut().push(chunk.len()));

    let listed = test.wait(fetch(&test.session, job)).unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(chunks.borrow().iter().sum::<usize>(), 3);

    test.run_for(Duration::from_millis(20));
    assert_eq!(chunks.borrow().iter().sum::<usize>(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn siblings_start_in_fifo_order(groups in prop::collection::vec(1usize..6, 1..4)) {
        let test = TestSession::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut expected = Vec::new();
        let mut parents = Vec::new();

        for (g, count) in groups.iter().enumerate() {
            let parent = JobHandle::spawn(&test.session, Group);
            for i in 0..*count {
                let label = format!("{g}.{i}");
                expected.push(label.clone());
                parent.add_subjob(Recorder { label, log: Rc::clone(&log) });
            }
            parents.push(parent);
        }

        for parent in parents {
            prop_assert_eq!(test.wait(parent.result()), Ok(()));
        }
        prop_assert_eq!(&*log.borrow(), &expected);

        let sent: Vec<String> = test
            .store
            .log()
            .into_iter()
            .filter_map(|command| match command {
                Command::SelectResource { name } => Some(name),
                _ => None,
            })
            .collect();
        prop_assert_eq!(sent, expected);
    }
}
