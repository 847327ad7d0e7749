mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use stackmirror::{
    EngineConfig, EventKind, LockOp, Notification, ObjectId, Outcome, RawObject, StaticSchema, ThreadId, ThreadNotification,
    ThreadStatus, TraceEvent, TypeKey, TypeSchema,
};

use common::{app_filter, count, frame, Harness, MAIN, WORKER};

fn monitor(h: &Harness, thread: ThreadId, op: LockOp) {
    h.handle(
        thread,
        &[frame("app.Account", "deposit", 12)],
        ThreadNotification::Monitor {
            op,
            lock: RawObject::ordinary(90, "app.Account"),
        },
    );
}

#[test]
fn lock_operations_drive_thread_status() {
    let h = Harness::new(app_filter(), StaticSchema::new());
    h.handle(MAIN, &[], ThreadNotification::Start { name: "main".into() });
    h.enter(MAIN, &[frame("app.Account", "deposit", 10)]);

    monitor(&h, MAIN, LockOp::Contended);
    let summary = &h.state.thread_summaries().unwrap()[0];
    assert_eq!(summary.status, ThreadStatus::Blocked);
    assert_eq!(summary.waiting_on, Some(ObjectId(90)));

    monitor(&h, MAIN, LockOp::Acquired);
    let summary = &h.state.thread_summaries().unwrap()[0];
    assert_eq!(summary.status, ThreadStatus::Running);
    assert_eq!(summary.locks_held, vec![ObjectId(90)]);
    assert_eq!(summary.name.as_deref(), Some("main"));

    monitor(&h, MAIN, LockOp::Wait);
    assert_eq!(h.state.thread_summaries().unwrap()[0].status, ThreadStatus::Waiting);
    monitor(&h, MAIN, LockOp::Waited);
    monitor(&h, MAIN, LockOp::Released);
    let summary = &h.state.thread_summaries().unwrap()[0];
    assert_eq!(summary.status, ThreadStatus::Running);
    assert!(summary.locks_held.is_empty());

    let events = h.events();
    assert_eq!(count(&events, "lock-operation"), 5);
    let ops: Vec<LockOp> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::LockOperation { op, lock } => {
                assert!(lock.is_in_model());
                Some(*op)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        ops,
        vec![LockOp::Contended, LockOp::Acquired, LockOp::Wait, LockOp::Waited, LockOp::Released]
    );
}

#[test]
fn threads_keep_independent_stacks() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    h.enter(WORKER, &[frame("app.B", "run", 1)]);
    h.enter(WORKER, &[frame("app.B", "loop", 5), frame("app.B", "run", 2)]);
    h.enter(MAIN, &[frame("app.A", "helper", 8), frame("app.A", "main", 3)]);
    h.enter(MAIN, &[frame("app.A", "inner", 9), frame("app.A", "helper", 8), frame("app.A", "main", 3)]);

    assert_eq!(h.state.mirrored_stack(MAIN).unwrap().len(), 3);
    assert_eq!(h.state.mirrored_stack(WORKER).unwrap().len(), 2);

    h.death(WORKER);
    let summaries = h.state.thread_summaries().unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].thread, MAIN);
    assert_eq!(summaries[0].depth, 3);
    assert_eq!(summaries[0].in_model_depth, 3);
    assert_eq!(summaries[1].status, ThreadStatus::Ended);
    assert_eq!(summaries[1].depth, 0);

    let events = h.events();
    let worker: Vec<&TraceEvent> = events.iter().filter(|e| e.thread == Some(WORKER)).collect();
    assert_eq!(worker.last().unwrap().name(), "thread-end");
    assert_eq!(worker.iter().filter(|e| e.name() == "method-exit").count(), 2);
    assert_eq!(count(&events, "thread-end"), 1);
}

#[test]
fn vm_death_ends_every_thread_then_exits() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    h.enter(WORKER, &[frame("app.B", "run", 1)]);
    assert_eq!(h.state.handle(Notification::VmDeath).unwrap(), Outcome::Processed);

    let events = h.events();
    assert_eq!(events.last().unwrap().name(), "system-exit");
    assert!(events.last().unwrap().thread.is_none());
    assert_eq!(count(&events, "thread-end"), 2);
    assert_eq!(count(&events, "method-call"), count(&events, "method-exit"));
    assert!(events
        .iter()
        .filter(|e| e.name() == "thread-end")
        .all(|e| e.synthetic));
    assert!(h
        .state
        .thread_summaries()
        .unwrap()
        .iter()
        .all(|s| s.status == ThreadStatus::Ended));
}

#[test]
fn ended_thread_history_keeps_the_most_recent() {
    let config = EngineConfig {
        ended_thread_history: 2,
        ..EngineConfig::default()
    };
    let h = Harness::with_config(config, app_filter(), StaticSchema::new());

    for n in 1..=4 {
        let t = ThreadId(n);
        h.enter(t, &[frame("app.A", "run", 1)]);
        h.death(t);
    }
    h.enter(ThreadId(9), &[frame("app.A", "run", 1)]);

    let threads: Vec<ThreadId> = h.state.thread_summaries().unwrap().iter().map(|s| s.thread).collect();
    assert_eq!(threads, vec![ThreadId(3), ThreadId(4), ThreadId(9)]);
}

#[test]
fn destroyed_objects_are_announced_once() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "run", 1).with_receiver(RawObject::ordinary(3, "app.A"))]);
    h.exit(
        MAIN,
        &[frame("app.A", "run", 2).with_receiver(RawObject::ordinary(3, "app.A"))],
        stackmirror::RawValue::Void,
    );

    let destroyed = Notification::ObjectDestroyed { object: ObjectId(3) };
    assert_eq!(h.state.handle(destroyed.clone()).unwrap(), Outcome::Processed);
    assert_eq!(h.state.handle(destroyed).unwrap(), Outcome::Filtered);

    let events = h.events();
    let created = events
        .iter()
        .find_map(|e| match e.kind {
            EventKind::NewObject { contour, .. } => Some(contour),
            _ => None,
        })
        .unwrap();
    let gone: Vec<&TraceEvent> = events.iter().filter(|e| e.name() == "destroy-object").collect();
    assert_eq!(gone.len(), 1);
    assert!(matches!(gone[0].kind, EventKind::DestroyObject { contour, .. } if contour == created));
    assert_eq!(h.state.contour_counts().unwrap().1, 0);
}

#[test]
fn prepared_types_are_loaded_super_first() {
    let schema = StaticSchema::new();
    schema.add_type(TypeSchema::new("app.Base")).unwrap();
    schema.add_type(TypeSchema::new("app.Derived").extends("app.Base")).unwrap();
    schema.add_type(TypeSchema::new("app.Leaf").extends("app.Derived")).unwrap();
    let h = Harness::new(app_filter(), schema);

    let prepared = |name: &str| {
        h.state
            .handle(Notification::ClassPrepared {
                type_key: TypeKey::new(name),
            })
            .unwrap()
    };
    assert_eq!(prepared("app.Leaf"), Outcome::Processed);
    assert_eq!(prepared("app.Leaf"), Outcome::Processed);
    assert_eq!(prepared("lib.Other"), Outcome::Filtered);

    let loads: Vec<(String, bool)> = h
        .events()
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::TypeLoad {
                type_key,
                super_contour,
                ..
            } => Some((type_key.to_string(), super_contour.is_some())),
            _ => None,
        })
        .collect();
    assert_eq!(
        loads,
        vec![
            ("app.Base".to_string(), false),
            ("app.Derived".to_string(), true),
            ("app.Leaf".to_string(), true),
        ]
    );
}

#[test]
fn concurrent_threads_are_reconciled_independently() {
    let h = Arc::new(Harness::new(app_filter(), StaticSchema::new()));

    let workers: Vec<_> = (10..14)
        .map(|n| {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                let t = ThreadId(n);
                // Each thread keeps its own scripted stack in the shared source.
                for depth in 1..=5u32 {
                    let stack: Vec<_> = (0..depth)
                        .rev()
                        .map(|d| frame("app.W", &format!("level{d}"), d + 1))
                        .collect();
                    h.source.set_stack(t, stack.clone());
                    h.state
                        .handle(Notification::on(
                            t,
                            ThreadNotification::Entry {
                                location: common::loc(&stack[0]),
                            },
                        ))
                        .unwrap();
                }
                h.state.handle(Notification::on(t, ThreadNotification::Death)).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let events = h.events();
    for n in 10..14 {
        let mine: Vec<&TraceEvent> = events.iter().filter(|e| e.thread == Some(ThreadId(n))).collect();
        let calls = mine.iter().filter(|e| e.name() == "method-call").count();
        let exits = mine.iter().filter(|e| e.name() == "method-exit").count();
        assert_eq!((calls, exits), (5, 5));
        assert_eq!(mine.last().unwrap().name(), "thread-end");
    }
    // One type-load for the shared type, whichever thread got there first.
    assert_eq!(count(&events, "type-load"), 1);

    let mut announced = HashSet::new();
    for event in &events {
        for referenced in event.kind.referenced_contours() {
            assert!(announced.contains(&referenced), "{event} references unannounced {referenced}");
        }
        if let Some(id) = event.kind.introduced_contour() {
            announced.insert(id);
        }
    }
}
