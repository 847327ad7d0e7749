mod common;

use stackmirror::{EventKind, Location, MethodKey, RawFrame, RawObject, RawValue, StaticSchema, ThreadNotification, TraceEvent};

use common::{app_filter, count, frame, Harness, MAIN};

fn throw(h: &Harness, stack: &[RawFrame], catch: Option<(&str, &str, u32)>) {
    let location = common::loc(&stack[0]);
    h.handle(
        MAIN,
        stack,
        ThreadNotification::Exception {
            location,
            exception: RawObject::ordinary(500, "lib.Boom"),
            catch_location: catch.map(|(owner, name, line)| Location::new(MethodKey::new(owner, name), Some(line))),
        },
    );
}

fn unwinding(events: &[TraceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ExceptionThrow { frame_popped, .. } => Some(format!("throw popped={frame_popped}")),
            EventKind::ExceptionCatch { .. } => Some("catch".to_string()),
            EventKind::MethodExit {
                method, exceptional, ..
            } => Some(format!("exit {} exceptional={exceptional}", method.name)),
            _ => None,
        })
        .collect()
}

#[test]
fn exception_caught_out_of_model_clears_in_flight() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    let stack = [frame("app.A", "work", 30), frame("lib.Runner", "run", 10), frame("app.A", "main", 2)];
    h.enter(MAIN, &stack);
    throw(
        &h,
        &[frame("app.A", "work", 31), frame("lib.Runner", "run", 10), frame("app.A", "main", 2)],
        Some(("lib.Runner", "run", 11)),
    );

    // Runner handles it and calls back into the model.
    let after = [frame("app.A", "after", 40), frame("lib.Runner", "run", 11), frame("app.A", "main", 2)];
    h.enter(MAIN, &after);
    h.exit(MAIN, &after, RawValue::Void);

    let events = h.events();
    assert_eq!(count(&events, "exception-throw"), 1);
    assert_eq!(count(&events, "exception-catch"), 0);
    assert_eq!(
        unwinding(&events),
        vec![
            "throw popped=true",
            "exit work exceptional=true",
            "exit after exceptional=false",
        ]
    );

    let thrower = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ExceptionThrow { thrower, .. } => Some(thrower.clone()),
            _ => None,
        })
        .unwrap();
    assert!(thrower.is_in_model());
}

#[test]
fn exception_caught_in_throwing_frame() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    throw(&h, &[frame("app.A", "main", 5)], Some(("app.A", "main", 7)));
    h.step(MAIN, &[frame("app.A", "main", 7)]);

    let events = h.events();
    assert_eq!(unwinding(&events), vec!["throw popped=false", "catch"]);
    let catch = events.iter().find(|e| e.name() == "exception-catch").unwrap();
    assert_eq!(catch.line, Some(7));
    assert!(!catch.synthetic);
    assert_eq!(h.state.mirrored_stack(MAIN).unwrap().len(), 1);
}

#[test]
fn exception_unwinds_through_in_model_frames() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    h.enter(MAIN, &[frame("app.A", "mid", 10), frame("app.A", "main", 2)]);
    h.enter(
        MAIN,
        &[frame("app.A", "leaf", 20), frame("app.A", "mid", 11), frame("app.A", "main", 2)],
    );
    throw(
        &h,
        &[frame("app.A", "leaf", 21), frame("app.A", "mid", 11), frame("app.A", "main", 2)],
        Some(("app.A", "main", 3)),
    );
    h.step(MAIN, &[frame("app.A", "main", 3)]);

    let events = h.events();
    assert_eq!(
        unwinding(&events),
        vec![
            "throw popped=true",
            "exit leaf exceptional=true",
            "throw popped=true",
            "exit mid exceptional=true",
            "catch",
        ]
    );
    // Everything after the original throw was manufactured.
    let first_throw = events.iter().position(|e| e.name() == "exception-throw").unwrap();
    assert!(events[first_throw + 1..]
        .iter()
        .filter(|e| e.name() != "variable-assign")
        .all(|e| e.synthetic));
    assert_eq!(count(&events, "method-returned"), 0);
}

#[test]
fn uncaught_exception_unwinds_at_thread_death() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    h.enter(MAIN, &[frame("app.A", "leaf", 20), frame("app.A", "main", 2)]);
    throw(&h, &[frame("app.A", "leaf", 21), frame("app.A", "main", 2)], None);
    h.death(MAIN);

    let events = h.events();
    assert_eq!(
        unwinding(&events),
        vec![
            "throw popped=true",
            "exit leaf exceptional=true",
            "throw popped=true",
            "exit main exceptional=true",
        ]
    );
    assert_eq!(count(&events, "method-call"), count(&events, "method-exit"));
    assert_eq!(events.last().unwrap().name(), "thread-end");
}

#[test]
fn exception_values_render_out_of_model() {
    let h = Harness::new(app_filter(), StaticSchema::new());

    h.enter(MAIN, &[frame("app.A", "main", 1)]);
    throw(&h, &[frame("app.A", "main", 5)], Some(("app.A", "main", 6)));

    let events = h.events();
    let exception = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ExceptionThrow { exception, .. } => Some(exception.clone()),
            _ => None,
        })
        .unwrap();
    assert!(!exception.is_in_model());
    assert!(exception.to_string().contains("lib.Boom"));
}
