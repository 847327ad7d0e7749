#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use stackmirror::{
    EngineConfig, EventStream, ExecutionState, Line, Location, MethodKey, ModelFilter, Notification, Outcome,
    PatternModelFilter, RawFrame, RawValue, SourceError, StackSource, StaticSchema, ThreadId, ThreadNotification,
    TraceEvent,
};

pub const MAIN: ThreadId = ThreadId(1);
pub const WORKER: ThreadId = ThreadId(2);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A monitoring source whose real stacks are set by the test.
#[derive(Default)]
pub struct ScriptedSource {
    stacks: Mutex<HashMap<ThreadId, Vec<RawFrame>>>,
    failing: Mutex<HashSet<ThreadId>>,
}

impl ScriptedSource {
    pub fn set_stack(&self, thread: ThreadId, frames: Vec<RawFrame>) {
        self.stacks.lock().unwrap().insert(thread, frames);
    }

    pub fn fail(&self, thread: ThreadId) {
        self.failing.lock().unwrap().insert(thread);
    }

    pub fn recover(&self, thread: ThreadId) {
        self.failing.lock().unwrap().remove(&thread);
    }
}

impl StackSource for ScriptedSource {
    fn frames(&self, thread: ThreadId) -> Result<Vec<RawFrame>, SourceError> {
        if self.failing.lock().unwrap().contains(&thread) {
            return Err(SourceError::NotSuspended { thread });
        }
        Ok(self.stacks.lock().unwrap().get(&thread).cloned().unwrap_or_default())
    }
}

pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub state: ExecutionState,
    pub stream: EventStream,
}

impl Harness {
    pub fn new(filter: impl ModelFilter + 'static, schema: StaticSchema) -> Self {
        Self::with_config(EngineConfig::default(), filter, schema)
    }

    pub fn with_config(config: EngineConfig, filter: impl ModelFilter + 'static, schema: StaticSchema) -> Self {
        init_tracing();
        let source = Arc::new(ScriptedSource::default());
        let state = ExecutionState::new(
            config,
            Arc::clone(&source) as Arc<dyn StackSource>,
            Arc::new(schema),
            Arc::new(filter),
        )
        .unwrap();
        let (_, stream) = state.subscribe_stream().unwrap();
        Self { source, state, stream }
    }

    /// Sets the real stack (innermost first) and delivers `event`.
    pub fn handle(&self, thread: ThreadId, stack: &[RawFrame], event: ThreadNotification) -> Outcome {
        self.source.set_stack(thread, stack.to_vec());
        self.state.handle(Notification::on(thread, event)).unwrap()
    }

    pub fn enter(&self, thread: ThreadId, stack: &[RawFrame]) -> Outcome {
        self.handle(thread, stack, ThreadNotification::Entry { location: loc(&stack[0]) })
    }

    pub fn exit(&self, thread: ThreadId, stack: &[RawFrame], return_value: RawValue) -> Outcome {
        self.handle(
            thread,
            stack,
            ThreadNotification::Exit {
                location: loc(&stack[0]),
                return_value,
            },
        )
    }

    pub fn step(&self, thread: ThreadId, stack: &[RawFrame]) -> Outcome {
        self.handle(thread, stack, ThreadNotification::Step { location: loc(&stack[0]) })
    }

    pub fn death(&self, thread: ThreadId) -> Outcome {
        self.state.handle(Notification::on(thread, ThreadNotification::Death)).unwrap()
    }

    /// Everything delivered so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.state.flush(Duration::from_secs(5)).unwrap();
        self.stream.drain()
    }
}

pub fn frame(owner: &str, name: &str, line: Line) -> RawFrame {
    RawFrame::new(MethodKey::new(owner, name)).at_line(line)
}

pub fn loc(frame: &RawFrame) -> Location {
    Location::new(frame.method.clone(), frame.line)
}

pub fn app_filter() -> PatternModelFilter {
    PatternModelFilter::new([r"app\..*", r"int\[\]"], Vec::<&str>::new()).unwrap()
}

pub fn names(events: &[TraceEvent]) -> Vec<&'static str> {
    events.iter().map(TraceEvent::name).collect()
}

pub fn count(events: &[TraceEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

/// Names of the frame-structure events only.
pub fn calls_and_exits(events: &[TraceEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(TraceEvent::name)
        .filter(|n| matches!(*n, "method-call" | "method-entered" | "method-exit" | "method-returned"))
        .collect()
}
