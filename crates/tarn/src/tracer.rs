//! Trace and profile hooks.
//!
//! A [`Runtime`](crate::Runtime) carries one optional *trace* hook and one
//! optional *profile* hook, the per-thread pair of callbacks a debugger or
//! profiler installs. Hooks receive a [`FrameView`] of the activation, the
//! [`TraceEvent`] kind and an event argument:
//!
//! | Event | Argument | Trace hook | Profile hook |
//! |-------|----------|------------|--------------|
//! | `call` | `None` | yes | yes |
//! | `line` | `None` | if the call answer was [`LocalTrace::Keep`] | no |
//! | `return` | returned or yielded value, `None` when unwinding | if kept | yes |
//! | `exception` | `(type, exception, traceback)` | if kept | no |
//!
//! When neither hook is installed the interpreter loop skips all of this; the
//! frame view and its locals are only built for a hook that is about to run.
//!
//! Stock hooks:
//!
//! | Hook | Purpose |
//! |------|---------|
//! | [`RecordingHook`] | Bounded in-memory event log |
//! | [`LogHook`] | Emits every event through `tracing` |
//! | [`ProfilingHook`] | Per-function call counts and per-line hit counts |
//! | [`CoverageHook`] | Set of executed `(code name, line)` pairs |

use std::{any::Any, fmt};

use ahash::{AHashMap, AHashSet};
use strum::{Display, IntoStaticStr};

use crate::{exception::Exception, object::Object};

/// Kind of instrumentation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum TraceEvent {
    Call,
    Line,
    Return,
    Exception,
}

/// A hook's answer to an event.
///
/// The answer to a `call` event decides whether the new activation receives
/// `line`, `return` and `exception` events. `Off` on a later event stops them
/// for the rest of the activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalTrace {
    #[default]
    Keep,
    Off,
}

/// A trace or profile callback.
///
/// Returning an error raises that exception at the traced location, replacing
/// any exception being traced, and uninstalls the hook.
pub trait TraceHook: Any {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, arg: &Object) -> Result<LocalTrace, Exception>;
}

/// Reflective view of an activation, handed to hooks.
///
/// Locals are materialized on the first call to [`FrameView::locals`].
/// Assignments made with [`FrameView::set_local`] are written back into the
/// activation before it continues.
pub struct FrameView<'a> {
    name: &'a str,
    qualname: &'a str,
    line: Option<u32>,
    depth: usize,
    source: &'a dyn Fn() -> Vec<(String, Object)>,
    locals: Option<Vec<(String, Object)>>,
    writes: Vec<(String, Object)>,
}

impl<'a> FrameView<'a> {
    pub(crate) fn new(
        name: &'a str,
        qualname: &'a str,
        line: Option<u32>,
        depth: usize,
        source: &'a dyn Fn() -> Vec<(String, Object)>,
    ) -> Self {
        Self {
            name,
            qualname,
            line,
            depth,
            source,
            locals: None,
            writes: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    #[must_use]
    pub fn qualname(&self) -> &str {
        self.qualname
    }

    /// Source line of the current instruction.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Number of activations on the stack, this one included.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Bound local, cell and free variables, in slot order.
    pub fn locals(&mut self) -> &[(String, Object)] {
        let source = self.source;
        self.locals.get_or_insert_with(source)
    }

    pub fn local(&mut self, name: &str) -> Option<&Object> {
        self.locals().iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Rebinds a local, cell or free variable of the activation.
    ///
    /// Names the code unit does not declare are ignored.
    pub fn set_local(&mut self, name: impl Into<String>, value: Object) {
        let name = name.into();
        if let Some(locals) = &mut self.locals {
            match locals.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value.clone(),
                None => locals.push((name.clone(), value.clone())),
            }
        }
        self.writes.push((name, value));
    }

    /// True once the locals have been built.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.locals.is_some()
    }

    pub(crate) fn into_writes(self) -> Vec<(String, Object)> {
        self.writes
    }
}

impl fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameView")
            .field("qualname", &self.qualname)
            .field("line", &self.line)
            .field("depth", &self.depth)
            .field("locals", &self.locals)
            .finish_non_exhaustive()
    }
}

/// Which of the two hooks an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookSlot {
    Trace,
    Profile,
}

/// Instrumentation bookkeeping for one activation.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct InstrumentationData {
    /// Receives local events from the trace hook.
    pub traced: bool,
    /// Line of the last `line` event; cleared on backward jumps.
    pub past_line: Option<u32>,
}

/// Hooks and per-activation bookkeeping for one logical thread.
#[derive(Default)]
pub(crate) struct ThreadState {
    trace: Option<Box<dyn TraceHook>>,
    profile: Option<Box<dyn TraceHook>>,
    frames: Vec<InstrumentationData>,
    next_serial: u64,
}

impl ThreadState {
    pub fn hook(&self, slot: HookSlot) -> Option<&(dyn TraceHook + 'static)> {
        match slot {
            HookSlot::Trace => self.trace.as_deref(),
            HookSlot::Profile => self.profile.as_deref(),
        }
    }

    pub fn hook_mut(&mut self, slot: HookSlot) -> Option<&mut (dyn TraceHook + 'static)> {
        match slot {
            HookSlot::Trace => self.trace.as_deref_mut(),
            HookSlot::Profile => self.profile.as_deref_mut(),
        }
    }

    /// Installs `hook`, returning the one it replaces.
    pub fn replace(&mut self, slot: HookSlot, hook: Option<Box<dyn TraceHook>>) -> Option<Box<dyn TraceHook>> {
        match slot {
            HookSlot::Trace => std::mem::replace(&mut self.trace, hook),
            HookSlot::Profile => std::mem::replace(&mut self.profile, hook),
        }
    }

    /// Takes the hook out for the duration of a callback.
    pub fn take(&mut self, slot: HookSlot) -> Option<Box<dyn TraceHook>> {
        self.replace(slot, None)
    }

    /// Puts a hook back after a callback, unless another was installed meanwhile.
    pub fn restore(&mut self, slot: HookSlot, hook: Box<dyn TraceHook>) {
        let target = match slot {
            HookSlot::Trace => &mut self.trace,
            HookSlot::Profile => &mut self.profile,
        };
        if target.is_none() {
            *target = Some(hook);
        }
    }

    pub fn has(&self, slot: HookSlot) -> bool {
        self.hook(slot).is_some()
    }

    pub fn is_active(&self) -> bool {
        self.trace.is_some() || self.profile.is_some()
    }

    pub fn push_frame(&mut self) {
        self.frames.push(InstrumentationData::default());
    }

    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn top(&self) -> Option<&InstrumentationData> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut InstrumentationData> {
        self.frames.last_mut()
    }

    /// Identity for a new activation, unique for the life of the runtime.
    pub fn next_serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("trace", &self.trace.is_some())
            .field("profile", &self.profile.is_some())
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RecordingHook
// ============================================================================

/// One event captured by [`RecordingHook`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event: TraceEvent,
    /// Qualified name of the activation's code unit.
    pub name: String,
    pub line: Option<u32>,
    pub depth: usize,
    pub arg: Object,
}

/// Records every event it receives, up to an optional limit.
#[derive(Debug, Default)]
pub struct RecordingHook {
    events: Vec<RecordedEvent>,
    limit: Option<usize>,
    dropped: usize,
}

impl RecordingHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hook that keeps the first `limit` events and counts the rest.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
            dropped: 0,
        }
    }

    #[must_use]
    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<RecordedEvent> {
        self.events
    }

    /// Number of events discarded after the limit was reached.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// `(event, name, line)` triples, convenient for assertions.
    #[must_use]
    pub fn summary(&self) -> Vec<(TraceEvent, String, Option<u32>)> {
        self.events.iter().map(|e| (e.event, e.name.clone(), e.line)).collect()
    }
}

impl TraceHook for RecordingHook {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, arg: &Object) -> Result<LocalTrace, Exception> {
        if self.limit.is_some_and(|limit| self.events.len() >= limit) {
            self.dropped += 1;
        } else {
            self.events.push(RecordedEvent {
                event,
                name: frame.qualname().to_owned(),
                line: frame.line(),
                depth: frame.depth(),
                arg: arg.clone(),
            });
        }
        Ok(LocalTrace::Keep)
    }
}

// ============================================================================
// LogHook
// ============================================================================

/// Emits each event as a `tracing` event at `DEBUG` level under the `tarn::trace` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHook;

impl TraceHook for LogHook {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, arg: &Object) -> Result<LocalTrace, Exception> {
        let event: &'static str = event.into();
        tracing::debug!(
            target: "tarn::trace",
            event,
            code = frame.qualname(),
            line = frame.line(),
            depth = frame.depth(),
            %arg,
        );
        Ok(LocalTrace::Keep)
    }
}

// ============================================================================
// ProfilingHook
// ============================================================================

/// Counts calls per function and hits per source line.
///
/// Installed as the profile hook it only sees calls and returns; installed as
/// the trace hook it also counts line hits.
#[derive(Debug, Default)]
pub struct ProfilingHook {
    calls: AHashMap<String, u64>,
    lines: AHashMap<(String, u32), u64>,
    max_depth: usize,
    events: u64,
}

/// Summary produced by [`ProfilingHook::report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingReport {
    /// Call counts per function, most called first.
    pub calls: Vec<(String, u64)>,
    /// Hit counts per `(function, line)`, hottest first.
    pub lines: Vec<((String, u32), u64)>,
    pub max_depth: usize,
    pub total_events: u64,
}

impl ProfilingHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut calls: Vec<_> = self.calls.iter().map(|(k, v)| (k.clone(), *v)).collect();
        calls.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut lines: Vec<_> = self.lines.iter().map(|(k, v)| (k.clone(), *v)).collect();
        lines.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ProfilingReport {
            calls,
            lines,
            max_depth: self.max_depth,
            total_events: self.events,
        }
    }
}

impl TraceHook for ProfilingHook {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, _arg: &Object) -> Result<LocalTrace, Exception> {
        self.events += 1;
        self.max_depth = self.max_depth.max(frame.depth());
        match event {
            TraceEvent::Call => *self.calls.entry(frame.qualname().to_owned()).or_insert(0) += 1,
            TraceEvent::Line => {
                if let Some(line) = frame.line() {
                    *self.lines.entry((frame.qualname().to_owned(), line)).or_insert(0) += 1;
                }
            }
            TraceEvent::Return | TraceEvent::Exception => {}
        }
        Ok(LocalTrace::Keep)
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Profile ===")?;
        writeln!(f, "Events:         {}", self.total_events)?;
        writeln!(f, "Max call depth: {}", self.max_depth)?;
        writeln!(f)?;
        writeln!(f, "--- Calls ---")?;
        for (name, count) in &self.calls {
            writeln!(f, "  {name:<30} {count:>10}")?;
        }
        if !self.lines.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Lines ---")?;
            for ((name, line), count) in &self.lines {
                writeln!(f, "  {:<30} {count:>10}", format!("{name}:{line}"))?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// CoverageHook
// ============================================================================

/// Records which source lines of which code units ran.
#[derive(Debug, Default)]
pub struct CoverageHook {
    lines: AHashSet<(String, u32)>,
}

impl CoverageHook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn covered_lines(&self) -> &AHashSet<(String, u32)> {
        &self.lines
    }

    #[must_use]
    pub fn is_covered(&self, qualname: &str, line: u32) -> bool {
        self.lines.contains(&(qualname.to_owned(), line))
    }

    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.lines.len()
    }
}

impl TraceHook for CoverageHook {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, _arg: &Object) -> Result<LocalTrace, Exception> {
        if event == TraceEvent::Line
            && let Some(line) = frame.line()
        {
            self.lines.insert((frame.qualname().to_owned(), line));
        }
        Ok(LocalTrace::Keep)
    }
}
