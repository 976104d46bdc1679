//! Trace and profile hooks observing execution.

mod common;

use std::sync::Arc;

use common::{define, function, module, raise_new, runtime};
use pretty_assertions::assert_eq;
use tarn::{
    CodeUnit, Constant, CoverageHook, ExcType, Exception, FrameView, LocalTrace, Object, Opcode, ProfilingHook,
    RecordingHook, TraceEvent, TraceHook,
};

/// ```text
/// 1  def f(n):
/// 11     n = n + 1
/// 12     m = n
/// 13     return m
/// 2  r = f(3)
/// 3  return r
/// ```
fn program() -> Arc<CodeUnit> {
    let f = function("f", &["n"], |b| {
        b.set_line(11);
        b.emit_load_local(0);
        b.emit_load_int(1);
        b.emit(Opcode::BinaryAdd);
        b.emit_store_local(0);
        b.set_line(12);
        let m = b.add_varname("m");
        b.emit_load_local(0);
        b.emit_store_local(m);
        b.set_line(13);
        b.emit_load_local(m);
        b.emit(Opcode::ReturnValue);
    });
    module(|b| {
        define(b, "f", f);
        b.set_line(2);
        common::call_global(b, "f", &[3]);
        b.emit_store_global("r");
        b.set_line(3);
        b.emit_load_global("r");
        b.emit(Opcode::ReturnValue);
    })
}

fn event(kind: TraceEvent, name: &str, line: u32) -> (TraceEvent, String, Option<u32>) {
    (kind, name.to_owned(), Some(line))
}

#[test]
fn trace_hook_sees_calls_lines_and_returns() {
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(RecordingHook::new())));
    assert_eq!(rt.run(&program()).unwrap(), Object::Int(4));

    let hook = rt.trace_hook::<RecordingHook>().unwrap();
    assert_eq!(
        hook.summary(),
        vec![
            event(TraceEvent::Call, "<module>", 1),
            event(TraceEvent::Line, "<module>", 1),
            event(TraceEvent::Line, "<module>", 2),
            event(TraceEvent::Call, "f", 11),
            event(TraceEvent::Line, "f", 11),
            event(TraceEvent::Line, "f", 12),
            event(TraceEvent::Line, "f", 13),
            event(TraceEvent::Return, "f", 13),
            event(TraceEvent::Line, "<module>", 3),
            event(TraceEvent::Return, "<module>", 3),
        ]
    );
    let f_return = &hook.events()[7];
    assert_eq!(f_return.arg, Object::Int(4));
    assert_eq!(f_return.depth, 2);
}

#[test]
fn profile_hook_sees_only_calls_and_returns() {
    let mut rt = runtime();
    rt.set_profile(Some(Box::new(RecordingHook::new())));
    rt.run(&program()).unwrap();
    let kinds: Vec<(TraceEvent, String)> = rt
        .profile_hook::<RecordingHook>()
        .unwrap()
        .events()
        .iter()
        .map(|e| (e.event, e.name.clone()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (TraceEvent::Call, "<module>".to_owned()),
            (TraceEvent::Call, "f".to_owned()),
            (TraceEvent::Return, "f".to_owned()),
            (TraceEvent::Return, "<module>".to_owned()),
        ]
    );
}

#[test]
fn profiling_report_counts_calls() {
    let mut rt = runtime();
    rt.set_profile(Some(Box::new(ProfilingHook::new())));
    rt.run(&program()).unwrap();
    rt.run(&program()).unwrap();
    let report = rt.profile_hook::<ProfilingHook>().unwrap().report();
    assert_eq!(report.calls, vec![("<module>".to_owned(), 2), ("f".to_owned(), 2)]);
    assert!(report.lines.is_empty());
    assert_eq!(report.max_depth, 2);
    assert_eq!(report.total_events, 8);
}

#[test]
fn coverage_hook_collects_executed_lines() {
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(CoverageHook::new())));
    rt.run(&program()).unwrap();
    let coverage = rt.trace_hook::<CoverageHook>().unwrap();
    assert_eq!(coverage.coverage_count(), 6);
    assert!(coverage.is_covered("f", 11));
    assert!(coverage.is_covered("f", 13));
    assert!(coverage.is_covered("<module>", 3));
    assert!(!coverage.is_covered("f", 10));
}

/// A backward jump re-arms the line event for the loop header.
#[test]
fn loop_headers_report_a_line_per_iteration() {
    let code = module(|b| {
        b.emit_load_const(Constant::Tuple(vec![Constant::Int(1), Constant::Int(2)]));
        b.emit(Opcode::GetIter);
        b.set_line(2);
        let top = b.current_offset();
        let exit = b.emit_jump(Opcode::ForIter);
        b.set_line(3);
        b.emit_store_global("x");
        b.emit_jump_to(Opcode::Jump, top);
        b.patch_jump(exit);
        b.set_stack_depth(0);
        b.set_line(4);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(RecordingHook::new())));
    rt.run(&code).unwrap();
    let lines: Vec<u32> = rt
        .trace_hook::<RecordingHook>()
        .unwrap()
        .events()
        .iter()
        .filter(|e| e.event == TraceEvent::Line)
        .filter_map(|e| e.line)
        .collect();
    assert_eq!(lines, vec![1, 2, 3, 2, 3, 2, 4]);
}

/// Stops local events for any activation named `skip`.
struct SkipFunction {
    skip: &'static str,
    seen: Vec<(TraceEvent, String)>,
}

impl TraceHook for SkipFunction {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, _arg: &Object) -> Result<LocalTrace, Exception> {
        self.seen.push((event, frame.qualname().to_owned()));
        if event == TraceEvent::Call && frame.qualname() == self.skip {
            Ok(LocalTrace::Off)
        } else {
            Ok(LocalTrace::Keep)
        }
    }
}

#[test]
fn declining_a_call_silences_that_activation() {
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(SkipFunction {
        skip: "f",
        seen: Vec::new(),
    })));
    rt.run(&program()).unwrap();
    let seen = &rt.trace_hook::<SkipFunction>().unwrap().seen;
    let in_f: Vec<TraceEvent> = seen.iter().filter(|(_, name)| name == "f").map(|(e, _)| *e).collect();
    assert_eq!(in_f, vec![TraceEvent::Call]);
    assert_eq!(seen.last(), Some(&(TraceEvent::Return, "<module>".to_owned())));
}

/// Rewrites `n` when `f` reaches line 12.
struct Rebind;

impl TraceHook for Rebind {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, _arg: &Object) -> Result<LocalTrace, Exception> {
        if event == TraceEvent::Line && frame.qualname() == "f" && frame.line() == Some(12) {
            assert_eq!(frame.local("n"), Some(&Object::Int(4)));
            frame.set_local("n", Object::Int(100));
        }
        Ok(LocalTrace::Keep)
    }
}

#[test]
fn hooks_can_rebind_locals() {
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(Rebind)));
    assert_eq!(rt.run(&program()).unwrap(), Object::Int(100));
}

/// Fails on the first event matching `event` in `name`.
struct Failing {
    event: TraceEvent,
    name: &'static str,
}

impl TraceHook for Failing {
    fn on_event(&mut self, frame: &mut FrameView<'_>, event: TraceEvent, _arg: &Object) -> Result<LocalTrace, Exception> {
        if event == self.event && frame.qualname() == self.name {
            return Err(Exception::new(ExcType::ValueError, Some("hook failed".to_owned())));
        }
        Ok(LocalTrace::Keep)
    }
}

#[test]
fn failing_hook_raises_in_place_and_is_uninstalled() {
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(Failing {
        event: TraceEvent::Line,
        name: "f",
    })));
    let err = rt.run(&program()).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("hook failed"));
    let names: Vec<&str> = err.traceback().iter().map(|frame| frame.name.as_str()).collect();
    assert_eq!(names, vec!["<module>", "f"]);
    assert!(rt.trace_hook::<Failing>().is_none());

    assert_eq!(rt.run(&program()).unwrap(), Object::Int(4));
}

/// A failing `call` event never enters the callee.
#[test]
fn failing_call_hook_raises_in_the_caller() {
    let mut rt = runtime();
    rt.set_profile(Some(Box::new(Failing {
        event: TraceEvent::Call,
        name: "f",
    })));
    let err = rt.run(&program()).unwrap_err();
    assert_eq!(err.message(), Some("hook failed"));
    assert_eq!(
        err.traceback(),
        &[tarn::StackFrame {
            name: "<module>".to_owned(),
            line: Some(2),
        }]
    );
    assert!(rt.profile_hook::<Failing>().is_none());
}

#[test]
fn exception_events_carry_type_value_and_traceback() {
    let fail = function("fail", &[], |b| {
        b.set_line(11);
        raise_new(b, "KeyError", "missing");
    });
    let code = module(|b| {
        define(b, "fail", fail);
        b.set_line(2);
        common::call_global(b, "fail", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(RecordingHook::new())));
    rt.run(&code).unwrap_err();
    let hook = rt.trace_hook::<RecordingHook>().unwrap();
    let exceptions: Vec<_> = hook.events().iter().filter(|e| e.event == TraceEvent::Exception).collect();
    assert_eq!(exceptions.len(), 2);

    let Object::Tuple(parts) = &exceptions[0].arg else {
        panic!("exception argument is a tuple: {:?}", exceptions[0].arg);
    };
    assert_eq!(parts[0], Object::ExcType(ExcType::KeyError));
    let Object::Exception(exc) = &parts[1] else {
        panic!("second item is the exception");
    };
    assert_eq!(exc.message(), Some("missing"));
    assert_eq!(
        parts[2],
        Object::List(vec![Object::Tuple(vec![
            Object::String("fail".to_owned()),
            Object::Int(11)
        ])])
    );
    assert_eq!(exceptions[1].name, "<module>");

    // The unwinding frames report a `None` return.
    let returns: Vec<&Object> = hook
        .events()
        .iter()
        .filter(|e| e.event == TraceEvent::Return)
        .map(|e| &e.arg)
        .collect();
    assert_eq!(returns, vec![&Object::None, &Object::None]);
}

/// The recording limit keeps the first events and counts the rest.
#[test]
fn recording_limit_drops_overflow() {
    let mut rt = runtime();
    rt.set_trace(Some(Box::new(RecordingHook::with_limit(3))));
    rt.run(&program()).unwrap();
    let hook = rt.trace_hook::<RecordingHook>().unwrap();
    assert_eq!(hook.events().len(), 3);
    assert_eq!(hook.dropped(), 7);
}

#[test]
fn replacing_a_hook_returns_the_previous_one() {
    let mut rt = runtime();
    assert!(rt.set_trace(Some(Box::new(RecordingHook::new()))).is_none());
    rt.run(&program()).unwrap();
    let previous = rt.set_trace(None).unwrap();
    let previous: Box<dyn std::any::Any> = previous;
    let recording = previous.downcast::<RecordingHook>().unwrap();
    assert_eq!(recording.events().len(), 10);
}
