//! Delivery of instrumentation events to the trace and profile hooks.

use tracing::warn;

use super::Vm;
use crate::{
    exception::RunResult,
    heap::{HeapData, HeapId},
    io::PrintWriter,
    object::{Object, exception_to_public},
    resource::ResourceTracker,
    tracer::{FrameView, HookSlot, LocalTrace, TraceEvent},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Delivers `call` for the activation just pushed.
    pub(super) fn fire_call(&mut self) -> RunResult<()> {
        if let Some(answer) = self.dispatch(HookSlot::Trace, TraceEvent::Call, &Object::None)?
            && let Some(data) = self.thread.top_mut()
        {
            data.traced = answer == LocalTrace::Keep;
        }
        self.dispatch(HookSlot::Profile, TraceEvent::Call, &Object::None)?;
        Ok(())
    }

    /// Delivers `line` when the current instruction starts a new source line.
    pub(super) fn trace_line(&mut self) -> RunResult<()> {
        let Some(data) = self.thread.top() else {
            return Ok(());
        };
        if !data.traced || !self.thread.has(HookSlot::Trace) {
            return Ok(());
        }
        let past_line = data.past_line;
        let frame = self.frame()?;
        let Some(line) = frame.code.line_for(frame.op_ip) else {
            return Ok(());
        };
        if past_line == Some(line) {
            return Ok(());
        }
        if let Some(data) = self.thread.top_mut() {
            data.past_line = Some(line);
        }
        self.local_event(TraceEvent::Line, &Object::None)
    }

    /// Delivers `return` for the activation about to be popped or suspended.
    pub(super) fn fire_return(&mut self, value: Value) -> RunResult<()> {
        if !self.thread.is_active() {
            return Ok(());
        }
        let arg = self.to_object(value);
        self.local_event(TraceEvent::Return, &arg)?;
        self.dispatch(HookSlot::Profile, TraceEvent::Return, &arg)?;
        Ok(())
    }

    /// Delivers `exception` with a `(type, value, traceback)` tuple.
    pub(super) fn fire_exception(&mut self, id: HeapId) -> RunResult<()> {
        if !self.thread.top().is_some_and(|data| data.traced) || !self.thread.has(HookSlot::Trace) {
            return Ok(());
        }
        let HeapData::Exception(exc) = self.heap.get(id) else {
            return Ok(());
        };
        let traceback = exc
            .traceback
            .iter()
            .map(|frame| {
                Object::Tuple(vec![
                    Object::String(frame.name.clone()),
                    frame.line.map_or(Object::None, |line| Object::Int(i64::from(line))),
                ])
            })
            .collect();
        let arg = Object::Tuple(vec![
            Object::ExcType(exc.exc_type),
            Object::Exception(Box::new(exception_to_public(id, self.heap, self.runtime_id))),
            Object::List(traceback),
        ]);
        self.local_event(TraceEvent::Exception, &arg)
    }

    /// Delivers a local event to the trace hook if the activation is traced.
    fn local_event(&mut self, event: TraceEvent, arg: &Object) -> RunResult<()> {
        if !self.thread.top().is_some_and(|data| data.traced) {
            return Ok(());
        }
        if self.dispatch(HookSlot::Trace, event, arg)? == Some(LocalTrace::Off)
            && let Some(data) = self.thread.top_mut()
        {
            data.traced = false;
        }
        Ok(())
    }

    /// Calls the hook in `slot`, if any, with a view of the current activation.
    ///
    /// The hook is taken out of its slot while it runs. On success it is put
    /// back and local assignments it made are written into the activation; on
    /// failure it stays uninstalled and its exception is raised here.
    fn dispatch(&mut self, slot: HookSlot, event: TraceEvent, arg: &Object) -> RunResult<Option<LocalTrace>> {
        let Some(mut hook) = self.thread.take(slot) else {
            return Ok(None);
        };
        let result;
        let writes;
        {
            let frame = self.frame()?;
            let heap = &*self.heap;
            let runtime_id = self.runtime_id;
            let source = || {
                let code = &frame.code;
                let mut locals = Vec::new();
                for (name, value) in code.varnames.iter().zip(&frame.locals) {
                    if *value != Value::Undefined {
                        locals.push((name.clone(), crate::object::to_object(*value, heap, runtime_id)));
                    }
                }
                for (index, cell) in frame.cells.iter().enumerate() {
                    if let HeapData::Cell(cell) = heap.get(*cell)
                        && let Some(value) = cell.get()
                        && let Some(name) = code.cell_name(index)
                    {
                        locals.push((name.to_owned(), crate::object::to_object(value, heap, runtime_id)));
                    }
                }
                locals
            };
            let mut view = FrameView::new(
                &frame.code.name,
                &frame.code.qualname,
                frame.code.line_for(frame.op_ip),
                self.frames.len(),
                &source,
            );
            result = hook.on_event(&mut view, event, arg);
            writes = view.into_writes();
        }
        match result {
            Ok(answer) => {
                self.thread.restore(slot, hook);
                self.apply_local_writes(writes)?;
                Ok(Some(answer))
            }
            Err(exc) => {
                warn!(?slot, %event, error = %exc, "hook raised; uninstalling it");
                Err(self.host_error(exc))
            }
        }
    }

    fn apply_local_writes(&mut self, writes: Vec<(String, Object)>) -> RunResult<()> {
        for (name, object) in writes {
            let value = self.from_object(object)?;
            let frame = self.frame_mut()?;
            if let Some(slot) = frame.code.varnames.iter().position(|n| *n == name) {
                frame.locals[slot] = value;
                continue;
            }
            let code = &frame.code;
            let cell_index = (0..frame.cells.len()).find(|&i| code.cell_name(i) == Some(name.as_str()));
            if let Some(index) = cell_index {
                let cell = frame.cells[index];
                self.cell(cell)?.set(value);
            }
        }
        Ok(())
    }
}
