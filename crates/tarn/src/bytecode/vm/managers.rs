//! `with` and `async with`.
//!
//! Both statements leave `[manager, exit]` below the protected region. The
//! region's handler and its normal exit meet at the exit instruction, with
//! either the raised exception or `None` on top.

use smallvec::smallvec;

use super::{ArgVec, Vm};
use crate::{
    builtins::Builtins,
    exception::{ExcType, RunError, RunResult},
    heap::HeapId,
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Method names of one flavor of the context manager protocol.
struct Protocol {
    enter: &'static str,
    exit: &'static str,
    label: &'static str,
}

const SYNC: Protocol = Protocol {
    enter: "__enter__",
    exit: "__exit__",
    label: "context manager",
};

const ASYNC: Protocol = Protocol {
    enter: "__aenter__",
    exit: "__aexit__",
    label: "asynchronous context manager",
};

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// `SetupWith`: `[manager] -> [manager, exit, entered]`.
    pub(super) fn setup_with(&mut self) -> RunResult<()> {
        let manager = self.pop()?;
        let (enter, exit) = self.manager_methods(manager, &SYNC)?;
        let entered = self.call_sync(enter, ArgVec::new(), Vec::new())?;
        self.push(manager);
        self.push(exit);
        self.push(entered);
        Ok(())
    }

    /// `ExitWith`: `[manager, exit, exc_or_none] -> []`.
    ///
    /// The exception is the handled one while `exit` runs. A true result
    /// swallows it; anything `exit` raises is chained to it.
    pub(super) fn exit_with(&mut self) -> RunResult<()> {
        let exc = self.pop()?;
        let exit = self.pop()?;
        self.pop()?;
        let Value::Ref(id) = exc else {
            self.call_sync(exit, exit_args(None), Vec::new())?;
            return Ok(());
        };
        let exc_type = self.exception_type(id)?;
        let saved = self.exc_slots.last().copied().flatten();
        if let Some(slot) = self.exc_slots.last_mut() {
            *slot = Some(id);
        }
        let result = self.call_sync(exit, exit_args(Some((exc_type, exc))), Vec::new());
        if let Some(slot) = self.exc_slots.last_mut() {
            *slot = saved;
        }
        match result {
            Ok(suppress) if suppress.is_truthy(self.heap) => Ok(()),
            Ok(_) => Err(RunError::reraised(id)),
            Err(err) => Err(self.chain_error(err, id)),
        }
    }

    /// `SetupAsyncWith`: `[manager] -> [manager, aexit, awaitable]`.
    pub(super) fn setup_async_with(&mut self) -> RunResult<()> {
        let manager = self.pop()?;
        let (enter, exit) = self.manager_methods(manager, &ASYNC)?;
        let awaitable = self.call_sync(enter, ArgVec::new(), Vec::new())?;
        self.push(manager);
        self.push(exit);
        self.push(awaitable);
        Ok(())
    }

    /// `GetAExitCoro`: `[manager, aexit, exc_or_none] -> [exc_or_none, awaitable]`.
    pub(super) fn get_aexit_coro(&mut self) -> RunResult<()> {
        let exc = self.pop()?;
        let exit = self.pop()?;
        self.pop()?;
        let args = match exc {
            Value::Ref(id) => exit_args(Some((self.exception_type(id)?, exc))),
            _ => exit_args(None),
        };
        let awaitable = self.call_sync(exit, args, Vec::new())?;
        self.push(exc);
        self.push(awaitable);
        Ok(())
    }

    /// `ExitAsyncWith`: `[exc_or_none, result] -> []`.
    pub(super) fn exit_async_with(&mut self) -> RunResult<()> {
        let result = self.pop()?;
        let exc = self.pop()?;
        match exc {
            Value::Ref(_) if !result.is_truthy(self.heap) => Err(RunError::reraised(self.exception_id(exc)?)),
            _ => Ok(()),
        }
    }

    /// Looks up the enter and exit methods, enter first.
    fn manager_methods(&mut self, manager: Value, protocol: &Protocol) -> RunResult<(Value, Value)> {
        let enter = self.manager_method(manager, protocol.enter, protocol, false)?;
        let exit = self.manager_method(manager, protocol.exit, protocol, true)?;
        Ok((enter, exit))
    }

    fn manager_method(&mut self, manager: Value, name: &str, protocol: &Protocol, is_exit: bool) -> RunResult<Value> {
        match self.load_attr(manager, name) {
            Err(err) if self.error_is(&err, ExcType::AttributeError) => {
                let type_name = manager.type_name(self.heap);
                let missed = if is_exit {
                    format!(" (missed {name} method)")
                } else {
                    String::new()
                };
                Err(ExcType::type_error(format!(
                    "'{type_name}' object does not support the {} protocol{missed}",
                    protocol.label
                )))
            }
            other => other,
        }
    }

    fn exception_type(&self, id: HeapId) -> RunResult<Value> {
        self.heap
            .exception(id)
            .map(|exc| Value::Builtin(Builtins::ExcType(exc.exc_type)))
            .ok_or_else(|| RunError::internal("exit called with a non-exception"))
    }
}

/// `(type, value, traceback)`; tracebacks are not objects, so the third is `None`.
fn exit_args(raised: Option<(Value, Value)>) -> ArgVec {
    match raised {
        Some((exc_type, exc)) => smallvec![exc_type, exc, Value::None],
        None => smallvec![Value::None, Value::None, Value::None],
    }
}
