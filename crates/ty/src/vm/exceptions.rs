//! Structured exception handling: throw unwinding, returns through
//! protected regions, frame teardown, and deferred actions.

use crate::{
    heap::HeapData,
    types::Generator,
    value::Value,
};

use super::{DeferAction, Flow, Handler, Pending, RunResult, VmError, World, call};

/// Unwinds a thrown value to the innermost handler.
///
/// Frames between the throw site and the handler's frame are torn down
/// (running their deferred actions); the stack is restored to the handler's
/// recorded depth; the thrown value is pushed and control resumes at the
/// handler's catch entry, whose unmatched path reruns the finally and
/// rethrows.
///
/// `Err` means no handler remained: the thread terminates.
pub fn handle_throw(world: &mut World, tid: usize, v: Value) -> Result<(), VmError> {
    let Some(h) = world.thread(tid).handlers.pop() else {
        return Err(VmError::Throw(v));
    };

    // Tear down frames above the handler's.
    while world.threads[tid].state.frames.len() - 1 > h.frame {
        run_frame_defers(world, tid, true);
        pop_frame_raw(world, tid);
    }

    let st = world.thread(tid);
    st.stack.truncate(h.stack);
    st.sp_saves.truncate(h.sp_saves);
    st.targets.truncate(h.targets);
    st.stack.push(v);
    st.frames.last_mut().expect("handler frame alive").ip = h.catch_ip;
    Ok(())
}

/// Returns `value` from the current frame.
///
/// When the frame still has protected regions with pending finallys, the
/// innermost one runs first with the return recorded as the pending action;
/// `EndFinally` re-enters here. Otherwise the frame is torn down: deferred
/// actions run, generator frames finish their generator, constructor frames
/// yield the new object, and the value lands on the caller's stack.
pub fn perform_return(world: &mut World, tid: usize, value: Value) -> RunResult<Flow> {
    let cur = world.threads[tid].state.frames.len() - 1;

    // Route through the innermost protected region of this frame.
    let maybe = world
        .thread(tid)
        .handlers
        .iter()
        .rposition(|h| h.frame == cur);
    if let Some(i) = maybe {
        let h = world.thread(tid).handlers.remove(i);
        let st = world.thread(tid);
        st.stack.truncate(h.stack);
        st.sp_saves.truncate(h.sp_saves);
        st.targets.truncate(h.targets);
        st.pending.push(Pending::Return(value));
        st.frames.last_mut().expect("frame alive").ip = h.finally_ip;
        return Ok(Flow::Continue);
    }

    run_frame_defers(world, tid, false);

    let frame = world.thread(tid).frames.pop().expect("frame to return from");
    let st = world.thread(tid);
    st.stack.truncate(frame.base);
    st.sp_saves.truncate(frame.sp_saves_base);
    st.targets.truncate(frame.targets_base);

    if let Some(gen_id) = frame.generator {
        // Falling off the end of a generator yields the end sentinel.
        if let HeapData::Generator(g) = world.heap.get_mut(gen_id) {
            *g = Generator { frame: None, done: true };
        }
        world.push(tid, Value::Sentinel);
    } else if let Some(obj) = frame.ctor {
        world.push(tid, obj);
    } else {
        world.push(tid, value);
    }

    if world.threads[tid].state.frames.is_empty() {
        let v = world.pop(tid);
        return Ok(Flow::Done(v));
    }
    Ok(Flow::Continue)
}

/// Runs the current frame's deferred actions, newest first. During
/// unwinding, unwind-only actions run too.
pub fn run_frame_defers(world: &mut World, tid: usize, unwinding: bool) {
    let defers = std::mem::take(&mut world.frame_mut(tid).defers);
    for action in defers.into_iter().rev() {
        let r = match action {
            DeferAction::Call(f) => call::call_function_sync(world, tid, f, Vec::new()).map(|_| ()),
            DeferAction::CallUnwind(f) => {
                if unwinding {
                    call::call_function_sync(world, tid, f, Vec::new()).map(|_| ())
                } else {
                    Ok(())
                }
            }
            DeferAction::DropValue(v) => call::call_drop_method(world, tid, v),
        };
        if let Err(e) = r {
            let msg = super::describe_vm_error(world, &e);
            world.tracer.on_note(&format!("deferred action failed: {msg}"));
        }
    }
}

/// Pops a frame without producing a value (unwinding path).
fn pop_frame_raw(world: &mut World, tid: usize) {
    let frame = world.thread(tid).frames.pop().expect("frame to unwind");
    let st = world.thread(tid);
    st.stack.truncate(frame.base);
    st.sp_saves.truncate(frame.sp_saves_base);
    st.targets.truncate(frame.targets_base);
    if let Some(gen_id) = frame.generator
        && let HeapData::Generator(g) = world.heap.get_mut(gen_id)
    {
        *g = Generator { frame: None, done: true };
    }
}

/// Drops every handler belonging to frames at or above `depth` (used when a
/// generator suspends mid-try).
pub fn split_handlers_above(world: &mut World, tid: usize, depth: usize) -> Vec<Handler> {
    let st = world.thread(tid);
    let split = st.handlers.iter().position(|h| h.frame >= depth).unwrap_or(st.handlers.len());
    st.handlers.split_off(split)
}
