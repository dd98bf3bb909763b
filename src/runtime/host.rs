//! Guest bindings for the Hook Facade.
//!
//! Only plain integers and UTF-8 byte ranges cross this boundary. Strings are
//! `(ptr, len)` pairs into the guest's exported memory and are copied out
//! before the facade sees them, but only after the facade has confirmed the
//! call belongs to the live submission, so a stale or canceled run always
//! aborts rather than faulting on a bad range.

use crate::core::hook::{self, HookResult};
use crate::runtime::wrapper::{HOOK_MODULE, MEMORY_EXPORT, SUBMISSION_GLOBAL};
use crate::trace::operation::StateChange;
use anyhow::{anyhow, Context};
use wasmtime::{Caller, Extern, Global, GlobalType, Linker, Mutability, Store, Val, ValType};

/// Bytes per argument record: name ptr, name len, value ptr, value len
const ARGUMENT_RECORD_SIZE: usize = 16;

/// Per-run store data
#[derive(Debug, Default)]
pub struct RunState {
    /// Set as soon as any hook aborts; the guest cannot clear it
    pub aborted: bool,
}

type HostCaller<'a> = Caller<'a, RunState>;

/// Turn a facade result into a host-call result, recording an abort
fn settle<T>(caller: &mut HostCaller<'_>, result: HookResult<T>) -> anyhow::Result<T> {
    result.map_err(|aborted| {
        caller.data_mut().aborted = true;
        anyhow::Error::new(aborted)
    })
}

fn read_bytes(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let memory = caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("guest does not export `{}`", MEMORY_EXPORT))?;
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or_else(|| anyhow!("byte range at {} overflows", start))?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("byte range {}..{} is outside guest memory", start, end))
}

fn read_str(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> anyhow::Result<String> {
    let bytes = read_bytes(caller, ptr, len)?;
    String::from_utf8(bytes).context("hook string is not valid UTF-8")
}

/// Decode `count` argument records. Arguments carry the id of their method.
fn read_arguments(
    caller: &mut HostCaller<'_>,
    method_id: u32,
    ptr: i32,
    count: i32,
) -> anyhow::Result<Vec<StateChange>> {
    let count = count as u32 as usize;
    let table_len = count
        .checked_mul(ARGUMENT_RECORD_SIZE)
        .and_then(|len| i32::try_from(len).ok())
        .ok_or_else(|| anyhow!("argument table of {} records is too large", count))?;
    let table = read_bytes(caller, ptr, table_len)?;

    let mut arguments = Vec::with_capacity(count);
    for record in table.chunks_exact(ARGUMENT_RECORD_SIZE) {
        let word = |n: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&record[n * 4..n * 4 + 4]);
            u32::from_le_bytes(raw) as i32
        };
        let name = read_str(caller, word(0), word(1))?;
        let value = read_str(caller, word(2), word(3))?;
        arguments.push(StateChange::new(method_id, name, value));
    }
    Ok(arguments)
}

/// Define every hook import on `linker`
pub fn define_hooks(linker: &mut Linker<RunState>) -> anyhow::Result<()> {
    linker.func_wrap(
        HOOK_MODULE,
        "begin_method",
        |mut caller: HostCaller<'_>,
         sid: i32,
         id: i32,
         name_ptr: i32,
         name_len: i32,
         args_ptr: i32,
         args_len: i32| {
            settle(&mut caller, hook::ensure_active(sid as u32))?;
            let name = read_str(&mut caller, name_ptr, name_len)?;
            let arguments = read_arguments(&mut caller, id as u32, args_ptr, args_len)?;
            let result = hook::begin_method(sid as u32, id as u32, &name, arguments);
            settle(&mut caller, result)
        },
    )?;

    define_container_hook(linker, "end_method", hook::end_method)?;
    define_container_hook(linker, "begin_loop", hook::begin_loop)?;
    define_container_hook(linker, "end_loop", hook::end_loop)?;
    define_container_hook(linker, "begin_inside_loop", hook::begin_inside_loop)?;
    define_container_hook(linker, "end_inside_loop", hook::end_inside_loop)?;

    linker.func_wrap(
        HOOK_MODULE,
        "log_variable_change",
        |mut caller: HostCaller<'_>,
         sid: i32,
         id: i32,
         name_ptr: i32,
         name_len: i32,
         value_ptr: i32,
         value_len: i32| {
            settle(&mut caller, hook::ensure_active(sid as u32))?;
            let name = read_str(&mut caller, name_ptr, name_len)?;
            let value = read_str(&mut caller, value_ptr, value_len)?;
            let result = hook::log_variable_change(sid as u32, id as u32, &name, value);
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_i32",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, name_ptr: i32, name_len: i32, v: i32| {
            settle(&mut caller, hook::ensure_active(sid as u32))?;
            let name = read_str(&mut caller, name_ptr, name_len)?;
            let result = hook::log_object(sid as u32, id as u32, &name, v).map(drop);
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_i64",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, name_ptr: i32, name_len: i32, v: i64| {
            settle(&mut caller, hook::ensure_active(sid as u32))?;
            let name = read_str(&mut caller, name_ptr, name_len)?;
            let result = hook::log_object(sid as u32, id as u32, &name, v).map(drop);
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_f64",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, name_ptr: i32, name_len: i32, v: f64| {
            settle(&mut caller, hook::ensure_active(sid as u32))?;
            let name = read_str(&mut caller, name_ptr, name_len)?;
            let result = hook::log_object(sid as u32, id as u32, &name, v).map(drop);
            settle(&mut caller, result)
        },
    )?;

    linker.func_wrap(
        HOOK_MODULE,
        "log_return",
        |mut caller: HostCaller<'_>, sid: i32, id: i32| {
            let result = hook::log_return(sid as u32, id as u32, None);
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_return_value",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, value_ptr: i32, value_len: i32| {
            settle(&mut caller, hook::ensure_active(sid as u32))?;
            let value = read_str(&mut caller, value_ptr, value_len)?;
            let result = hook::log_return(sid as u32, id as u32, Some(value));
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_return_i32",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, v: i32| {
            let result = hook::log_return_value(sid as u32, id as u32, v).map(drop);
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_return_i64",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, v: i64| {
            let result = hook::log_return_value(sid as u32, id as u32, v).map(drop);
            settle(&mut caller, result)
        },
    )?;
    linker.func_wrap(
        HOOK_MODULE,
        "log_return_f64",
        |mut caller: HostCaller<'_>, sid: i32, id: i32, v: f64| {
            let result = hook::log_return_value(sid as u32, id as u32, v).map(drop);
            settle(&mut caller, result)
        },
    )?;

    Ok(())
}

fn define_container_hook(
    linker: &mut Linker<RunState>,
    name: &str,
    op: fn(u32, u32) -> HookResult<()>,
) -> anyhow::Result<()> {
    linker.func_wrap(
        HOOK_MODULE,
        name,
        move |mut caller: HostCaller<'_>, sid: i32, id: i32| {
            let result = op(sid as u32, id as u32);
            settle(&mut caller, result)
        },
    )?;
    Ok(())
}

/// Bind the constant submission id global for this run
pub fn define_submission_global(
    linker: &mut Linker<RunState>,
    store: &mut Store<RunState>,
    submission_id: u32,
) -> anyhow::Result<()> {
    let global = Global::new(
        &mut *store,
        GlobalType::new(ValType::I32, Mutability::Const),
        Val::I32(submission_id as i32),
    )?;
    linker.define(&*store, HOOK_MODULE, SUBMISSION_GLOBAL, global)?;
    Ok(())
}
