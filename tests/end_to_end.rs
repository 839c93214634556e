//! End-to-end interpreter scenarios (spec §8 "End-to-end scenarios"),
//! each driving a real `Ejs` through the embedding API rather than
//! poking at one crate's internals in isolation.

use ejs::{Ejs, Service};
use ejs_loader::encoding::encode_num;
use ejs_value::error::{EjsError, Result};
use ejs_value::flags::{HandlerFlags, LoaderAttrs, TraitAttrs, VarFlags};
use ejs_value::helpers::{block_helpers_base, object_helpers_base, Operator};
use ejs_value::name::Name;
use ejs_value::var::{
    BlockData, Code, ExceptionHandler, FunctionBody, FunctionData, Heap, ObjectData, TypeData,
};
use ejs_value::{ConstantPool, HeapHandle, Var, VmHost};
use ejs_vm::context::VmContext;
use ejs_vm::opcode::{encode_program, Instr};
use std::cell::RefCell;
use std::rc::Rc;

fn new_interpreter() -> Ejs {
    Ejs::new(Rc::new(RefCell::new(Service::new()))).unwrap()
}

fn scripted_function(num_args: usize, num_locals: usize, program: &[Instr]) -> HeapHandle {
    let mut fd = FunctionData {
        num_args,
        body: FunctionBody::Code(Code { byte_code: encode_program(program), ..Code::default() }),
        ..FunctionData::default()
    };
    fd.block.object.slots = vec![Var::Undefined; num_args + num_locals];
    Rc::new(RefCell::new(Heap::function(None, VarFlags::empty(), fd)))
}

fn define_global(ejs: &Ejs, slot: i32, name: &str, value: Var) {
    let global = Var::Ref(ejs.global());
    (block_helpers_base().define_property)(&global, slot, &Name::unqualified(name), None, TraitAttrs::ENUMERABLE, value)
        .unwrap();
}

/// Scenario 1: `LoadInt 2; LoadInt 3; Add; EndCode` yields the Number 5.
#[test]
fn arithmetic_adds_two_literals() {
    let mut ejs = new_interpreter();
    let func = scripted_function(0, 0, &[Instr::LoadInt(2), Instr::LoadInt(3), Instr::BinaryOp(Operator::Add), Instr::EndCode]);
    let result = ejs.run_function(&func, None, &[]).unwrap();
    assert!(matches!(result, Var::Number(n) if n == 5.0));
}

/// Scenario 2: a global `function id(x) { return x }` bound at slot K,
/// called via `LoadString "hi"; CallGlobalSlot K 1`, yields the String "hi".
#[test]
fn scoped_call_returns_its_argument() {
    let mut ejs = new_interpreter();
    let id_fn = scripted_function(1, 0, &[Instr::LoadLocalSlot(0), Instr::Return]);
    define_global(&ejs, 0, "id", Var::Ref(id_fn));

    let constants = Rc::new(ConstantPool::from_bytes(b"hi\0".to_vec()));
    let caller_code = Code {
        byte_code: encode_program(&[Instr::LoadString(0), Instr::CallGlobalSlot { slot: 0, argc: 1 }, Instr::Return]),
        constants,
        handlers: Vec::new(),
    };
    let caller = Rc::new(RefCell::new(Heap::function(
        None,
        VarFlags::empty(),
        FunctionData { body: FunctionBody::Code(caller_code), ..FunctionData::default() },
    )));

    let result = ejs.run_function(&caller, None, &[]).unwrap();
    match result {
        Var::String(s) => assert_eq!(&*s, "hi"),
        other => panic!("expected String(\"hi\"), got {other:?}"),
    }
}

/// Scenario 3: `try { throw "e" } catch (x) { result = x } finally { result += "!" }`
/// leaves the top-level result as the String "e!".
#[test]
fn try_catch_finally_appends_in_finally() {
    let try_region = encode_program(&[Instr::LoadString(0), Instr::Throw]);
    let catch_region = encode_program(&[Instr::StoreLocalSlot(0)]);
    let finally_region = encode_program(&[
        Instr::LoadLocalSlot(0),
        Instr::LoadString(1),
        Instr::BinaryOp(Operator::Add),
        Instr::StoreLocalSlot(0),
        Instr::Finally,
    ]);
    let end_marker = encode_program(&[Instr::EndException]);
    let tail = encode_program(&[Instr::LoadLocalSlot(0), Instr::Return]);

    let try_start = 0u32;
    let try_end = try_region.len() as u32;
    let catch_start = try_end;
    let catch_end = catch_start + catch_region.len() as u32;
    let finally_start = catch_end;
    let finally_end = finally_start + finally_region.len() as u32;

    let mut byte_code = Vec::new();
    byte_code.extend(try_region);
    byte_code.extend(catch_region);
    byte_code.extend(finally_region);
    byte_code.extend(end_marker);
    byte_code.extend(tail);

    let catch_handler = ExceptionHandler {
        try_start,
        try_end,
        handler_start: catch_start,
        handler_end: catch_end,
        num_blocks: 0,
        num_stack: 0,
        catch_type_slot: None,
        flags: HandlerFlags::CATCH,
    };
    let finally_handler = ExceptionHandler {
        try_start,
        try_end,
        handler_start: finally_start,
        handler_end: finally_end,
        num_blocks: 0,
        num_stack: 0,
        catch_type_slot: None,
        flags: HandlerFlags::FINALLY,
    };

    let constants = Rc::new(ConstantPool::from_bytes(b"e\0!\0".to_vec()));
    let mut fd = FunctionData {
        num_args: 0,
        body: FunctionBody::Code(Code { byte_code, constants, handlers: vec![catch_handler, finally_handler] }),
        ..FunctionData::default()
    };
    fd.block.object.slots = vec![Var::Undefined; 1];
    let func = Rc::new(RefCell::new(Heap::function(None, VarFlags::empty(), fd)));

    let mut ejs = new_interpreter();
    let result = ejs.run_function(&func, None, &[]).unwrap();
    match result {
        Var::String(s) => assert_eq!(&*s, "e!"),
        other => panic!("expected String(\"e!\"), got {other:?}"),
    }
}

fn native_iterator_next(_host: &mut dyn VmHost, this: Option<Var>, _args: &[Var]) -> Result<Var> {
    let this = this.ok_or_else(|| EjsError::Internal("next() called without an iterator instance".into()))?;
    let helpers = object_helpers_base();
    let idx = match (helpers.get_property)(&this, 0)? {
        Var::Number(n) => n as i64,
        _ => 0,
    };
    if idx >= 3 {
        return Err(EjsError::StopIteration);
    }
    (helpers.set_property)(&this, 0, Var::Number((idx + 1) as f64))?;
    Ok(Var::Number((idx + 1) as f64 * 10.0))
}

/// Scenario 4: iterating an Array-like object with a `next()` method
/// invokes it repeatedly (10, 20, 30), then a fourth call raises
/// `StopIteration`, which the handler table's `ITERATION` entry catches
/// the way a compiled `for..in` loop's break target would.
#[test]
fn for_in_style_iteration_stops_on_stop_iteration() {
    let iter_obj = Var::Ref(Rc::new(RefCell::new(Heap::object(None, VarFlags::empty(), ObjectData::default()))));
    (object_helpers_base().define_property)(&iter_obj, 0, &Name::unqualified("count"), None, TraitAttrs::ENUMERABLE, Var::Number(0.0)).unwrap();
    let next_fn = Rc::new(RefCell::new(Heap::function(
        None,
        VarFlags::empty(),
        FunctionData { body: FunctionBody::Native(native_iterator_next), ..FunctionData::default() },
    )));
    (object_helpers_base().define_property)(&iter_obj, 1, &Name::unqualified("next"), None, TraitAttrs::ENUMERABLE, Var::Ref(next_fn)).unwrap();

    let next_token = 0usize;
    let constants = Rc::new(ConstantPool::from_bytes(b"next\0".to_vec()));

    let prelude = encode_program(&[Instr::LoadInt(0), Instr::StoreLocalSlot(1)]);
    let call_once = encode_program(&[
        Instr::LoadLocalSlot(0),
        Instr::CallObjectByName { name: next_token, argc: 0 },
        Instr::LoadLocalSlot(1),
        Instr::BinaryOp(Operator::Add),
        Instr::StoreLocalSlot(1),
    ]);
    let mut body = Vec::new();
    for _ in 0..4 {
        body.extend(call_once.clone());
    }
    let tail = encode_program(&[Instr::LoadLocalSlot(1), Instr::Return]);

    let try_start = prelude.len() as u32;
    let try_end = try_start + body.len() as u32;
    let handler_start = try_end;
    let handler_end = handler_start + tail.len() as u32;

    let mut byte_code = Vec::new();
    byte_code.extend(prelude);
    byte_code.extend(body);
    byte_code.extend(tail);

    let handler = ExceptionHandler {
        try_start,
        try_end,
        handler_start,
        handler_end,
        num_blocks: 0,
        num_stack: 0,
        catch_type_slot: None,
        flags: HandlerFlags::ITERATION,
    };

    let mut fd = FunctionData {
        num_args: 1,
        body: FunctionBody::Code(Code { byte_code, constants, handlers: vec![handler] }),
        ..FunctionData::default()
    };
    fd.block.object.slots = vec![Var::Undefined; 2];
    let func = Rc::new(RefCell::new(Heap::function(None, VarFlags::empty(), fd)));

    let mut ejs = new_interpreter();
    let result = ejs.run_function(&func, None, &[iter_obj]).unwrap();
    assert!(matches!(result, Var::Number(n) if n == 60.0));
}

/// Scenario 5: `function Pt(x) { this.x = x }`, `pt = new Pt(7)`: `pt.x`
/// is the Number 7 and `pt` is a reference-valued (object) instance —
/// `typeof` itself is class-library surface this crate does not model.
#[test]
fn prototype_constructor_sets_instance_property() {
    let mut ejs = new_interpreter();

    let mut type_data = TypeData::default();
    type_data.id = 100;
    type_data.helpers = Some(Rc::new(object_helpers_base()));
    let pt_type = Rc::new(RefCell::new(Heap::type_obj(None, VarFlags::empty(), type_data)));

    let x_token = 0usize;
    let constants = Rc::new(ConstantPool::from_bytes(b"x\0".to_vec()));
    let ctor_code = Code {
        byte_code: encode_program(&[
            Instr::LoadThis,
            Instr::LoadLocalSlot(0),
            Instr::StoreObjectProperty(x_token),
            Instr::Return,
        ]),
        constants,
        handlers: Vec::new(),
    };
    let ctor = Rc::new(RefCell::new(Heap::function(
        None,
        VarFlags::empty(),
        FunctionData { num_args: 1, body: FunctionBody::Code(ctor_code), ..FunctionData::default() },
    )));
    (block_helpers_base().define_property)(
        &Var::Ref(pt_type.clone()),
        0,
        &Name::unqualified("constructor"),
        None,
        TraitAttrs::ENUMERABLE,
        Var::Ref(ctor),
    )
    .unwrap();

    define_global(&ejs, 0, "Pt", Var::Ref(pt_type));
    let new_pt = scripted_function(0, 0, &[Instr::LoadInt(7), Instr::New { type_slot: 0, argc: 1 }, Instr::Return]);
    let pt = ejs.run_function(&new_pt, None, &[]).unwrap();

    let x = (object_helpers_base().get_property_by_name)(&pt, &Name::unqualified("x")).unwrap();
    assert!(matches!(x, Var::Number(n) if n == 7.0));
    assert!(matches!(pt, Var::Ref(_)), "a constructed instance is a reference (object) value");
}

// --- Module loading: scenario 6 and P7 ---

fn push_num(buf: &mut Vec<u8>, n: i64) {
    buf.extend(encode_num(n));
}
fn push_word(buf: &mut Vec<u8>, n: i32) {
    buf.extend(n.to_le_bytes());
}

/// Builds one `MODULE ... MODULE_END` file with a single top-level
/// function (the module's initializer) that stores `value` into global
/// slot `result_slot`, optionally depending on `dep_name`.
fn build_module_bytes(name: &str, dep_name: Option<&str>, result_slot: i32, value: i64) -> Vec<u8> {
    let mut pool = Vec::new();
    let name_tok = pool.len();
    pool.extend_from_slice(name.as_bytes());
    pool.push(0);
    let public_tok = pool.len();
    pool.extend_from_slice(b"public");
    pool.push(0);
    let init_tok = pool.len();
    pool.extend_from_slice(b"init");
    pool.push(0);
    let dep_tok = dep_name.map(|d| {
        let t = pool.len();
        pool.extend_from_slice(d.as_bytes());
        pool.push(0);
        t
    });

    let mut buf = Vec::new();
    push_word(&mut buf, ejs_loader::EJS_MODULE_MAGIC);
    push_word(&mut buf, ejs_loader::EJS_MODULE_VERSION);
    push_word(&mut buf, 0);
    push_word(&mut buf, 0);
    push_word(&mut buf, 0);

    buf.push(1); // MODULE
    push_num(&mut buf, name_tok as i64);
    push_num(&mut buf, 0); // version
    push_word(&mut buf, 0); // checksum
    push_num(&mut buf, pool.len() as i64);
    buf.extend_from_slice(&pool);

    if let Some(dep_tok) = dep_tok {
        buf.push(3); // DEPENDENCY
        push_num(&mut buf, dep_tok as i64);
        push_num(&mut buf, 0); // checksum
        push_num(&mut buf, 0); // min version
        push_num(&mut buf, 0); // max version
    }

    let code = encode_program(&[Instr::LoadInt(value as i32), Instr::StoreGlobalSlot(result_slot), Instr::Return]);
    buf.push(8); // FUNCTION
    push_num(&mut buf, init_tok as i64);
    push_num(&mut buf, public_tok as i64);
    push_num(&mut buf, -1); // nextSlot
    push_num(&mut buf, LoaderAttrs::INITIALIZER.bits() as i64);
    buf.push(0); // lang
    push_num(&mut buf, 0); // returnType: NOREF
    push_num(&mut buf, (result_slot + 1) as i64); // slotNum for the function itself
    push_num(&mut buf, 0); // numArgs
    push_num(&mut buf, 0); // numLocals
    push_num(&mut buf, 0); // numExceptions
    push_num(&mut buf, code.len() as i64);
    buf.extend_from_slice(&code);
    buf.push(9); // FUNCTION_END

    buf.push(2); // MODULE_END
    buf
}

/// Scenario 6: module A depends on module B; after loading both and
/// running initializers, both report `initialized` and their globals hold
/// the values their initializers wrote.
#[test]
fn module_dependency_runs_initializers_in_dependency_order() {
    let dir = std::env::temp_dir().join(format!("ejs-e2e-{}-{}", std::process::id(), "deps"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("b-0.0.0.mod"), build_module_bytes("b", None, 0, 2)).unwrap();
    std::fs::write(dir.join("a-0.0.0.mod"), build_module_bytes("a", Some("b"), 1, 5)).unwrap();

    let mut ejs = new_interpreter();
    ejs.set_search_path(vec![dir.clone()]);
    ejs.load_module("b", 0, u32::MAX).unwrap();
    ejs.load_module("a", 0, u32::MAX).unwrap();
    ejs.run_initializers().unwrap();

    assert!(matches!(ejs.global_slot(0), Some(Var::Number(n)) if n == 2.0));
    assert!(matches!(ejs.global_slot(1), Some(Var::Number(n)) if n == 5.0));

    std::fs::remove_dir_all(&dir).ok();
}

/// P7 Module determinism: loading the same module file into two fresh
/// interpreters binds the same name to the same global slot in both.
#[test]
fn loading_the_same_module_twice_binds_identical_slots() {
    let dir = std::env::temp_dir().join(format!("ejs-e2e-{}-{}", std::process::id(), "determinism"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("solo-0.0.0.mod"), build_module_bytes("solo", None, 3, 9)).unwrap();

    let mut first = new_interpreter();
    first.set_search_path(vec![dir.clone()]);
    first.load_module("solo", 0, u32::MAX).unwrap();

    let mut second = new_interpreter();
    second.set_search_path(vec![dir.clone()]);
    second.load_module("solo", 0, u32::MAX).unwrap();

    assert!(matches!(first.global_slot(3), Some(Var::Ref(_))));
    assert!(matches!(second.global_slot(3), Some(Var::Ref(_))));

    // Loading the same name again on an already-loaded interpreter is a
    // no-op: the slot's binding does not change underneath it.
    let before = first.global_slot(3);
    first.load_module("solo", 0, u32::MAX).unwrap();
    let after = first.global_slot(3);
    match (before, after) {
        (Some(Var::Ref(a)), Some(Var::Ref(b))) => assert!(Rc::ptr_eq(&a, &b)),
        other => panic!("expected stable Ref bindings, got {other:?}"),
    }

    std::fs::remove_dir_all(&dir).ok();
}
