//! Turns a decoded module into live `ejs-value` `Type`/`Function`
//! instances and installs them on the global block (spec §4.4 "After all
//! sections in the top-level load are read, resolve fixups ... run each
//! loaded module's initializer").
//!
//! The decoder (`ejs_loader::loader`) only produces a plain
//! [`LoadedModule`] and a list of still-unresolved [`Fixup`]s — this is
//! the piece that has a running global-slot table to resolve the rest of
//! them against, and that can actually allocate `Type`/`Function` `Heap`
//! instances.

use crate::context::VmContext;
use ejs_loader::{Fixup, FixupKind, FunctionDef, LoadedModule, LoaderAttrs, PropertyDef, TypeRefSpec};
use ejs_value::error::{EjsError, Result};
use ejs_value::flags::{FunctionFlags, LangMode, TraitAttrs, TypeFlags, VarFlags};
use ejs_value::helpers::block_helpers_base;
use ejs_value::name::Name;
use ejs_value::var::{BlockData, Code, FunctionBody, FunctionData, Heap, TypeData};
use ejs_value::{ConstantPool, HeapHandle, Var};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

fn name_of(module: &LoadedModule, tokens: ejs_loader::NameTokens) -> Result<Name> {
    Ok(Name::new(module.string(tokens.name)?, module.string(tokens.space)?))
}

fn attrs_to_trait(attrs: LoaderAttrs) -> TraitAttrs {
    let mut out = TraitAttrs::ENUMERABLE;
    if attrs.contains(LoaderAttrs::GETTER) {
        out |= TraitAttrs::GETTER;
    }
    if attrs.contains(LoaderAttrs::SETTER) {
        out |= TraitAttrs::SETTER;
    }
    if attrs.contains(LoaderAttrs::OVERRIDE) {
        out |= TraitAttrs::OVERRIDE;
    }
    out
}

fn attrs_to_function_flags(attrs: LoaderAttrs) -> FunctionFlags {
    let mut out = FunctionFlags::empty();
    if attrs.contains(LoaderAttrs::GETTER) {
        out |= FunctionFlags::GETTER;
    }
    if attrs.contains(LoaderAttrs::SETTER) {
        out |= FunctionFlags::SETTER;
    }
    if attrs.contains(LoaderAttrs::CONSTRUCTOR) {
        out |= FunctionFlags::CONSTRUCTOR;
    }
    if attrs.contains(LoaderAttrs::STATIC) {
        out |= FunctionFlags::STATIC_METHOD;
    }
    if attrs.contains(LoaderAttrs::OVERRIDE) {
        out |= FunctionFlags::OVERRIDE;
    }
    if attrs.contains(LoaderAttrs::REST) {
        out |= FunctionFlags::REST;
    }
    if attrs.contains(LoaderAttrs::FULL_SCOPE) {
        out |= FunctionFlags::FULL_SCOPE;
    }
    if attrs.contains(LoaderAttrs::HAS_RETURN) {
        out |= FunctionFlags::HAS_RETURN;
    }
    if attrs.contains(LoaderAttrs::INITIALIZER) || attrs.contains(LoaderAttrs::STATIC_INITIALIZER) {
        out |= FunctionFlags::IS_INITIALIZER;
    }
    if attrs.contains(LoaderAttrs::NATIVE) {
        out |= FunctionFlags::NATIVE_PROC;
    }
    out
}

fn attrs_to_type_flags(attrs: LoaderAttrs) -> TypeFlags {
    let mut out = TypeFlags::empty();
    if attrs.contains(LoaderAttrs::CONSTRUCTOR) {
        out |= TypeFlags::HAS_CONSTRUCTOR;
    }
    if attrs.contains(LoaderAttrs::INITIALIZER) {
        out |= TypeFlags::HAS_INITIALIZER;
    }
    if attrs.contains(LoaderAttrs::STATIC_INITIALIZER) {
        out |= TypeFlags::HAS_STATIC_INITIALIZER;
    }
    if attrs.contains(LoaderAttrs::INTERFACE) {
        out |= TypeFlags::IS_INTERFACE;
    }
    if attrs.contains(LoaderAttrs::FINAL) {
        out |= TypeFlags::FINAL;
    }
    if attrs.contains(LoaderAttrs::OBJECT) {
        out |= TypeFlags::OBJECT_BASED;
    }
    if attrs.contains(LoaderAttrs::DYNAMIC_INSTANCE) {
        out |= TypeFlags::DYNAMIC_INSTANCE;
    }
    if attrs.contains(LoaderAttrs::CALLS_SUPER) {
        out |= TypeFlags::CALLS_SUPER;
    }
    out
}

/// A native proc that never got a real callback registered: a module can
/// declare `NATIVE` functions before the host installs the matching
/// native-module configurator (spec §4.4 "Native-backed modules"); calling
/// one before that happens is a caller error, not a crash.
fn unregistered_native(_host: &mut dyn ejs_value::VmHost, _this: Option<Var>, _args: &[Var]) -> Result<Var> {
    Err(EjsError::Internal("native function has no registered implementation".into()))
}

fn build_function(def: &FunctionDef, constants: &Rc<ConstantPool>, owner: Option<HeapHandle>) -> FunctionData {
    let mut block = BlockData::default();
    let num_slots = def.num_args as usize + def.num_locals as usize;
    block.object.slots = vec![Var::Undefined; num_slots];

    let body = if def.attributes.contains(LoaderAttrs::NATIVE) {
        FunctionBody::Native(unregistered_native)
    } else {
        let handlers = def
            .exceptions
            .iter()
            .map(|e| ejs_value::var::ExceptionHandler {
                try_start: e.try_start as u32,
                try_end: e.try_end as u32,
                handler_start: e.handler_start as u32,
                handler_end: e.handler_end as u32,
                num_blocks: e.num_blocks as u32,
                num_stack: e.num_stack as u32,
                catch_type_slot: match e.catch_type {
                    TypeRefSpec::Slot(n) => Some(n),
                    _ => None,
                },
                flags: e.flags,
            })
            .collect();
        FunctionBody::Code(Code {
            byte_code: def.code.clone(),
            constants: constants.clone(),
            handlers,
        })
    };

    let lang = match def.lang {
        1 => LangMode::Strict,
        2 => LangMode::Plus,
        3 => LangMode::Ecma,
        _ => LangMode::Fixed,
    };

    FunctionData {
        block,
        body,
        num_args: def.num_args as usize,
        num_default: 0,
        next_slot: def.next_slot,
        result_type: None,
        this_obj: None,
        owner,
        slot_num: def.slot_num,
        prototype: None,
        flags: attrs_to_function_flags(def.attributes),
        lang,
    }
}

fn function_initial_value(module: &LoadedModule, def: &FunctionDef, constants: &Rc<ConstantPool>) -> Var {
    let fd = build_function(def, constants, None);
    let _ = module;
    Var::Ref(Rc::new(RefCell::new(Heap::function(None, VarFlags::empty(), fd))))
}

fn property_initial_value(module: &LoadedModule, def: &PropertyDef) -> Result<Var> {
    match def.initial_value_token {
        Some(token) => Ok(Var::String(Rc::from(module.string(token)?))),
        None => Ok(Var::Undefined),
    }
}

/// Accumulates the live handles produced while installing one batch of
/// modules, so fixups addressed by `(module_index, class_index,
/// member_index)` can find what they need to patch.
#[derive(Default)]
struct Installed {
    /// `(module_index, class_index)` -> the class's `Type` handle.
    classes: HashMap<(usize, usize), HeapHandle>,
    /// `(module_index, class_index, member_index)` -> a method handle;
    /// `class_index == None` addresses a top-level function.
    functions: HashMap<(usize, Option<usize>, usize), HeapHandle>,
    /// Resolvable by bare name, for cross-module `Name`-tagged fixups and
    /// for `base`/`implements` references within the same batch.
    by_name: HashMap<String, HeapHandle>,
}

/// Installs every module in `modules` onto `ctx`'s global object, then
/// resolves `fixups` against the now-materialized types (spec §4.4
/// "resolve fixups in order: for each, locate the target type by slot or
/// name, then patch the receiver").
pub fn install_modules(ctx: &mut dyn VmContext, modules: &[LoadedModule], fixups: &[Fixup]) -> Result<()> {
    let mut installed = Installed::default();

    for (module_index, module) in modules.iter().enumerate() {
        install_classes_pass1(ctx, module_index, module, &mut installed)?;
    }
    for (module_index, module) in modules.iter().enumerate() {
        install_classes_pass2(ctx, module_index, module, &mut installed)?;
        install_top_level(ctx, module_index, module, &mut installed)?;
    }
    for fixup in fixups {
        apply_fixup(ctx, modules, &installed, fixup)?;
    }
    Ok(())
}

fn global_define(ctx: &mut dyn VmContext, slot: i32, name: Name, attrs: TraitAttrs, value: Var) -> Result<i32> {
    let global = Var::Ref(ctx.global());
    let helpers = block_helpers_base();
    (helpers.define_property)(&global, slot, &name, None, attrs, value)
}

fn install_classes_pass1(
    ctx: &mut dyn VmContext,
    module_index: usize,
    module: &LoadedModule,
    installed: &mut Installed,
) -> Result<()> {
    for (class_index, class) in module.classes.iter().enumerate() {
        let name = name_of(module, class.name)?;
        let type_data = TypeData {
            block: BlockData::default(),
            base_type: None,
            instance_block: Some(Rc::new(RefCell::new(Heap::block(None, VarFlags::empty(), BlockData::default())))),
            implements: Vec::new(),
            id: (module_index as i32) * 10_000 + class_index as i32,
            instance_size: 0,
            sub_type_count: 0,
            helpers: Some(Rc::new(block_helpers_base())),
            module_name: Some(Rc::from(module.string(module.name_token)?)),
            flags: attrs_to_type_flags(class.attributes),
        };
        let handle = Rc::new(RefCell::new(Heap::type_obj(None, VarFlags::empty(), type_data)));
        debug!(class = name.name.as_ref(), slot = class.slot_num, "installing class");
        global_define(ctx, class.slot_num, name.clone(), TraitAttrs::ENUMERABLE, Var::Ref(handle.clone()))?;
        installed.classes.insert((module_index, class_index), handle.clone());
        installed.by_name.insert(name.name.to_string(), handle);
    }
    Ok(())
}

fn install_classes_pass2(
    ctx: &mut dyn VmContext,
    module_index: usize,
    module: &LoadedModule,
    installed: &mut Installed,
) -> Result<()> {
    for (class_index, class) in module.classes.iter().enumerate() {
        let handle = installed.classes[&(module_index, class_index)].clone();

        if let TypeRefSpec::Slot(slot) = class.base {
            if let Some(base) = ctx.global_slot(slot).and_then(|v| v.as_ref_handle().cloned()) {
                handle.borrow_mut().as_type_mut().unwrap().base_type = Some(base);
            }
        }
        for iface in &class.interfaces {
            if let TypeRefSpec::Slot(slot) = iface {
                if let Some(t) = ctx.global_slot(*slot).and_then(|v| v.as_ref_handle().cloned()) {
                    handle.borrow_mut().as_type_mut().unwrap().implements.push(t);
                }
            }
        }

        let constants = Rc::new(module.constants.clone());
        for prop in &class.properties {
            let pname = name_of(module, prop.name)?;
            let value = property_initial_value(module, prop)?;
            let target = if prop.attributes.contains(LoaderAttrs::STATIC) {
                Var::Ref(handle.clone())
            } else {
                let inst = handle.borrow().as_type().unwrap().instance_block.clone().unwrap();
                Var::Ref(inst)
            };
            let helpers = block_helpers_base();
            (helpers.define_property)(&target, prop.slot_num, &pname, None, attrs_to_trait(prop.attributes), value)?;
        }
        for (member_index, fdef) in class.functions.iter().enumerate() {
            let fname = name_of(module, fdef.name)?;
            let fd = build_function(fdef, &constants, Some(handle.clone()));
            let fhandle = Rc::new(RefCell::new(Heap::function(None, VarFlags::empty(), fd)));
            let target = if fdef.attributes.contains(LoaderAttrs::STATIC) {
                Var::Ref(handle.clone())
            } else {
                let inst = handle.borrow().as_type().unwrap().instance_block.clone().unwrap();
                Var::Ref(inst)
            };
            let helpers = block_helpers_base();
            (helpers.define_property)(
                &target,
                fdef.slot_num,
                &fname,
                None,
                attrs_to_trait(fdef.attributes),
                Var::Ref(fhandle.clone()),
            )?;
            installed.functions.insert((module_index, Some(class_index), member_index), fhandle);
        }
    }
    Ok(())
}

fn install_top_level(
    ctx: &mut dyn VmContext,
    module_index: usize,
    module: &LoadedModule,
    installed: &mut Installed,
) -> Result<()> {
    let constants = Rc::new(module.constants.clone());
    for prop in &module.properties {
        let pname = name_of(module, prop.name)?;
        let value = property_initial_value(module, prop)?;
        global_define(ctx, prop.slot_num, pname, attrs_to_trait(prop.attributes), value)?;
    }
    for (member_index, fdef) in module.functions.iter().enumerate() {
        let fname = name_of(module, fdef.name)?;
        let value = function_initial_value(module, fdef, &constants);
        global_define(ctx, fdef.slot_num, fname.clone(), attrs_to_trait(fdef.attributes), value.clone())?;
        if let Some(handle) = value.as_ref_handle() {
            installed.functions.insert((module_index, None, member_index), handle.clone());
            installed.by_name.insert(fname.name.to_string(), handle.clone());
        }
    }
    trace!(module = module.string(module.name_token).unwrap_or(""), "module installed");
    Ok(())
}

fn resolve_target_handle(
    ctx: &dyn VmContext,
    modules: &[LoadedModule],
    installed: &Installed,
    module_index: usize,
    type_ref: &TypeRefSpec,
) -> Option<HeapHandle> {
    match type_ref {
        TypeRefSpec::Slot(slot) => ctx.global_slot(*slot).and_then(|v| v.as_ref_handle().cloned()),
        TypeRefSpec::Name { name, .. } => {
            let module = modules.get(module_index)?;
            let target_name = module.string(*name).ok()?;
            installed.by_name.get(target_name).cloned()
        }
        TypeRefSpec::NoRef => None,
    }
}

fn apply_fixup(ctx: &mut dyn VmContext, modules: &[LoadedModule], installed: &Installed, fixup: &Fixup) -> Result<()> {
    let Some(target) = resolve_target_handle(ctx, modules, installed, fixup.module_index, &fixup.type_ref) else {
        trace!(kind = ?fixup.kind, "fixup target still unresolved, leaving as-is");
        return Ok(());
    };

    match fixup.kind {
        FixupKind::BaseType => {
            if let Some(class_index) = fixup.class_index {
                if let Some(handle) = installed.classes.get(&(fixup.module_index, class_index)) {
                    handle.borrow_mut().as_type_mut().unwrap().base_type = Some(target);
                }
            }
        }
        FixupKind::InterfaceType => {
            if let Some(class_index) = fixup.class_index {
                if let Some(handle) = installed.classes.get(&(fixup.module_index, class_index)) {
                    handle.borrow_mut().as_type_mut().unwrap().implements.push(target);
                }
            }
        }
        FixupKind::ReturnType => {
            let key = (fixup.module_index, fixup.class_index, fixup.member_index.unwrap_or(0));
            if let Some(handle) = installed.functions.get(&key) {
                handle.borrow_mut().as_function_mut().unwrap().result_type = Some(target);
            }
        }
        FixupKind::TypeProperty | FixupKind::InstanceProperty => {
            if let (Some(class_index), Some(slot)) = (fixup.class_index, fixup.member_index) {
                if let Some(handle) = installed.classes.get(&(fixup.module_index, class_index)) {
                    let b = handle.borrow();
                    let td = b.as_type().unwrap();
                    let owner = if fixup.kind == FixupKind::TypeProperty {
                        Var::Ref(handle.clone())
                    } else {
                        Var::Ref(td.instance_block.clone().unwrap())
                    };
                    drop(b);
                    let helpers = block_helpers_base();
                    (helpers.set_property_trait)(&owner, slot as i32, Some(target), TraitAttrs::ENUMERABLE)?;
                }
            }
        }
        FixupKind::Exception => {
            let key = (fixup.module_index, fixup.class_index, fixup.member_index.unwrap_or(0));
            if let Some(handle) = installed.functions.get(&key) {
                let slot = lookup_global_slot(ctx, &target);
                let mut b = handle.borrow_mut();
                if let Some(fd) = b.as_function_mut() {
                    if let FunctionBody::Code(code) = &mut fd.body {
                        if let Some(h) = code.handlers.last_mut() {
                            h.catch_type_slot = slot;
                        }
                    }
                }
            }
        }
        FixupKind::Local => {
            trace!("local-variable type fixup noted, not tracked by the untyped interpreter");
        }
    }
    Ok(())
}

fn lookup_global_slot(ctx: &dyn VmContext, target: &HeapHandle) -> Option<i32> {
    let global = ctx.global();
    let b = global.borrow();
    for (slot, v) in b.as_object().slots.iter().enumerate() {
        if let Some(h) = v.as_ref_handle() {
            if Rc::ptr_eq(h, target) {
                return Some(slot as i32);
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use ejs_loader::decode_module;
    use ejs_value::VmHost;
    use ejs_value::var::{BlockData as TestBlockData, ObjectData as TestObjectData};
    use std::rc::Rc as StdRc;

    struct TestCtx {
        global: HeapHandle,
        exception: Option<Var>,
    }

    impl TestCtx {
        fn new(num_slots: usize) -> Self {
            let mut blk = TestBlockData::default();
            blk.object.slots = vec![Var::Undefined; num_slots];
            TestCtx {
                global: StdRc::new(RefCell::new(Heap::block(None, VarFlags::empty(), blk))),
                exception: None,
            }
        }
    }

    impl VmHost for TestCtx {
        fn allocate(&mut self, type_: &HeapHandle, extra_slots: usize) -> Result<Var> {
            let data = TestObjectData { slots: vec![Var::Undefined; extra_slots], names: Default::default() };
            Ok(Var::Ref(StdRc::new(RefCell::new(Heap::object(Some(type_.clone()), VarFlags::empty(), data)))))
        }
        fn throw(&mut self, value: Var) {
            self.exception = Some(value);
        }
        fn singleton_undefined(&self) -> Var {
            Var::Undefined
        }
        fn singleton_null(&self) -> Var {
            Var::Null
        }
        fn singleton_true(&self) -> Var {
            Var::Boolean(true)
        }
        fn singleton_false(&self) -> Var {
            Var::Boolean(false)
        }
        fn core_type(&self, _name: &str) -> Option<HeapHandle> {
            None
        }
    }

    impl VmContext for TestCtx {
        fn global(&self) -> HeapHandle {
            self.global.clone()
        }
        fn set_result(&mut self, _v: Var) {}
        fn maybe_collect(&mut self, _roots: &[Var]) {}
        fn global_slot(&self, slot: i32) -> Option<Var> {
            self.global.borrow().as_object().slots.get(slot as usize).cloned()
        }
        fn exception(&self) -> Option<Var> {
            self.exception.clone()
        }
        fn clear_exception(&mut self) {
            self.exception = None;
        }
    }

    fn push_num(buf: &mut Vec<u8>, n: i64) {
        buf.extend(ejs_loader::encoding::encode_num(n));
    }
    fn push_word(buf: &mut Vec<u8>, n: i32) {
        buf.extend(n.to_le_bytes());
    }
    fn push_str_token(buf: &mut Vec<u8>, token: i64) {
        push_num(buf, token);
    }

    fn one_function_module() -> Vec<u8> {
        let mut buf = Vec::new();
        push_word(&mut buf, ejs_loader::EJS_MODULE_MAGIC);
        push_word(&mut buf, ejs_loader::EJS_MODULE_VERSION);
        push_word(&mut buf, 0);
        push_word(&mut buf, 0);
        push_word(&mut buf, 0);

        buf.push(1); // MODULE
        push_str_token(&mut buf, 0); // name token
        push_num(&mut buf, 0); // version
        push_word(&mut buf, 0); // checksum
        let pool = b"mod\0id\0public\0";
        push_num(&mut buf, pool.len() as i64);
        buf.extend_from_slice(pool);

        buf.push(8); // FUNCTION
        push_str_token(&mut buf, 4); // name: "id"
        push_str_token(&mut buf, 7); // space: "public"
        push_num(&mut buf, -1); // nextSlot
        push_num(&mut buf, 0); // attributes
        buf.push(0); // lang
        push_num(&mut buf, 0); // returnType: NOREF
        push_num(&mut buf, 0); // slotNum
        push_num(&mut buf, 1); // numArgs
        push_num(&mut buf, 0); // numLocals
        push_num(&mut buf, 0); // numExceptions
        let code = ejs_vm_test_program();
        push_num(&mut buf, code.len() as i64);
        buf.extend_from_slice(&code);
        buf.push(9); // FUNCTION_END

        buf.push(2); // MODULE_END
        buf
    }

    fn ejs_vm_test_program() -> Vec<u8> {
        crate::opcode::encode_program(&[crate::opcode::Instr::LoadLocalSlot(0), crate::opcode::Instr::Return])
    }

    #[test]
    fn installs_a_top_level_function_onto_the_global_slot() {
        let bytes = one_function_module();
        let decoded = decode_module(&bytes).unwrap();
        let mut ctx = TestCtx::new(4);
        install_modules(&mut ctx, &decoded.modules, &decoded.fixups).unwrap();
        let installed = ctx.global_slot(0).unwrap();
        assert!(installed.as_ref_handle().is_some());
    }
}
