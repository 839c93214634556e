//! The per-`Type` helper vtable (spec §4.1).
//!
//! Three default tables exist — `default`, `object`, `block` — each built
//! by starting from the previous one and overriding the entries that
//! change. A native type customizes behavior by cloning a base table and
//! replacing individual fields; there is no virtual dispatch, just plain
//! function pointers compared and copied like any other `Copy` data.

use crate::error::Result;
use crate::host::VmHost;
use crate::name::Name;
use crate::var::{HeapHandle, Heap, NamesTable, ObjectData, SlotTrait, Var};
use std::cell::RefCell;
use std::rc::Rc;

pub type CastFn = fn(host: &mut dyn VmHost, v: &Var, target: &HeapHandle) -> Result<Var>;
pub type CloneFn = fn(host: &mut dyn VmHost, v: &Var, deep: bool) -> Result<Var>;
pub type CreateFn = fn(host: &mut dyn VmHost, type_: &HeapHandle, extra_slots: usize) -> Result<Var>;
pub type DestroyFn = fn(v: &Var);
pub type DefinePropertyFn =
    fn(v: &Var, slot: i32, name: &Name, type_: Option<HeapHandle>, attrs: crate::flags::TraitAttrs, value: Var) -> Result<i32>;
pub type DeletePropertyFn = fn(v: &Var, slot: i32) -> Result<()>;
pub type DeletePropertyByNameFn = fn(v: &Var, name: &Name) -> Result<()>;
pub type GetPropertyFn = fn(v: &Var, slot: i32) -> Result<Var>;
pub type GetPropertyByNameFn = fn(v: &Var, name: &Name) -> Result<Var>;
pub type GetPropertyCountFn = fn(v: &Var) -> usize;
pub type GetPropertyNameFn = fn(v: &Var, slot: i32) -> Option<Name>;
pub type GetPropertyTraitFn = fn(v: &Var, slot: i32) -> Option<SlotTrait>;
pub type InvokeOperatorFn = fn(host: &mut dyn VmHost, lhs: &Var, op: Operator, rhs: Option<&Var>) -> Result<Var>;
pub type LookupPropertyFn = fn(v: &Var, name: &Name) -> i32;
pub type MarkVarFn = fn(v: &Var, visit: &mut dyn FnMut(&Var));
pub type SetPropertyFn = fn(v: &Var, slot: i32, value: Var) -> Result<()>;
pub type SetPropertyNameFn = fn(v: &Var, name: &Name, value: Var) -> Result<i32>;
pub type SetPropertyTraitFn =
    fn(v: &Var, slot: i32, type_: Option<HeapHandle>, attrs: crate::flags::TraitAttrs) -> Result<()>;

/// Operators dispatched through `invokeOperator` (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    LeftShift,
    RightShift,
    UnsignedRightShift,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    CompareEq,
    CompareStrictEq,
    CompareNe,
    CompareStrictNe,
    CompareLt,
    CompareLe,
    CompareGt,
    CompareGe,
    LogicalNot,
    Negate,
    BitNot,
    Increment,
    Decrement,
}

#[derive(Clone)]
pub struct HelperTable {
    pub cast: CastFn,
    pub clone_var: CloneFn,
    pub create: CreateFn,
    pub destroy: DestroyFn,
    pub define_property: DefinePropertyFn,
    pub delete_property: DeletePropertyFn,
    pub delete_property_by_name: DeletePropertyByNameFn,
    pub get_property: GetPropertyFn,
    pub get_property_by_name: GetPropertyByNameFn,
    pub get_property_count: GetPropertyCountFn,
    pub get_property_name: GetPropertyNameFn,
    pub get_property_trait: GetPropertyTraitFn,
    pub invoke_operator: InvokeOperatorFn,
    pub lookup_property: LookupPropertyFn,
    pub mark_var: MarkVarFn,
    pub set_property: SetPropertyFn,
    pub set_property_name: SetPropertyNameFn,
    pub set_property_trait: SetPropertyTraitFn,
}

mod default_impls {
    use super::*;
    use crate::error::EjsError;

    pub fn cast(_host: &mut dyn VmHost, v: &Var, _target: &HeapHandle) -> Result<Var> {
        Ok(v.clone())
    }

    pub fn clone_var(_host: &mut dyn VmHost, v: &Var, _deep: bool) -> Result<Var> {
        // Primitives are copy-by-value already; reference types without a
        // type-specific override are shallow-cloned by sharing the handle
        // (mirrors "primitives return self" in spec §4.1).
        Ok(v.clone())
    }

    pub fn create(_host: &mut dyn VmHost, _type_: &HeapHandle, _extra_slots: usize) -> Result<Var> {
        Err(EjsError::Internal(
            "default helper table cannot create instances; use object/block helpers".into(),
        ))
    }

    pub fn destroy(_v: &Var) {}

    pub fn define_property(
        _v: &Var,
        _slot: i32,
        _name: &Name,
        _type_: Option<HeapHandle>,
        _attrs: crate::flags::TraitAttrs,
        _value: Var,
    ) -> Result<i32> {
        Err(EjsError::Reference(
            "defineProperty not supported on a non-dynamic, non-block value".into(),
        ))
    }

    pub fn delete_property(_v: &Var, _slot: i32) -> Result<()> {
        Err(EjsError::Reference("deleteProperty not supported".into()))
    }

    pub fn delete_property_by_name(_v: &Var, _name: &Name) -> Result<()> {
        Err(EjsError::Reference(
            "deletePropertyByName not supported".into(),
        ))
    }

    pub fn get_property(_v: &Var, _slot: i32) -> Result<Var> {
        Ok(Var::Undefined)
    }

    pub fn get_property_by_name(_v: &Var, _name: &Name) -> Result<Var> {
        Ok(Var::Undefined)
    }

    pub fn get_property_count(_v: &Var) -> usize {
        0
    }

    pub fn get_property_name(_v: &Var, _slot: i32) -> Option<Name> {
        None
    }

    pub fn get_property_trait(_v: &Var, _slot: i32) -> Option<SlotTrait> {
        None
    }

    pub fn invoke_operator(
        host: &mut dyn VmHost,
        lhs: &Var,
        op: Operator,
        rhs: Option<&Var>,
    ) -> Result<Var> {
        crate::cast::invoke_primitive_operator(host, lhs, op, rhs)
    }

    pub fn lookup_property(_v: &Var, _name: &Name) -> i32 {
        -1
    }

    pub fn mark_var(_v: &Var, _visit: &mut dyn FnMut(&Var)) {}

    pub fn set_property(_v: &Var, _slot: i32, _value: Var) -> Result<()> {
        Err(EjsError::Reference("setProperty not supported".into()))
    }

    pub fn set_property_name(_v: &Var, _name: &Name, _value: Var) -> Result<i32> {
        Err(EjsError::Reference("setPropertyName not supported".into()))
    }

    pub fn set_property_trait(
        _v: &Var,
        _slot: i32,
        _type_: Option<HeapHandle>,
        _attrs: crate::flags::TraitAttrs,
    ) -> Result<()> {
        Err(EjsError::Reference("setPropertyTrait not supported".into()))
    }
}

/// The `default` helper table: primitive casts, no property storage at
/// all (spec §4.1: "A type selects one at creation").
pub fn default_helpers() -> HelperTable {
    use default_impls::*;
    HelperTable {
        cast,
        clone_var,
        create,
        destroy,
        define_property,
        delete_property,
        delete_property_by_name,
        get_property,
        get_property_by_name,
        get_property_count,
        get_property_name,
        get_property_trait,
        invoke_operator,
        lookup_property,
        mark_var,
        set_property,
        set_property_name,
        set_property_trait,
    }
}

/// Shared storage ops for anything whose payload carries an `ObjectData`
/// prefix (Object, Block, Function, Frame, Type all qualify, since the
/// prefix relationship holds for every member of the family — spec §4.2).
mod object_impls {
    use super::*;
    use crate::error::EjsError;

    fn handle(v: &Var) -> Result<&HeapHandle> {
        v.as_ref_handle()
            .ok_or_else(|| EjsError::Type("property operation requires a reference value".into()))
    }

    fn slot_index(slot: i32) -> Result<usize> {
        usize::try_from(slot).map_err(|_| EjsError::OutOfBounds(format!("negative slot {slot}")))
    }

    /// Whether a brand-new named property may be hung off this instance
    /// at runtime (spec §8 "Setting a property on a non-dynamic Object
    /// raises ReferenceError"). A plain object with no type (object/array
    /// literals) is always dynamic; otherwise it's the owning type's
    /// `DYNAMIC_INSTANCE` flag, or `VarFlags::DYNAMIC` on the instance
    /// itself, that decides.
    fn is_dynamic(h: &HeapHandle) -> bool {
        let b = h.borrow();
        if b.flags.contains(crate::flags::VarFlags::DYNAMIC) {
            return true;
        }
        match &b.type_ {
            Some(t) => t
                .borrow()
                .as_type()
                .map(|td| td.flags.contains(crate::flags::TypeFlags::DYNAMIC_INSTANCE))
                .unwrap_or(true),
            None => true,
        }
    }

    pub fn create(_host: &mut dyn VmHost, type_: &HeapHandle, extra_slots: usize) -> Result<Var> {
        let (names, base_len) = {
            let t = type_.borrow();
            match t.as_type().and_then(|td| td.instance_block.as_ref()) {
                Some(instance) => {
                    let ib = instance.borrow();
                    let obj = ib.as_object();
                    (obj.names.clone(), obj.slots.len())
                }
                None => (Rc::new(NamesTable::new()), 0),
            }
        };
        let data = ObjectData {
            slots: vec![Var::Undefined; base_len + extra_slots],
            names,
        };
        let heap = Heap::object(Some(type_.clone()), crate::flags::VarFlags::empty(), data);
        Ok(Var::Ref(Rc::new(RefCell::new(heap))))
    }

    pub fn clone_var(host: &mut dyn VmHost, v: &Var, deep: bool) -> Result<Var> {
        let h = handle(v)?;
        let (type_, names, slots) = {
            let b = h.borrow();
            let obj = b.as_object();
            (b.type_.clone(), obj.names.clone(), obj.slots.clone())
        };
        let slots = if deep {
            slots
                .into_iter()
                .map(|s| if matches!(s, Var::Ref(_)) { clone_var(host, &s, true) } else { Ok(s) })
                .collect::<Result<Vec<_>>>()?
        } else {
            slots
        };
        let data = ObjectData { slots, names };
        let heap = Heap::object(type_, crate::flags::VarFlags::empty(), data);
        Ok(Var::Ref(Rc::new(RefCell::new(heap))))
    }

    pub fn get_property(v: &Var, slot: i32) -> Result<Var> {
        let h = handle(v)?;
        let idx = slot_index(slot)?;
        let b = h.borrow();
        b.as_object()
            .slots
            .get(idx)
            .cloned()
            .ok_or_else(|| EjsError::OutOfBounds(format!("slot {slot} out of range")))
    }

    pub fn get_property_by_name(v: &Var, name: &Name) -> Result<Var> {
        let slot = lookup_property(v, name);
        if slot < 0 {
            Ok(Var::Undefined)
        } else {
            get_property(v, slot)
        }
    }

    pub fn get_property_count(v: &Var) -> usize {
        handle(v).map(|h| h.borrow().as_object().slots.len()).unwrap_or(0)
    }

    pub fn get_property_name(v: &Var, slot: i32) -> Option<Name> {
        let h = handle(v).ok()?;
        let idx = usize::try_from(slot).ok()?;
        let b = h.borrow();
        b.as_object().names.entries.get(idx).map(|e| e.name.clone())
    }

    pub fn lookup_property(v: &Var, name: &Name) -> i32 {
        match handle(v) {
            Ok(h) => h.borrow().as_object().names.lookup(name),
            Err(_) => -1,
        }
    }

    pub fn define_property(
        v: &Var,
        slot: i32,
        name: &Name,
        _type_: Option<HeapHandle>,
        _attrs: crate::flags::TraitAttrs,
        value: Var,
    ) -> Result<i32> {
        let h = handle(v)?;
        if slot < 0 && lookup_property(v, name) < 0 && !is_dynamic(h) {
            return Err(EjsError::Reference(format!("cannot add property '{}' to a non-dynamic object", name.name)));
        }
        let mut b = h.borrow_mut();
        let obj = b.as_object_mut();
        let target = if slot >= 0 { slot as usize } else { obj.slots.len() };
        while obj.slots.len() <= target {
            obj.slots.push(Var::Undefined);
        }
        obj.slots[target] = value;
        obj.names_mut().insert(name.clone(), target);
        Ok(target as i32)
    }

    pub fn delete_property(v: &Var, slot: i32) -> Result<()> {
        let h = handle(v)?;
        let idx = slot_index(slot)?;
        let mut b = h.borrow_mut();
        let obj = b.as_object_mut();
        if idx >= obj.slots.len() {
            return Err(EjsError::OutOfBounds(format!("slot {slot} out of range")));
        }
        // Deleting never renumbers a surviving slot; length only shrinks
        // when the removed slot was the last one (spec §9 "shrink only
        // when the removed index equals length-1").
        if idx == obj.slots.len() - 1 {
            obj.slots.pop();
            let names = obj.names_mut();
            if idx < names.entries.len() {
                names.entries.truncate(idx);
                names.rehash();
            }
        } else {
            obj.slots[idx] = Var::Undefined;
            let names = obj.names_mut();
            if idx < names.entries.len() {
                names.entries[idx].name = Name::unqualified("");
            }
        }
        Ok(())
    }

    pub fn delete_property_by_name(v: &Var, name: &Name) -> Result<()> {
        let slot = lookup_property(v, name);
        if slot < 0 {
            return Err(EjsError::Reference(format!("no such property '{}'", name.name)));
        }
        delete_property(v, slot)
    }

    pub fn set_property(v: &Var, slot: i32, value: Var) -> Result<()> {
        let h = handle(v)?;
        let idx = slot_index(slot)?;
        let mut b = h.borrow_mut();
        let obj = b.as_object_mut();
        if idx >= obj.slots.len() {
            return Err(EjsError::OutOfBounds(format!("slot {slot} out of range")));
        }
        obj.slots[idx] = value;
        Ok(())
    }

    pub fn set_property_name(v: &Var, name: &Name, value: Var) -> Result<i32> {
        let existing = lookup_property(v, name);
        if existing >= 0 {
            set_property(v, existing, value)?;
            Ok(existing)
        } else {
            define_property(v, -1, name, None, crate::flags::TraitAttrs::empty(), value)
        }
    }

    pub fn mark_var(v: &Var, visit: &mut dyn FnMut(&Var)) {
        if let Ok(h) = handle(v) {
            let b = h.borrow();
            if let Some(t) = &b.type_ {
                visit(&Var::Ref(t.clone()));
            }
            for s in &b.as_object().slots {
                if matches!(s, Var::Ref(_)) {
                    visit(s);
                }
            }
        }
    }
}

/// `object` helpers: `default` plus hashed-name property storage on
/// `ObjectData` (spec §4.2).
pub fn object_helpers_base() -> HelperTable {
    HelperTable {
        create: object_impls::create,
        clone_var: object_impls::clone_var,
        get_property: object_impls::get_property,
        get_property_by_name: object_impls::get_property_by_name,
        get_property_count: object_impls::get_property_count,
        get_property_name: object_impls::get_property_name,
        lookup_property: object_impls::lookup_property,
        define_property: object_impls::define_property,
        delete_property: object_impls::delete_property,
        delete_property_by_name: object_impls::delete_property_by_name,
        set_property: object_impls::set_property,
        set_property_name: object_impls::set_property_name,
        mark_var: object_impls::mark_var,
        ..default_helpers()
    }
}

/// Trait-aware storage for anything with a `BlockData` prefix (Block,
/// Function, Frame, Type — spec §4.2/§4.3).
mod block_impls {
    use super::*;
    use crate::error::EjsError;
    use crate::flags::TraitAttrs;

    fn handle(v: &Var) -> Result<&HeapHandle> {
        v.as_ref_handle()
            .ok_or_else(|| EjsError::Type("property operation requires a reference value".into()))
    }

    pub fn define_property(
        v: &Var,
        slot: i32,
        name: &Name,
        type_: Option<HeapHandle>,
        attrs: TraitAttrs,
        value: Var,
    ) -> Result<i32> {
        let h = handle(v)?;
        let mut b = h.borrow_mut();
        let blk = b
            .as_block_mut()
            .ok_or_else(|| EjsError::Type("defineProperty requires a Block-derived value".into()))?;
        let target = if slot >= 0 { slot as usize } else { blk.object.slots.len() };
        while blk.object.slots.len() <= target {
            blk.object.slots.push(Var::Undefined);
        }
        while blk.traits.len() <= target {
            blk.traits.push(SlotTrait::default());
        }
        blk.object.slots[target] = value;
        blk.traits[target] = SlotTrait { type_, attributes: attrs };
        blk.object.names_mut().insert(name.clone(), target);
        Ok(target as i32)
    }

    pub fn set_property(v: &Var, slot: i32, value: Var) -> Result<()> {
        let h = handle(v)?;
        let idx = usize::try_from(slot).map_err(|_| EjsError::OutOfBounds(format!("negative slot {slot}")))?;
        let mut b = h.borrow_mut();
        let blk = b
            .as_block_mut()
            .ok_or_else(|| EjsError::Type("setProperty requires a Block-derived value".into()))?;
        if let Some(t) = blk.traits.get(idx) {
            if t.attributes.contains(TraitAttrs::READONLY) {
                return Err(EjsError::Reference("property is read-only".into()));
            }
        }
        if idx >= blk.object.slots.len() {
            return Err(EjsError::OutOfBounds(format!("slot {slot} out of range")));
        }
        blk.object.slots[idx] = value;
        Ok(())
    }

    pub fn get_property_trait(v: &Var, slot: i32) -> Option<SlotTrait> {
        let h = handle(v).ok()?;
        let idx = usize::try_from(slot).ok()?;
        let b = h.borrow();
        b.as_block()?.traits.get(idx).cloned()
    }

    pub fn set_property_trait(
        v: &Var,
        slot: i32,
        type_: Option<HeapHandle>,
        attrs: TraitAttrs,
    ) -> Result<()> {
        let h = handle(v)?;
        let idx = usize::try_from(slot).map_err(|_| EjsError::OutOfBounds(format!("negative slot {slot}")))?;
        let mut b = h.borrow_mut();
        let blk = b
            .as_block_mut()
            .ok_or_else(|| EjsError::Type("setPropertyTrait requires a Block-derived value".into()))?;
        while blk.traits.len() <= idx {
            blk.traits.push(SlotTrait::default());
        }
        blk.traits[idx] = SlotTrait { type_, attributes: attrs };
        Ok(())
    }

    pub fn mark_var(v: &Var, visit: &mut dyn FnMut(&Var)) {
        let Ok(h) = handle(v) else { return };
        let b = h.borrow();
        if let Some(t) = &b.type_ {
            visit(&Var::Ref(t.clone()));
        }
        for s in &b.as_object().slots {
            if matches!(s, Var::Ref(_)) {
                visit(s);
            }
        }
        if let Some(blk) = b.as_block() {
            for t in &blk.traits {
                if let Some(th) = &t.type_ {
                    visit(&Var::Ref(th.clone()));
                }
            }
            if let Some(sc) = &blk.scope_chain {
                visit(&Var::Ref(sc.clone()));
            }
            if let Some(p) = &blk.prev {
                visit(&Var::Ref(p.clone()));
            }
            if let Some(pe) = &blk.prev_exception {
                if matches!(pe, Var::Ref(_)) {
                    visit(pe);
                }
            }
        }
    }
}

/// `block` helpers: `object` plus `Trait`-aware property definitions and
/// scope/namespace bookkeeping (spec §4.3).
pub fn block_helpers_base() -> HelperTable {
    HelperTable {
        define_property: block_impls::define_property,
        set_property: block_impls::set_property,
        get_property_trait: block_impls::get_property_trait,
        set_property_trait: block_impls::set_property_trait,
        mark_var: block_impls::mark_var,
        ..object_helpers_base()
    }
}
