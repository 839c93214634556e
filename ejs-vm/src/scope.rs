//! Scope-chain and by-name property lookup (spec §4.3).

use ejs_value::name::{Name, Namespace};
use ejs_value::var::HeapHandle;
use ejs_value::Var;

/// Where a name resolved to (spec §4.3 "Lookup returns a record: {obj
/// found in, slot, nthBase, nthBlock, instanceProperty, useThis}").
#[derive(Debug, Clone)]
pub struct ScopeResult {
    pub obj: HeapHandle,
    pub slot: i32,
    pub nth_block: u32,
    pub nth_base: u32,
    pub instance_property: bool,
    pub use_this: bool,
}

/// Tries every namespace open on `block`, most-recently-opened first
/// (spec §4.2 "the lookup walker iterates this list in LIFO order"),
/// plus the public/empty namespace as a fallback.
fn lookup_in_block(block: &HeapHandle, name: &str) -> Option<i32> {
    let b = block.borrow();
    let blk = b.as_block()?;
    for ns in blk.namespaces.iter().rev() {
        let qualified = Name::new(name, ns.space(None));
        let slot = blk.object.names.lookup(&qualified);
        if slot >= 0 {
            return Some(slot);
        }
    }
    let public = Name::new(name, Namespace::public("public").space(None));
    let slot = blk.object.names.lookup(&public);
    if slot >= 0 {
        Some(slot)
    } else {
        None
    }
}

/// Walks the `bp` scope chain outward via each block's `prev` link,
/// checking the instance chain first when the block belongs to `this`'s
/// type (spec §4.3 "if the block is the class of `this`, look in the
/// instance chain; otherwise look in the block itself"). `global` is
/// consulted last.
pub fn lookup_scope(bp: &HeapHandle, this_obj: Option<&Var>, global: &HeapHandle, name: &str) -> Option<ScopeResult> {
    let mut nth_block = 0u32;
    let mut current = Some(bp.clone());
    while let Some(block) = current {
        let is_this_class = this_obj
            .and_then(Var::as_ref_handle)
            .map(|t| std::rc::Rc::ptr_eq(t, &block))
            .unwrap_or(false);
        if is_this_class {
            if let Some((slot, nth_base)) = lookup_instance_chain(&block, name) {
                return Some(ScopeResult {
                    obj: block,
                    slot,
                    nth_block,
                    nth_base,
                    instance_property: true,
                    use_this: true,
                });
            }
        } else if let Some(slot) = lookup_in_block(&block, name) {
            return Some(ScopeResult {
                obj: block,
                slot,
                nth_block,
                nth_base: 0,
                instance_property: false,
                use_this: false,
            });
        }
        let next = block.borrow().as_block().and_then(|b| b.prev.clone());
        current = next;
        nth_block += 1;
    }
    lookup_in_block(global, name).map(|slot| ScopeResult {
        obj: global.clone(),
        slot,
        nth_block,
        nth_base: 0,
        instance_property: false,
        use_this: false,
    })
}

/// Walks a type's `baseType` chain looking for `name` among instance
/// traits, returning the depth from the most-derived type (spec §4.1
/// "isA"/"nthBase" in the scope-lookup record).
fn lookup_instance_chain(type_obj: &HeapHandle, name: &str) -> Option<(i32, u32)> {
    let mut depth = 0u32;
    let mut current = Some(type_obj.clone());
    while let Some(t) = current {
        let (slot, base) = {
            let b = t.borrow();
            let td = b.as_type()?;
            let slot = td
                .instance_block
                .as_ref()
                .and_then(|ib| lookup_in_block(ib, name));
            (slot, td.base_type.clone())
        };
        if let Some(slot) = slot {
            return Some((slot, depth));
        }
        current = base;
        depth += 1;
    }
    None
}

/// `ejsGetVarByName`: scope lookup when `obj` is absent, otherwise
/// object-relative lookup with base-class traversal through the
/// per-type helper table (spec §4.3). Never throws; an absent name just
/// yields `Undefined`. A raw read — unlike the dispatch loop's own
/// by-name lookups, this never invokes a getter found along the way.
pub fn get_var_by_name(
    obj: Option<&Var>,
    bp: Option<&HeapHandle>,
    this_obj: Option<&Var>,
    global: &HeapHandle,
    name: &str,
) -> Var {
    match obj {
        Some(v) => {
            let Some(h) = v.as_ref_handle() else {
                return Var::Undefined;
            };
            let helpers = {
                let b = h.borrow();
                b.type_.as_ref().and_then(|t| t.borrow().as_type().and_then(|td| td.helpers.clone()))
            };
            let Some(helpers) = helpers else {
                return Var::Undefined;
            };
            let n = Name::unqualified(name);
            let slot = (helpers.lookup_property)(v, &n);
            if slot < 0 {
                Var::Undefined
            } else {
                (helpers.get_property)(v, slot).unwrap_or(Var::Undefined)
            }
        }
        None => match bp {
            Some(bp) => lookup_scope(bp, this_obj, global, name)
                .map(|r| {
                    let b = r.obj.borrow();
                    b.as_object().slots.get(r.slot as usize).cloned().unwrap_or(Var::Undefined)
                })
                .unwrap_or(Var::Undefined),
            None => Var::Undefined,
        },
    }
}
