//! The interpreter-side services the dispatch loop needs beyond the
//! narrow [`ejs_value::VmHost`] native-code surface: the global object,
//! the `ejs.result` slot, and the GC work-quota checkpoint (spec §4.5
//! "attention ... re-checked after every instruction").
//!
//! `ejs-vm` still cannot depend on the root crate (same layering reason
//! as `ejs_value::host`), so the root crate's `Ejs` implements this trait
//! instead of the dispatch loop owning GC/global state directly.

use ejs_value::{HeapHandle, Var, VmHost};

pub trait VmContext: VmHost {
    /// The global object every scope chain bottoms out at (spec §4.3
    /// "Global is searched last").
    fn global(&self) -> HeapHandle;

    /// `ejs.result`: where a completed call's return value is deposited
    /// before the VM state is restored (spec §4.5 "Return").
    fn set_result(&mut self, v: Var);

    /// Runs the GC's work-quota checkpoint (spec §4.7 "every allocation
    /// increments workDone; when it reaches workQuota ... attention is
    /// raised"), given the roots the *caller* can see right now (eval
    /// stack depth, frame/block chain). A no-op if no collection is due.
    fn maybe_collect(&mut self, roots: &[Var]);

    /// Resolves a `TypeRef`'s global slot into a live `Type`, used to
    /// check a thrown value against a handler's declared catch type.
    fn global_slot(&self, slot: i32) -> Option<Var>;

    /// `ejs.exception`: set by [`VmHost::throw`], consulted by the
    /// dispatch loop's post-instruction attention check (spec §4.6).
    fn exception(&self) -> Option<Var>;

    /// Clears `ejs.exception`, done once a handler has taken ownership of
    /// it (the value itself is pushed to the eval stack for the `catch`
    /// body to bind).
    fn clear_exception(&mut self);
}
