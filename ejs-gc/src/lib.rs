//! The generational garbage collector (spec §4.7): three generations of
//! live allocations plus a per-type free-list pool, mark-and-sweep with a
//! work-quota trigger.
//!
//! Rust's `Rc` already frees memory the instant the last strong reference
//! drops, so this collector's job is narrower than the C original's: it
//! decides *when* a sweep runs, ages survivors between generations, keeps
//! per-type pools of recycled instances for `allocPooled`, and invokes the
//! `destroy` helper on anything a sweep reclaims. An allocation is "leaked"
//! from the generation's point of view only if something else still holds
//! an `Rc` to it — which is precisely reachability.

mod pool;

pub use pool::Pool;

use ejs_value::{Heap, HeapHandle, Var, VarFlags};
use std::collections::HashMap;
use tracing::{debug, trace};

/// The three ages a live allocation can belong to (spec §3 "Interpreter",
/// §4.7 "three generations").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    New,
    Old,
    Eternal,
}

impl Generation {
    const ALL: [Generation; 3] = [Generation::New, Generation::Old, Generation::Eternal];

    fn index(self) -> usize {
        match self {
            Generation::New => 0,
            Generation::Old => 1,
            Generation::Eternal => 2,
        }
    }
}

/// Allocation/collection counters exposed to a host via the embedding
/// API's allocation notifier (spec §4.7a).
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub work_done: u64,
    pub allocations: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub collections: u64,
    pub swept: u64,
}

/// Tunables for when a collection is due and when pools get drained.
#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    /// Allocations between automatic collections (spec §4.7 `workQuota`).
    pub work_quota: u64,
    /// Total pooled-instance count above which a post-sweep pool drain
    /// kicks in (spec §4.7 "redline").
    pub redline_pool_size: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            work_quota: 4096,
            redline_pool_size: 2048,
        }
    }
}

/// The collector state for one interpreter. Not `Send`/`Sync`: GC is
/// single-threaded per interpreter (spec §4.7 "Concurrency").
pub struct Gc {
    config: GcConfig,
    generations: [Vec<HeapHandle>; 3],
    pools: HashMap<i32, Pool>,
    stats: GcStats,
    gc_required: bool,
}

impl Gc {
    pub fn new(config: GcConfig) -> Self {
        Gc {
            config,
            generations: [Vec::new(), Vec::new(), Vec::new()],
            pools: HashMap::new(),
            stats: GcStats::default(),
            gc_required: false,
        }
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Whether `workDone` has reached `workQuota` since the last sweep
    /// (spec §4.7 "attention raised").
    pub fn gc_required(&self) -> bool {
        self.gc_required
    }

    /// Live allocation count in a generation, for hosts and tests
    /// observing collector behavior without reaching into internals.
    pub fn generation_count(&self, gen: Generation) -> usize {
        self.generations[gen.index()].len()
    }

    /// `allocPooled`: reuse a freed instance of `type_id` if one is
    /// cached, otherwise fall back to `create` (spec §4.7 "Allocation").
    /// `create` always runs — it's what produces a correctly shaped,
    /// correctly initialized object for *this* call's requested shape —
    /// but on a pool hit its output is spliced into the recycled handle
    /// rather than handed back directly, so callers that held onto the
    /// recycled `Rc` (e.g. via a prior `Var::Ref` clone that outlived the
    /// sweep) still see the fresh contents. The returned handle is
    /// registered in the `New` generation.
    pub fn alloc_pooled(
        &mut self,
        type_id: i32,
        create: impl FnOnce() -> ejs_value::Result<HeapHandle>,
    ) -> ejs_value::Result<HeapHandle> {
        let fresh = create()?;
        let handle = match self.pools.get_mut(&type_id).and_then(Pool::take) {
            Some(recycled) => {
                self.stats.pool_hits += 1;
                let fresh_heap = std::rc::Rc::try_unwrap(fresh)
                    .expect("a freshly created handle has exactly one owner")
                    .into_inner();
                {
                    let mut r = recycled.borrow_mut();
                    reset_for_reuse(&mut r, fresh_heap.type_.clone());
                    r.payload = fresh_heap.payload;
                }
                recycled
            }
            None => {
                self.stats.pool_misses += 1;
                fresh
            }
        };
        self.generations[Generation::New.index()].push(handle.clone());
        self.stats.allocations += 1;
        self.stats.work_done += 1;
        if self.stats.work_done >= self.config.work_quota {
            self.gc_required = true;
        }
        Ok(handle)
    }

    /// Registers an allocation directly as permanent/eternal (spec §4.8
    /// "Singletons ... created once per interpreter and marked permanent").
    pub fn register_eternal(&mut self, handle: HeapHandle) {
        handle.borrow_mut().flags.insert(VarFlags::PERMANENT);
        self.generations[Generation::Eternal.index()].push(handle);
    }

    /// `collectGarbage(gen)`: unmark, mark from roots, sweep generations
    /// `0..=gen`, age survivors, and drain pools if still over redline
    /// (spec §4.7 steps 1-5).
    pub fn collect(&mut self, gen: Generation, roots: &[Var]) {
        let span = tracing::info_span!("gc_collect", ?gen, work_done = self.stats.work_done);
        let _enter = span.enter();

        let upto = gen.index();
        for g in &Generation::ALL[..=upto] {
            for h in &self.generations[g.index()] {
                h.borrow_mut().flags.remove(VarFlags::MARKED | VarFlags::VISITED);
            }
        }

        for root in roots {
            mark(root);
        }

        let mut swept = 0u64;
        for g in &Generation::ALL[..=upto] {
            let idx = g.index();
            let mut survivors = Vec::with_capacity(self.generations[idx].len());
            for h in self.generations[idx].drain(..) {
                let (marked, permanent, type_id) = {
                    let b = h.borrow();
                    let type_id = b
                        .type_
                        .as_ref()
                        .and_then(|t| t.borrow().as_type().map(|td| td.id))
                        .unwrap_or(-1);
                    (
                        b.flags.contains(VarFlags::MARKED),
                        b.flags.contains(VarFlags::PERMANENT),
                        type_id,
                    )
                };
                if marked || permanent {
                    survivors.push(h);
                } else {
                    destroy(&h);
                    swept += 1;
                    if std::rc::Rc::strong_count(&h) == 1 {
                        self.pools.entry(type_id).or_insert_with(Pool::new).give(h);
                    }
                }
            }
            // Survivors of a New-generation sweep age into Old; Old/Eternal
            // survivors stay put.
            if *g == Generation::New {
                self.generations[Generation::Old.index()].extend(survivors);
            } else {
                self.generations[idx] = survivors;
            }
        }

        self.stats.collections += 1;
        self.stats.swept += swept;
        self.stats.work_done = 0;
        self.gc_required = false;
        debug!(swept, "gc sweep complete");

        let pooled_total: usize = self.pools.values().map(Pool::len).sum();
        if pooled_total > self.config.redline_pool_size {
            trace!(pooled_total, "redline exceeded, draining pools");
            for pool in self.pools.values_mut() {
                pool.drain();
            }
        }
    }
}

/// Depth-first mark, following the per-type `markVar` helper; stops at
/// already-visited nodes (spec §4.7 "No object is visited twice").
fn mark(v: &Var) {
    let Some(h) = v.as_ref_handle() else { return };
    {
        let mut b = h.borrow_mut();
        if b.flags.contains(VarFlags::VISITED) {
            return;
        }
        b.flags.insert(VarFlags::MARKED | VarFlags::VISITED);
    }
    let helpers = {
        let b = h.borrow();
        b.type_
            .as_ref()
            .and_then(|t| t.borrow().as_type().and_then(|td| td.helpers.clone()))
    };
    if let Some(helpers) = helpers {
        (helpers.mark_var)(v, &mut |child| mark(child));
    }
}

fn destroy(h: &HeapHandle) {
    let helpers = {
        let b = h.borrow();
        b.type_
            .as_ref()
            .and_then(|t| t.borrow().as_type().and_then(|td| td.helpers.clone()))
    };
    if let Some(helpers) = helpers {
        (helpers.destroy)(&Var::Ref(h.clone()));
    }
}

/// Resets a recycled `Heap` in place before it's handed back out as a
/// fresh instance (used by callers of [`Gc::alloc_pooled`] together with
/// [`Pool::take`]).
pub fn reset_for_reuse(heap: &mut Heap, type_: Option<HeapHandle>) {
    heap.type_ = type_;
    heap.flags = VarFlags::empty();
}


#[cfg(test)]
mod properties {
    use super::*;
    use ejs_value::{helpers::HelperTable, ObjectData, TypeData};
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn leaf_type(id: i32, helpers: HelperTable) -> HeapHandle {
        let mut td = TypeData::default();
        td.id = id;
        td.helpers = Some(Rc::new(helpers));
        Rc::new(RefCell::new(Heap::type_obj(None, VarFlags::empty(), td)))
    }

    fn new_object(type_: HeapHandle) -> HeapHandle {
        Rc::new(RefCell::new(Heap::object(
            Some(type_),
            VarFlags::empty(),
            ObjectData::default(),
        )))
    }

    proptest! {
        /// P3 GC soundness: anything reachable from the roots passed to
        /// `collect` is still reachable (same pointer) afterward (spec §8).
        #[test]
        fn reachable_roots_survive_collection(n_rooted in 1usize..12, n_garbage in 0usize..12) {
            let mut gc = Gc::new(GcConfig::default());
            let ty = leaf_type(10, ejs_value::helpers::default_helpers());

            let roots: Vec<Var> = (0..n_rooted)
                .map(|_| Var::Ref(gc.alloc_pooled(10, || Ok(new_object(ty.clone()))).unwrap()))
                .collect();
            for _ in 0..n_garbage {
                gc.alloc_pooled(10, || Ok(new_object(ty.clone()))).unwrap();
            }

            let before: Vec<*const RefCell<Heap>> =
                roots.iter().map(|v| Rc::as_ptr(v.as_ref_handle().unwrap())).collect();
            gc.collect(Generation::New, &roots);
            let after: Vec<*const RefCell<Heap>> =
                roots.iter().map(|v| Rc::as_ptr(v.as_ref_handle().unwrap())).collect();
            prop_assert_eq!(before, after);
        }

        /// P4 Refcount-free non-leak: pushing N unreachable temporaries and
        /// collecting the New generation returns its live count to the
        /// pre-push value (spec §8).
        #[test]
        fn unreachable_temporaries_do_not_leak(n in 0usize..20) {
            let mut gc = Gc::new(GcConfig::default());
            let ty = leaf_type(11, ejs_value::helpers::default_helpers());
            gc.collect(Generation::New, &[]);
            let baseline = gc.generation_count(Generation::New);

            for _ in 0..n {
                let _ = gc.alloc_pooled(11, || Ok(new_object(ty.clone()))).unwrap();
            }
            gc.collect(Generation::New, &[]);
            prop_assert_eq!(gc.generation_count(Generation::New), baseline);
        }
    }
}
