//! Per-type free-list pool (spec §4.7 "`pool[type.id]` caches freed
//! instances of a type for reuse; bounded by pool-policy").

use ejs_value::HeapHandle;

#[derive(Default)]
pub struct Pool {
    free: Vec<HeapHandle>,
}

impl Pool {
    pub fn new() -> Self {
        Pool { free: Vec::new() }
    }

    pub fn take(&mut self) -> Option<HeapHandle> {
        self.free.pop()
    }

    pub fn give(&mut self, handle: HeapHandle) {
        self.free.push(handle);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// "drain all type pools": frees every cached instance (spec §4.7
    /// step 4, triggered when still over redline after a sweep).
    pub fn drain(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ejs_value::{flags::VarFlags, Heap, ObjectData};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn dummy() -> HeapHandle {
        Rc::new(RefCell::new(Heap::object(None, VarFlags::empty(), ObjectData::default())))
    }

    #[test]
    fn take_is_lifo() {
        let mut pool = Pool::new();
        let a = dummy();
        let b = dummy();
        pool.give(a.clone());
        pool.give(b.clone());
        assert!(Rc::ptr_eq(&pool.take().unwrap(), &b));
        assert!(Rc::ptr_eq(&pool.take().unwrap(), &a));
        assert!(pool.take().is_none());
    }

    #[test]
    fn drain_empties_pool() {
        let mut pool = Pool::new();
        pool.give(dummy());
        pool.give(dummy());
        pool.drain();
        assert!(pool.is_empty());
    }
}
