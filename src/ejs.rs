//! `Ejs`: one running interpreter (spec §3 "Interpreter", §4.8 "Interpreter
//! Lifecycle & Cloning"). Owns the GC, the VM's evaluation stack, the
//! global block, the core-type hash, and the embedding-API surface (§6.3).

use crate::service::Service;
use ejs_gc::{Gc, GcConfig, GcStats, Generation};
use ejs_loader::model::{LoaderAttrs, LoadedModule};
use ejs_value::error::{EjsError, Result};
use ejs_value::flags::VarFlags;
use ejs_value::helpers::{block_helpers_base, object_helpers_base};
use ejs_value::name::Name;
use ejs_value::var::{BlockData, Heap, ObjectData, TypeData};
use ejs_value::{HeapHandle, Var, VmHost};
use ejs_vm::{context::VmContext, Vm};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{debug, info_span, warn};

/// Core types whose instances a slave interpreter must be able to mutate
/// independently of its master (spec §4.8 "clone a small number of
/// intrinsically mutable types (XML, DB, web connector)"). The concrete
/// native behavior behind these names is out of scope here — the class
/// library's method bodies are not reimplemented — but the cloning rule
/// itself is general: it just needs a name to key off of.
const INTRINSICALLY_MUTABLE_TYPES: &[&str] = &["XML", "Database", "WebConnector"];

/// Types whose instances are themselves block-shaped (own a slot table and
/// traits) rather than plain property bags; these get `block_helpers_base`
/// instead of `object_helpers_base`.
fn is_block_shaped(name: &str) -> bool {
    matches!(name, "Type" | "Block" | "Function" | "Global")
}

/// Last-reported failure, for the embedding API's "report last error"
/// surface (spec §6.3). Kept distinct from the live `exception` slot: an
/// interpreter may clear its exception and keep running, but a host asking
/// "what went wrong last" still wants the answer.
#[derive(Debug, Clone, Default)]
pub struct LastError {
    pub message: String,
    pub stack: String,
    pub file: String,
    pub line: u32,
}

/// One interpreter. Not `Send`/`Sync` — GC and dispatch are single-threaded
/// per interpreter (spec §5).
pub struct Ejs {
    service: Rc<RefCell<Service>>,
    gc: Gc,
    vm: Vm,
    global: HeapHandle,
    /// Shared with a master/its other slaves; see [`Ejs::new_slave`].
    core_types: Rc<RefCell<HashMap<String, HeapHandle>>>,
    /// Per-slave overrides for [`INTRINSICALLY_MUTABLE_TYPES`], checked
    /// before `core_types`.
    private_types: HashMap<String, HeapHandle>,
    modules: Rc<RefCell<Vec<LoadedModule>>>,
    loaded_names: Rc<RefCell<HashSet<String>>>,
    initialized: HashSet<String>,
    search_dirs: Vec<PathBuf>,
    result: Var,
    exception: Option<Var>,
    gc_enabled: bool,
    alloc_notifier: Option<fn(GcStats)>,
    last_error: Option<LastError>,
    next_type_id: i32,
}

impl Ejs {
    /// Creates a standalone master interpreter: fresh GC generations, a
    /// fresh global block, and the bootstrap core types (spec §4.8 step 4).
    pub fn new(service: Rc<RefCell<Service>>) -> Result<Self> {
        let global = Rc::new(RefCell::new(Heap::block(None, VarFlags::PERMANENT, BlockData::default())));
        let mut ejs = Ejs {
            service,
            gc: Gc::new(GcConfig::default()),
            vm: Vm::new(),
            global,
            core_types: Rc::new(RefCell::new(HashMap::new())),
            private_types: HashMap::new(),
            modules: Rc::new(RefCell::new(Vec::new())),
            loaded_names: Rc::new(RefCell::new(HashSet::new())),
            initialized: HashSet::new(),
            search_dirs: ejs_loader::search::default_search_dirs(
                std::env::var("EJSPATH").ok().as_deref(),
                None,
                &std::env::current_dir().unwrap_or_default(),
            ),
            result: Var::Undefined,
            exception: None,
            gc_enabled: true,
            alloc_notifier: None,
            last_error: None,
            next_type_id: 1,
        };
        crate::bootstrap::create_core_types(&mut ejs)?;
        Ok(ejs)
    }

    /// Creates a slave sharing `master`'s core types, modules registry, and
    /// loaded-name set by reference, with its own global block seeded from
    /// the master's slot values and its own GC/eval-stack state (spec §4.8
    /// step 3).
    pub fn new_slave(master: &Ejs) -> Result<Self> {
        let global = clone_global_for_slave(&master.global);
        let mut private_types = HashMap::new();
        for name in INTRINSICALLY_MUTABLE_TYPES {
            if let Some(handle) = master.core_types.borrow().get(*name) {
                private_types.insert((*name).to_string(), deep_clone_type(handle));
            }
        }
        Ok(Ejs {
            service: master.service.clone(),
            gc: Gc::new(GcConfig::default()),
            vm: Vm::new(),
            global,
            core_types: master.core_types.clone(),
            private_types,
            modules: master.modules.clone(),
            loaded_names: master.loaded_names.clone(),
            initialized: HashSet::new(),
            search_dirs: master.search_dirs.clone(),
            result: Var::Undefined,
            exception: None,
            gc_enabled: master.gc_enabled,
            alloc_notifier: None,
            last_error: None,
            next_type_id: master.next_type_id,
        })
    }

    // -- bootstrap helpers (pub(crate), used by `crate::bootstrap`) -----

    pub(crate) fn next_type_id(&mut self) -> i32 {
        let id = self.next_type_id;
        self.next_type_id += 1;
        id
    }

    /// Builds one bootstrap core type's shell, defines it on the global
    /// block under its own name, and records it in the core-type hash.
    pub(crate) fn define_core_type(&mut self, name: &str) -> Result<HeapHandle> {
        let id = self.next_type_id();
        let helpers = if is_block_shaped(name) { block_helpers_base() } else { object_helpers_base() };
        let type_data = TypeData {
            block: BlockData::default(),
            base_type: None,
            instance_block: Some(Rc::new(RefCell::new(Heap::block(None, VarFlags::empty(), BlockData::default())))),
            implements: Vec::new(),
            id,
            instance_size: 0,
            sub_type_count: 0,
            helpers: Some(Rc::new(helpers)),
            module_name: None,
            flags: Default::default(),
        };
        let handle = Rc::new(RefCell::new(Heap::type_obj(None, VarFlags::PERMANENT | VarFlags::BUILTIN, type_data)));
        let global = Var::Ref(self.global.clone());
        (block_helpers_base().define_property)(
            &global,
            -1,
            &Name::unqualified(name),
            None,
            ejs_value::flags::TraitAttrs::ENUMERABLE,
            Var::Ref(handle.clone()),
        )?;
        self.core_types.borrow_mut().insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    // -- embedding API (spec §6.3) ---------------------------------------

    pub fn set_search_path(&mut self, dirs: Vec<PathBuf>) {
        self.search_dirs = dirs;
    }

    pub fn append_search_path(&mut self, dir: PathBuf) {
        self.search_dirs.push(dir);
    }

    pub fn install_native_module(&mut self, name: impl Into<String>, configurator: crate::service::NativeModuleConfigurator) {
        self.service.borrow_mut().install_native_module(name, configurator);
    }

    /// Resolves `name` against the search path, decodes it, installs its
    /// classes/functions/properties, and runs its native configurator (if
    /// one has been registered) — a no-op if `name` was already loaded
    /// (spec §4.4/§6.3 "Load module by name with version range").
    pub fn load_module(&mut self, name: &str, min_version: u32, max_version: u32) -> Result<()> {
        if self.loaded_names.borrow().contains(name) {
            return Ok(());
        }
        let span = info_span!("load_module", name);
        let _enter = span.enter();

        let candidates = ejs_loader::search::resolve(name, &self.search_dirs, min_version, max_version);
        let path = candidates
            .first()
            .ok_or_else(|| EjsError::Io(format!("module not found on search path: {name}")))?
            .clone();
        let bytes = std::fs::read(&path).map_err(|e| EjsError::Io(format!("reading {}: {e}", path.display())))?;
        let decoded = ejs_loader::decode_module(&bytes)?;
        ejs_vm::install::install_modules(self, &decoded.modules, &decoded.fixups)?;

        self.loaded_names.borrow_mut().insert(name.to_string());
        debug!(modules = decoded.modules.len(), "module installed");
        self.modules.borrow_mut().extend(decoded.modules);

        if let Some(configurator) = self.service.borrow().native_module(name) {
            configurator(self)?;
        }
        Ok(())
    }

    /// Runs every not-yet-initialized module's dependencies depth-first,
    /// then the module itself (spec §4.8 "Running a module").
    pub fn run_initializers(&mut self) -> Result<()> {
        let modules = self.modules.borrow().clone();
        for (index, module) in modules.iter().enumerate() {
            self.run_initializer(&modules, index, &mut HashSet::new())?;
        }
        Ok(())
    }

    fn run_initializer(&mut self, modules: &[LoadedModule], index: usize, visiting: &mut HashSet<usize>) -> Result<()> {
        let module_name = modules[index].string(modules[index].name_token).unwrap_or("").to_string();
        if self.initialized.contains(&module_name) || !visiting.insert(index) {
            return Ok(());
        }
        for dep in &modules[index].dependencies {
            let dep_name = modules[index].string(dep.name_token).unwrap_or("");
            if let Some(dep_index) = modules.iter().position(|m| m.string(m.name_token).unwrap_or("") == dep_name) {
                self.run_initializer(modules, dep_index, visiting)?;
            }
        }
        if let Some(func) = modules[index]
            .functions
            .iter()
            .find(|f| f.attributes.contains(LoaderAttrs::INITIALIZER))
        {
            if let Some(handle) = self.global_slot(func.slot_num).and_then(|v| v.as_ref_handle().cloned()) {
                self.run_function(&handle, None, &[])?;
            }
        }
        self.initialized.insert(module_name);
        Ok(())
    }

    /// `runFunction` (spec §4.8): activates `func` (native or scripted) and
    /// returns its result. Temporarily takes `self.vm` so it isn't borrowed
    /// both as the dispatch loop's driver and as the `VmContext` it steps
    /// against.
    pub fn run_function(&mut self, func: &HeapHandle, this_obj: Option<Var>, args: &[Var]) -> Result<Var> {
        let mut vm = std::mem::take(&mut self.vm);
        let result = vm.call_function(self, func, this_obj, args);
        self.vm = vm;
        match &result {
            Ok(v) => self.result = v.clone(),
            Err(e) => self.note_last_error(e),
        }
        result
    }

    /// Runs a named top-level function, or an instance/static method of a
    /// named core type if `class` is given (spec §6.3 "Run ... named
    /// function by (class, method)").
    pub fn run_named_function(&mut self, class: Option<&str>, method: &str) -> Result<Var> {
        let target = match class {
            None => self.lookup_global_by_name(method),
            Some(class_name) => self.core_type(class_name).and_then(|type_handle| {
                let b = type_handle.borrow();
                let td = b.as_type()?;
                let slot = (object_helpers_base().lookup_property)(
                    &Var::Ref(td.instance_block.clone().unwrap_or_else(|| type_handle.clone())),
                    &Name::unqualified(method),
                );
                if slot < 0 {
                    None
                } else {
                    (block_helpers_base().get_property)(&Var::Ref(type_handle.clone()), slot)
                        .ok()
                        .and_then(|v| v.as_ref_handle().cloned())
                }
            }),
        };
        let handle = target.ok_or_else(|| EjsError::Reference(format!("function not found: {method}")))?;
        self.run_function(&handle, None, &[])
    }

    fn lookup_global_by_name(&self, name: &str) -> Option<HeapHandle> {
        let b = self.global.borrow();
        let slot = b.as_object().names.lookup(&Name::unqualified(name));
        if slot < 0 {
            return None;
        }
        b.as_object().slots.get(slot as usize).and_then(|v| v.as_ref_handle().cloned())
    }

    pub fn set_alloc_notifier(&mut self, notifier: fn(GcStats)) {
        self.alloc_notifier = Some(notifier);
    }

    pub fn enable_gc(&mut self) {
        self.gc_enabled = true;
    }

    pub fn disable_gc(&mut self) {
        self.gc_enabled = false;
    }

    /// Forces a collection at `gen` regardless of the work quota, rooted at
    /// the global block, the live result, and any pending exception.
    pub fn force_collect(&mut self, gen: Generation) {
        let roots = self.roots();
        self.gc.collect(gen, &roots);
        if let Some(notifier) = self.alloc_notifier {
            notifier(self.gc.stats());
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.stats()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    fn roots(&self) -> Vec<Var> {
        let mut roots = vec![Var::Ref(self.global.clone()), self.result.clone()];
        if let Some(exc) = &self.exception {
            roots.push(exc.clone());
        }
        roots
    }

    fn note_last_error(&mut self, err: &EjsError) {
        warn!(error = %err, "run_function raised an exception");
        self.last_error = Some(LastError {
            message: err.to_string(),
            stack: String::new(),
            file: String::new(),
            line: 0,
        });
    }
}

fn clone_global_for_slave(master_global: &HeapHandle) -> HeapHandle {
    let mb = master_global.borrow();
    let blk = mb.as_block().expect("global is always a Block");
    let data = BlockData {
        object: ObjectData {
            slots: blk.object.slots.clone(),
            names: blk.object.names.clone(),
        },
        traits: blk.traits.clone(),
        num_inherited: blk.num_inherited,
        scope_chain: None,
        prev: None,
        namespaces: blk.namespaces.clone(),
        prev_exception: None,
    };
    Rc::new(RefCell::new(Heap::block(None, VarFlags::PERMANENT, data)))
}

fn clone_block_data(blk: &BlockData) -> BlockData {
    BlockData {
        object: ObjectData {
            slots: blk.object.slots.clone(),
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

/// Deep-clones a type shell (own block, own instance block) so a slave can
/// mutate it without affecting its master (spec §4.8 "clone ... so the
/// slave can mutate them independently").
fn deep_clone_type(handle: &HeapHandle) -> HeapHandle {
    let b = handle.borrow();
    let td = b.as_type().expect("private_types only ever holds Type values");
    let instance_block = td.instance_block.as_ref().map(|ib| {
        let data = clone_block_data(ib.borrow().as_block().expect("instance_block is always a Block"));
        Rc::new(RefCell::new(Heap::block(None, VarFlags::empty(), data)))
    });
    let cloned = TypeData {
        block: clone_block_data(&td.block),
        base_type: td.base_type.clone(),
        instance_block,
        implements: td.implements.clone(),
        id: td.id,
        instance_size: td.instance_size,
        sub_type_count: td.sub_type_count,
        helpers: td.helpers.clone(),
        module_name: td.module_name.clone(),
        flags: td.flags,
    };
    let type_of = b.type_.clone();
    let flags = b.flags;
    drop(b);
    Rc::new(RefCell::new(Heap::type_obj(type_of, flags, cloned)))
}

impl VmHost for Ejs {
    /// `allocate` (spec §4.7 "Allocation"): runs the type's own `create`
    /// helper to produce a correctly shaped, correctly initialized instance
    /// for this call's `extra_slots`, then hands it to `Gc::alloc_pooled`.
    /// That fresh instance is moved (not cloned) into the pool closure so
    /// it's the *only* owner at that point — `alloc_pooled` itself decides
    /// whether to hand it back directly (pool miss) or splice its contents
    /// into a recycled handle (pool hit), so a reused object never carries
    /// its previous occupant's shape or contents forward.
    fn allocate(&mut self, type_: &HeapHandle, extra_slots: usize) -> Result<Var> {
        let type_id = type_.borrow().as_type().map(|td| td.id).unwrap_or(-1);
        let helpers = type_
            .borrow()
            .as_type()
            .and_then(|td| td.helpers.clone())
            .ok_or_else(|| EjsError::Internal("type has no helper table".into()))?;
        let type_clone = type_.clone();
        let created = (helpers.create)(self, &type_clone, extra_slots)?;
        let handle = match created {
            Var::Ref(h) => h,
            _ => return Err(EjsError::Internal("create helper did not return a reference value".into())),
        };
        let pooled = self.gc.alloc_pooled(type_id, move || Ok(handle))?;
        Ok(Var::Ref(pooled))
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

    fn core_type(&self, name: &str) -> Option<HeapHandle> {
        self.private_types.get(name).cloned().or_else(|| self.core_types.borrow().get(name).cloned())
    }
}

impl VmContext for Ejs {
    fn global(&self) -> HeapHandle {
        self.global.clone()
    }

    fn set_result(&mut self, v: Var) {
        self.result = v;
    }

    fn maybe_collect(&mut self, roots: &[Var]) {
        if !self.gc_enabled || !self.gc.gc_required() {
            return;
        }
        let mut all_roots = self.roots();
        all_roots.extend_from_slice(roots);
        self.gc.collect(Generation::New, &all_roots);
        if let Some(notifier) = self.alloc_notifier {
            notifier(self.gc.stats());
        }
    }

    fn global_slot(&self, slot: i32) -> Option<Var> {
        usize::try_from(slot).ok().and_then(|idx| self.global.borrow().as_object().slots.get(idx).cloned())
    }

    fn exception(&self) -> Option<Var> {
        self.exception.clone()
    }

    fn clear_exception(&mut self) {
        self.exception = None;
    }
}
