//! `Service`: the registry every interpreter spun up from it shares (spec
//! §4.8 "A Service owns a registry of native-module callbacks and is
//! shared by all interpreters").

use crate::ejs::Ejs;
use ejs_value::error::Result;
use std::collections::HashMap;

/// Configures native-backed globals for one module once its scripted
/// definitions have been installed (spec §4.4 "native configurators
/// registered for \"ejs\", \"ejs.db.sqlite\", \"ejs.web\""). Plain `fn`
/// pointers, not closures: the registry is shared across interpreters and
/// outlives any one of them.
pub type NativeModuleConfigurator = fn(&mut Ejs) -> Result<()>;

/// Process-wide state shared by every `Ejs` created from it: the
/// native-module callback table. Interpreters hold an `Rc<RefCell<Service>>`
/// rather than owning one, so installing a callback after some interpreters
/// already exist still reaches them.
#[derive(Default)]
pub struct Service {
    native_modules: HashMap<String, NativeModuleConfigurator>,
}

impl Service {
    pub fn new() -> Self {
        Service::default()
    }

    /// Registers (or replaces) the native configurator run right after
    /// `name` finishes loading.
    pub fn install_native_module(&mut self, name: impl Into<String>, configurator: NativeModuleConfigurator) {
        self.native_modules.insert(name.into(), configurator);
    }

    pub(crate) fn native_module(&self, name: &str) -> Option<NativeModuleConfigurator> {
        self.native_modules.get(name).copied()
    }
}
