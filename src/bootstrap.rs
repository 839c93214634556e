//! Builds the core types that exist before any `.mod` file is loaded (spec
//! §4.8 step 4): `Object -> Type -> Block -> Namespace -> Function ->
//! Global -> Null -> rest`. A handful of the most primitive value types
//! (Boolean, Number, String) are included in "rest" so native code can
//! look them up by name via [`Ejs::core_type`](crate::Ejs::core_type);
//! the rest of the class library (Array, XML, Http, ...) is out of scope
//! here and arrives, if at all, from a loaded `.mod` file.

use crate::ejs::Ejs;
use ejs_value::error::Result;

const BOOTSTRAP_ORDER: &[&str] = &["Object", "Type", "Block", "Namespace", "Function", "Global", "Null", "Boolean", "Number", "String"];

pub(crate) fn create_core_types(ejs: &mut Ejs) -> Result<()> {
    for name in BOOTSTRAP_ORDER {
        ejs.define_core_type(name)?;
    }
    Ok(())
}
