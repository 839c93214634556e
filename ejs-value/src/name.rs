//! `Name` and `Namespace` (spec §3).
//!
//! Names are immutable (name, space) pairs; equality uses both parts but
//! hashing uses only the name portion, matching the names-table probing
//! rule in spec §4.2 ("Probing uses a hash of the name portion only").

use crate::flags::NamespaceFlags;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A namespace tag used to qualify a `Name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: Rc<str>,
    pub uri: Rc<str>,
    pub flags: NamespaceFlags,
}

impl Namespace {
    pub fn new(name: impl Into<Rc<str>>, uri: impl Into<Rc<str>>, flags: NamespaceFlags) -> Self {
        Namespace {
            name: name.into(),
            uri: uri.into(),
            flags,
        }
    }

    /// The canonical `space` string used for name comparison: the URI,
    /// except reserved namespaces which are formatted as
    /// `[[qualifiedType,space]]` to guarantee uniqueness (spec §3).
    pub fn space(&self, qualified_type: Option<&str>) -> String {
        if self.flags.contains(NamespaceFlags::RESERVED) {
            format!("[[{},{}]]", qualified_type.unwrap_or(""), self.name)
        } else {
            self.uri.to_string()
        }
    }

    pub fn public(uri: impl Into<Rc<str>>) -> Self {
        Namespace::new("public", uri, NamespaceFlags::empty())
    }
}

/// An immutable (name, space) pair. Equality compares both; hashing
/// considers only `name`, matching the name-hash-only probing rule.
#[derive(Debug, Clone)]
pub struct Name {
    pub name: Rc<str>,
    pub space: Rc<str>,
}

impl Name {
    pub fn new(name: impl Into<Rc<str>>, space: impl Into<Rc<str>>) -> Self {
        Name {
            name: name.into(),
            space: space.into(),
        }
    }

    /// A name in the empty namespace, used for plain identifiers and by
    /// the `in` operator (spec §8 "`in` operator uses the empty namespace").
    pub fn unqualified(name: impl Into<Rc<str>>) -> Self {
        Name::new(name, "")
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.space == other.space && self.name == other.name
    }
}
impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
