//! Top-level section dispatch (spec §4.4 "Loader behavior").

use crate::encoding::Cursor;
use crate::fixup::{Fixup, FixupKind};
use crate::model::{
    BlockDef, ClassDef, Dependency, ExceptionDef, FunctionDef, LoaderAttrs, LoadedModule,
    NameTokens, PropertyDef, TypeRefSpec,
};
use ejs_value::error::{EjsError, Result};
use ejs_value::{ConstantPool, HandlerFlags};
use tracing::{debug, trace};

pub const EJS_MODULE_MAGIC: i32 = 0x0045_4A53; // "EJS\0" little-endian-ish tag, this crate's own constant
pub const EJS_MODULE_VERSION: i32 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Module = 1,
    ModuleEnd = 2,
    Dependency = 3,
    Class = 4,
    ClassEnd = 5,
    Block = 6,
    BlockEnd = 7,
    Function = 8,
    FunctionEnd = 9,
    Exception = 10,
    Property = 11,
    Doc = 12,
}

impl TryFrom<u8> for Tag {
    type Error = EjsError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Tag::Module,
            2 => Tag::ModuleEnd,
            3 => Tag::Dependency,
            4 => Tag::Class,
            5 => Tag::ClassEnd,
            6 => Tag::Block,
            7 => Tag::BlockEnd,
            8 => Tag::Function,
            9 => Tag::FunctionEnd,
            10 => Tag::Exception,
            11 => Tag::Property,
            12 => Tag::Doc,
            n => return Err(EjsError::Syntax(format!("unknown module section tag {n}"))),
        })
    }
}

/// Where newly-decoded definitions currently attach, mirroring the VM's
/// own scope-chain push/pop (spec §4.4 "handlers maintain a 'current
/// scope chain' parallel to the VM's").
#[derive(Debug, Clone, Copy)]
enum Scope {
    Class(usize),
    Function { class: Option<usize>, func: usize },
    Block,
}

struct Decoder<'a> {
    cursor: Cursor<'a>,
    modules: Vec<LoadedModule>,
    fixups: Vec<Fixup>,
    scopes: Vec<Scope>,
    pending_doc: Option<String>,
}

/// Result of decoding one top-level load request: every module touched
/// (spec §4.4 "a load state ... that accumulates newly-loaded modules")
/// plus the fixup list to resolve once all of them are in memory.
pub struct DecodeResult {
    pub modules: Vec<LoadedModule>,
    pub fixups: Vec<Fixup>,
}

/// Decodes a module file's header and every section in its body (spec
/// §4.4/§6.1). Does not resolve fixups or run initializers — that is
/// `resolve_fixups` plus the interpreter's installer.
pub fn decode_module(bytes: &[u8]) -> Result<DecodeResult> {
    let mut cursor = Cursor::new(bytes);
    let magic = cursor.word()?;
    if magic != EJS_MODULE_MAGIC {
        return Err(EjsError::Io(format!("bad module magic {magic:#x}")));
    }
    let file_version = cursor.word()?;
    if file_version != EJS_MODULE_VERSION {
        return Err(EjsError::Io(format!(
            "unsupported module file version {file_version}"
        )));
    }
    let _flags = cursor.word()?;
    let _reserved = cursor.word()?;
    let _padding = cursor.word()?;

    let mut decoder = Decoder {
        cursor,
        modules: Vec::new(),
        fixups: Vec::new(),
        scopes: Vec::new(),
        pending_doc: None,
    };
    while !decoder.cursor.is_empty() {
        decoder.step()?;
    }
    Ok(DecodeResult {
        modules: decoder.modules,
        fixups: decoder.fixups,
    })
}

impl<'a> Decoder<'a> {
    fn step(&mut self) -> Result<()> {
        let tag = Tag::try_from(self.cursor.u1()?)?;
        trace!(?tag, "decoding module section");
        match tag {
            Tag::Module => self.module(),
            Tag::ModuleEnd => {
                self.scopes.clear();
                Ok(())
            }
            Tag::Dependency => self.dependency(),
            Tag::Class => self.class(),
            Tag::ClassEnd => {
                self.scopes.pop();
                Ok(())
            }
            Tag::Block => self.block(),
            Tag::BlockEnd => {
                self.scopes.pop();
                Ok(())
            }
            Tag::Function => self.function(),
            Tag::FunctionEnd => {
                self.scopes.pop();
                Ok(())
            }
            Tag::Exception => self.exception(),
            Tag::Property => self.property(),
            Tag::Doc => self.doc(),
        }
    }

    fn module(&mut self) -> Result<()> {
        let name_token = self.cursor.string_token()?;
        let version = self.cursor.num()?;
        let checksum = self.cursor.word()?;
        let pool_size = self.cursor.num()? as usize;
        let pool_bytes = self.cursor.bytes(pool_size)?.to_vec();
        debug!(name_token, version, "decoded module header");
        self.modules.push(LoadedModule {
            name_token,
            version,
            checksum,
            constants: ConstantPool::from_bytes(pool_bytes),
            dependencies: Vec::new(),
            classes: Vec::new(),
            functions: Vec::new(),
            properties: Vec::new(),
            doc: self.pending_doc.take(),
        });
        Ok(())
    }

    fn current_module(&mut self) -> Result<&mut LoadedModule> {
        self.modules
            .last_mut()
            .ok_or_else(|| EjsError::Syntax("section outside of any MODULE".into()))
    }

    fn dependency(&mut self) -> Result<()> {
        let name_token = self.cursor.string_token()?;
        let checksum = self.cursor.num()?;
        let min_version = self.cursor.num()?;
        let max_version = self.cursor.num()?;
        self.current_module()?.dependencies.push(Dependency {
            name_token,
            checksum,
            min_version,
            max_version,
        });
        Ok(())
    }

    fn name_tokens(&mut self) -> Result<NameTokens> {
        Ok(NameTokens {
            name: self.cursor.string_token()?,
            space: self.cursor.string_token()?,
        })
    }

    fn type_ref(&mut self) -> Result<TypeRefSpec> {
        let raw = self.cursor.num()?;
        let tag = raw & 0b11;
        let rest = raw >> 2;
        Ok(match tag {
            0 => TypeRefSpec::NoRef,
            1 => TypeRefSpec::Slot(rest as i32),
            2 => TypeRefSpec::Name {
                name: usize::try_from(rest)
                    .map_err(|_| EjsError::Io("negative name token in TypeRef".into()))?,
                space: self.cursor.string_token()?,
            },
            n => return Err(EjsError::Syntax(format!("invalid TypeRef tag {n}"))),
        })
    }

    fn class(&mut self) -> Result<()> {
        let name = self.name_tokens()?;
        let attributes = LoaderAttrs::from_bits_truncate(self.cursor.num()? as u32);
        let slot_num = self.cursor.num()? as i32;
        let base = self.type_ref()?;
        let num_type_prop = self.cursor.num()?;
        let num_instance_prop = self.cursor.num()?;
        let num_interfaces = self.cursor.num()?;
        let mut interfaces = Vec::with_capacity(num_interfaces.max(0) as usize);
        for _ in 0..num_interfaces {
            interfaces.push(self.type_ref()?);
        }
        let module = self.current_module()?;
        let class_index = module.classes.len();
        if Fixup::is_needed(&base) {
            self.fixups.push(Fixup::new(
                FixupKind::BaseType,
                base,
                self.modules.len() - 1,
                Some(class_index),
                None,
            ));
        }
        for (i, iface) in interfaces.iter().enumerate() {
            if Fixup::is_needed(iface) {
                self.fixups.push(Fixup::new(
                    FixupKind::InterfaceType,
                    *iface,
                    self.modules.len() - 1,
                    Some(class_index),
                    Some(i),
                ));
            }
        }
        let doc = self.pending_doc.take();
        self.current_module()?.classes.push(ClassDef {
            name,
            attributes,
            slot_num,
            base,
            num_type_prop,
            num_instance_prop,
            interfaces,
            properties: Vec::new(),
            functions: Vec::new(),
            blocks: Vec::new(),
            doc,
        });
        self.scopes.push(Scope::Class(class_index));
        Ok(())
    }

    fn current_class_index(&self) -> Option<usize> {
        self.scopes.iter().rev().find_map(|s| match s {
            Scope::Class(i) => Some(*i),
            Scope::Function { class, .. } => *class,
            Scope::Block => None,
        })
    }

    fn current_function_index(&self) -> Option<(Option<usize>, usize)> {
        self.scopes.iter().rev().find_map(|s| match s {
            Scope::Function { class, func } => Some((*class, *func)),
            _ => None,
        })
    }

    fn block(&mut self) -> Result<()> {
        let name_token = self.cursor.string_token()?;
        let slot_num = self.cursor.num()? as i32;
        let num_slot = self.cursor.num()?;
        let def = BlockDef {
            name_token,
            slot_num,
            num_slot,
        };
        if let Some((class, func)) = self.current_function_index() {
            self.function_mut(class, func)?.blocks.push(def);
        } else if let Some(class) = self.current_class_index() {
            self.current_module()?.classes[class].blocks.push(def);
        }
        self.scopes.push(Scope::Block);
        Ok(())
    }

    fn function_mut(&mut self, class: Option<usize>, func: usize) -> Result<&mut FunctionDef> {
        let module = self.current_module()?;
        match class {
            Some(c) => Ok(&mut module.classes[c].functions[func]),
            None => Ok(&mut module.functions[func]),
        }
    }

    fn function(&mut self) -> Result<()> {
        let name = self.name_tokens()?;
        let next_slot = self.cursor.num()? as i32;
        let attributes = LoaderAttrs::from_bits_truncate(self.cursor.num()? as u32);
        let lang = self.cursor.u1()?;
        let return_type = self.type_ref()?;
        let slot_num = self.cursor.num()? as i32;
        let num_args = self.cursor.num()?;
        let num_locals = self.cursor.num()?;
        let num_exceptions = self.cursor.num()?;
        let code_len = self.cursor.num()? as usize;
        let code = self.cursor.bytes(code_len)?.to_vec();
        let class = self.current_class_index();
        let doc = self.pending_doc.take();
        let def = FunctionDef {
            name,
            next_slot,
            attributes,
            lang,
            return_type,
            slot_num,
            num_args,
            num_locals,
            code,
            exceptions: Vec::with_capacity(num_exceptions.max(0) as usize),
            blocks: Vec::new(),
            properties: Vec::new(),
            doc,
        };
        let module = self.current_module()?;
        let func_index = match class {
            Some(c) => {
                module.classes[c].functions.push(def);
                module.classes[c].functions.len() - 1
            }
            None => {
                module.functions.push(def);
                module.functions.len() - 1
            }
        };
        if Fixup::is_needed(&return_type) {
            self.fixups.push(Fixup::new(
                FixupKind::ReturnType,
                return_type,
                self.modules.len() - 1,
                class,
                Some(func_index),
            ));
        }
        self.scopes.push(Scope::Function {
            class,
            func: func_index,
        });
        Ok(())
    }

    fn exception(&mut self) -> Result<()> {
        let flags = HandlerFlags::from_bits_truncate(self.cursor.u1()? as u32);
        let try_start = self.cursor.num()?;
        let try_end = self.cursor.num()?;
        let handler_start = self.cursor.num()?;
        let handler_end = self.cursor.num()?;
        let num_blocks = self.cursor.num()?;
        let num_stack = self.cursor.num()?;
        let catch_type = self.type_ref()?;
        let def = ExceptionDef {
            flags,
            try_start,
            try_end,
            handler_start,
            handler_end,
            num_blocks,
            num_stack,
            catch_type,
        };
        if let Some((class, func)) = self.current_function_index() {
            if Fixup::is_needed(&catch_type) {
                self.fixups.push(Fixup::new(
                    FixupKind::Exception,
                    catch_type,
                    self.modules.len() - 1,
                    class,
                    Some(func),
                ));
            }
            self.function_mut(class, func)?.exceptions.push(def);
        }
        Ok(())
    }

    fn property(&mut self) -> Result<()> {
        let name = self.name_tokens()?;
        let attributes = LoaderAttrs::from_bits_truncate(self.cursor.num()? as u32);
        let slot_num = self.cursor.num()? as i32;
        let type_ref = self.type_ref()?;
        let initial_value_token = if attributes.contains(LoaderAttrs::HAS_VALUE) {
            Some(self.cursor.string_token()?)
        } else {
            None
        };
        let doc = self.pending_doc.take();
        let def = PropertyDef {
            name,
            attributes,
            slot_num,
            type_ref,
            initial_value_token,
            doc,
        };
        let fixup_kind = if self.current_function_index().is_some() {
            FixupKind::Local
        } else if self.current_class_index().is_some() {
            FixupKind::InstanceProperty
        } else {
            FixupKind::TypeProperty
        };
        let class = self.current_class_index();
        let func = self.current_function_index();
        if Fixup::is_needed(&type_ref) {
            self.fixups.push(Fixup::new(
                fixup_kind,
                type_ref,
                self.modules.len() - 1,
                class,
                func.map(|(_, f)| f),
            ));
        }
        if let Some((c, f)) = func {
            self.function_mut(c, f)?.properties.push(def);
        } else if let Some(c) = class {
            self.current_module()?.classes[c].properties.push(def);
        } else {
            self.current_module()?.properties.push(def);
        }
        Ok(())
    }

    fn doc(&mut self) -> Result<()> {
        let token = self.cursor.string_token()?;
        let text = self.current_module()?.string(token)?.to_string();
        self.pending_doc = Some(text);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encoding::encode_num;

    fn push_num(buf: &mut Vec<u8>, n: i64) {
        buf.extend(encode_num(n));
    }

    fn push_word(buf: &mut Vec<u8>, n: i32) {
        buf.extend(n.to_le_bytes());
    }

    fn push_str_token(buf: &mut Vec<u8>, token: usize) {
        push_num(buf, token as i64);
    }

    fn push_name(buf: &mut Vec<u8>, name: usize, space: usize) {
        push_str_token(buf, name);
        push_str_token(buf, space);
    }

    fn push_no_ref(buf: &mut Vec<u8>) {
        push_num(buf, 0);
    }

    /// Builds `MODULE "demo" ... FUNCTION "run" ... FUNCTION_END MODULE_END`
    /// with a tiny constant pool, exercising header parsing, scope
    /// tracking, and the empty-fixup-list happy path end to end.
    fn build_single_function_module() -> Vec<u8> {
        let mut buf = Vec::new();
        push_word(&mut buf, EJS_MODULE_MAGIC);
        push_word(&mut buf, EJS_MODULE_VERSION);
        push_word(&mut buf, 0);
        push_word(&mut buf, 0);
        push_word(&mut buf, 0);

        let pool = b"demo\0run\0public\0".to_vec();
        let name_tok = 0usize;
        let run_tok = 5usize;
        let space_tok = 9usize;

        buf.push(1); // MODULE
        push_str_token(&mut buf, name_tok);
        push_num(&mut buf, 0); // version
        push_word(&mut buf, 0); // checksum
        push_num(&mut buf, pool.len() as i64);
        buf.extend(&pool);

        buf.push(8); // FUNCTION
        push_name(&mut buf, run_tok, space_tok);
        push_num(&mut buf, 0); // next_slot
        push_num(&mut buf, 0); // attributes
        buf.push(0); // lang
        push_no_ref(&mut buf); // return type
        push_num(&mut buf, 0); // slot_num
        push_num(&mut buf, 0); // num_args
        push_num(&mut buf, 0); // num_locals
        push_num(&mut buf, 0); // num_exceptions
        let code = vec![0xAAu8, 0xBB];
        push_num(&mut buf, code.len() as i64);
        buf.extend(&code);

        buf.push(9); // FUNCTION_END
        buf.push(2); // MODULE_END
        buf
    }

    #[test]
    fn decodes_header_and_a_single_function() {
        let bytes = build_single_function_module();
        let result = decode_module(&bytes).unwrap();
        assert_eq!(result.modules.len(), 1);
        let module = &result.modules[0];
        assert_eq!(module.string(module.name_token).unwrap(), "demo");
        assert_eq!(module.functions.len(), 1);
        let func = &module.functions[0];
        assert_eq!(module.string(func.name.name).unwrap(), "run");
        assert_eq!(func.code, vec![0xAA, 0xBB]);
        assert!(result.fixups.is_empty());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build_single_function_module();
        bytes[0] ^= 0xFF;
        assert!(decode_module(&bytes).is_err());
    }

    #[test]
    fn class_with_unresolved_base_type_enqueues_a_fixup() {
        let mut buf = Vec::new();
        push_word(&mut buf, EJS_MODULE_MAGIC);
        push_word(&mut buf, EJS_MODULE_VERSION);
        push_word(&mut buf, 0);
        push_word(&mut buf, 0);
        push_word(&mut buf, 0);

        let pool = b"demo\0Widget\0public\0Base\0".to_vec();
        buf.push(1); // MODULE
        push_str_token(&mut buf, 0);
        push_num(&mut buf, 0);
        push_word(&mut buf, 0);
        push_num(&mut buf, pool.len() as i64);
        buf.extend(&pool);

        buf.push(4); // CLASS
        push_name(&mut buf, 5, 12); // "Widget", "public"
        push_num(&mut buf, 0); // attributes
        push_num(&mut buf, 0); // slot_num
        // base type: Name-tagged TypeRef referring to "Base" at token 19
        let raw = (19i64 << 2) | 2;
        push_num(&mut buf, raw);
        push_str_token(&mut buf, 19); // space token for the base's Name ref
        push_num(&mut buf, 0); // num_type_prop
        push_num(&mut buf, 0); // num_instance_prop
        push_num(&mut buf, 0); // num_interfaces
        buf.push(5); // CLASS_END
        buf.push(2); // MODULE_END

        let result = decode_module(&buf).unwrap();
        assert_eq!(result.fixups.len(), 1);
        assert_eq!(result.fixups[0].kind, FixupKind::BaseType);
    }
}

/// Applies every fixup against the now-fully-decoded set of modules
/// (spec §4.4 "After all sections ... resolve fixups in order"). This
/// only resolves name-based references against classes declared in the
/// same batch; cross-module global-slot resolution is the interpreter
/// installer's job once types are materialized.
pub fn resolve_local_fixups(modules: &[LoadedModule], fixups: &[Fixup]) -> Vec<Fixup> {
    let mut unresolved = Vec::new();
    for fixup in fixups {
        let TypeRefSpec::Name { name, .. } = fixup.type_ref else {
            continue;
        };
        let module = &modules[fixup.module_index];
        let Ok(target_name) = module.string(name) else {
            unresolved.push(*fixup);
            continue;
        };
        let found = module.classes.iter().any(|c| {
            module
                .string(c.name.name)
                .map(|n| n == target_name)
                .unwrap_or(false)
        });
        if !found {
            unresolved.push(*fixup);
        }
    }
    unresolved
}
