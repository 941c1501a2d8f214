//! Global and per-function symbol tables.
//!
//! Variables are keyed by name. A translation unit has one [`GlobalSymbols`] table shared by
//! every function; each function gets a [`LocalSymbols`] table that shadows it. Lookups always
//! try the local table first and fall through to the global one, so a function-local `buf` and a
//! global `buf` coexist without either side knowing about the other.

use crate::ast::TypeId;
use crate::containers::unordered::{UnorderedMap, UnorderedMapEntry};
use crate::log::*;

/// Everything known about one variable.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct VarInfo {
    /// Resolved type, if one is known
    pub ty: Option<TypeId>,
    /// Load address, for globals only
    pub global_address: Option<u64>,
    /// Zero-based parameter position, for formal parameters only
    pub param_index: Option<usize>,
    /// Free-form annotation carried through from the importer
    pub description: Option<String>,
}

/// A struct layout registered under a key in the global table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StructLayout {
    /// Fields in declaration order: (name, byte offset, type)
    pub fields: Vec<(String, u64, TypeId)>,
}

/// An enum definition registered under a key in the global table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EnumDef {
    /// Members in declaration order: (name, value)
    pub members: Vec<(String, u64)>,
}

/// The translation-unit-wide symbol table.
#[derive(Default)]
pub struct GlobalSymbols {
    vars: UnorderedMap<String, VarInfo>,
    /// Reverse index from load address to variable name, for address-based lookups
    addr_to_name: UnorderedMap<u64, String>,
    struct_layouts: UnorderedMap<String, StructLayout>,
    enum_defs: UnorderedMap<String, EnumDef>,
}

impl GlobalSymbols {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a variable. Registration is additive: re-registering an existing name merges the
    /// new information field-by-field into the old record and never overwrites a known type,
    /// address, or parameter position with a different one (the first registration wins; a
    /// disagreement is logged and ignored). Returns the merged record.
    pub fn add_symbol(&mut self, name: &str, info: VarInfo) -> &VarInfo {
        if let Some(address) = info.global_address {
            self.addr_to_name.insert(address, name.to_owned());
        }
        match self.vars.entry(name.to_owned()) {
            UnorderedMapEntry::Vacant(v) => v.insert(info),
            UnorderedMapEntry::Occupied(o) => {
                let existing = o.into_mut();
                merge_field(name, "type", &mut existing.ty, info.ty);
                merge_field(
                    name,
                    "address",
                    &mut existing.global_address,
                    info.global_address,
                );
                merge_field(name, "param-index", &mut existing.param_index, info.param_index);
                if existing.description.is_none() {
                    existing.description = info.description;
                }
                existing
            }
        }
    }

    /// Look up `name`, panicking if it was never registered. [`Self::lookup`] is the fallible
    /// form.
    pub fn get_symbol(&self, name: &str) -> &VarInfo {
        self.lookup(name)
            .unwrap_or_else(|| panic!("Global {:?} was never registered", name))
    }

    pub fn lookup(&self, name: &str) -> Option<&VarInfo> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn name_at_address(&self, address: u64) -> Option<&str> {
        self.addr_to_name.get(&address).map(|s| s.as_str())
    }

    /// Register a struct layout. Two different layouts under one key mean the importer is
    /// internally inconsistent; that is a fatal error, not something to paper over.
    pub fn add_struct_layout(&mut self, key: &str, layout: StructLayout) {
        match self.struct_layouts.get(key) {
            None => {
                self.struct_layouts.insert(key.to_owned(), layout);
            }
            Some(existing) => {
                assert!(
                    *existing == layout,
                    "Conflicting struct layouts registered under key {:?}",
                    key
                );
            }
        }
    }

    pub fn add_enum_def(&mut self, key: &str, def: EnumDef) {
        match self.enum_defs.get(key) {
            None => {
                self.enum_defs.insert(key.to_owned(), def);
            }
            Some(existing) => {
                assert!(
                    *existing == def,
                    "Conflicting enum definitions registered under key {:?}",
                    key
                );
            }
        }
    }

    pub fn struct_layout(&self, key: &str) -> Option<&StructLayout> {
        self.struct_layouts.get(key)
    }

    pub fn enum_def(&self, key: &str) -> Option<&EnumDef> {
        self.enum_defs.get(key)
    }

    pub fn vars_iter(&self) -> impl Iterator<Item = (&String, &VarInfo)> {
        self.vars.iter()
    }

    pub fn struct_layouts_iter(&self) -> impl Iterator<Item = (&String, &StructLayout)> {
        self.struct_layouts.iter()
    }

    pub fn enum_defs_iter(&self) -> impl Iterator<Item = (&String, &EnumDef)> {
        self.enum_defs.iter()
    }
}

fn merge_field<T: PartialEq + std::fmt::Debug>(
    name: &str,
    what: &'static str,
    existing: &mut Option<T>,
    incoming: Option<T>,
) {
    let new = match incoming {
        None => return,
        Some(new) => new,
    };
    match existing {
        None => *existing = Some(new),
        Some(old) => {
            if *old != new {
                debug!(
                    "Ignoring conflicting re-registration of symbol";
                    "name" => name,
                    "field" => what,
                    "kept" => format!("{:?}", old),
                    "ignored" => format!("{:?}", new),
                );
            }
        }
    }
}

/// The per-function symbol table. Local registrations shadow global ones by name.
#[derive(Default)]
pub struct LocalSymbols {
    vars: UnorderedMap<String, VarInfo>,
}

impl LocalSymbols {
    pub fn new() -> Self {
        Default::default()
    }

    /// See [`GlobalSymbols::add_symbol`]; locals carry no address field to merge.
    pub fn add_symbol(&mut self, name: &str, info: VarInfo) -> &VarInfo {
        match self.vars.entry(name.to_owned()) {
            UnorderedMapEntry::Vacant(v) => v.insert(info),
            UnorderedMapEntry::Occupied(o) => {
                let existing = o.into_mut();
                merge_field(name, "type", &mut existing.ty, info.ty);
                merge_field(name, "param-index", &mut existing.param_index, info.param_index);
                if existing.description.is_none() {
                    existing.description = info.description;
                }
                existing
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Look up `name` locally, then globally. Every variable mentioned by a tree must have been
    /// registered before lookup; an absent name is a construction bug upstream.
    pub fn get_symbol<'a>(&'a self, globals: &'a GlobalSymbols, name: &str) -> &'a VarInfo {
        self.vars
            .get(name)
            .or_else(|| globals.lookup(name))
            .unwrap_or_else(|| panic!("Variable {:?} was never registered", name))
    }

    /// Is `name` resolved through the global table (i.e. not shadowed locally)?
    pub fn is_global(&self, globals: &GlobalSymbols, name: &str) -> bool {
        !self.vars.contains_key(name) && globals.contains(name)
    }

    pub fn vars_iter(&self) -> impl Iterator<Item = (&String, &VarInfo)> {
        self.vars.iter()
    }
}
