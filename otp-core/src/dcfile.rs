/*
    This file is part of otpd.

    Copyright © 2024 otpd Authors.

    otpd is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    otpd is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with otpd. If not, see <https://www.gnu.org/licenses/>.
*/

//! Root structure that stores the collection of DC elements in
//! memory: classes, structs, fields, keywords, and imports.

use crate::dcfield::{DCField, DCParameter};
use crate::globals::{DCFileHash, DClassId, FieldId};
use crate::hashgen::{DCHashGenerator, LegacyDCHash};
use multimap::MultiMap;
use std::collections::HashMap;

/// Represents a Python-style import statement in the DC file.
#[derive(Debug, Clone, PartialEq)]
pub struct DCPythonImport {
    pub module: String,
    pub symbols: Vec<String>,
}

/// A plain data structure declared with `struct`; usable as a
/// parameter type inside class fields.
#[derive(Debug, Clone)]
pub struct DCStruct {
    name: String,
    members: Vec<DCParameter>,
}

impl DCStruct {
    pub(crate) fn new(name: String, members: Vec<DCParameter>) -> Self {
        Self { name, members }
    }

    #[inline]
    pub fn get_name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn get_members(&self) -> &[DCParameter] {
        &self.members
    }
}

impl LegacyDCHash for DCStruct {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator) {
        hashgen.add_string(&self.name);
        hashgen.add_int(self.members.len() as u32);

        for member in &self.members {
            member.generate_hash(hashgen);
        }
    }
}

/// A Distributed Class: a named, numbered set of fields, including
/// the fields inherited from its parent classes.
#[derive(Debug, Clone)]
pub struct DClass {
    name: String,
    class_id: DClassId,
    parents: Vec<DClassId>,
    own_fields: Vec<FieldId>,
    /// Parents-first flattened field list, deduplicated by name.
    /// This is the iteration order of required fields at generate.
    inherited_fields: Vec<FieldId>,
}

impl DClass {
    pub(crate) fn new(name: String, class_id: DClassId, parents: Vec<DClassId>) -> Self {
        Self {
            name,
            class_id,
            parents,
            own_fields: vec![],
            inherited_fields: vec![],
        }
    }

    pub(crate) fn add_own_field(&mut self, field_id: FieldId) {
        self.own_fields.push(field_id);
    }

    pub(crate) fn set_inherited_fields(&mut self, fields: Vec<FieldId>) {
        self.inherited_fields = fields;
    }

    #[inline]
    pub fn get_name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn get_dclass_id(&self) -> DClassId {
        self.class_id
    }

    #[inline]
    pub fn get_parents(&self) -> &[DClassId] {
        &self.parents
    }

    #[inline]
    pub fn get_own_fields(&self) -> &[FieldId] {
        &self.own_fields
    }

    pub fn get_num_inherited_fields(&self) -> usize {
        self.inherited_fields.len()
    }

    pub fn get_inherited_field(&self, index: usize) -> Option<FieldId> {
        self.inherited_fields.get(index).copied()
    }

    #[inline]
    pub fn get_inherited_fields(&self) -> &[FieldId] {
        &self.inherited_fields
    }

    /// Returns true if the field belongs to this class,
    /// directly or by inheritance.
    pub fn has_field(&self, field_id: FieldId) -> bool {
        self.inherited_fields.contains(&field_id)
    }
}

impl LegacyDCHash for DClass {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator) {
        hashgen.add_string(&self.name);
        hashgen.add_int(self.parents.len() as u32);

        for parent in &self.parents {
            hashgen.add_int(u32::from(*parent));
        }
        hashgen.add_int(self.own_fields.len() as u32);
    }
}

/// Data model that provides a high level representation of one or
/// more DC files merged together: their class imports, type
/// definitions, structures, and Distributed Classes.
#[derive(Debug, Default, Clone)]
pub struct DCFile {
    structs: Vec<DCStruct>,
    dclasses: Vec<DClass>,
    fields: Vec<DCField>,
    imports: Vec<DCPythonImport>,
    keywords: Vec<String>,
    class_name_2_id: HashMap<String, DClassId>,
    struct_name_2_index: HashMap<String, usize>,
    field_name_2_field: MultiMap<String, FieldId>,
    baked_legacy_hash: DCFileHash,
}

impl DCFile {
    pub(crate) fn new(
        structs: Vec<DCStruct>,
        dclasses: Vec<DClass>,
        fields: Vec<DCField>,
        imports: Vec<DCPythonImport>,
        keywords: Vec<String>,
    ) -> Self {
        let mut class_name_2_id: HashMap<String, DClassId> = HashMap::new();
        let mut struct_name_2_index: HashMap<String, usize> = HashMap::new();
        let mut field_name_2_field: MultiMap<String, FieldId> = MultiMap::new();

        for dclass in &dclasses {
            class_name_2_id.insert(dclass.get_name().to_owned(), dclass.get_dclass_id());
        }
        for (index, strukt) in structs.iter().enumerate() {
            struct_name_2_index.insert(strukt.get_name().to_owned(), index);
        }
        for field in &fields {
            field_name_2_field.insert(field.get_name().to_owned(), field.get_id());
        }

        let mut dc_file: DCFile = Self {
            structs,
            dclasses,
            fields,
            imports,
            keywords,
            class_name_2_id,
            struct_name_2_index,
            field_name_2_field,
            baked_legacy_hash: 0,
        };

        let mut hashgen: DCHashGenerator = DCHashGenerator::default();

        dc_file.generate_hash(&mut hashgen);
        dc_file.baked_legacy_hash = hashgen.get_hash();
        dc_file
    }

    /// Returns a 32-bit hash index associated with this file. This
    /// number is guaranteed to be consistent if the contents of the
    /// file have not changed, and it is very likely to be different
    /// if the contents of the file do change.
    pub fn get_legacy_hash(&self) -> DCFileHash {
        self.baked_legacy_hash
    }

    /// Returns a string with the hash as a pretty format hexadecimal.
    pub fn get_pretty_hash(&self) -> String {
        format!("0x{:0width$x}", self.get_legacy_hash(), width = 8)
    }

    // ---------- Distributed Class ---------- //

    pub fn get_num_dclasses(&self) -> usize {
        self.dclasses.len()
    }

    pub fn class_by_number(&self, class_id: DClassId) -> Option<&DClass> {
        self.dclasses.get(usize::from(class_id))
    }

    pub fn class_by_name(&self, name: &str) -> Option<&DClass> {
        let class_id: DClassId = *self.class_name_2_id.get(name)?;
        self.class_by_number(class_id)
    }

    // ---------- DC Field ---------- //

    pub fn get_num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field_by_id(&self, field_id: FieldId) -> Option<&DCField> {
        self.fields.get(usize::from(field_id))
    }

    /// Looks a field up by name within the given class,
    /// including its inherited fields.
    pub fn field_by_name(&self, dclass: &DClass, name: &str) -> Option<&DCField> {
        let candidates: &Vec<FieldId> = self.field_name_2_field.get_vec(name)?;

        for field_id in candidates {
            if dclass.has_field(*field_id) {
                return self.field_by_id(*field_id);
            }
        }
        None
    }

    // ---------- DC Struct ---------- //

    pub fn get_num_structs(&self) -> usize {
        self.structs.len()
    }

    pub fn struct_by_index(&self, index: usize) -> Option<&DCStruct> {
        self.structs.get(index)
    }

    pub fn struct_by_name(&self, name: &str) -> Option<&DCStruct> {
        let index: usize = *self.struct_name_2_index.get(name)?;
        self.struct_by_index(index)
    }

    // ---------- Python Imports ---------- //

    pub fn get_num_imports(&self) -> usize {
        self.imports.len()
    }

    pub fn get_python_import(&self, index: usize) -> Option<&DCPythonImport> {
        self.imports.get(index)
    }

    // ---------- DC Keyword ---------- //

    pub fn get_num_keywords(&self) -> usize {
        self.keywords.len()
    }

    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|kw| kw == keyword)
    }
}

impl LegacyDCHash for DCFile {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator) {
        hashgen.add_int(self.dclasses.len() as u32);

        for strukt in &self.structs {
            strukt.generate_hash(hashgen);
        }
        for dclass in &self.dclasses {
            dclass.generate_hash(hashgen);
        }
        for field in &self.fields {
            field.generate_hash(hashgen);
        }
    }
}
