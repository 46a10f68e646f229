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

//! Data model for DC fields: the field's wire type tree and its
//! communication keywords.

use crate::globals::FieldId;
use crate::hashgen::{DCHashGenerator, LegacyDCHash};

/// A node of a field's type tree. Scalar leaves, sized types,
/// arrays, and named struct types.
#[derive(Debug, Clone, PartialEq)]
pub enum DCTypeDef {
    Char,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float64,
    String,
    Blob,
    /// `size` is `Some(n)` for fixed-length arrays (packed without a
    /// length tag) and `None` for sized arrays (16-bit byte-length tag).
    Array {
        element: Box<DCTypeDef>,
        size: Option<usize>,
    },
    /// Index into the schema registry's struct table.
    Struct(usize),
    /// Anonymous member sequence, e.g. the pairs of `uint32uint8array`.
    Tuple(Vec<DCTypeDef>),
}

impl DCTypeDef {
    /// Stable small integer identifying the type shape, fed to the hash.
    fn type_code(&self) -> u32 {
        match self {
            DCTypeDef::Char => 1,
            DCTypeDef::Int8 => 2,
            DCTypeDef::Int16 => 3,
            DCTypeDef::Int32 => 4,
            DCTypeDef::Int64 => 5,
            DCTypeDef::UInt8 => 6,
            DCTypeDef::UInt16 => 7,
            DCTypeDef::UInt32 => 8,
            DCTypeDef::UInt64 => 9,
            DCTypeDef::Float64 => 10,
            DCTypeDef::String => 11,
            DCTypeDef::Blob => 12,
            DCTypeDef::Array { .. } => 13,
            DCTypeDef::Struct(_) => 14,
            DCTypeDef::Tuple(_) => 15,
        }
    }
}

impl LegacyDCHash for DCTypeDef {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator) {
        hashgen.add_int(self.type_code());

        match self {
            DCTypeDef::Array { element, size } => {
                element.generate_hash(hashgen);
                hashgen.add_int(size.unwrap_or(0) as u32);
            }
            DCTypeDef::Struct(index) => {
                hashgen.add_int(*index as u32);
            }
            DCTypeDef::Tuple(members) => {
                hashgen.add_int(members.len() as u32);

                for member in members {
                    member.generate_hash(hashgen);
                }
            }
            _ => {}
        }
    }
}

/// A single parameter of a field (or member of a struct).
#[derive(Debug, Clone, PartialEq)]
pub struct DCParameter {
    pub name: Option<String>,
    pub param_type: DCTypeDef,
}

impl LegacyDCHash for DCParameter {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator) {
        self.param_type.generate_hash(hashgen);
    }
}

/// A field of a Distributed Class.
///
/// Plain parameter fields carry one parameter; atomic fields carry
/// the parameter list of the remote call; molecular fields are
/// resolved at parse time into the concatenated parameters and the
/// keyword union of their components.
#[derive(Debug, Clone)]
pub struct DCField {
    name: String,
    field_id: FieldId,
    class_name: String,
    params: Vec<DCParameter>,
    keywords: Vec<String>,
}

impl DCField {
    pub(crate) fn new(
        name: String,
        field_id: FieldId,
        class_name: String,
        params: Vec<DCParameter>,
        keywords: Vec<String>,
    ) -> Self {
        Self {
            name,
            field_id,
            class_name,
            params,
            keywords,
        }
    }

    #[inline]
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// The field's file-global index.
    #[inline]
    pub fn get_id(&self) -> FieldId {
        self.field_id
    }

    /// Name of the class the field was declared in.
    #[inline]
    pub fn get_class_name(&self) -> &str {
        &self.class_name
    }

    #[inline]
    pub fn get_params(&self) -> &[DCParameter] {
        &self.params
    }

    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords.iter().any(|kw| kw == keyword)
    }

    #[inline]
    pub fn is_required(&self) -> bool {
        self.has_keyword("required")
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.has_keyword("broadcast")
    }

    #[inline]
    pub fn is_ownsend(&self) -> bool {
        self.has_keyword("ownsend")
    }

    #[inline]
    pub fn is_clsend(&self) -> bool {
        self.has_keyword("clsend")
    }

    #[inline]
    pub fn is_ram(&self) -> bool {
        self.has_keyword("ram")
    }

    #[inline]
    pub fn is_db(&self) -> bool {
        self.has_keyword("db")
    }

    pub fn get_keywords(&self) -> &[String] {
        &self.keywords
    }
}

impl LegacyDCHash for DCField {
    fn generate_hash(&self, hashgen: &mut DCHashGenerator) {
        hashgen.add_string(&self.name);
        hashgen.add_int(u32::from(self.field_id));
        hashgen.add_int(self.params.len() as u32);

        for param in &self.params {
            param.generate_hash(hashgen);
        }
        hashgen.add_int(self.keywords.len() as u32);

        for keyword in &self.keywords {
            hashgen.add_string(keyword);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_field(keywords: &[&str]) -> DCField {
        DCField::new(
            "setName".to_owned(),
            4,
            "DistributedAvatar".to_owned(),
            vec![DCParameter {
                name: None,
                param_type: DCTypeDef::String,
            }],
            keywords.iter().map(|kw| (*kw).to_owned()).collect(),
        )
    }

    #[test]
    fn keyword_queries() {
        let field: DCField = test_field(&["required", "broadcast", "db"]);

        assert!(field.is_required());
        assert!(field.is_broadcast());
        assert!(field.is_db());
        assert!(!field.is_ram());
        assert!(!field.is_clsend());
        assert!(!field.is_ownsend());
        assert!(field.has_keyword("db"));
        assert!(!field.has_keyword("airecv"));
    }

    #[test]
    fn keyword_set_changes_hash() {
        use crate::hashgen::DCHashGenerator;

        let mut gen_a: DCHashGenerator = DCHashGenerator::default();
        let mut gen_b: DCHashGenerator = DCHashGenerator::default();

        test_field(&["required"]).generate_hash(&mut gen_a);
        test_field(&["required", "broadcast"]).generate_hash(&mut gen_b);

        assert_ne!(gen_a.get_hash(), gen_b.get_hash());
    }
}
