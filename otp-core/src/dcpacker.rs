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

//! Schema-driven field packer. One recursive walk over a field's
//! type tree packs or unpacks its arguments; the state server never
//! interprets field payloads any other way.

use crate::datagram::datagram::{Datagram, DatagramError};
use crate::datagram::iterator::{DatagramIterator, IteratorError};
use crate::dcfield::{DCField, DCTypeDef};
use crate::dcfile::DCFile;
use crate::globals::DgSizeTag;
use thiserror::Error;

/// Custom error type for pack/unpack operations.
#[derive(Debug, Error)]
pub enum PackError {
    #[error("type mismatch; {0}")]
    TypeMismatch(&'static str),
    #[error("value out of range; {0}")]
    ValueOutOfRange(&'static str),
    #[error("unknown struct type")]
    UnknownStruct,
    #[error("fixed array length mismatch")]
    ArrayLengthMismatch,
    #[error(transparent)]
    Iterator(#[from] IteratorError),
    #[error(transparent)]
    Datagram(#[from] DatagramError),
}

/// An unpacked field argument.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Char(char),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    fn as_i64(&self) -> Result<i64, PackError> {
        match self {
            FieldValue::Int(v) => Ok(*v),
            FieldValue::UInt(v) => i64::try_from(*v)
                .map_err(|_| PackError::ValueOutOfRange("unsigned value too large for i64")),
            _ => Err(PackError::TypeMismatch("expected an integer value")),
        }
    }

    fn as_u64(&self) -> Result<u64, PackError> {
        match self {
            FieldValue::UInt(v) => Ok(*v),
            FieldValue::Int(v) => u64::try_from(*v)
                .map_err(|_| PackError::ValueOutOfRange("negative value for unsigned type")),
            _ => Err(PackError::TypeMismatch("expected an integer value")),
        }
    }
}

/// Packs one value against one type tree node.
fn pack_value(
    dc: &DCFile,
    dg: &mut Datagram,
    value_type: &DCTypeDef,
    value: &FieldValue,
) -> Result<(), PackError> {
    match value_type {
        DCTypeDef::Char => match value {
            FieldValue::Char(c) => Ok(dg.add_u8(*c as u8)?),
            _ => Err(PackError::TypeMismatch("expected a char value")),
        },
        DCTypeDef::Int8 => {
            let v: i64 = value.as_i64()?;
            let v: i8 = i8::try_from(v).map_err(|_| PackError::ValueOutOfRange("int8"))?;
            Ok(dg.add_i8(v)?)
        }
        DCTypeDef::Int16 => {
            let v: i16 = i16::try_from(value.as_i64()?)
                .map_err(|_| PackError::ValueOutOfRange("int16"))?;
            Ok(dg.add_i16(v)?)
        }
        DCTypeDef::Int32 => {
            let v: i32 = i32::try_from(value.as_i64()?)
                .map_err(|_| PackError::ValueOutOfRange("int32"))?;
            Ok(dg.add_i32(v)?)
        }
        DCTypeDef::Int64 => Ok(dg.add_i64(value.as_i64()?)?),
        DCTypeDef::UInt8 => {
            let v: u8 =
                u8::try_from(value.as_u64()?).map_err(|_| PackError::ValueOutOfRange("uint8"))?;
            Ok(dg.add_u8(v)?)
        }
        DCTypeDef::UInt16 => {
            let v: u16 = u16::try_from(value.as_u64()?)
                .map_err(|_| PackError::ValueOutOfRange("uint16"))?;
            Ok(dg.add_u16(v)?)
        }
        DCTypeDef::UInt32 => {
            let v: u32 = u32::try_from(value.as_u64()?)
                .map_err(|_| PackError::ValueOutOfRange("uint32"))?;
            Ok(dg.add_u32(v)?)
        }
        DCTypeDef::UInt64 => Ok(dg.add_u64(value.as_u64()?)?),
        DCTypeDef::Float64 => match value {
            FieldValue::Float(f) => Ok(dg.add_f64(*f)?),
            FieldValue::Int(v) => Ok(dg.add_f64(*v as f64)?),
            FieldValue::UInt(v) => Ok(dg.add_f64(*v as f64)?),
            _ => Err(PackError::TypeMismatch("expected a float value")),
        },
        DCTypeDef::String => match value {
            FieldValue::Text(text) => Ok(dg.add_string(text)?),
            _ => Err(PackError::TypeMismatch("expected a string value")),
        },
        DCTypeDef::Blob => match value {
            FieldValue::Blob(bytes) => Ok(dg.add_blob(bytes.clone())?),
            _ => Err(PackError::TypeMismatch("expected a blob value")),
        },
        DCTypeDef::Array { element, size } => {
            let items: &Vec<FieldValue> = match value {
                FieldValue::List(items) => items,
                _ => return Err(PackError::TypeMismatch("expected a list value")),
            };
            match size {
                Some(fixed) => {
                    // Fixed arrays carry no length tag.
                    if items.len() != *fixed {
                        return Err(PackError::ArrayLengthMismatch);
                    }
                    for item in items {
                        pack_value(dc, dg, element, item)?;
                    }
                    Ok(())
                }
                None => {
                    // Sized arrays are prefixed by their byte length.
                    let mut nested: Datagram = Datagram::default();

                    for item in items {
                        pack_value(dc, &mut nested, element, item)?;
                    }
                    Ok(dg.add_blob(nested.get_data())?)
                }
            }
        }
        DCTypeDef::Struct(index) => {
            let strukt = dc.struct_by_index(*index).ok_or(PackError::UnknownStruct)?;
            let members: &Vec<FieldValue> = match value {
                FieldValue::List(members) => members,
                _ => return Err(PackError::TypeMismatch("expected struct members")),
            };

            if members.len() != strukt.get_members().len() {
                return Err(PackError::TypeMismatch("wrong struct member count"));
            }
            for (member, value) in strukt.get_members().iter().zip(members) {
                pack_value(dc, dg, &member.param_type, value)?;
            }
            Ok(())
        }
        DCTypeDef::Tuple(member_types) => {
            let members: &Vec<FieldValue> = match value {
                FieldValue::List(members) => members,
                _ => return Err(PackError::TypeMismatch("expected tuple members")),
            };

            if members.len() != member_types.len() {
                return Err(PackError::TypeMismatch("wrong tuple member count"));
            }
            for (member_type, value) in member_types.iter().zip(members) {
                pack_value(dc, dg, member_type, value)?;
            }
            Ok(())
        }
    }
}

/// Unpacks one value for one type tree node, advancing the cursor.
fn unpack_value(
    dc: &DCFile,
    dgi: &mut DatagramIterator,
    value_type: &DCTypeDef,
) -> Result<FieldValue, PackError> {
    match value_type {
        DCTypeDef::Char => Ok(FieldValue::Char(dgi.read_u8()? as char)),
        DCTypeDef::Int8 => Ok(FieldValue::Int(i64::from(dgi.read_i8()?))),
        DCTypeDef::Int16 => Ok(FieldValue::Int(i64::from(dgi.read_i16()?))),
        DCTypeDef::Int32 => Ok(FieldValue::Int(i64::from(dgi.read_i32()?))),
        DCTypeDef::Int64 => Ok(FieldValue::Int(dgi.read_i64()?)),
        DCTypeDef::UInt8 => Ok(FieldValue::UInt(u64::from(dgi.read_u8()?))),
        DCTypeDef::UInt16 => Ok(FieldValue::UInt(u64::from(dgi.read_u16()?))),
        DCTypeDef::UInt32 => Ok(FieldValue::UInt(u64::from(dgi.read_u32()?))),
        DCTypeDef::UInt64 => Ok(FieldValue::UInt(dgi.read_u64()?)),
        DCTypeDef::Float64 => Ok(FieldValue::Float(dgi.read_f64()?)),
        DCTypeDef::String => Ok(FieldValue::Text(dgi.read_string()?)),
        DCTypeDef::Blob => {
            let length: DgSizeTag = dgi.read_size()?;
            Ok(FieldValue::Blob(dgi.read_data(usize::from(length))?))
        }
        DCTypeDef::Array { element, size } => match size {
            Some(fixed) => {
                let mut items: Vec<FieldValue> = Vec::with_capacity(*fixed);

                for _ in 0..*fixed {
                    items.push(unpack_value(dc, dgi, element)?);
                }
                Ok(FieldValue::List(items))
            }
            None => {
                let byte_length: DgSizeTag = dgi.read_size()?;
                let end: usize = dgi.tell() + usize::from(byte_length);
                let mut items: Vec<FieldValue> = vec![];

                while dgi.tell() < end {
                    items.push(unpack_value(dc, dgi, element)?);
                }
                if dgi.tell() != end {
                    return Err(PackError::TypeMismatch(
                        "array elements overran the length tag",
                    ));
                }
                Ok(FieldValue::List(items))
            }
        },
        DCTypeDef::Struct(index) => {
            let strukt = dc.struct_by_index(*index).ok_or(PackError::UnknownStruct)?;
            let mut members: Vec<FieldValue> = vec![];

            for member in strukt.get_members() {
                members.push(unpack_value(dc, dgi, &member.param_type)?);
            }
            Ok(FieldValue::List(members))
        }
        DCTypeDef::Tuple(member_types) => {
            let mut members: Vec<FieldValue> = vec![];

            for member_type in member_types {
                members.push(unpack_value(dc, dgi, member_type)?);
            }
            Ok(FieldValue::List(members))
        }
    }
}

/// Packs a field's argument list into its wire form.
pub fn pack_field(
    dc: &DCFile,
    field: &DCField,
    args: &[FieldValue],
) -> Result<Vec<u8>, PackError> {
    if args.len() != field.get_params().len() {
        return Err(PackError::TypeMismatch("wrong argument count for field"));
    }
    let mut dg: Datagram = Datagram::default();

    for (param, value) in field.get_params().iter().zip(args) {
        pack_value(dc, &mut dg, &param.param_type, value)?;
    }
    Ok(dg.get_data())
}

/// Unpacks a field's argument list from the cursor, advancing it
/// past the field's packed data.
pub fn unpack_field(
    dc: &DCFile,
    field: &DCField,
    dgi: &mut DatagramIterator,
) -> Result<Vec<FieldValue>, PackError> {
    let mut args: Vec<FieldValue> = Vec::with_capacity(field.get_params().len());

    for param in field.get_params() {
        args.push(unpack_value(dc, dgi, &param.param_type)?);
    }
    Ok(args)
}

/// Validates a field's packed data at the cursor and returns the raw
/// bytes it occupies, advancing the cursor past it. The state server
/// stores and re-emits fields in this packed form.
pub fn extract_field_bytes(
    dc: &DCFile,
    field: &DCField,
    dgi: &mut DatagramIterator,
) -> Result<Vec<u8>, PackError> {
    let start: usize = dgi.tell();

    unpack_field(dc, field, dgi)?;

    let end: usize = dgi.tell();

    dgi.seek(start);
    Ok(dgi.read_data(end - start)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcparser::parse_dc_sources;

    fn test_dc() -> DCFile {
        let source: String = String::from(
            "struct Coords {
                int32 x;
                int32 y;
            };
            dclass Avatar {
                setName(string name) required broadcast db;
                setHp(uint16) required broadcast;
                setInventory(uint32array) ram;
                setTag(blob) clsend;
                setPos(Coords) broadcast ram;
                setBadges(uint8[3]) ram;
            };",
        );
        parse_dc_sources(&[source]).expect("test schema must parse")
    }

    fn field<'dc>(dc: &'dc DCFile, name: &str) -> &'dc DCField {
        let avatar = dc.class_by_name("Avatar").expect("class exists");
        dc.field_by_name(avatar, name).expect("field exists")
    }

    #[test]
    fn string_field_round_trip() {
        let dc: DCFile = test_dc();
        let set_name: &DCField = field(&dc, "setName");

        let args: Vec<FieldValue> = vec![FieldValue::Text("alice".to_owned())];
        let packed: Vec<u8> = pack_field(&dc, set_name, &args).expect("pack");

        // 16-bit length tag + five bytes
        assert_eq!(packed, vec![5, 0, b'a', b'l', b'i', b'c', b'e']);

        let dg: Datagram = Datagram::try_from(packed).expect("fits");
        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(unpack_field(&dc, set_name, &mut dgi).expect("unpack"), args);
        assert_eq!(dgi.get_remaining(), 0);
    }

    #[test]
    fn sized_array_round_trip() {
        let dc: DCFile = test_dc();
        let set_inventory: &DCField = field(&dc, "setInventory");

        let args: Vec<FieldValue> = vec![FieldValue::List(vec![
            FieldValue::UInt(7),
            FieldValue::UInt(1000),
        ])];
        let packed: Vec<u8> = pack_field(&dc, set_inventory, &args).expect("pack");

        // byte-length tag (8) + two little-endian u32 values
        assert_eq!(packed[..2], [8, 0]);
        assert_eq!(packed.len(), 10);

        let dg: Datagram = Datagram::try_from(packed).expect("fits");
        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(
            unpack_field(&dc, set_inventory, &mut dgi).expect("unpack"),
            args
        );
    }

    #[test]
    fn fixed_array_has_no_length_tag() {
        let dc: DCFile = test_dc();
        let set_badges: &DCField = field(&dc, "setBadges");

        let args: Vec<FieldValue> = vec![FieldValue::List(vec![
            FieldValue::UInt(1),
            FieldValue::UInt(2),
            FieldValue::UInt(3),
        ])];
        let packed: Vec<u8> = pack_field(&dc, set_badges, &args).expect("pack");

        assert_eq!(packed, vec![1, 2, 3]);

        let wrong_arity: Vec<FieldValue> =
            vec![FieldValue::List(vec![FieldValue::UInt(1)])];
        assert!(pack_field(&dc, set_badges, &wrong_arity).is_err());
    }

    #[test]
    fn struct_field_round_trip() {
        let dc: DCFile = test_dc();
        let set_pos: &DCField = field(&dc, "setPos");

        let args: Vec<FieldValue> = vec![FieldValue::List(vec![
            FieldValue::Int(-3),
            FieldValue::Int(250),
        ])];
        let packed: Vec<u8> = pack_field(&dc, set_pos, &args).expect("pack");

        assert_eq!(packed.len(), 8); // two int32 members, no tag

        let dg: Datagram = Datagram::try_from(packed).expect("fits");
        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(unpack_field(&dc, set_pos, &mut dgi).expect("unpack"), args);
    }

    #[test]
    fn truncated_data_fails_unpack() {
        let dc: DCFile = test_dc();
        let set_hp: &DCField = field(&dc, "setHp");

        let dg: Datagram = Datagram::try_from(vec![0x01]).expect("fits");
        let mut dgi: DatagramIterator = dg.into();

        assert!(unpack_field(&dc, set_hp, &mut dgi).is_err());
    }

    #[test]
    fn extract_bytes_matches_packed_form() {
        let dc: DCFile = test_dc();
        let set_hp: &DCField = field(&dc, "setHp");

        let mut dg: Datagram = Datagram::default();

        dg.add_u16(200).expect("fits");
        dg.add_string("trailing").expect("fits");

        let mut dgi: DatagramIterator = dg.into();
        let bytes: Vec<u8> = extract_field_bytes(&dc, set_hp, &mut dgi).expect("extract");

        assert_eq!(bytes, vec![200, 0]);
        // the cursor sits right after the field's packed data
        assert_eq!(dgi.read_string().expect("trailing intact"), "trailing");
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let dc: DCFile = test_dc();
        let set_name: &DCField = field(&dc, "setName");

        let args: Vec<FieldValue> = vec![FieldValue::UInt(5)];
        assert!(pack_field(&dc, set_name, &args).is_err());
    }
}
