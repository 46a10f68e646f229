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

//! Parser for the DC schema language. Consumes the token stream of
//! [`crate::dclexer`] by recursive descent and produces the
//! [`DCFile`] schema registry.
//!
//! The grammar covered is the declaration subset the cluster needs:
//! keyword declarations, typedefs, structs, distributed classes with
//! atomic / parameter / molecular fields, and Python-style imports.
//! Default values and numeric range constraints are accepted and
//! skipped; they do not affect the wire format.

use crate::dcfield::{DCField, DCParameter, DCTypeDef};
use crate::dcfile::{DCFile, DCPythonImport, DCStruct, DClass};
use crate::dclexer::{DCDataType, DCToken, Lexer, Span};
use crate::globals::{DClassId, FieldId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Custom error type for reading and parsing DC schema files.
#[derive(Debug, Error)]
pub enum DCReadError {
    #[error("could not read DC file '{0}'; {1}")]
    FileError(String, std::io::Error),
    #[error("DC syntax error at line {line}; {message}")]
    Syntax { line: usize, message: String },
}

/// Parses one or more DC sources, merged in order, into a
/// [`DCFile`] registry.
pub fn parse_dc_sources(sources: &[String]) -> Result<DCFile, DCReadError> {
    let mut parser: Parser = Parser::default();

    for source in sources {
        parser.feed(source)?;
    }
    Ok(parser.finish())
}

#[derive(Default)]
struct Parser {
    tokens: Vec<(DCToken, Span)>,
    pos: usize,
    // registry being built, shared across sources
    structs: Vec<DCStruct>,
    dclasses: Vec<DClass>,
    fields: Vec<DCField>,
    imports: Vec<DCPythonImport>,
    keywords: Vec<String>,
    typedefs: HashMap<String, DCTypeDef>,
    struct_names: HashMap<String, usize>,
    class_names: HashMap<String, DClassId>,
}

impl Parser {
    fn feed(&mut self, source: &str) -> Result<(), DCReadError> {
        self.tokens = Lexer::new(source).collect();
        self.pos = 0;

        while self.peek().is_some() {
            self.parse_type_declaration()?;
        }
        Ok(())
    }

    fn finish(self) -> DCFile {
        DCFile::new(
            self.structs,
            self.dclasses,
            self.fields,
            self.imports,
            self.keywords,
        )
    }

    // ---------- token stream helpers ---------- //

    fn peek(&self) -> Option<&DCToken> {
        self.tokens.get(self.pos).map(|(tok, _)| tok)
    }

    fn peek_ahead(&self, offset: usize) -> Option<&DCToken> {
        self.tokens.get(self.pos + offset).map(|(tok, _)| tok)
    }

    fn next(&mut self) -> Option<DCToken> {
        let token: Option<DCToken> = self.tokens.get(self.pos).map(|(tok, _)| tok.clone());

        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn line(&self) -> usize {
        match self.tokens.get(self.pos.min(self.tokens.len().saturating_sub(1))) {
            Some((_, span)) => span.line,
            None => 0,
        }
    }

    fn syntax_error(&self, message: impl Into<String>) -> DCReadError {
        DCReadError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: DCToken, what: &str) -> Result<(), DCReadError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.syntax_error(format!(
                "expected {}, found {:?}",
                what, token
            ))),
            None => Err(self.syntax_error(format!("expected {}, found end of file", what))),
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String, DCReadError> {
        match self.next() {
            Some(DCToken::Identifier(id)) => Ok(id),
            Some(token) => Err(self.syntax_error(format!(
                "expected {}, found {:?}",
                what, token
            ))),
            None => Err(self.syntax_error(format!("expected {}, found end of file", what))),
        }
    }

    // ---------- top-level declarations ---------- //

    fn parse_type_declaration(&mut self) -> Result<(), DCReadError> {
        match self.peek() {
            Some(DCToken::Keyword) => self.parse_keyword_declaration(),
            Some(DCToken::Typedef) => self.parse_typedef(),
            Some(DCToken::Struct) => self.parse_struct(),
            Some(DCToken::DClass) => self.parse_dclass(),
            Some(DCToken::From) => self.parse_import(),
            Some(token) => {
                let message: String = format!("unexpected token at top level: {:?}", token);
                Err(self.syntax_error(message))
            }
            None => Ok(()),
        }
    }

    fn parse_keyword_declaration(&mut self) -> Result<(), DCReadError> {
        self.expect(DCToken::Keyword, "'keyword'")?;

        let name: String = match self.next() {
            Some(DCToken::Identifier(id)) => id,
            // Redeclaring a historical keyword is legal.
            Some(DCToken::FieldKeyword(kw)) => kw,
            _ => return Err(self.syntax_error("expected a keyword identifier")),
        };

        if !self.keywords.contains(&name) {
            self.keywords.push(name);
        }
        self.expect(DCToken::Semicolon, "';'")
    }

    fn parse_typedef(&mut self) -> Result<(), DCReadError> {
        self.expect(DCToken::Typedef, "'typedef'")?;

        let mut alias_type: DCTypeDef = self.parse_type()?;
        let alias: String = self.expect_identifier("a typedef alias")?;

        while self.peek() == Some(&DCToken::LBracket) {
            alias_type = self.parse_array_suffix(alias_type)?;
        }
        self.expect(DCToken::Semicolon, "';'")?;

        self.typedefs.insert(alias, alias_type);
        Ok(())
    }

    fn parse_struct(&mut self) -> Result<(), DCReadError> {
        self.expect(DCToken::Struct, "'struct'")?;

        let name: String = self.expect_identifier("a struct name")?;

        self.expect(DCToken::LBrace, "'{'")?;

        let mut members: Vec<DCParameter> = vec![];

        while self.peek() != Some(&DCToken::RBrace) {
            let member: DCParameter = self.parse_parameter(&[DCToken::Semicolon])?;

            members.push(member);
            self.expect(DCToken::Semicolon, "';'")?;
        }
        self.expect(DCToken::RBrace, "'}'")?;
        self.expect(DCToken::Semicolon, "';'")?;

        self.struct_names.insert(name.clone(), self.structs.len());
        self.structs.push(DCStruct::new(name, members));
        Ok(())
    }

    fn parse_import(&mut self) -> Result<(), DCReadError> {
        self.expect(DCToken::From, "'from'")?;

        let mut module: String = String::new();

        // module path: identifiers or module-name tokens joined by dots
        loop {
            match self.next() {
                Some(DCToken::Identifier(part)) | Some(DCToken::ModuleName(part)) => {
                    if !module.is_empty() {
                        module.push('.');
                    }
                    module.push_str(&part);
                }
                Some(token) => {
                    return Err(self.syntax_error(format!(
                        "expected a module name, found {:?}",
                        token
                    )));
                }
                None => return Err(self.syntax_error("unterminated import statement")),
            }
            match self.peek() {
                Some(DCToken::Dot) => {
                    self.pos += 1;
                }
                Some(DCToken::Import) => {
                    self.pos += 1;
                    break;
                }
                _ => return Err(self.syntax_error("expected '.' or 'import'")),
            }
        }

        let mut symbol: String = self.expect_identifier("an imported symbol")?;

        // view suffixes, e.g. DistributedAvatar/AI/OV
        while self.peek() == Some(&DCToken::Slash) {
            self.pos += 1;
            match self.next() {
                Some(DCToken::ViewSuffix(suffix)) | Some(DCToken::Identifier(suffix)) => {
                    symbol.push('/');
                    symbol.push_str(&suffix);
                }
                _ => return Err(self.syntax_error("expected a view suffix")),
            }
        }
        self.imports.push(DCPythonImport {
            module,
            symbols: vec![symbol],
        });
        Ok(())
    }

    // ---------- dclass ---------- //

    fn parse_dclass(&mut self) -> Result<(), DCReadError> {
        self.expect(DCToken::DClass, "'dclass'")?;

        let name: String = self.expect_identifier("a class name")?;
        let mut parents: Vec<DClassId> = vec![];

        if self.peek() == Some(&DCToken::Colon) {
            self.pos += 1;
            loop {
                let parent_name: String = self.expect_identifier("a parent class name")?;

                match self.class_names.get(&parent_name) {
                    Some(parent_id) => parents.push(*parent_id),
                    None => {
                        return Err(self.syntax_error(format!(
                            "unknown parent class '{}'",
                            parent_name
                        )));
                    }
                }
                if self.peek() == Some(&DCToken::Comma) {
                    self.pos += 1;
                    continue;
                }
                break;
            }
        }

        // Flatten the parents' fields up front; molecular fields may
        // reference inherited components while the body is parsed.
        let mut inherited: Vec<FieldId> = vec![];
        let mut seen_names: HashSet<String> = HashSet::new();

        for parent_id in &parents {
            let parent: &DClass = &self.dclasses[usize::from(*parent_id)];

            for field_id in parent.get_inherited_fields() {
                let field_name: String = self.fields[usize::from(*field_id)].get_name().to_owned();

                if seen_names.insert(field_name) {
                    inherited.push(*field_id);
                }
            }
        }

        let class_id: DClassId = self.dclasses.len() as DClassId;
        let mut dclass: DClass = DClass::new(name.clone(), class_id, parents);

        self.expect(DCToken::LBrace, "'{'")?;

        while self.peek() != Some(&DCToken::RBrace) {
            let field_id: FieldId = self.fields.len() as FieldId;
            let field: DCField = self.parse_class_field(&name, field_id, &inherited, &dclass)?;
            let field_name: String = field.get_name().to_owned();

            self.fields.push(field);
            dclass.add_own_field(field_id);

            if seen_names.insert(field_name.clone()) {
                inherited.push(field_id);
            } else {
                // A re-declared field overrides the parent's slot.
                for slot in inherited.iter_mut() {
                    if self.fields[usize::from(*slot)].get_name() == field_name {
                        *slot = field_id;
                        break;
                    }
                }
            }
        }
        self.expect(DCToken::RBrace, "'}'")?;
        self.expect(DCToken::Semicolon, "';'")?;

        dclass.set_inherited_fields(inherited);
        self.class_names.insert(name, class_id);
        self.dclasses.push(dclass);
        Ok(())
    }

    fn parse_class_field(
        &mut self,
        class_name: &str,
        field_id: FieldId,
        inherited: &[FieldId],
        dclass: &DClass,
    ) -> Result<DCField, DCReadError> {
        if let Some(DCToken::Identifier(_)) = self.peek() {
            match self.peek_ahead(1) {
                Some(DCToken::LParen) => {
                    return self.parse_atomic_field(class_name, field_id);
                }
                Some(DCToken::Colon) => {
                    return self.parse_molecular_field(class_name, field_id, inherited, dclass);
                }
                _ => {} // falls through; a struct-typed parameter field
            }
        }
        self.parse_parameter_field(class_name, field_id)
    }

    fn parse_atomic_field(
        &mut self,
        class_name: &str,
        field_id: FieldId,
    ) -> Result<DCField, DCReadError> {
        let name: String = self.expect_identifier("a field name")?;

        self.expect(DCToken::LParen, "'('")?;

        let mut params: Vec<DCParameter> = vec![];

        if self.peek() != Some(&DCToken::RParen) {
            loop {
                let param: DCParameter =
                    self.parse_parameter(&[DCToken::Comma, DCToken::RParen])?;

                params.push(param);
                match self.peek() {
                    Some(DCToken::Comma) => {
                        self.pos += 1;
                    }
                    Some(DCToken::RParen) => break,
                    _ => return Err(self.syntax_error("expected ',' or ')'")),
                }
            }
        }
        self.expect(DCToken::RParen, "')'")?;

        let keywords: Vec<String> = self.parse_field_keywords();

        if self.peek() == Some(&DCToken::Equals) {
            self.pos += 1;
            self.skip_value(&[DCToken::Semicolon])?;
        }
        self.expect(DCToken::Semicolon, "';'")?;

        Ok(DCField::new(
            name,
            field_id,
            class_name.to_owned(),
            params,
            keywords,
        ))
    }

    fn parse_parameter_field(
        &mut self,
        class_name: &str,
        field_id: FieldId,
    ) -> Result<DCField, DCReadError> {
        let param: DCParameter = self.parse_parameter(&[DCToken::Semicolon])?;

        let name: String = match &param.name {
            Some(name) => name.clone(),
            None => return Err(self.syntax_error("a class attribute needs a name")),
        };

        let keywords: Vec<String> = self.parse_field_keywords();

        if self.peek() == Some(&DCToken::Equals) {
            self.pos += 1;
            self.skip_value(&[DCToken::Semicolon])?;
        }
        self.expect(DCToken::Semicolon, "';'")?;

        Ok(DCField::new(
            name,
            field_id,
            class_name.to_owned(),
            vec![param],
            keywords,
        ))
    }

    fn parse_molecular_field(
        &mut self,
        class_name: &str,
        field_id: FieldId,
        inherited: &[FieldId],
        dclass: &DClass,
    ) -> Result<DCField, DCReadError> {
        let name: String = self.expect_identifier("a field name")?;

        self.expect(DCToken::Colon, "':'")?;

        let mut params: Vec<DCParameter> = vec![];
        let mut keywords: Vec<String> = vec![];

        loop {
            let component_name: String = self.expect_identifier("a component field name")?;
            let component: &DCField =
                match self.find_component(&component_name, inherited, dclass) {
                    Some(component) => component,
                    None => {
                        return Err(self.syntax_error(format!(
                            "unknown molecular component '{}'",
                            component_name
                        )));
                    }
                };

            params.extend_from_slice(component.get_params());

            for keyword in component.get_keywords() {
                if !keywords.contains(keyword) {
                    keywords.push(keyword.clone());
                }
            }
            match self.peek() {
                Some(DCToken::Comma) => {
                    self.pos += 1;
                }
                _ => break,
            }
        }
        self.expect(DCToken::Semicolon, "';'")?;

        Ok(DCField::new(
            name,
            field_id,
            class_name.to_owned(),
            params,
            keywords,
        ))
    }

    /// Finds a molecular component among the class's own fields
    /// parsed so far, falling back to the inherited fields.
    fn find_component(
        &self,
        name: &str,
        inherited: &[FieldId],
        dclass: &DClass,
    ) -> Option<&DCField> {
        let own_match: Option<&DCField> = dclass
            .get_own_fields()
            .iter()
            .map(|field_id| &self.fields[usize::from(*field_id)])
            .find(|field| field.get_name() == name);

        own_match.or_else(|| {
            inherited
                .iter()
                .map(|field_id| &self.fields[usize::from(*field_id)])
                .find(|field| field.get_name() == name)
        })
    }

    fn parse_field_keywords(&mut self) -> Vec<String> {
        let mut keywords: Vec<String> = vec![];

        while let Some(DCToken::FieldKeyword(keyword)) = self.peek() {
            keywords.push(keyword.clone());
            self.pos += 1;
        }
        keywords
    }

    // ---------- parameters and types ---------- //

    fn parse_parameter(&mut self, terminators: &[DCToken]) -> Result<DCParameter, DCReadError> {
        let mut param_type: DCTypeDef = self.parse_type()?;
        let mut name: Option<String> = None;

        if let Some(DCToken::Identifier(id)) = self.peek() {
            name = Some(id.clone());
            self.pos += 1;
        }
        // an array suffix may bind after the parameter name
        while self.peek() == Some(&DCToken::LBracket) {
            param_type = self.parse_array_suffix(param_type)?;
        }
        if self.peek() == Some(&DCToken::Equals) {
            self.pos += 1;
            self.skip_value(terminators)?;
        }
        Ok(DCParameter { name, param_type })
    }

    fn parse_type(&mut self) -> Result<DCTypeDef, DCReadError> {
        let base: DCTypeDef = match self.next() {
            Some(DCToken::DataType(data_type)) => base_type_of(data_type),
            Some(DCToken::Identifier(id)) => {
                if let Some(alias) = self.typedefs.get(&id) {
                    alias.clone()
                } else if let Some(index) = self.struct_names.get(&id) {
                    DCTypeDef::Struct(*index)
                } else {
                    return Err(self.syntax_error(format!("unknown type '{}'", id)));
                }
            }
            Some(token) => {
                return Err(self.syntax_error(format!("expected a type, found {:?}", token)));
            }
            None => return Err(self.syntax_error("expected a type, found end of file")),
        };

        // numeric range constraint, e.g. uint16(0-1000); does not
        // affect the wire format, so it is skipped
        if self.peek() == Some(&DCToken::LParen) {
            self.pos += 1;
            self.skip_balanced(DCToken::LParen, DCToken::RParen)?;
        }
        // divisor/modulo transforms, e.g. uint16/100 or int16%360
        loop {
            match self.peek() {
                Some(DCToken::Percent)
                | Some(DCToken::Slash)
                | Some(DCToken::Star)
                | Some(DCToken::Minus)
                | Some(DCToken::Plus) => {
                    self.pos += 1;
                    self.pos += 1; // the literal operand
                }
                _ => break,
            }
        }

        let mut full_type: DCTypeDef = base;

        while self.peek() == Some(&DCToken::LBracket) {
            full_type = self.parse_array_suffix(full_type)?;
        }
        Ok(full_type)
    }

    /// Consumes a `[...]` suffix and wraps the element type. A lone
    /// decimal literal is a fixed size; anything else (empty, or a
    /// range constraint) produces a sized array.
    fn parse_array_suffix(&mut self, element: DCTypeDef) -> Result<DCTypeDef, DCReadError> {
        self.expect(DCToken::LBracket, "'['")?;

        let mut contents: Vec<DCToken> = vec![];

        loop {
            match self.peek() {
                Some(DCToken::RBracket) => {
                    self.pos += 1;
                    break;
                }
                Some(token) => {
                    contents.push(token.clone());
                    self.pos += 1;
                }
                None => return Err(self.syntax_error("unterminated array suffix")),
            }
        }

        let size: Option<usize> = match contents.as_slice() {
            [DCToken::IntegerLiteral(n)] if *n >= 0 => Some(*n as usize),
            _ => None,
        };

        Ok(DCTypeDef::Array {
            element: Box::new(element),
            size,
        })
    }

    /// Skips a default value: everything up to one of the terminator
    /// tokens at bracket depth zero. The terminator is not consumed.
    /// A DC keyword also ends the value; keyword lists may trail a
    /// default (`uint32 count = 0 required db;`).
    fn skip_value(&mut self, terminators: &[DCToken]) -> Result<(), DCReadError> {
        let mut depth: usize = 0;

        loop {
            match self.peek() {
                Some(token)
                    if depth == 0
                        && (terminators.contains(token)
                            || matches!(token, DCToken::FieldKeyword(_))) =>
                {
                    return Ok(())
                }
                Some(DCToken::LParen) | Some(DCToken::LBracket) | Some(DCToken::LBrace) => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(DCToken::RParen) | Some(DCToken::RBracket) | Some(DCToken::RBrace) => {
                    if depth == 0 {
                        return Err(self.syntax_error("unbalanced default value"));
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                Some(_) => {
                    self.pos += 1;
                }
                None => return Err(self.syntax_error("unterminated default value")),
            }
        }
    }

    /// Skips tokens until the matching close delimiter; the opening
    /// delimiter has already been consumed.
    fn skip_balanced(&mut self, open: DCToken, close: DCToken) -> Result<(), DCReadError> {
        let mut depth: usize = 1;

        while depth > 0 {
            match self.next() {
                Some(token) if token == open => depth += 1,
                Some(token) if token == close => depth -= 1,
                Some(_) => {}
                None => return Err(self.syntax_error("unbalanced delimiters")),
            }
        }
        Ok(())
    }
}

fn array_of(element: DCTypeDef) -> DCTypeDef {
    DCTypeDef::Array {
        element: Box::new(element),
        size: None,
    }
}

/// Maps a built-in type name onto its wire type tree.
fn base_type_of(data_type: DCDataType) -> DCTypeDef {
    match data_type {
        DCDataType::Char => DCTypeDef::Char,
        DCDataType::Int8 => DCTypeDef::Int8,
        DCDataType::Int16 => DCTypeDef::Int16,
        DCDataType::Int32 => DCTypeDef::Int32,
        DCDataType::Int64 => DCTypeDef::Int64,
        DCDataType::UInt8 => DCTypeDef::UInt8,
        DCDataType::UInt16 => DCTypeDef::UInt16,
        DCDataType::UInt32 => DCTypeDef::UInt32,
        DCDataType::UInt64 => DCTypeDef::UInt64,
        DCDataType::Float64 => DCTypeDef::Float64,
        DCDataType::Str => DCTypeDef::String,
        DCDataType::Blob => DCTypeDef::Blob,
        DCDataType::Int8Array => array_of(DCTypeDef::Int8),
        DCDataType::Int16Array => array_of(DCTypeDef::Int16),
        DCDataType::Int32Array => array_of(DCTypeDef::Int32),
        DCDataType::UInt8Array => array_of(DCTypeDef::UInt8),
        DCDataType::UInt16Array => array_of(DCTypeDef::UInt16),
        DCDataType::UInt32Array => array_of(DCTypeDef::UInt32),
        DCDataType::UInt32UInt8Array => {
            array_of(DCTypeDef::Tuple(vec![DCTypeDef::UInt32, DCTypeDef::UInt8]))
        }
    }
}
