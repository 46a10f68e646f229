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

//! Tokenizer for the DC schema language.
//!
//! Bare words are sorted in one place, [`classify_word`]: built-in
//! type names, declaration words, field keywords, and view suffixes
//! all lex through the same rule. Whitespace and comments are trivia
//! and never reach the parser; the line counter advances across
//! multi-line trivia so syntax errors point at the right line. A
//! byte no rule knows lexes as [`DCToken::Unrecognized`] and becomes
//! an ordinary syntax error downstream instead of a panic here.

use crate::globals::{DC_KEYWORDS, DC_VIEW_SUFFIXES};
use plex::lexer;

/// A type name baked into the language, covering the scalar types
/// and the legacy array spellings (`uint32array` and friends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DCDataType {
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
    Str,
    Blob,
    Int8Array,
    Int16Array,
    Int32Array,
    UInt8Array,
    UInt16Array,
    UInt32Array,
    UInt32UInt8Array,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DCToken {
    // literals
    IntegerLiteral(i64),
    /// Octal, hex, or binary spelling, kept as written; these only
    /// appear inside default values, which the parser skips.
    RadixLiteral(String),
    FloatLiteral(f64),
    CharLiteral(char),
    StringLiteral(String),

    // words
    DataType(DCDataType),
    DClass,
    Struct,
    Keyword,
    Typedef,
    From,
    Import,
    FieldKeyword(String),
    ViewSuffix(String),
    Identifier(String),
    /// Like an identifier, but hyphens (and a leading digit) are
    /// legal; Python module names in import lines need this.
    ModuleName(String),

    // punctuation
    Percent,
    Star,
    Plus,
    Minus,
    Slash,
    Dot,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Equals,
    Colon,

    /// Whitespace or a comment; consumed by [`Lexer`].
    Trivia,
    /// A byte no rule recognizes; surfaced so the parser can report
    /// it as a syntax error with a line number.
    Unrecognized(String),
}

/// Sorts a bare word into the token it stands for.
fn classify_word(word: &str) -> DCToken {
    let data_type: Option<DCDataType> = match word {
        "char" => Some(DCDataType::Char),
        "int8" => Some(DCDataType::Int8),
        "int16" => Some(DCDataType::Int16),
        "int32" => Some(DCDataType::Int32),
        "int64" => Some(DCDataType::Int64),
        "uint8" => Some(DCDataType::UInt8),
        "uint16" => Some(DCDataType::UInt16),
        "uint32" => Some(DCDataType::UInt32),
        "uint64" => Some(DCDataType::UInt64),
        "float64" => Some(DCDataType::Float64),
        "string" => Some(DCDataType::Str),
        "blob" => Some(DCDataType::Blob),
        "int8array" => Some(DCDataType::Int8Array),
        "int16array" => Some(DCDataType::Int16Array),
        "int32array" => Some(DCDataType::Int32Array),
        "uint8array" => Some(DCDataType::UInt8Array),
        "uint16array" => Some(DCDataType::UInt16Array),
        "uint32array" => Some(DCDataType::UInt32Array),
        "uint32uint8array" => Some(DCDataType::UInt32UInt8Array),
        _ => None,
    };

    if let Some(data_type) = data_type {
        return DCToken::DataType(data_type);
    }

    match word {
        "dclass" => DCToken::DClass,
        "struct" => DCToken::Struct,
        "keyword" => DCToken::Keyword,
        "typedef" => DCToken::Typedef,
        "from" => DCToken::From,
        "import" => DCToken::Import,
        _ if DC_KEYWORDS.contains(&word) => DCToken::FieldKeyword(word.to_owned()),
        _ if DC_VIEW_SUFFIXES.contains(&word) => DCToken::ViewSuffix(word.to_owned()),
        _ => DCToken::Identifier(word.to_owned()),
    }
}

lexer! {
    fn next_token(text: 'a) -> (DCToken, &'a str);

    // trivia: whitespace and both comment styles
    r#"[ \t\r\n]+"# => (DCToken::Trivia, text),
    r#"//[^\n]*"# => (DCToken::Trivia, text),
    r#"/[*]([^*]|[*]+[^*/])*[*]+/"# => (DCToken::Trivia, text),

    // numeric literals. Schema constants are tiny; an absurdly long
    // integer saturates rather than failing the whole read.
    r#"[0-9]*\.[0-9]+"# => (DCToken::FloatLiteral(text.parse().unwrap_or(0.0)), text),
    r#"0[xX][0-9a-fA-F]+|0[bB][01]+|0[0-7]+"# => (DCToken::RadixLiteral(text.to_owned()), text),
    r#"0|[1-9][0-9]*"# => (DCToken::IntegerLiteral(text.parse().unwrap_or(i64::MAX)), text),

    // text literals; the quotes are part of the match
    r#"'.'"# => (DCToken::CharLiteral(text.chars().nth(1).unwrap_or('\0')), text),
    r#"\"[^\"]*\""# => (DCToken::StringLiteral(text.trim_matches('"').to_owned()), text),

    // every bare word runs through one classifier
    r#"[A-Za-z_][A-Za-z0-9_]*"# => (classify_word(text), text),
    r#"[A-Za-z0-9_][A-Za-z0-9_\-]*"# => (DCToken::ModuleName(text.to_owned()), text),

    r#"%"# => (DCToken::Percent, text),
    r#"\*"# => (DCToken::Star, text),
    r#"\+"# => (DCToken::Plus, text),
    r#"-"# => (DCToken::Minus, text),
    r#"/"# => (DCToken::Slash, text),
    r#"\."# => (DCToken::Dot, text),

    r#"\("# => (DCToken::LParen, text),
    r#"\)"# => (DCToken::RParen, text),
    r#"\{"# => (DCToken::LBrace, text),
    r#"\}"# => (DCToken::RBrace, text),
    r#"\["# => (DCToken::LBracket, text),
    r#"\]"# => (DCToken::RBracket, text),
    r#"\,"# => (DCToken::Comma, text),
    r#"\;"# => (DCToken::Semicolon, text),
    r#"\="# => (DCToken::Equals, text),
    r#"\:"# => (DCToken::Colon, text),

    r#"."# => (DCToken::Unrecognized(text.to_owned()), text),
}

/// Byte range and starting line of one token within its source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
}

/// Streams `(token, span)` pairs out of one DC source, dropping
/// trivia along the way.
pub struct Lexer<'a> {
    source: &'a str,
    rest: &'a str,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            rest: source,
            line: 1,
        }
    }

    fn span_of(&self, slice: &str, line: usize) -> Span {
        let start: usize = slice.as_ptr() as usize - self.source.as_ptr() as usize;

        Span {
            start,
            end: start + slice.len(),
            line,
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = (DCToken, Span);

    fn next(&mut self) -> Option<(DCToken, Span)> {
        loop {
            let ((token, slice), rest) = next_token(self.rest)?;

            self.rest = rest;

            // a token is reported at the line it starts on; trivia
            // may span lines and pushes the counter forward
            let line: usize = self.line;

            self.line += slice.matches('\n').count();

            match token {
                DCToken::Trivia => continue,
                token => return Some((token, self.span_of(slice, line))),
            }
        }
    }
}
