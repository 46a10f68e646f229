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

//! # otp-core
//! Provides the wire-level and schema-level building blocks of the
//! otpd cluster: datagrams and datagram iterators, the message type
//! definitions of every cluster role, and the DC file layer (lexer,
//! parser, schema registry, field packer, and legacy hash).
//!
//! Every multi-byte value on the wire is little-endian. Cluster
//! messages are framed by the network layer with a 16-bit length tag.

#![allow(clippy::module_inception)]
#![deny(unused_extern_crates)]

pub mod datagram;
pub mod dcfield;
pub mod dcfile;
pub mod dclexer;
pub mod dcpacker;
pub mod dcparser;
pub mod globals;
mod hashgen;
pub mod protocol;

use dcfile::DCFile;
use dcparser::DCReadError;

/// Returns false if a [`log`] logger is not initialized.
fn logger_initialized() -> bool {
    use log::Level::*;

    let levels: &[log::Level] = &[Error, Warn, Info, Debug, Trace];

    for level in levels {
        if log::log_enabled!(*level) {
            return true;
        }
    }
    false
}

/// Creates a [`pretty_env_logger`] logger if no [`log`]
/// logger is found to be initialized in this process.
fn init_logger() {
    if logger_initialized() {
        return;
    }
    pretty_env_logger::init();
}

/// Reads and parses every DC schema file given, merging their
/// declarations in order into a single [`DCFile`] registry.
///
/// Any unreadable or unparsable file fails the whole read; the
/// cluster cannot start without its schema.
pub fn read_dc_files(file_paths: &[String]) -> Result<DCFile, DCReadError> {
    init_logger();

    let mut sources: Vec<String> = vec![];

    for path in file_paths {
        match std::fs::read_to_string(path) {
            Ok(contents) => sources.push(contents),
            Err(err) => {
                return Err(DCReadError::FileError(path.clone(), err));
            }
        }
    }
    dcparser::parse_dc_sources(&sources)
}
