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

//! # otp-daemon
//! Scaffolding shared by every otpd service: daemon configuration,
//! the global logger, the service bootstrap trait, and the cluster
//! subscriber helpers.

pub mod config;
pub mod logger;
pub mod service;
pub mod subscriber;

/// Name of the daemon binary.
pub static BINARY: &str = "otpd";

/// Configuration file looked up in the working directory when no
/// path argument is given.
pub static DEFAULT_TOML: &str = "otpd.toml";

pub static VERSION: &str = env!("CARGO_PKG_VERSION");
