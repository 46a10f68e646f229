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

//! Deserialized model of the daemon's TOML configuration file.

use otp_core::globals::Channel;
use serde::Deserialize;

#[derive(Deserialize, PartialEq, Debug, Clone)]
pub struct OtpConfig {
    pub daemon: Daemon,
    pub global: Global,
    pub services: Services,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
pub struct Daemon {
    pub name: String,
    pub log_level: Option<String>,
    /// Run the I/O runtime with worker threads; a single-threaded
    /// runtime is used when false.
    pub want_threads: Option<bool>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
pub struct Global {
    pub dc_files: Vec<String>,
    /// Channel the database server listens on; `db` field updates
    /// are forwarded there.
    pub database_channel: Option<Channel>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
pub struct Services {
    pub message_director: Option<MessageDirector>,
    pub state_server: Option<StateServer>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
pub struct MessageDirector {
    pub bind: String, // '<host>:<port>'
    /// Seconds an undeliverable routed message may wait for its
    /// sender to rebind before it is dropped.
    pub message_timeout: Option<f64>,
}

#[derive(Deserialize, PartialEq, Debug, Clone)]
pub struct StateServer {
    pub connect: String, // '<host>:<port>' of the message director
    pub channel: Option<Channel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_deserializes() {
        let source: &str = r#"
            [daemon]
            name = "Cluster"
            log_level = "debug"
            want_threads = true

            [global]
            dc_files = ["otp.dc", "game.dc"]
            database_channel = 4003

            [services.message_director]
            bind = "0.0.0.0:6666"
            message_timeout = 15.0

            [services.state_server]
            connect = "127.0.0.1:6666"
            channel = 4002
        "#;

        let conf: OtpConfig = toml::from_str(source).expect("config must parse");

        assert_eq!(conf.daemon.name, "Cluster");
        assert_eq!(conf.daemon.want_threads, Some(true));
        assert_eq!(conf.global.dc_files.len(), 2);
        assert_eq!(conf.global.database_channel, Some(4003));

        let md: MessageDirector = conf.services.message_director.expect("configured");

        assert_eq!(md.bind, "0.0.0.0:6666");
        assert_eq!(md.message_timeout, Some(15.0));

        let ss: StateServer = conf.services.state_server.expect("configured");

        assert_eq!(ss.connect, "127.0.0.1:6666");
        assert_eq!(ss.channel, Some(4002));
    }

    #[test]
    fn services_are_optional() {
        let source: &str = r#"
            [daemon]
            name = "MD only"

            [global]
            dc_files = []

            [services.message_director]
            bind = "127.0.0.1:7100"
        "#;

        let conf: OtpConfig = toml::from_str(source).expect("config must parse");

        assert!(conf.services.state_server.is_none());
        assert!(conf.services.message_director.is_some());
        assert_eq!(conf.daemon.want_threads, None);
    }
}
