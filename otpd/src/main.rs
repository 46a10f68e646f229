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

//! # otpd
//! Daemon binary for the otpd cluster. One process can run any
//! combination of the cluster services; which ones boot is decided
//! by the `[services]` table of the TOML configuration.

#![deny(unused_extern_crates)]

use log::{error, info, warn};
use otp_core::dcfile::DCFile;
use otp_core::read_dc_files;
use otp_daemon::config::OtpConfig;
use otp_daemon::logger::{self, DaemonLogger};
use otp_daemon::service::{set_future_return_type, OtpService};
use otp_daemon::{BINARY, DEFAULT_TOML, VERSION};
use otp_message_director::MessageDirector;
use otp_state_server::StateServer;
use std::fs::File;
use std::io::{Error, ErrorKind, Read};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

#[derive(Clone, Copy)]
enum FlagArguments {
    DCFilePath,
}

// Macro for defining the global logger static and initializing it.
macro_rules! init_logger {
    ($level:expr) => {
        pub static GLOBAL_LOGGER: DaemonLogger = DaemonLogger { log_level: $level };
        logger::init_logger(&GLOBAL_LOGGER)?;

        info!("Log level set at {}.", $level);
    };
}

fn main() -> std::io::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_file: &str = DEFAULT_TOML;
    let mut want_dc_check: bool = false;
    let mut dc_check_files: Vec<String> = vec![];
    let mut expecting_flag_argument: Option<FlagArguments> = None;

    if args.len() > 1 {
        for item in args.iter().enumerate() {
            let (index, argument): (usize, &String) = item;
            if index == 0 {
                continue; // skip invoked binary name
            }
            if argument.starts_with('-') {
                if argument == "-h" || argument == "--help" {
                    print_help_page();
                    return Ok(());
                } else if argument == "-v" || argument == "--version" {
                    print_version();
                    return Ok(());
                } else if argument == "-c" || argument == "--validate-dc" {
                    want_dc_check = true;
                    expecting_flag_argument = Some(FlagArguments::DCFilePath);
                    continue;
                } else {
                    println!("{}: {}: Invalid flag.\n", BINARY, argument);
                    print_help_page();
                    return Ok(());
                }
            } else if let Some(expect_flag_arg) = expecting_flag_argument {
                match expect_flag_arg {
                    FlagArguments::DCFilePath => {
                        dc_check_files.push(argument.to_owned());

                        // Look ahead to see if we should expect more args.
                        if let Some(lookahead) = args.get(index + 1) {
                            if !lookahead.ends_with(".dc") {
                                expecting_flag_argument = None;
                            }
                            continue;
                        }
                        expecting_flag_argument = None;
                    }
                }
            } else if index == (args.len() - 1) {
                // last argument given & we're not expecting more arguments,
                // so it must be the configuration file path given.
                config_file = argument.as_str();
                break;
            } else {
                println!("{}: {}: Invalid argument.\n", BINARY, argument);
                print_help_page();
                return Ok(());
            }
        }
        if expecting_flag_argument.is_some() {
            println!("{}: Expected more arguments.\n", BINARY);
            print_help_page();
            return Ok(());
        }
    }

    // Read the daemon configuration file
    let mut conf_file: File = match File::open(config_file) {
        Err(err) => {
            println!("Could not load the TOML configuration.");
            println!("otpd cannot start without a configuration file present.");
            return Err(err);
        }
        Ok(file) => file,
    };

    let mut contents: String = String::new();

    conf_file.read_to_string(&mut contents)?;
    drop(conf_file);

    // Deserialize the TOML config file to our [`OtpConfig`] struct.
    let daemon_config: OtpConfig = match toml::from_str(contents.as_str()) {
        Ok(config) => config,
        Err(err) => {
            println!("An error occurred while parsing the TOML configuration.");
            return Err(Error::new(ErrorKind::InvalidInput, err.message()));
        }
    };
    drop(contents);

    // Now that the configuration file is parsed, we can create the logger.
    if let Some(log_level) = &daemon_config.daemon.log_level {
        match log_level.as_str() {
            "error" => {
                init_logger!(log::Level::Error);
            }
            "warn" => {
                init_logger!(log::Level::Warn);
            }
            "info" => {
                init_logger!(log::Level::Info);
            }
            "debug" => {
                init_logger!(log::Level::Debug);
            }
            "trace" => {
                init_logger!(log::Level::Trace);
            }
            _ => panic!("Could not initialize logger. Error in log level string in TOML configuration."),
        }
    } else {
        init_logger!(log::Level::Info);
    }

    // If `--validate-dc` argument was received, parse DC files and exit.
    if want_dc_check {
        return validate_dc_files(dc_check_files);
    }

    drop(args);

    // Read the DC files listed in the daemon configuration. The
    // message director alone does not need them, but a state server
    // cannot exist without its schema.
    let dc: Option<DCFile> = if daemon_config.global.dc_files.is_empty() {
        None
    } else {
        match read_dc_files(&daemon_config.global.dc_files) {
            Ok(dc) => {
                info!("Read DC schema; hash is {}.", dc.get_pretty_hash());
                Some(dc)
            }
            Err(dc_err) => {
                error!("Failed to parse DC file(s): {}", dc_err);
                return Err(Error::new(ErrorKind::InvalidInput, "Failed to parse DC file."));
            }
        }
    };

    // Everything is prepped for the daemon, so we are safe
    // to start the Tokio asynchronous runtime.
    let want_threads: bool = daemon_config.daemon.want_threads.unwrap_or(true);

    let tokio_runtime: Runtime = if want_threads {
        Builder::new_multi_thread().enable_all().build()?
    } else {
        Builder::new_current_thread().enable_all().build()?
    };

    let daemon_async_main = async move {
        // Tokio join handles for spawned tasks of services started.
        let mut service_handles: Vec<JoinHandle<std::io::Result<()>>> = vec![];

        let want_message_director: bool = daemon_config.services.message_director.is_some();
        let want_state_server: bool = daemon_config.services.state_server.is_some();

        if want_message_director {
            info!("Booting Message Director service.");

            let handle = MessageDirector::start(daemon_config.clone(), None).await?;
            service_handles.push(handle);
        }

        if want_state_server {
            info!("Booting State Server service.");

            if dc.is_none() {
                error!("The State Server requires DC files in the configuration.");
                return Err(Error::new(ErrorKind::InvalidInput, "No DC files configured."));
            }
            let handle = StateServer::start(daemon_config.clone(), dc.clone()).await?;
            service_handles.push(handle);
        }

        drop(dc);
        drop(daemon_config);

        if service_handles.is_empty() {
            warn!("No services spawned, exiting program.")
        } else {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    println!();
                    info!("Received interrupt (Ctrl + C)");
                }
                Err(err) => {
                    error!("Unable to listen for shutdown signal: {}", err);
                    panic!("Tokio was not able to listen to the interrupt signal.")
                }
            }
        }
        info!("Exiting...");

        // Abort all spawned Tokio tasks.
        for handle in &service_handles {
            handle.abort();
        }
        // Await task handles to wrap things up; expect a cancellation error.
        for handle in service_handles {
            if let Err(join_err) = handle.await {
                assert!(join_err.is_cancelled());
            }
        }
        Ok(())
    };

    // Hack to reassure the compiler that I want to return an IO result.
    set_future_return_type::<std::io::Result<()>, _>(&daemon_async_main);

    tokio_runtime.block_on(daemon_async_main)
}

/// Performs the operation for the `-h` flag, or the `--help`
/// GNU-style long flag in the daemon binary.
fn print_help_page() {
    println!(
        "Usage:    {} [options] ... [CONFIG_FILE]\n\
        \n\
        otpd - distributed object cluster daemon.\n\
        This binary will look for a configuration file (.toml)\n\
        in the current working directory as \"{}\".\n\
        \n\
        -h, --help          Print the help page.\n\
        -v, --version       Print otpd binary build version & info.\n\
        -c, --validate-dc   Run the DC parser on the given DC file(s).\n",
        BINARY, DEFAULT_TOML
    );
}

/// Performs the operation for the `-v` flag, or the `--version`
/// GNU-style long flag in the daemon binary.
#[rustfmt::skip]
fn print_version() {
    let bin_arch: &str = if cfg!(target_arch = "x86") { "x86" }
    else if cfg!(target_arch = "x86_64") { "x86_64" }
    else if cfg!(target_arch = "aarch64") { "aarch64" }
    else { "unknown" };

    let bin_platform: &str = if cfg!(target_os = "linux") { "linux" }
    else if cfg!(target_os = "windows") { "windows" }
    else if cfg!(target_os = "macos") { "macos" }
    else if cfg!(target_os = "freebsd") { "freebsd" }
    else { "unknown" };

    println!(
        "otpd, version {} ({}-{})\n\n\
        otpd is free software; you can redistribute it and/or modify\n\
        it under the terms of the GNU Affero General Public License,\n\
        as published by the Free Software Foundation, either version 3\n\
        of the License, or (at your option) any later version.\n",
        VERSION, bin_arch, bin_platform
    );
}

/// Performs the operation for the `-c` flag, or the `--validate-dc`
/// GNU-style long flag in the daemon binary.
fn validate_dc_files(files: Vec<String>) -> std::io::Result<()> {
    match read_dc_files(&files) {
        Ok(dc_file) => {
            let hash: u32 = dc_file.get_legacy_hash();
            let signed: i32 = hash as i32;
            let pretty: String = dc_file.get_pretty_hash();

            info!(
                "No issues found. Schema hash is {} (signed {}, hex {})",
                hash, signed, pretty
            );
            Ok(())
        }
        Err(err) => {
            error!("Failed to parse DC file: {:?}", err);

            Err(Error::new(ErrorKind::InvalidInput, "Failed to parse DC file."))
        }
    }
}
