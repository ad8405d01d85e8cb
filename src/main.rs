//! A CGI gateway server.
//!
//! Call it like this:
//!
//!     cgi-gateway -f config.toml
//!
//! The config file is in the [TOML format][toml] because it’s commonly used in
//! the Rust ecosystem. Here is an example:
//!
//! ```toml
//! [listen]
//! port = 8000
//!
//! [cgi]
//! root = "/etc/cgi-gateway/cgi-bin"
//! public_prefix = "/cgi-bin"
//! timeout_secs = 10
//! max_concurrent = 16
//!
//! [cgi.interpreters]
//! py = "python3"
//! ```
//!
//! Everything but the interpreters also serves as the defaults if no config
//! file is provided, or any given key is not present. If a key is of the
//! wrong type, the server will bail, so don’t do that.
//!
//! `cgi-gateway` will listen for connections from any IP address and run the
//! script a request path names under the root. Handler stderr goes to the
//! log, which is tuned through `CGI_GATEWAY_LOG`.
//!
//! [toml]: https://github.com/toml-lang/toml

use cgi_gateway::config::parser::{self, parse_file};
use cgi_gateway::server::serve;

use clap::{Arg, Command};
use log::{error, info, LevelFilter};

use std::env;
use std::ffi::OsString;
use std::process::exit;

fn main() {
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(LevelFilter::Info);

    if let Ok(var) = env::var("CGI_GATEWAY_LOG") {
        log_builder.parse_filters(&var);
    }

    if let Err(e) = log_builder.try_init() {
        eprintln!("cgi-gateway: Error when initializing logging: {}", e);
        exit(1);
    }

    let matches = Command::new("cgi-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Alex Hill <alexander.d.hill.89@gmail.com>")
        .arg(Arg::new("config_file")
             .short('f')
             .value_name("FILE")
             .help("The TOML file with server configuration")
             .value_parser(clap::value_parser!(OsString))
             .default_value("/etc/cgi-gateway/config.toml"))
        .get_matches();

    let config_file = match matches.get_one::<OsString>("config_file") {
        Some(file) => file.clone(),
        None => OsString::from("/etc/cgi-gateway/config.toml")
    };

    let config = match parse_file(&config_file) {
        Ok(c) => c,
        Err(parser::Error::Io(e)) => {
            error!("Error opening config file {:?}: {}", config_file, e);
            exit(1);
        },
        Err(parser::Error::Parse(e)) => {
            error!("Errors parsing config file {:?}", config_file);
            for error in e {
                error!("Config file error at line {} column {}: {}",
                       error.line, error.column, error.desc);
            }
            exit(1);
        },
        Err(parser::Error::Validation(message)) => {
            error!("Error in config file: {}", message);
            exit(1);
        }
    };

    info!("Starting server on port {}, serving {} from {}",
          config.port, config.cgi.public_prefix.display(), config.cgi.root.display());
    if let Err(e) = serve(config) {
        error!("{}", e);
        exit(1);
    }
}
