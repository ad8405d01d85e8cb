//! A CGI/1.1 gateway.
//!
//! Runs external handler programs for HTTP requests: request metadata goes
//! into the handler’s environment, the request body into its stdin, and
//! whatever it prints on stdout is parsed back into a response. The pieces
//! are usable on their own; `server` hosts them behind a small listener.

#[macro_use] extern crate log;

pub mod cgi;
pub mod config;
pub mod cookies;
pub mod errors;
pub mod filesystem;
pub mod log_util;
pub mod server;
