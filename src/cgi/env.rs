//! CGI/1.1 metavariables for a request

use crate::errors::{Result, Error};
use crate::server::Request;

use std::collections::btree_map::{self, BTreeMap};
use std::path::{Path, PathBuf};

/// Name of the software we tell handlers they are talking to
pub const SERVER_SOFTWARE: &str = concat!("cgi-gateway/", env!("CARGO_PKG_VERSION"));

/// Where a request landed once the router picked a script for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLocation {
    /// The virtual path of the script, e.g. `/cgi-bin/counter.py`
    pub script_name: String,
    /// The real path of the script on disk
    pub script_filename: PathBuf,
    /// Whatever followed the script in the request path, e.g. `/extra`
    pub path_info: String,
    pub document_root: PathBuf
}

/// The complete environment of one handler process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    vars: BTreeMap<String, String>
}

impl CgiEnvironment {
    pub fn new() -> CgiEnvironment {
        CgiEnvironment { vars: BTreeMap::new() }
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<String, String> {
        self.vars.iter()
    }

    /// The handler to run
    pub fn script_filename(&self) -> Option<&Path> {
        self.get("SCRIPT_FILENAME").map(Path::new)
    }
}

impl<'a> IntoIterator for &'a CgiEnvironment {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

/// Builds the environment for `req`.
///
/// The request must already carry its `ScriptLocation`; without one there
/// is nothing to run and this fails before any process is started.
pub fn build_environment(req: &Request) -> Result<CgiEnvironment> {
    let script = match req.script() {
        Some(s) => s,
        None => return Err(Error::Configuration(
            format!("no script routed for {}", req.path())))
    };

    let mut env = CgiEnvironment::new();
    env.insert("GATEWAY_INTERFACE", "CGI/1.1");
    env.insert("SERVER_PROTOCOL", req.protocol());
    env.insert("SERVER_SOFTWARE", SERVER_SOFTWARE);
    env.insert("SERVER_NAME", server_name(req));
    env.insert("SERVER_PORT", req.local_port.to_string());
    env.insert("REQUEST_METHOD", req.method());
    env.insert("REQUEST_URI", req.raw_target());
    env.insert("QUERY_STRING", req.query_string());
    env.insert("REMOTE_ADDR", req.remote_addr.ip().to_string());
    env.insert("REMOTE_PORT", req.remote_addr.port().to_string());
    env.insert("DOCUMENT_ROOT", script.document_root.to_string_lossy());
    env.insert("SCRIPT_NAME", script.script_name.as_str());
    env.insert("SCRIPT_FILENAME", script.script_filename.to_string_lossy());

    if !script.path_info.is_empty() {
        let translated = script.document_root
            .join(script.path_info.trim_start_matches('/'));
        env.insert("PATH_INFO", script.path_info.as_str());
        env.insert("PATH_TRANSLATED", translated.to_string_lossy());
    }

    if !req.body().is_empty() {
        env.insert("CONTENT_LENGTH", req.body().len().to_string());
    }

    for (name, value) in req.headers() {
        let lower = name.to_ascii_lowercase();
        if lower == "content-type" {
            env.insert("CONTENT_TYPE", String::from_utf8_lossy(value));
            continue;
        }
        if lower == "content-length" || is_withheld_header(&lower) {
            continue;
        }

        env.insert(header_variable(name), String::from_utf8_lossy(value));
    }

    Ok(env)
}

/// `X-Foo-Bar` → `HTTP_X_FOO_BAR`
pub fn header_variable(name: &str) -> String {
    let mut var = String::with_capacity(name.len() + 5);
    var.push_str("HTTP_");
    var.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }
    }));
    var
}

/// Hop-by-hop headers, plus `Proxy`, which would otherwise become
/// `HTTP_PROXY` and be picked up as a proxy setting by the handler.
fn is_withheld_header(lower: &str) -> bool {
    matches!(
        lower,
        "connection"
            | "keep-alive"
            | "proxy"
            | "proxy-connection"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn server_name(req: &Request) -> String {
    let host = match req.headers().get("Host") {
        Some(h) => String::from_utf8_lossy(h).into_owned(),
        None => return String::from("localhost")
    };

    if host.starts_with('[') {
        // IPv6 literal, keep the brackets
        return match host.find(']') {
            Some(end) => host[..= end].to_owned(),
            None => host
        };
    }

    match host.rfind(':') {
        Some(colon) => host[.. colon].to_owned(),
        None => host
    }
}
