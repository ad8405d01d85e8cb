pub mod parser;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// A holder for app configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port number to listen on
    pub port: u16,
    pub cgi: CgiConfig
}

impl Default for Config {
    fn default() -> Config {
        Config {
            port: 8000,
            cgi: Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct CgiConfig {
    /// Where the handler scripts are located on disk
    pub root: PathBuf,
    /// Public URI prefix that gets mapped onto `root`
    pub public_prefix: PathBuf,
    /// Wall-clock budget for one handler run
    pub timeout: Duration,
    /// How many handlers may run at the same time
    pub max_concurrent: usize,
    pub max_stdout_bytes: usize,
    pub max_stderr_bytes: usize,
    /// How far into handler output we look for the end of the headers
    pub header_scan_limit: usize,
    pub max_request_body: usize,
    /// Methods routed to handlers; `None` routes every method
    pub methods: Option<Vec<String>>,
    /// File extension to interpreter program
    pub interpreters: HashMap<String, PathBuf>
}

impl Default for CgiConfig {
    fn default() -> CgiConfig {
        CgiConfig {
            root: PathBuf::from("/etc/cgi-gateway/cgi-bin"),
            public_prefix: PathBuf::from("/cgi-bin"),
            timeout: Duration::from_secs(10),
            max_concurrent: 16,
            max_stdout_bytes: 10 * 1024 * 1024,
            max_stderr_bytes: 64 * 1024,
            header_scan_limit: 16 * 1024,
            max_request_body: 1024 * 1024,
            methods: None,
            interpreters: HashMap::new()
        }
    }
}
