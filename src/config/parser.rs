use super::*;
use toml::{Table, Value};

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn parse_file<P: AsRef<Path>>(conf: P)
                                  -> Result<Config, Error>
{
    let mut toml = String::new();
    {
        let mut f = File::open(conf)?;
        f.read_to_string(&mut toml)?;
    }

    parse_str(&toml)
}

pub fn parse_str(toml: &str) -> Result<Config, Error> {
    match toml.parse::<Table>() {
        Ok(table) => config_from_table(&table),
        Err(e) => Err(Error::Parse(vec![message_from_error(toml, &e)]))
    }
}

/// Walks a dotted key through nested tables
fn lookup<'a>(table: &'a Table, key: &str) -> Option<&'a Value> {
    let mut parts = key.split('.');
    let mut current = table.get(parts.next()?)?;
    for part in parts {
        current = current.as_table()?.get(part)?;
    }
    Some(current)
}

fn config_from_table(table: &Table) -> Result<Config, Error> {
    let mut config: Config = Default::default();

    match lookup(table, "listen.port") {
        Some(&Value::Integer(p))
            if p <= u16::MAX as i64 &&
            p > 0 => config.port = p as u16,
        Some(&Value::Integer(p)) => return Err(Error::Validation(
            format!("The given port {} is out of range", p)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the port to be an integer, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.root") {
        Some(Value::String(path)) =>
            config.cgi.root = PathBuf::from(path),
        Some(val) => return Err(Error::Validation(
            format!("Expected the CGI root to be a string, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.public_prefix") {
        Some(Value::String(path)) if path.starts_with('/') =>
            config.cgi.public_prefix = PathBuf::from(path),
        Some(Value::String(path)) => return Err(Error::Validation(
            format!("The public prefix {:?} must begin with '/'", path)
        )),
        Some(val) => return Err(Error::Validation(
            format!("Expected the public prefix to be a string, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    if let Some(secs) = positive_integer(table, "cgi.timeout_secs")? {
        config.cgi.timeout = Duration::from_secs(secs as u64);
    }
    if let Some(n) = positive_integer(table, "cgi.max_concurrent")? {
        config.cgi.max_concurrent = n;
    }
    if let Some(n) = positive_integer(table, "cgi.max_stdout_bytes")? {
        config.cgi.max_stdout_bytes = n;
    }
    if let Some(n) = positive_integer(table, "cgi.max_stderr_bytes")? {
        config.cgi.max_stderr_bytes = n;
    }
    if let Some(n) = positive_integer(table, "cgi.header_scan_limit")? {
        config.cgi.header_scan_limit = n;
    }
    if let Some(n) = positive_integer(table, "cgi.max_request_body")? {
        config.cgi.max_request_body = n;
    }

    match lookup(table, "cgi.methods") {
        Some(Value::Array(methods)) => {
            let mut names = Vec::with_capacity(methods.len());
            for method in methods {
                match method {
                    Value::String(m) => names.push(m.to_ascii_uppercase()),
                    other => return Err(Error::Validation(
                        format!("Expected methods to be strings, got a {}",
                                other.type_str())
                    ))
                }
            }
            config.cgi.methods = Some(names);
        },
        Some(val) => return Err(Error::Validation(
            format!("Expected methods to be an array, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    match lookup(table, "cgi.interpreters") {
        Some(Value::Table(interpreters)) => {
            for (extension, program) in interpreters {
                match program {
                    Value::String(p) => {
                        config.cgi.interpreters.insert(
                            extension.trim_start_matches('.').to_owned(),
                            PathBuf::from(p));
                    },
                    other => return Err(Error::Validation(
                        format!("Expected the interpreter for {:?} to be a string, got a {}",
                                extension, other.type_str())
                    ))
                }
            }
        },
        Some(val) => return Err(Error::Validation(
            format!("Expected interpreters to be a table, got a {}",
                    val.type_str())
        )),
        None => ()
    }

    Ok(config)
}

fn positive_integer(table: &Table, key: &str) -> Result<Option<usize>, Error> {
    match lookup(table, key) {
        Some(&Value::Integer(n)) if n > 0 => Ok(Some(n as usize)),
        Some(&Value::Integer(n)) => Err(Error::Validation(
            format!("{} must be positive, got {}", key, n)
        )),
        Some(val) => Err(Error::Validation(
            format!("Expected {} to be an integer, got a {}",
                    key, val.type_str())
        )),
        None => Ok(None)
    }
}

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(Vec<ErrorMessage>),
    Validation(String)
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

/// An owned, rendered version of a TOML syntax error
#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub desc: String,
    pub line: usize,
    pub column: usize
}

/// Convert a `toml::de::Error` into an `ErrorMessage`
fn message_from_error(source: &str, error: &toml::de::Error)
                      -> ErrorMessage
{
    let offset = error.span().map_or(0, |span| span.start);
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;

    ErrorMessage {
        desc: error.message().to_owned(),
        line,
        column
    }
}
