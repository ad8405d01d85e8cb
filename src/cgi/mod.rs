//! Running CGI/1.1 handlers
//!
//! A request flows through `env` (metavariables), `invoker` (the handler
//! process) and `parser` (its stdout), with `gateway` tying the three to the
//! server's `Handler` trait.

pub mod env;
pub mod gateway;
pub mod invoker;
pub mod parser;

use std::str;

/// A status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason_phrase: Vec<u8>
}

/// A response header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub content: Vec<u8>
}

impl Header {
    pub fn new(name: &str, content: &str) -> Header {
        Header {
            name: Vec::from(name.as_bytes()),
            content: Vec::from(content.as_bytes())
        }
    }

    #[inline]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

/// Set when the handler declared more body than it wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncatedBody {
    pub declared: usize,
    pub available: usize
}

/// A handler’s output, split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// 200 unless the handler said otherwise
    pub status: Status,
    /// In output order, `Status` and `Content-Length` excluded. Repeated
    /// headers such as `Set-Cookie` appear once per occurrence.
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
    /// The handler’s own `Content-Length`, if it sent a valid one
    pub declared_length: Option<usize>,
    pub truncated: Option<TruncatedBody>
}

impl ParsedResponse {
    /// All values of the named header, in order
    pub fn header_values<'a>(&'a self, name: &'a str)
                             -> impl Iterator<Item = &'a [u8]> + 'a
    {
        self.headers.iter()
            .filter(move |h| h.is(name))
            .map(|h| h.content.as_slice())
    }

    /// The first value of the named header, if it is UTF-8
    pub fn header<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.header_values(name).next().and_then(|v| str::from_utf8(v).ok())
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }
}

/// The reason phrase we use when a handler gives only a code
pub fn default_reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown"
    }
}
