//! Client-side cookie state
//!
//! Cookies live with the client, so everything here is a pure function over
//! header strings. There is no server-side jar.

use std::collections::HashMap;
use std::fmt::Write;

/// Parses a `Cookie` request header into a name → value mapping.
///
/// Pairs that don’t look like `name=value` are skipped, and a repeated name
/// takes its last value. An absent or entirely unparseable header gives an
/// empty mapping; first-visit clients have no cookies.
pub fn parse_incoming(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();

    for pair in header.split(';') {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => continue
        };

        if name.is_empty() || !name.bytes().all(is_token_byte) {
            continue;
        }

        cookies.insert(name.to_owned(), unquote(value));
    }

    cookies
}

/// Renders a complete `Set-Cookie` header line for one cookie.
pub fn set_outgoing(name: &str, value: &str, attributes: &CookieAttributes)
                    -> String
{
    format!("Set-Cookie: {}", Cookie {
        name: name.to_owned(),
        value: value.to_owned(),
        attributes: attributes.clone()
    }.to_header_value())
}

/// The optional attributes of an outgoing cookie
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieAttributes {
    /// Lifetime in seconds
    pub max_age: Option<i64>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool
}

impl CookieAttributes {
    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }
}

/// An outgoing cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub attributes: CookieAttributes
}

impl Cookie {
    /// The value of a `Set-Cookie` header, without the header name
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, quote(&self.value));
        let attrs = &self.attributes;

        if let Some(max_age) = attrs.max_age {
            let _ = write!(out, "; Max-Age={}", max_age);
        }
        if let Some(ref path) = attrs.path {
            let _ = write!(out, "; Path={}", path);
        }
        if let Some(ref domain) = attrs.domain {
            let _ = write!(out, "; Domain={}", domain);
        }
        if attrs.secure {
            out.push_str("; Secure");
        }
        if attrs.http_only {
            out.push_str("; HttpOnly");
        }

        out
    }
}

/// A batch of outgoing cookies with unique names.
///
/// Setting a name twice keeps the position of the first `set` and the value
/// and attributes of the last.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>
}

impl CookieJar {
    pub fn new() -> CookieJar {
        CookieJar { cookies: Vec::new() }
    }

    pub fn set<N, V>(&mut self, name: N, value: V, attributes: CookieAttributes)
        where N: Into<String>, V: Into<String>
    {
        let cookie = Cookie {
            name: name.into(),
            value: value.into(),
            attributes
        };

        match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie)
        }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// One `Set-Cookie: ...` line per cookie, in insertion order
    pub fn header_lines(&self) -> Vec<String> {
        self.cookies.iter()
            .map(|c| format!("Set-Cookie: {}", c.to_header_value()))
            .collect()
    }
}

/// What the client asked the counter to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterAction {
    Add,
    Show
}

/// A per-client counter kept in a single cookie.
///
/// Reading is fail-soft: a missing or non-numeric cookie counts as `default`.
#[derive(Debug, Clone)]
pub struct Counter {
    pub name: String,
    pub default: u64,
    /// `Max-Age` for the cookie that carries the count
    pub max_age: Option<i64>
}

impl Counter {
    pub fn new<S: Into<String>>(name: S, default: u64) -> Counter {
        Counter {
            name: name.into(),
            default,
            max_age: None
        }
    }

    pub fn with_max_age(mut self, seconds: i64) -> Counter {
        self.max_age = Some(seconds);
        self
    }

    /// The count after applying `action` to what the client sent.
    ///
    /// A client without the cookie starts at `default` whatever the action,
    /// and so does one whose cookie isn’t a number.
    pub fn next(&self, cookies: &HashMap<String, String>, action: CounterAction)
                -> u64
    {
        let current = match cookies.get(&self.name).map(|v| v.parse::<u64>()) {
            Some(Ok(n)) => n,
            Some(Err(_)) => {
                debug!("Counter cookie {} is not a number, resetting", self.name);
                return self.default;
            },
            None => return self.default
        };

        match action {
            CounterAction::Add => current.saturating_add(1),
            CounterAction::Show => current
        }
    }

    /// Convenience over `next` for a raw `Cookie` header
    pub fn next_from_header(&self, header: Option<&str>, action: CounterAction)
                            -> u64
    {
        self.next(&parse_incoming(header.unwrap_or("")), action)
    }

    /// The `Set-Cookie` line storing `count`
    pub fn set_cookie(&self, count: u64) -> String {
        let mut attributes = CookieAttributes::default();
        attributes.max_age = self.max_age;
        set_outgoing(&self.name, &count.to_string(), &attributes)
    }
}

/// Token characters per RFC 7230
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Bytes allowed unquoted in a cookie value per RFC 6265
fn is_cookie_octet(c: char) -> bool {
    matches!(c, '\x21' | '\x23' ..= '\x2B' | '\x2D' ..= '\x3A' | '\x3C' ..= '\x5B' | '\x5D' ..= '\x7E')
}

fn quote(value: &str) -> String {
    if value.chars().all(is_cookie_octet) {
        return value.to_owned();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn unquote(value: &str) -> String {
    let inner = match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner,
        None => return value.to_owned()
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        }
        else {
            out.push(c);
        }
    }
    out
}
