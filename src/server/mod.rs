//! Server functionality
//!
//! Just enough HTTP/1.1 to host CGI handlers: a request line, headers and a
//! `Content-Length` body in; a status line, headers and a body out. Every
//! connection carries one request and is closed afterwards.

mod router;

pub use self::router::Router;

use crate::cgi::env::ScriptLocation;
use crate::cgi::gateway::Gateway;
use crate::config::Config;
use crate::errors::{Result, Error};
use crate::filesystem::normalize_path;

use std::io::{self, Read, Write, BufWriter, Cursor};
use std::net::{TcpListener, TcpStream, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Most bytes we accept before the end of the request headers
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Binds the configured port and hands requests under the public prefix to
/// CGI handlers, one thread per connection.
pub fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))?;
    let router = Arc::new(build_router(&config)?);
    let max_body = config.cgi.max_request_body;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let router = Arc::clone(&router);
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &router, max_body) {
                        warn!("{}", e);
                    }
                });
            },
            Err(e) => {
                warn!("Failed connection: {}", e);
            }
        };
    }

    Ok(())
}

/// Installs the gateway under the public prefix, for the configured methods
pub fn build_router(config: &Config) -> Result<Router> {
    let gateway = Arc::new(Gateway::new(&config.cgi)?);
    let prefix = config.cgi.public_prefix.to_string_lossy().into_owned();

    let mut router = Router::new();
    match config.cgi.methods {
        Some(ref methods) => {
            for method in methods {
                let gateway = Arc::clone(&gateway);
                router.route(prefix.clone(), method.clone(),
                             move |req: Request| gateway.serve(req));
            }
        },
        None => router.route_any(prefix, move |req: Request| gateway.serve(req))
    }

    Ok(router)
}

fn handle_client(stream: TcpStream, router: &Router, max_body: usize) -> Result<()> {
    stream.set_read_timeout(Some(Duration::new(5, 0)))?;
    stream.set_write_timeout(Some(Duration::new(5, 0)))?;

    let peer_addr = stream.peer_addr()?;
    let local_port = stream.local_addr()?.port();

    let response = match Request::parse(&stream, peer_addr, local_port, max_body) {
        Ok(req) => {
            debug!("{} {} from {}", req.method(), req.raw_target(), peer_addr);
            router.serve(req)
        },
        Err(Error::Io(e)) => return Err(Error::Io(e)),
        Err(e) => {
            info!("Rejecting request from {}: {}", peer_addr, e);
            error_messages::for_status(e.status_code())
        }
    };

    let mut writer = BufWriter::new(&stream);
    response.write_to(&mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Values which can handle requests
pub trait Handler: Send + Sync {
    fn serve(&self, req: Request) -> Response;
}

impl<F> Handler for F where F: Fn(Request) -> Response + Send + Sync {
    fn serve(&self, req: Request) -> Response {
        self(req)
    }
}

/// An incoming request from the client
///
/// Fully read by the time a handler sees it, body included.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    /// The request-target exactly as sent
    raw_target: String,
    /// Percent-decoded path, always starting with `/`
    path: String,
    query_string: String,
    /// `HTTP/1.0` or `HTTP/1.1`
    protocol: String,
    headers: Headers,
    body: Vec<u8>,
    script: Option<ScriptLocation>,
    pub remote_addr: SocketAddr,
    pub local_port: u16
}

impl Request {
    /// Builds a request from its parts, splitting and decoding `target`
    pub fn new(method: &str, target: &str, headers: Headers, body: Vec<u8>,
               remote_addr: SocketAddr, local_port: u16) -> Result<Request>
    {
        let (path, query) = match target.find('?') {
            Some(i) => (&target[.. i], &target[i + 1 ..]),
            None => (target, "")
        };

        let normalized = normalize_path(path.as_bytes())?;
        let mut decoded = String::with_capacity(normalized.len() + 1);
        decoded.push('/');
        decoded.push_str(std::str::from_utf8(&normalized)
                         .map_err(|_| Error::IllegalPercentEncoding)?);

        Ok(Request {
            method: method.to_owned(),
            raw_target: target.to_owned(),
            path: decoded,
            query_string: query.to_owned(),
            protocol: String::from("HTTP/1.1"),
            headers,
            body,
            script: None,
            remote_addr,
            local_port
        })
    }

    /// Reads one request off `stream`
    pub fn parse<R: Read>(mut stream: R, remote_addr: SocketAddr, local_port: u16,
                          max_body: usize) -> Result<Request>
    {
        let (leftover, method, target, version, headers) = parse_inner(&mut stream)?;
        let body = read_body(Cursor::new(leftover).chain(stream), &headers, max_body)?;

        let req = Request::new(&method, &target, headers, body, remote_addr, local_port)?;
        Ok(req.with_protocol(&format!("HTTP/1.{}", version)))
    }

    /// The same request, as sent with another HTTP version
    pub fn with_protocol(mut self, protocol: &str) -> Request {
        self.protocol = protocol.to_owned();
        self
    }

    /// The same request, now bound to a script
    pub fn with_script(mut self, script: ScriptLocation) -> Request {
        self.script = Some(script);
        self
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn raw_target(&self) -> &str {
        &self.raw_target
    }

    #[inline]
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn script(&self) -> Option<&ScriptLocation> {
        self.script.as_ref()
    }
}

/// Reads up to the end of the request headers.
///
/// Returns whatever was read past the headers along with the parsed parts.
fn parse_inner<R: Read>(mut source: R) -> Result<(Vec<u8>,
                                                  String,
                                                  String,
                                                  u8,
                                                  Headers)>
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let read = source.read(&mut chunk)?;
        if read == 0 {
            return Err(Error::RequestIncomplete);
        }
        buffer.extend_from_slice(&chunk[.. read]);

        let mut headers = [httparse::EMPTY_HEADER; 100];
        let mut req = httparse::Request::new(&mut headers);

        if let httparse::Status::Complete(bytes) = req.parse(&buffer)? {
            let mut parsed = Headers::new();
            for header in req.headers.iter() {
                parsed.insert(header.name, Vec::from(header.value));
            }

            return Ok(
                (buffer[bytes ..].to_vec(),
                 String::from(req.method.unwrap_or("")),
                 String::from(req.path.unwrap_or("")),
                 req.version.unwrap_or(1),
                 parsed)
            );
        }

        if buffer.len() > MAX_HEAD_BYTES {
            return Err(Error::Parse(httparse::Error::TooManyHeaders));
        }
    }
}

fn read_body<R: Read>(mut source: R, headers: &Headers, max_body: usize)
                      -> Result<Vec<u8>>
{
    if headers.get("Transfer-Encoding").is_some() {
        return Err(Error::LengthRequired);
    }

    let length = match headers.get("Content-Length") {
        Some(value) => std::str::from_utf8(value).ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(Error::Parse(httparse::Error::HeaderValue))?,
        None => return Ok(Vec::new())
    };

    if length > max_body {
        return Err(Error::BodyTooLarge);
    }

    let mut body = vec![0; length];
    match source.read_exact(&mut body) {
        Ok(()) => Ok(body),
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof =>
            Err(Error::RequestIncomplete),
        Err(e) => Err(Error::from(e))
    }
}

#[test]
fn parse_request_basic() {
    let request: &[u8] = b"GET / HTTP/1.1\r\nHost: google.com\r\nUser-Agent: curl/7.47.1\r\nAccept: */*\r\n\r\n";

    let (_, method, path, version, headers) = parse_inner(request).unwrap();

    assert_eq!(method, "GET");
    assert_eq!(path, "/");
    assert_eq!(version, 1);
    assert_eq!(headers.get("host").map(Vec::as_slice), Some(&b"google.com"[..]));
}

#[test]
fn parse_request_does_not_percent_decode() {
    let request: &[u8] = b"GET /%20 HTTP/1.1\r\n\r\n";

    let (_, _, path, _, _) = parse_inner(request).unwrap();

    assert_eq!(path, "/%20");
}

#[test]
fn parse_request_does_not_fail_on_illegal_percent_decoding() {
    let request: &[u8] = b"GET /bogus%zz HTTP/1.1\r\n\r\n";

    let (_, _, path, _, _) = parse_inner(request).unwrap();

    assert_eq!(path, "/bogus%zz");
}

#[test]
fn parse_request_fails_on_bad_bytes() {
    let request: &[u8] = b"GET /bogon\xff HTTP/1.1\r\n";

    assert!(parse_inner(request).is_err());
}

#[test]
fn parse_reads_the_body_and_query() {
    let request: &[u8] = b"POST /cgi-bin/up%20load.py?x=1 HTTP/1.1\r\nContent-Length: 5\r\nCookie: a=1\r\ncookie: b=2\r\n\r\nhello, and then some";

    let req = Request::parse(request, "127.0.0.1:5000".parse().unwrap(), 8000, 1024).unwrap();

    assert_eq!(req.method(), "POST");
    assert_eq!(req.path(), "/cgi-bin/up load.py");
    assert_eq!(req.query_string(), "x=1");
    assert_eq!(req.body(), b"hello");
    assert_eq!(req.headers().get("Cookie").map(Vec::as_slice), Some(&b"a=1; b=2"[..]));
    assert!(req.script().is_none());
}

#[test]
fn parse_keeps_the_protocol_version() {
    let request: &[u8] = b"GET /cgi-bin/a.sh HTTP/1.0\r\n\r\n";

    let req = Request::parse(request, "127.0.0.1:5000".parse().unwrap(), 8000, 1024).unwrap();

    assert_eq!(req.protocol(), "HTTP/1.0");
}

#[test]
fn parse_enforces_body_limits() {
    let request: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 50\r\n\r\nshort";
    match Request::parse(request, "127.0.0.1:5000".parse().unwrap(), 8000, 10) {
        Err(Error::BodyTooLarge) => (),
        other => panic!("{:?}", other)
    }

    match Request::parse(request, "127.0.0.1:5000".parse().unwrap(), 8000, 100) {
        Err(Error::RequestIncomplete) => (),
        other => panic!("{:?}", other)
    }

    let chunked: &[u8] = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    match Request::parse(chunked, "127.0.0.1:5000".parse().unwrap(), 8000, 100) {
        Err(Error::LengthRequired) => (),
        other => panic!("{:?}", other)
    }
}

/// The response a `Handler` hands back
///
/// `Content-Length` and `Connection` are filled in when the response is
/// written; anything a handler put there is replaced.
#[derive(Debug, Clone)]
pub struct Response {
    status: ResponseStatus,
    headers: Headers,
    body: Vec<u8>,
    omit_body: bool
}

#[derive(Debug, Clone)]
struct ResponseStatus {
    code: u16,
    reason: String
}

/// An ordered list of HTTP headers
///
/// Names are case-normalized on input. The first word, and any words after a
/// hyphen, are capitalized, with all other letters lowercased. Repeats are
/// kept in order, which `Set-Cookie` needs.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    list: Vec<(String, Vec<u8>)>
}

fn normalize_header_name(name: &str) -> String {
    let lowercased = name.to_ascii_lowercase();
    let mut lower_chars = lowercased.chars();

    let mut normalized = String::with_capacity(lowercased.len());
    if let Some(ch) = lower_chars.next() {
        normalized.push(ch.to_ascii_uppercase());
    }
    else {
        return normalized;
    }

    let mut after_hyphen = false;
    for ch in lower_chars {
        if ch == '-' {
            after_hyphen = true;
            normalized.push(ch);
        }
        else if after_hyphen {
            normalized.push(ch.to_ascii_uppercase());
            after_hyphen = false;
        }
        else {
            normalized.push(ch);
        }
    }

    normalized
}

#[test]
fn normalize_content_type() {
    let expected = "Content-Type";
    assert_eq!(expected, &normalize_header_name("Content-Type"));
    assert_eq!(expected, &normalize_header_name("content-type"));
    assert_eq!(expected, &normalize_header_name("CONTENT-TYPE"));
    assert_eq!(expected, &normalize_header_name("cOnTeNt-TyPe"));
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            list: Vec::new()
        }
    }

    /// Adds a request header, folding repeats into the existing value
    pub fn insert(&mut self, key: &str, mut value: Vec<u8>) {
        let name = normalize_header_name(key);
        let separator: &[u8] = if name == "Cookie" { b"; " } else { b"," };

        match self.list.iter_mut().find(|(n, _)| *n == name) {
            None => self.list.push((name, value)),
            Some((_, entry)) => {
                entry.reserve(value.len() + separator.len());
                entry.extend_from_slice(separator);
                entry.append(&mut value);
            }
        }
    }

    /// Adds a header line, keeping any earlier ones of the same name
    pub fn append(&mut self, key: &str, value: Vec<u8>) {
        self.list.push((normalize_header_name(key), value));
    }

    /// Replaces every header of this name with a single value
    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        self.remove(key);
        self.append(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        let name = normalize_header_name(key);
        self.list.retain(|(n, _)| *n != name);
    }

    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        let name = normalize_header_name(key);
        self.list.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn get_all<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a Vec<u8>> + 'a {
        let name = normalize_header_name(key);
        self.list.iter().filter(move |(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.list.iter().map(|(n, v)| (n, v))
    }
}

impl IntoIterator for Headers {
    type Item = (String, Vec<u8>);
    type IntoIter = std::vec::IntoIter<(String, Vec<u8>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a Vec<u8>);
    type IntoIter = std::iter::Map<std::slice::Iter<'a, (String, Vec<u8>)>,
                                   fn(&'a (String, Vec<u8>)) -> (&'a String, &'a Vec<u8>)>;

    fn into_iter(self) -> Self::IntoIter {
        fn split(pair: &(String, Vec<u8>)) -> (&String, &Vec<u8>) {
            (&pair.0, &pair.1)
        }
        self.list.iter().map(split as fn(&'a (String, Vec<u8>)) -> (&'a String, &'a Vec<u8>))
    }
}

#[test]
fn headers_keep_repeats_in_order() {
    let mut headers = Headers::new();
    headers.append("set-cookie", Vec::from(&b"a=1"[..]));
    headers.append("Content-Type", Vec::from(&b"text/html"[..]));
    headers.append("SET-COOKIE", Vec::from(&b"b=2"[..]));

    let cookies: Vec<&Vec<u8>> = headers.get_all("Set-Cookie").collect();
    assert_eq!(cookies, vec![&b"a=1".to_vec(), &b"b=2".to_vec()]);

    headers.set("set-cookie", Vec::from(&b"c=3"[..]));
    assert_eq!(headers.len(), 2);
    assert_eq!(headers.get("Set-Cookie"), Some(&b"c=3".to_vec()));
}

impl Default for Response {
    fn default() -> Response {
        Response::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Response {
            status: ResponseStatus {
                code: 200,
                reason: String::from("OK")
            },
            headers: Headers::new(),
            body: Vec::new(),
            omit_body: false
        }
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn set_status(&mut self, code: u16, reason: String) {
        self.status = ResponseStatus {
            code,
            reason
        };
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status.code
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.status.reason
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Keep the headers (length included) but send no body, as for `HEAD`
    pub fn omit_body(&mut self) {
        self.omit_body = true;
    }

    pub fn write_to<W: Write>(mut self, mut writer: W) -> io::Result<()> {
        self.headers.set("Content-Length",
                         self.body.len().to_string().into_bytes());
        self.headers.set("Connection", Vec::from(&b"close"[..]));

        // Status line
        write!(writer, "HTTP/1.1 {} {}\r\n",
               self.status.code, self.status.reason)?;

        for (header, content) in &self.headers {
            write!(writer, "{}: ", header)?;
            writer.write_all(content)?;
            writer.write_all(b"\r\n")?;
        }

        writer.write_all(b"\r\n")?;

        if !self.omit_body {
            writer.write_all(&self.body)?;
        }

        Ok(())
    }
}

#[test]
fn response_writes_length_and_repeated_headers() {
    let mut res = Response::new();
    res.set_status(201, String::from("Created"));
    res.headers_mut().append("Set-Cookie", Vec::from(&b"a=1"[..]));
    res.headers_mut().append("Set-Cookie", Vec::from(&b"b=2"[..]));
    res.headers_mut().append("Content-Length", Vec::from(&b"999"[..]));
    res.set_body(Vec::from(&b"made"[..]));

    let mut out = Vec::new();
    res.write_to(&mut out).unwrap();

    assert_eq!(out, b"HTTP/1.1 201 Created\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\nContent-Length: 4\r\nConnection: close\r\n\r\nmade".to_vec());
}

#[test]
fn head_responses_have_no_body() {
    let mut res = Response::new();
    res.set_body(Vec::from(&b"hidden"[..]));
    res.omit_body();

    let mut out = Vec::new();
    res.write_to(&mut out).unwrap();

    assert!(out.ends_with(b"Content-Length: 6\r\nConnection: close\r\n\r\n"));
}

pub mod error_messages {
    use super::Response;
    use crate::cgi::default_reason;

    fn page(code: u16, message: &str) -> Response {
        let reason = default_reason(code);
        let body = format!(
            "<!doctype html><html><head><title>Error</title></head><body><h1>{}</h1><p>{}</p></body></html>",
            reason, message);

        let mut res = Response::new();
        res.set_status(code, String::from(reason));
        res.headers_mut().set("Content-Type", Vec::from(&b"text/html"[..]));
        res.set_body(body.into_bytes());
        res
    }

    pub fn error_400() -> Response {
        page(400, "Your request had some kind of bad syntax. Are you using netcat?")
    }

    pub fn error_403() -> Response {
        page(403, "You don't have permission to run that. Sorry.")
    }

    pub fn error_404() -> Response {
        page(404, "I couldn't find that script. Sorry.")
    }

    pub fn error_405(allowed: &[&str]) -> Response {
        let mut res = page(405, "That script doesn't take this kind of request.");
        res.headers_mut().set("Allow", allowed.join(", ").into_bytes());
        res
    }

    pub fn error_411() -> Response {
        page(411, "Request bodies need a Content-Length here.")
    }

    pub fn error_413() -> Response {
        page(413, "That request body is too large.")
    }

    pub fn error_500() -> Response {
        page(500, "Something went wrong on my side. There's nothing you can do; maybe come back later.")
    }

    pub fn error_502() -> Response {
        page(502, "The script answered with something I couldn't understand.")
    }

    pub fn error_504() -> Response {
        page(504, "The script took too long to answer.")
    }

    /// The page for an error status, falling back to 500
    pub fn for_status(code: u16) -> Response {
        match code {
            400 => error_400(),
            403 => error_403(),
            404 => error_404(),
            411 => error_411(),
            413 => error_413(),
            502 => error_502(),
            504 => error_504(),
            _ => error_500()
        }
    }

    #[test]
    fn pages_carry_their_status() {
        for &code in &[400, 403, 404, 411, 413, 500, 502, 504] {
            let res = for_status(code);
            assert_eq!(res.status_code(), code);
            assert!(!res.body().is_empty());
        }
        assert_eq!(for_status(418).status_code(), 500);
        assert_eq!(error_405(&["GET", "POST"]).headers().get("Allow"),
                   Some(&b"GET, POST".to_vec()));
    }
}
