//! The CGI gateway as a request `Handler`
//!
//! Maps a request path onto a script under the configured root, runs it and
//! turns whatever it printed into a `Response`.

use crate::cgi::env::{build_environment, ScriptLocation};
use crate::cgi::invoker::{LocalInvoker, ProcessInvoker};
use crate::cgi::parser::ResponseParser;
use crate::cgi::ParsedResponse;
use crate::config::CgiConfig;
use crate::errors::{Result, Error};
use crate::log_util::{ascii_escape, ascii_escape_capped};
use crate::server::{error_messages, Handler, Request, Response};

use std::fs;
use std::io;
use std::path::PathBuf;

/// How much of a bad handler response ends up in the log
const LOGGED_OUTPUT_BYTES: usize = 512;

pub struct Gateway {
    config: CgiConfig,
    canonical_root: PathBuf,
    invoker: Box<dyn ProcessInvoker>,
    parser: ResponseParser
}

impl Gateway {
    /// A gateway running handlers as local processes
    pub fn new(config: &CgiConfig) -> Result<Gateway> {
        Gateway::with_invoker(config, Box::new(LocalInvoker::new(config)))
    }

    pub fn with_invoker(config: &CgiConfig, invoker: Box<dyn ProcessInvoker>)
                        -> Result<Gateway>
    {
        let canonical_root = config.root.canonicalize().map_err(|e| {
            Error::Configuration(format!("CGI root {}: {}", config.root.display(), e))
        })?;

        Ok(Gateway {
            config: config.clone(),
            canonical_root,
            invoker,
            parser: ResponseParser::new(config.header_scan_limit)
        })
    }

    /// Finds the script a decoded request path refers to.
    ///
    /// The first regular file along the path is the script and anything after
    /// it becomes `PATH_INFO`.
    pub fn resolve(&self, path: &str) -> Result<ScriptLocation> {
        let prefix = self.config.public_prefix.to_string_lossy();
        let prefix = prefix.trim_end_matches('/');

        let rest = path.strip_prefix(prefix).ok_or(Error::NotFound)?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return Err(Error::NotFound);
        }

        let segments: Vec<&str> = rest.split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if segments.iter().any(|s| *s == "..") {
            return Err(Error::PermissionDenied);
        }

        let mut candidate = self.canonical_root.clone();
        let mut script_name = String::from(prefix);

        for (i, segment) in segments.iter().enumerate() {
            candidate.push(segment);
            script_name.push('/');
            script_name.push_str(segment);

            let meta = match fs::metadata(&candidate) {
                Ok(meta) => meta,
                Err(ref e) if e.kind() == io::ErrorKind::PermissionDenied =>
                    return Err(Error::PermissionDenied),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound =>
                    return Err(Error::NotFound),
                Err(e) => return Err(Error::Io(e))
            };

            if meta.is_file() {
                let script_filename = candidate.canonicalize()?;
                if !script_filename.starts_with(&self.canonical_root) {
                    warn!("{} resolves outside the CGI root", candidate.display());
                    return Err(Error::PermissionDenied);
                }

                let remainder = &segments[i + 1 ..];
                let path_info = if remainder.is_empty() {
                    String::new()
                } else {
                    format!("/{}", remainder.join("/"))
                };

                return Ok(ScriptLocation {
                    script_name,
                    script_filename,
                    path_info,
                    document_root: self.canonical_root.clone()
                });
            }

            if !meta.is_dir() {
                return Err(Error::NotFound);
            }
        }

        Err(Error::NotFound)
    }

    fn serve_inner(&self, req: Request) -> Result<Response> {
        let location = self.resolve(req.path())?;
        let req = req.with_script(location);
        let env = build_environment(&req)?;

        let run = self.invoker.invoke(&env, req.body(), self.config.timeout)?;
        let script = env.get("SCRIPT_NAME").unwrap_or("");

        if !run.stderr.is_empty() {
            warn!("{} stderr: {}", script, ascii_escape(&run.stderr));
        }
        if !run.status.success() {
            info!("{} {} after {:?}", script, run.status, run.elapsed);
        }

        let parsed = match self.parser.parse(&run.stdout) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("{} sent a malformed response: \"{}\"", script,
                      ascii_escape_capped(&run.stdout, LOGGED_OUTPUT_BYTES));
                return Err(e);
            }
        };

        Ok(into_response(parsed, req.method() == "HEAD"))
    }
}

fn into_response(parsed: ParsedResponse, head: bool) -> Response {
    let mut res = Response::new();
    res.set_status(parsed.status.code,
                   String::from_utf8_lossy(&parsed.status.reason_phrase).into_owned());

    for header in parsed.headers {
        let name = String::from_utf8_lossy(&header.name);
        if is_hop_by_hop(&name) {
            debug!("Dropping hop-by-hop header {} from handler", name);
            continue;
        }
        res.headers_mut().append(&name, header.content);
    }

    res.set_body(parsed.body);
    if head {
        res.omit_body();
    }
    res
}

fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
    )
}

impl Handler for Gateway {
    fn serve(&self, req: Request) -> Response {
        let head = req.method() == "HEAD";
        let target = String::from(req.raw_target());

        match self.serve_inner(req) {
            Ok(res) => res,
            Err(e) => {
                let code = e.status_code();
                if code >= 500 {
                    warn!("Error serving {}: {}", target, e);
                } else {
                    info!("Error serving {}: {}", target, e);
                }

                let mut res = error_messages::for_status(code);
                if head {
                    res.omit_body();
                }
                res
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cgi::env::CgiEnvironment;
    use crate::cgi::invoker::HandlerInvocation;
    use crate::server::Headers;

    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::process::ExitStatus;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const FRIENDS: &str = "\
n=$(printf '%s' \"$HTTP_COOKIE\" | sed -n 's/.*friends=\\([0-9][0-9]*\\).*/\\1/p')
if [ -z \"$n\" ]; then
  n=1
elif [ \"$QUERY_STRING\" = \"action=add\" ]; then
  n=$((n+1))
fi
printf 'Content-Type: text/html\\r\\n'
printf 'Set-Cookie: friends=%s; Max-Age=20\\r\\n' \"$n\"
printf '\\r\\n'
printf '<p>%s friends</p>' \"$n\"
";

    fn cgi_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        fs::write(bin.join("friends.sh"), FRIENDS).unwrap();
        fs::write(bin.join("info.sh"),
                  "printf 'Content-Type: text/plain\\n\\n%s|%s' \"$SCRIPT_NAME\" \"$PATH_INFO\"\n")
            .unwrap();
        fs::write(bin.join("slow.sh"), "sleep 30\n").unwrap();
        fs::write(bin.join("garbage.sh"), "echo this is not a response\n").unwrap();
        fs::write(dir.path().join("secret.sh"), "echo secret\n").unwrap();
        dir
    }

    fn config(root: &Path) -> CgiConfig {
        let mut config = CgiConfig::default();
        config.root = root.join("bin");
        config.timeout = Duration::from_secs(10);
        config.interpreters.insert(String::from("sh"), PathBuf::from("sh"));
        config
    }

    fn request(method: &str, target: &str, cookie: Option<&str>) -> Request {
        let mut headers = Headers::new();
        headers.insert("Host", Vec::from(&b"localhost:8000"[..]));
        if let Some(cookie) = cookie {
            headers.insert("Cookie", Vec::from(cookie.as_bytes()));
        }
        Request::new(method, target, headers, Vec::new(),
                     "127.0.0.1:50000".parse().unwrap(), 8000).unwrap()
    }

    fn set_cookie(res: &Response) -> String {
        String::from_utf8(res.headers().get("Set-Cookie").unwrap().clone()).unwrap()
    }

    #[test]
    fn friend_counter_round_trip() {
        let root = cgi_root();
        let gateway = Gateway::new(&config(root.path())).unwrap();

        let res = gateway.serve(request("GET", "/cgi-bin/friends.sh?action=add", None));
        assert_eq!(res.status_code(), 200);
        assert_eq!(set_cookie(&res), "friends=1; Max-Age=20");
        assert_eq!(res.body(), b"<p>1 friends</p>");

        let res = gateway.serve(request("GET", "/cgi-bin/friends.sh?action=add",
                                        Some("friends=3")));
        assert_eq!(set_cookie(&res), "friends=4; Max-Age=20");

        let res = gateway.serve(request("GET", "/cgi-bin/friends.sh",
                                        Some("friends=3")));
        assert_eq!(set_cookie(&res), "friends=3; Max-Age=20");
        assert_eq!(res.headers().get("Content-Type"), Some(&b"text/html".to_vec()));
    }

    #[test]
    fn resolves_path_info() {
        let root = cgi_root();
        let gateway = Gateway::new(&config(root.path())).unwrap();

        let location = gateway.resolve("/cgi-bin/info.sh/a/b").unwrap();
        assert_eq!(location.script_name, "/cgi-bin/info.sh");
        assert_eq!(location.path_info, "/a/b");
        assert!(location.script_filename.ends_with("info.sh"));

        let res = gateway.serve(request("GET", "/cgi-bin/info.sh/a/b", None));
        assert_eq!(res.body(), b"/cgi-bin/info.sh|/a/b");
    }

    #[test]
    fn missing_and_unrouted_scripts_are_404() {
        let root = cgi_root();
        let gateway = Gateway::new(&config(root.path())).unwrap();

        assert_eq!(gateway.serve(request("GET", "/cgi-bin/nope.sh", None)).status_code(), 404);
        assert_eq!(gateway.serve(request("GET", "/cgi-bin", None)).status_code(), 404);
        assert_eq!(gateway.serve(request("GET", "/cgi-binfriends.sh", None)).status_code(), 404);
        assert_eq!(gateway.serve(request("GET", "/elsewhere", None)).status_code(), 404);
    }

    #[test]
    fn escaping_the_root_is_403() {
        let root = cgi_root();
        std::os::unix::fs::symlink(root.path().join("secret.sh"),
                                   root.path().join("bin").join("link.sh")).unwrap();
        let gateway = Gateway::new(&config(root.path())).unwrap();

        assert_eq!(gateway.serve(request("GET", "/cgi-bin/../secret.sh", None)).status_code(), 403);
        assert_eq!(gateway.serve(request("GET", "/cgi-bin/link.sh", None)).status_code(), 403);
    }

    #[test]
    fn slow_handler_is_504() {
        let root = cgi_root();
        let mut config = config(root.path());
        config.timeout = Duration::from_millis(200);
        let gateway = Gateway::new(&config).unwrap();

        assert_eq!(gateway.serve(request("GET", "/cgi-bin/slow.sh", None)).status_code(), 504);
    }

    #[test]
    fn malformed_output_is_502() {
        let root = cgi_root();
        let gateway = Gateway::new(&config(root.path())).unwrap();

        assert_eq!(gateway.serve(request("GET", "/cgi-bin/garbage.sh", None)).status_code(), 502);
    }

    #[test]
    fn head_keeps_headers_but_drops_the_body() {
        let root = cgi_root();
        let gateway = Gateway::new(&config(root.path())).unwrap();

        let res = gateway.serve(request("HEAD", "/cgi-bin/friends.sh", None));
        let mut out = Vec::new();
        res.write_to(&mut out).unwrap();

        assert!(out.ends_with(b"Content-Length: 16\r\nConnection: close\r\n\r\n"));
    }

    #[test]
    fn bad_root_is_a_configuration_error() {
        let mut config = CgiConfig::default();
        config.root = PathBuf::from("/nonexistent/cgi/root");
        match Gateway::new(&config) {
            Err(Error::Configuration(_)) => (),
            Err(e) => panic!("{:?}", e),
            Ok(_) => panic!("gateway built without a root")
        }
    }

    struct Canned {
        stdout: Vec<u8>,
        seen: Arc<Mutex<Option<CgiEnvironment>>>
    }

    impl ProcessInvoker for Canned {
        fn invoke(&self, env: &CgiEnvironment, _body: &[u8], _timeout: Duration)
                  -> Result<HandlerInvocation>
        {
            *self.seen.lock().unwrap() = Some(env.clone());
            Ok(HandlerInvocation {
                stdout: self.stdout.clone(),
                stderr: Vec::new(),
                status: ExitStatus::from_raw(0),
                elapsed: Duration::from_millis(1)
            })
        }
    }

    #[test]
    fn handler_headers_pass_through_in_order() {
        let root = cgi_root();
        let seen = Arc::new(Mutex::new(None));
        let invoker = Canned {
            stdout: Vec::from(&b"Status: 201 Created\nSet-Cookie: a=1\nConnection: keep-alive\nSet-Cookie: b=2\nContent-Length: 2\n\nokextra"[..]),
            seen: Arc::clone(&seen)
        };
        let gateway = Gateway::with_invoker(&config(root.path()), Box::new(invoker)).unwrap();

        let res = gateway.serve(request("GET", "/cgi-bin/info.sh?x=1", None));

        assert_eq!(res.status_code(), 201);
        assert_eq!(res.reason(), "Created");
        assert_eq!(res.body(), b"ok");
        assert!(res.headers().get("Connection").is_none());
        let cookies: Vec<&Vec<u8>> = res.headers().get_all("Set-Cookie").collect();
        assert_eq!(cookies, vec![&b"a=1".to_vec(), &b"b=2".to_vec()]);

        let env = seen.lock().unwrap().take().unwrap();
        assert_eq!(env.get("QUERY_STRING"), Some("x=1"));
        assert_eq!(env.get("SCRIPT_NAME"), Some("/cgi-bin/info.sh"));
    }
}
