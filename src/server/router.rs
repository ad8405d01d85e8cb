//! A dead-simple router implementation
//!
//! A `Router` simply matches a request path against installed routes, in the
//! order they have been added, dispatching to the first handler that matches.

use crate::server::{Handler, Request, Response};
use crate::server::error_messages::*;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>
}

struct Route {
    path: PathBuf,
    handlers: MethodDispatch
}

enum MethodDispatch {
    Any(Box<dyn Handler>),
    Specific(HashMap<String, Box<dyn Handler>>)
}

impl Router {
    /// Initialize a new, empty router
    pub fn new() -> Router {
        Router { routes: Vec::new() }
    }

    /// Create a route that will invoke the given `handler` for all methods
    pub fn route_any<P, H>(&mut self, path: P, handler: H)
        where P: Into<PathBuf>, H: Handler + 'static
    {
        self.routes.push(Route {
            path: path.into(),
            handlers: MethodDispatch::Any(Box::new(handler))
        });
    }

    /// Create a route that will invoke the given `handler`, but only for the
    /// particular `method`.
    ///
    /// A prefix already routed for every method keeps that route, and this
    /// one is ignored with a warning.
    pub fn route<P, H>(&mut self, path: P, method: String, handler: H)
        where P: Into<PathBuf>, H: Handler + 'static
    {
        let path = path.into();

        for route in self.routes.iter_mut() {
            if route.path == path {
                match route.handlers {
                    MethodDispatch::Specific(ref mut map) => {
                        map.insert(method, Box::new(handler));
                    },
                    MethodDispatch::Any(_) => {
                        warn!("{} is already routed for every method; ignoring {} route",
                              path.display(), method);
                    }
                }
                return;
            }
        }

        let mut handlers: HashMap<_, Box<dyn Handler>> = HashMap::new();
        handlers.insert(method, Box::new(handler));

        self.routes.push(Route {
            path,
            handlers: MethodDispatch::Specific(handlers)
        });
    }
}

impl Handler for Router {
    fn serve(&self, req: Request) -> Response {
        let request_path = Path::new(req.path()).to_owned();

        for route in &self.routes {
            if request_path.starts_with(&route.path) {
                return route.handlers.serve(req);
            }
        }

        without_body_for_head(&req, error_404())
    }
}

impl Handler for MethodDispatch {
    fn serve(&self, req: Request) -> Response {
        match *self {
            MethodDispatch::Any(ref handler) => handler.serve(req),
            MethodDispatch::Specific(ref map) => {
                if let Some(handler) = map.get(req.method()) {
                    handler.serve(req)
                }
                else {
                    let mut allowed: Vec<&str> = map.keys().map(String::as_str).collect();
                    allowed.sort_unstable();
                    without_body_for_head(&req, error_405(&allowed))
                }
            }
        }
    }
}

fn without_body_for_head(req: &Request, mut res: Response) -> Response {
    if req.method() == "HEAD" {
        res.omit_body();
    }
    res
}
