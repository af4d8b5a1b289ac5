/*
 * Copyright (C) 2025 Filament Contributors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::http1::{Reply, Request};
use crate::net::AsyncTcpStream;
use crate::websocket::WsSocket;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

pub trait Handler {
    fn handle(&self, req: &Request, resp: Reply) -> Reply;
}

impl<F> Handler for F
where
    F: Fn(&Request, Reply) -> Reply,
{
    fn handle(&self, req: &Request, resp: Reply) -> Reply {
        (self)(req, resp)
    }
}

pub trait WsHandler {
    fn handle(
        &self,
        req: Request,
        sock: WsSocket<AsyncTcpStream>,
    ) -> Pin<Box<dyn Future<Output = ()>>>;
}

// adapter turning an async closure into a WsHandler
pub struct WsFnHandler<F>(pub F);

impl<F, Fut> WsHandler for WsFnHandler<F>
where
    F: Fn(Request, WsSocket<AsyncTcpStream>) -> Fut,
    Fut: Future<Output = ()> + 'static,
{
    fn handle(
        &self,
        req: Request,
        sock: WsSocket<AsyncTcpStream>,
    ) -> Pin<Box<dyn Future<Output = ()>>> {
        Box::pin((self.0)(req, sock))
    }
}

// exact-match routing tables. misses produce the router's own error reply
#[derive(Default)]
pub struct Routes {
    handlers: HashMap<String, HashMap<String, Rc<dyn Handler>>>,
    ws_handlers: HashMap<String, Rc<dyn WsHandler>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H>(&mut self, method: &str, path: &str, handler: H)
    where
        H: Handler + 'static,
    {
        self.handlers
            .entry(method.to_string())
            .or_default()
            .insert(path.to_string(), Rc::new(handler));
    }

    pub fn add_ws<H>(&mut self, path: &str, handler: H)
    where
        H: WsHandler + 'static,
    {
        self.ws_handlers.insert(path.to_string(), Rc::new(handler));
    }

    pub fn handle(&self, path: &str, req: &Request, mut resp: Reply) -> Reply {
        let handler = self
            .handlers
            .get(req.method.as_str())
            .and_then(|by_path| by_path.get(path));

        match handler {
            Some(handler) => handler.handle(req, resp),
            None => {
                resp.set_status(404);
                resp.set_content("Not Found", "text/plain");

                resp
            }
        }
    }

    pub fn get_ws_handler(&self, path: &str) -> Option<Rc<dyn WsHandler>> {
        self.ws_handlers.get(path).cloned()
    }

    // returns the handler's session future, or None when no handler is
    // registered for the path
    pub fn handle_ws(
        &self,
        path: &str,
        sock: WsSocket<AsyncTcpStream>,
        req: Request,
    ) -> Option<Pin<Box<dyn Future<Output = ()>>>> {
        self.get_ws_handler(path)
            .map(|handler| handler.handle(req, sock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http1::Version;
    use std::collections::HashMap as Map;

    fn make_req(method: &str, uri: &str) -> Request {
        Request {
            method: method.to_string(),
            uri: uri.to_string(),
            version: Version::Http11,
            headers: Vec::new(),
            query_params: Map::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn lookup_hit() {
        let mut routes = Routes::new();

        routes.add("GET", "/", |_req: &Request, mut resp: Reply| {
            resp.set_content("hello", "text/html");

            resp
        });

        let req = make_req("GET", "/");
        let resp = routes.handle("/", &req, Reply::new());

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"hello");
        assert_eq!(resp.header("Content-Type"), Some("text/html"));
    }

    #[test]
    fn lookup_miss_is_404() {
        let routes = Routes::new();

        let req = make_req("GET", "/nope");
        let resp = routes.handle("/nope", &req, Reply::new());

        assert_eq!(resp.status(), 404);
    }

    #[test]
    fn method_matters() {
        let mut routes = Routes::new();

        routes.add("GET", "/x", |_req: &Request, resp: Reply| resp);

        let req = make_req("POST", "/x");
        let resp = routes.handle("/x", &req, Reply::new());

        assert_eq!(resp.status(), 404);
    }

    #[test]
    fn ws_lookup() {
        let mut routes = Routes::new();

        assert!(routes.get_ws_handler("/ws").is_none());

        routes.add_ws(
            "/ws",
            WsFnHandler(|_req: Request, _sock: WsSocket<AsyncTcpStream>| async move {}),
        );

        assert!(routes.get_ws_handler("/ws").is_some());
        assert!(routes.get_ws_handler("/other").is_none());
    }
}
