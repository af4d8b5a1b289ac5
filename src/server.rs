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

use crate::buffer::ReadBuffer;
use crate::channel;
use crate::executor::{Executor, Spawner};
use crate::future::{join_2, select_2, Select2, Timeout};
use crate::http1::{
    header_value_has_token, ParseStatus, Reply, Request, RequestParser, Version,
};
use crate::io::{io_split, recv_into, AsyncWriteExt, ReadHalf, WriteHalf};
use crate::net::{self, AsyncTcpListener, AsyncTcpStream};
use crate::query::split_query;
use crate::queue::{ReplyQueue, REPLIES_MAX};
use crate::reactor::Reactor;
use crate::routes::Routes;
use crate::websocket::{self, WsSocket};
use log::{debug, error, info, warn};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

const BUFFER_SIZE: usize = 8192;
const BODY_SIZE_MAX: usize = 100_000;
const DATE_REFRESH: Duration = Duration::from_secs(1);

fn http_date() -> String {
    let format =
        format_description!("[day] [month repr:short] [year] [hour]:[minute]:[second] GMT");

    OffsetDateTime::now_utc()
        .format(&format)
        .expect("failed to format date")
}

fn inc(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

fn dec(cell: &Cell<u64>) {
    cell.set(cell.get() - 1);
}

// shard-local counters. the shard is single-threaded, so plain cells do
#[derive(Default)]
pub struct Metrics {
    total_connections: Cell<u64>,
    current_connections: Cell<u64>,
    requests_served: Cell<u64>,
    read_errors: Cell<u64>,
    respond_errors: Cell<u64>,
    connections_being_accepted: Cell<u64>,
}

impl Metrics {
    pub fn total_connections(&self) -> u64 {
        self.total_connections.get()
    }

    pub fn current_connections(&self) -> u64 {
        self.current_connections.get()
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.get()
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.get()
    }

    pub fn respond_errors(&self) -> u64 {
        self.respond_errors.get()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ConnectionDone {
    KeepOpen,
    Close,
    Detach,
}

struct ServerInner {
    name: String,
    routes: RefCell<Routes>,
    date: RefCell<String>,
    metrics: Metrics,
    conns: RefCell<Slab<Weak<RefCell<AsyncTcpStream>>>>,
    conns_max: usize,
    stopping: Cell<bool>,
    idle_s: channel::LocalSender<()>,
    idle_r: RefCell<Option<channel::LocalReceiver<()>>>,
    accept_stops: RefCell<Vec<channel::LocalSender<()>>>,
    date_stop: RefCell<Option<channel::LocalSender<()>>>,
    spawner: Spawner,
}

impl ServerInner {
    // resolves the shutdown latch once nothing is accepting and no
    // connection remains
    fn maybe_idle(&self) {
        if self.stopping.get()
            && self.metrics.connections_being_accepted.get() == 0
            && self.conns.borrow().is_empty()
        {
            let _ = self.idle_s.try_send(());
        }
    }
}

// one shard's server: listeners, live connections, counters, and the
// cached Date header value
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    pub fn new(name: &str, conns_max: usize) -> Self {
        let executor = Executor::current().unwrap();

        let (idle_s, idle_r) = channel::local_channel(1);
        let (date_stop_s, date_stop_r) = channel::local_channel(1);

        let inner = Rc::new(ServerInner {
            name: name.to_string(),
            routes: RefCell::new(Routes::new()),
            date: RefCell::new(http_date()),
            metrics: Metrics::default(),
            conns: RefCell::new(Slab::with_capacity(conns_max)),
            conns_max,
            stopping: Cell::new(false),
            idle_s,
            idle_r: RefCell::new(Some(idle_r)),
            accept_stops: RefCell::new(Vec::new()),
            date_stop: RefCell::new(Some(date_stop_s)),
            spawner: executor.spawner(),
        });

        executor
            .spawn(date_task(inner.clone(), date_stop_r))
            .unwrap();

        Self { inner }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn with_routes<F>(&self, f: F)
    where
        F: FnOnce(&mut Routes),
    {
        f(&mut self.inner.routes.borrow_mut());
    }

    // bind and start accepting. returns the resolved local address
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, io::Error> {
        let listener = AsyncTcpListener::new(net::listen_socket(addr)?);

        let local_addr = listener.local_addr()?;

        let (stop_s, stop_r) = channel::local_channel(1);

        self.inner.accept_stops.borrow_mut().push(stop_s);

        self.inner
            .spawner
            .spawn(accept_task(self.inner.clone(), listener, stop_r))
            .map_err(|_| io::Error::from(io::ErrorKind::WriteZero))?;

        info!("server {}: listening on {}", self.inner.name, local_addr);

        Ok(local_addr)
    }

    // stop accepting, shut down every live connection, and wait for the
    // connection set to drain
    pub async fn stop(&self) {
        let inner = &self.inner;

        inner.stopping.set(true);

        // aborts the accept selects
        inner.accept_stops.borrow_mut().clear();

        // stops the date timer
        inner.date_stop.borrow_mut().take();

        for (_, conn) in inner.conns.borrow().iter() {
            if let Some(sock) = conn.upgrade() {
                // both directions, regardless of protocol phase
                let _ = sock.borrow().shutdown(Shutdown::Both);
            }
        }

        inner.maybe_idle();

        let idle_r = inner.idle_r.borrow_mut().take().unwrap();
        let _ = idle_r.recv().await;

        info!(
            "server {}: stopped (total_connections={} requests_served={} read_errors={} respond_errors={})",
            inner.name,
            inner.metrics.total_connections.get(),
            inner.metrics.requests_served.get(),
            inner.metrics.read_errors.get(),
            inner.metrics.respond_errors.get(),
        );
    }
}

async fn date_task(inner: Rc<ServerInner>, stop: channel::LocalReceiver<()>) {
    let timeout = Timeout::new(Reactor::current().unwrap().now() + DATE_REFRESH);

    loop {
        match select_2(stop.recv(), timeout.elapsed()).await {
            Select2::R1(_) => break,
            Select2::R2(()) => {
                inner.date.replace(http_date());

                timeout.set_deadline(Reactor::current().unwrap().now() + DATE_REFRESH);
            }
        }
    }
}

async fn accept_task(
    inner: Rc<ServerInner>,
    listener: AsyncTcpListener,
    stop: channel::LocalReceiver<()>,
) {
    loop {
        inc(&inner.metrics.connections_being_accepted);

        let result = select_2(stop.recv(), listener.accept()).await;

        dec(&inner.metrics.connections_being_accepted);

        match result {
            Select2::R1(_) => {
                // aborted
                inner.maybe_idle();

                break;
            }
            Select2::R2(Ok((stream, peer_addr))) => {
                if inner.stopping.get() {
                    inner.maybe_idle();

                    break;
                }

                if inner.conns.borrow().len() >= inner.conns_max {
                    warn!(
                        "server {}: connection limit reached; dropping connection from {}",
                        inner.name, peer_addr
                    );

                    continue;
                }

                let mut stream = stream;
                net::set_socket_opts(&mut stream);

                let stream = AsyncTcpStream::new(stream);

                debug!(
                    "server {}: accepted connection from {}",
                    inner.name, peer_addr
                );

                if inner
                    .spawner
                    .spawn(connection_task(inner.clone(), stream, peer_addr))
                    .is_err()
                {
                    error!(
                        "server {}: task limit reached; dropping connection from {}",
                        inner.name, peer_addr
                    );
                }
            }
            Select2::R2(Err(e)) => {
                // ends this listener's accept loop only
                error!("server {}: accept error: {:?}", inner.name, e);

                break;
            }
        }
    }
}

async fn connection_task(inner: Rc<ServerInner>, stream: AsyncTcpStream, peer_addr: SocketAddr) {
    let sock = Rc::new(RefCell::new(stream));

    inc(&inner.metrics.total_connections);
    inc(&inner.metrics.current_connections);

    let ckey = inner.conns.borrow_mut().insert(Rc::downgrade(&sock));

    {
        let conn = Connection::new(inner.clone(), peer_addr);

        conn.process(&sock).await;
    }

    inner.conns.borrow_mut().remove(ckey);
    dec(&inner.metrics.current_connections);

    debug!("server {}: connection from {} closed", inner.name, peer_addr);

    inner.maybe_idle();
}

// one live client session, processed by a reader fiber and a writer fiber
// joined by a barrier. the reader parses requests and produces replies via
// the routes table; the writer serializes them in request order
struct Connection {
    server: Rc<ServerInner>,
    peer_addr: SocketAddr,
    parser: RefCell<RequestParser>,
    replies: ReplyQueue,
    done: Cell<ConnectionDone>,
    upgrade_req: RefCell<Option<Request>>,
}

impl Connection {
    fn new(server: Rc<ServerInner>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            parser: RefCell::new(RequestParser::new(BODY_SIZE_MAX)),
            replies: ReplyQueue::new(REPLIES_MAX),
            done: Cell::new(ConnectionDone::KeepOpen),
            upgrade_req: RefCell::new(None),
        }
    }

    async fn process(&self, sock: &Rc<RefCell<AsyncTcpStream>>) {
        let (r, w) = io_split(sock);

        let rbuf = ReadBuffer::new(BUFFER_SIZE);

        let (rbuf, ()) = join_2(self.read_loop(r, rbuf), self.respond_loop(w)).await;

        if self.done.get() == ConnectionDone::Detach {
            // the writer has flushed the 101 reply. move the socket into
            // its websocket form, carrying over any bytes the reader had
            // already buffered past the handshake, and hand control to the
            // websocket handler
            let req = self.upgrade_req.borrow_mut().take().unwrap();

            let path = {
                let (path, _) = split_query(&req.uri);

                path.to_string()
            };

            let ws = WsSocket::new(sock.clone(), rbuf);

            let fut = self.server.routes.borrow().handle_ws(&path, ws, req);

            if let Some(fut) = fut {
                // errors within the handler stay with the handler
                fut.await;
            }
        }
    }

    async fn read_loop(
        &self,
        mut r: ReadHalf<'_, AsyncTcpStream>,
        mut rbuf: ReadBuffer,
    ) -> ReadBuffer {
        'requests: loop {
            self.parser.borrow_mut().reset();

            // feed the parser until a request is complete
            let req = loop {
                let status = self.parser.borrow_mut().parse(&mut rbuf);

                match status {
                    Ok(ParseStatus::Complete(req)) => break req,
                    Ok(ParseStatus::Incomplete) => match recv_into(&mut r, &mut rbuf).await {
                        Ok(0) => {
                            // eof before a complete request
                            self.done.set(ConnectionDone::Close);

                            break 'requests;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(
                                "server {}: read error from {}: {}",
                                self.server.name, self.peer_addr, e
                            );

                            inc(&self.server.metrics.read_errors);
                            self.done.set(ConnectionDone::Close);

                            break 'requests;
                        }
                    },
                    Err(e) => {
                        debug!(
                            "server {}: parse error from {}: {}",
                            self.server.name, self.peer_addr, e
                        );

                        self.done.set(ConnectionDone::Close);

                        break 'requests;
                    }
                }
            };

            inc(&self.server.metrics.requests_served);

            self.replies.not_full().await;

            let done = self.generate_reply(req);
            self.done.set(done);

            if done != ConnectionDone::KeepOpen {
                break;
            }
        }

        if self.done.get() != ConnectionDone::Detach {
            // deterministic writer termination
            self.replies.push_eventually(None).await;
        }

        rbuf
    }

    async fn respond_loop(&self, mut w: WriteHalf<'_, AsyncTcpStream>) {
        let mut wbuf = Vec::new();

        loop {
            let mut resp = match self.replies.pop_eventually().await {
                Some(resp) => resp,
                None => break,
            };

            resp.set_header("Server", &self.server.name);
            resp.set_header("Date", self.server.date.borrow().as_str());

            let content_length = resp.body().len().to_string();
            resp.set_header("Content-Length", &content_length);

            wbuf.clear();
            resp.serialize(&mut wbuf);

            if let Err(e) = w.write(&wbuf).await {
                debug!(
                    "server {}: write error to {}: {}",
                    self.server.name, self.peer_addr, e
                );

                inc(&self.server.metrics.respond_errors);

                if self.done.get() != ConnectionDone::Detach {
                    // keep draining so the reader can reach its sentinel
                    while self.replies.pop_eventually().await.is_some() {}
                }

                break;
            }

            if self.done.get() != ConnectionDone::KeepOpen {
                break;
            }
        }
    }

    fn generate_reply(&self, mut req: Request) -> ConnectionDone {
        let mut resp = Reply::new();

        let mut conn_keep_alive = false;
        let mut conn_close = false;

        if let Some(value) = req.header("Connection") {
            if header_value_has_token(value, "keep-alive") {
                conn_keep_alive = true;
            }

            if header_value_has_token(value, "close") {
                conn_close = true;
            }

            if header_value_has_token(value, "upgrade") {
                if let Some(upgrade) = req.header("Upgrade") {
                    if upgrade.eq_ignore_ascii_case("websocket") {
                        return self.upgrade_websocket(req);
                    }
                }
            }
        }

        let version = req.version;
        resp.set_version(version);

        let should_close = match version {
            Version::Http10 => {
                if conn_keep_alive {
                    resp.set_header("Connection", "Keep-Alive");
                }

                !conn_keep_alive
            }
            Version::Http11 => conn_close,
        };

        let path = {
            let (path, params) = split_query(&req.uri);
            let path = path.to_string();

            req.query_params = params;

            path
        };

        let mut resp = self.server.routes.borrow().handle(&path, &req, resp);

        // handlers don't get to change the protocol version
        resp.set_version(version);

        self.replies.push(Some(resp));

        if should_close {
            ConnectionDone::Close
        } else {
            ConnectionDone::KeepOpen
        }
    }

    fn upgrade_websocket(&self, mut req: Request) -> ConnectionDone {
        let path = {
            let (path, params) = split_query(&req.uri);
            let path = path.to_string();

            // decoded for the handler's benefit; dispatch is by path
            req.query_params = params;

            path
        };

        let mut resp = Reply::new();
        resp.set_version(req.version);

        let accept = req
            .header("Sec-WebSocket-Key")
            .and_then(|key| websocket::accept_key(key.as_bytes()).ok());

        let has_handler = self.server.routes.borrow().get_ws_handler(&path).is_some();

        let done = match accept {
            Some(accept) if has_handler => {
                resp.set_status(101);
                resp.set_header("Upgrade", "websocket");
                resp.set_header("Connection", "Upgrade");
                resp.set_header("Sec-WebSocket-Accept", accept.as_str());

                // held for the handoff
                self.upgrade_req.replace(Some(req));

                ConnectionDone::Detach
            }
            _ => {
                // refusal closes through the normal shutdown path
                resp.set_status(400);

                ConnectionDone::Close
            }
        };

        self.done.set(done);
        self.replies.push(Some(resp));

        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::future::AsyncReceiver;
    use crate::reactor::Reactor;
    use std::io::{Read, Write};
    use std::str;
    use std::sync::mpsc;
    use std::thread;

    fn read_reply(stream: &mut std::net::TcpStream) -> (String, Vec<u8>) {
        let mut data = Vec::new();

        let header_end;

        loop {
            let mut buf = [0; 1024];

            let size = stream.read(&mut buf).unwrap();
            assert!(size > 0, "eof before headers");

            data.extend(&buf[..size]);

            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                header_end = pos + 4;
                break;
            }
        }

        let head = str::from_utf8(&data[..header_end]).unwrap().to_string();

        let content_length: usize = head
            .lines()
            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse().unwrap()))
            .unwrap_or(0);

        let mut body = data[header_end..].to_vec();

        while body.len() < content_length {
            let mut buf = [0; 1024];

            let size = stream.read(&mut buf).unwrap();
            assert!(size > 0, "eof before body end");

            body.extend(&buf[..size]);
        }

        assert_eq!(body.len(), content_length);

        (head, body)
    }

    #[test]
    fn serve_pipelined_and_stop() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(32);

        let (addr_s, addr_r) = mpsc::channel();
        let (stop_s, stop_r) = channel::channel(1);

        executor
            .spawn(async move {
                let server = Server::new("testserver", 16);

                server.with_routes(|routes| {
                    routes.add("GET", "/echo", |req: &Request, mut resp: Reply| {
                        let n = req.query_params.get("n").cloned().unwrap_or_default();
                        resp.set_content(format!("n={}", n), "text/plain");

                        resp
                    });
                });

                let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

                addr_s.send(addr).unwrap();

                let stop = AsyncReceiver::new(stop_r);
                let _ = stop.recv().await;

                server.stop().await;

                let m = server.metrics();
                assert_eq!(m.requests_served(), 3);
                assert_eq!(m.total_connections(), 1);
                assert_eq!(m.current_connections(), 0);
            })
            .unwrap();

        let client = thread::spawn(move || {
            let addr = addr_r.recv().unwrap();

            let mut stream = std::net::TcpStream::connect(addr).unwrap();

            // three pipelined requests arrive at once; replies must come
            // back in request order
            stream
                .write_all(
                    b"GET /echo?n=1 HTTP/1.1\r\nHost: x\r\n\r\n\
                      GET /echo?n=2 HTTP/1.1\r\nHost: x\r\n\r\n\
                      GET /echo?n=3 HTTP/1.1\r\nHost: x\r\n\r\n",
                )
                .unwrap();

            for expected in ["n=1", "n=2", "n=3"] {
                let (head, body) = read_reply(&mut stream);

                assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
                assert!(head.contains("Server: testserver\r\n"));
                assert!(head.contains("Date: "));
                assert_eq!(body, expected.as_bytes());
            }

            drop(stream);

            stop_s.send(()).unwrap();
        });

        executor.run(|timeout| reactor.poll(timeout)).unwrap();

        client.join().unwrap();
    }

    #[test]
    fn http10_closes_without_keep_alive() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(32);

        let (addr_s, addr_r) = mpsc::channel();
        let (stop_s, stop_r) = channel::channel(1);

        executor
            .spawn(async move {
                let server = Server::new("testserver", 16);

                server.with_routes(|routes| {
                    routes.add("GET", "/", |_req: &Request, mut resp: Reply| {
                        resp.set_content("hello", "text/html");

                        resp
                    });
                });

                let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

                addr_s.send(addr).unwrap();

                let stop = AsyncReceiver::new(stop_r);
                let _ = stop.recv().await;

                server.stop().await;
            })
            .unwrap();

        let client = thread::spawn(move || {
            let addr = addr_r.recv().unwrap();

            // plain 1.0: server closes after one reply
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();

            let (head, body) = read_reply(&mut stream);
            assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
            assert_eq!(body, b"hello");

            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).unwrap();
            assert!(rest.is_empty());

            // 1.0 with keep-alive: connection stays open for a second
            // request and the reply advertises it
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
                .unwrap();

            let (head, body) = read_reply(&mut stream);
            assert!(head.contains("Connection: Keep-Alive\r\n"));
            assert_eq!(body, b"hello");

            stream
                .write_all(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n")
                .unwrap();

            let (_, body) = read_reply(&mut stream);
            assert_eq!(body, b"hello");

            drop(stream);

            stop_s.send(()).unwrap();
        });

        executor.run(|timeout| reactor.poll(timeout)).unwrap();

        client.join().unwrap();
    }

    #[test]
    fn http11_connection_close() {
        let reactor = Reactor::new(128);
        let executor = Executor::new(32);

        let (addr_s, addr_r) = mpsc::channel();
        let (stop_s, stop_r) = channel::channel(1);

        executor
            .spawn(async move {
                let server = Server::new("testserver", 16);

                server.with_routes(|routes| {
                    routes.add("GET", "/", |_req: &Request, mut resp: Reply| {
                        resp.set_content("hello", "text/html");

                        resp
                    });
                });

                let addr = server.listen("127.0.0.1:0".parse().unwrap()).unwrap();

                addr_s.send(addr).unwrap();

                let stop = AsyncReceiver::new(stop_r);
                let _ = stop.recv().await;

                server.stop().await;
            })
            .unwrap();

        let client = thread::spawn(move || {
            let addr = addr_r.recv().unwrap();

            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
                .unwrap();

            let (head, _) = read_reply(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).unwrap();
            assert!(rest.is_empty());

            stop_s.send(()).unwrap();
        });

        executor.run(|timeout| reactor.poll(timeout)).unwrap();

        client.join().unwrap();
    }
}
