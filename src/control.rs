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

use crate::channel;
use crate::executor::Executor;
use crate::future::AsyncReceiver;
use crate::reactor::Reactor;
use crate::routes::Routes;
use crate::server::Server;
use log::debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

// control task, date task, accept tasks
const SHARD_NON_CONNECTION_TASKS_MAX: usize = 8;

const REGISTRATIONS_PER_TASK_MAX: usize = 4;

type RoutesFn = Arc<dyn Fn(&mut Routes) + Send + Sync>;

enum Command {
    SetRoutes(RoutesFn, channel::Sender<()>),
    Listen(SocketAddr, channel::Sender<Result<SocketAddr, io::Error>>),
    Stop(channel::Sender<()>),
}

struct Shard {
    thread: Option<thread::JoinHandle<()>>,
    control: channel::Sender<Command>,
}

// fan-out facade over one server per shard thread. configuration calls are
// broadcast to every shard and awaited before returning, so routes are in
// place on all shards before the first accept can resolve
pub struct ServerControl {
    shards: Vec<Shard>,
    stopped: bool,
}

impl ServerControl {
    pub fn start(name: &str, shard_count: usize, conns_max: usize) -> Self {
        assert!(shard_count > 0);

        let mut shards = Vec::with_capacity(shard_count);

        for id in 0..shard_count {
            let (control_s, control_r) = channel::channel(1);
            let (ready_s, ready_r) = channel::channel(1);

            let name = name.to_string();

            let thread = thread::Builder::new()
                .name(format!("shard-{}", id))
                .spawn(move || {
                    run_shard(&name, id, conns_max, ready_s, control_r);
                })
                .unwrap();

            ready_r.recv().unwrap();

            shards.push(Shard {
                thread: Some(thread),
                control: control_s,
            });
        }

        Self {
            shards,
            stopped: false,
        }
    }

    // apply a routes configuration function on every shard. routes tables
    // are replicated, not shared
    pub fn set_routes<F>(&self, f: F)
    where
        F: Fn(&mut Routes) + Send + Sync + 'static,
    {
        let f: RoutesFn = Arc::new(f);

        let mut acks = Vec::new();

        for shard in &self.shards {
            let (ack_s, ack_r) = channel::channel(1);

            shard
                .control
                .send(Command::SetRoutes(f.clone(), ack_s))
                .unwrap();

            acks.push(ack_r);
        }

        for ack in acks {
            ack.recv().unwrap();
        }
    }

    // every shard listens on the same address. the first shard resolves the
    // port (meaningful when binding port 0) and the rest bind the resolved
    // address, sharing it via SO_REUSEPORT
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, io::Error> {
        let mut resolved = None;

        for shard in &self.shards {
            let addr = resolved.unwrap_or(addr);

            let (ack_s, ack_r) = channel::channel(1);

            shard.control.send(Command::Listen(addr, ack_s)).unwrap();

            let bound = ack_r.recv().unwrap()?;

            if resolved.is_none() {
                resolved = Some(bound);
            }
        }

        Ok(resolved.unwrap())
    }

    // stop every shard and wait for all of them to drain
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }

        self.stopped = true;

        let mut acks = Vec::new();

        for shard in &self.shards {
            let (ack_s, ack_r) = channel::channel(1);

            shard.control.send(Command::Stop(ack_s)).unwrap();

            acks.push(ack_r);
        }

        for ack in acks {
            let _ = ack.recv();
        }

        for shard in &mut self.shards {
            shard.thread.take().unwrap().join().unwrap();
        }
    }
}

impl Drop for ServerControl {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_shard(
    name: &str,
    id: usize,
    conns_max: usize,
    ready: channel::Sender<()>,
    control: channel::Receiver<Command>,
) {
    // 1 task per connection, plus a handful of supporting tasks
    let tasks_max = conns_max + SHARD_NON_CONNECTION_TASKS_MAX;

    let registrations_max = REGISTRATIONS_PER_TASK_MAX * tasks_max;

    let reactor = Reactor::new(registrations_max);
    let executor = Executor::new(tasks_max);

    debug!("shard {}: starting", id);

    {
        let name = name.to_string();

        executor
            .spawn(async move {
                let server = Server::new(&name, conns_max);

                let control = AsyncReceiver::new(control);

                ready.send(()).unwrap();
                drop(ready);

                loop {
                    match control.recv().await {
                        Ok(Command::SetRoutes(f, ack)) => {
                            server.with_routes(|routes| f(routes));

                            ack.send(()).unwrap();
                        }
                        Ok(Command::Listen(addr, ack)) => {
                            ack.send(server.listen(addr)).unwrap();
                        }
                        Ok(Command::Stop(ack)) => {
                            server.stop().await;

                            ack.send(()).unwrap();

                            break;
                        }
                        Err(_) => {
                            // controller went away
                            server.stop().await;

                            break;
                        }
                    }
                }
            })
            .unwrap();
    }

    executor.run(|timeout| reactor.poll(timeout)).unwrap();

    debug!("shard {}: stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http1::{Reply, Request};
    use crate::net::AsyncTcpStream;
    use crate::routes::WsFnHandler;
    use crate::websocket::{self, WsSocket, OPCODE_CLOSE, OPCODE_TEXT};
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpStream;
    use std::str;

    fn demo_routes(routes: &mut Routes) {
        routes.add("GET", "/", |_req: &Request, mut resp: Reply| {
            resp.set_content("hello", "text/html");

            resp
        });

        routes.add("GET", "/q", |req: &Request, mut resp: Reply| {
            let mut params: Vec<_> = req
                .query_params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            params.sort();

            resp.set_content(params.join("&"), "text/plain");

            resp
        });

        routes.add_ws(
            "/ws",
            WsFnHandler(
                |_req: Request, mut sock: WsSocket<AsyncTcpStream>| async move {
                    while let Ok(Some(msg)) = sock.recv_message().await {
                        if sock.send_message(msg.opcode, &msg.data).await.is_err() {
                            break;
                        }
                    }
                },
            ),
        );
    }

    fn start_test_server() -> (ServerControl, SocketAddr) {
        let control = ServerControl::start("testserver", 1, 16);

        control.set_routes(demo_routes);

        let addr = control.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        (control, addr)
    }

    fn read_reply(stream: &mut TcpStream) -> (String, Vec<u8>) {
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
            .find_map(|l| {
                l.to_ascii_lowercase()
                    .strip_prefix("content-length:")
                    .map(|v| v.trim().parse().unwrap())
            })
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

    fn client_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mask = [0x21, 0x22, 0x23, 0x24];

        let mut buf = vec![0; websocket::HEADER_SIZE_MAX + payload.len()];

        let offset =
            websocket::write_header(true, opcode, payload.len(), Some(mask), &mut buf).unwrap();

        buf[offset..offset + payload.len()].copy_from_slice(payload);
        websocket::apply_mask(&mut buf[offset..offset + payload.len()], mask, 0);
        buf.truncate(offset + payload.len());

        buf
    }

    // small frames only
    fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut h = [0; 2];
        stream.read_exact(&mut h).unwrap();

        assert_eq!(h[1] & 0x80, 0, "server frames must not be masked");

        let len = (h[1] & 0x7f) as usize;
        assert!(len < 126);

        let mut payload = vec![0; len];
        stream.read_exact(&mut payload).unwrap();

        (h[0] & 0x0f, payload)
    }

    #[test]
    fn get_keeps_connection_open() {
        let (mut control, addr) = start_test_server();

        let mut stream = TcpStream::connect(addr).unwrap();

        for _ in 0..2 {
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();

            let (head, body) = read_reply(&mut stream);

            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
            assert!(head.contains("Server: testserver\r\n"));
            assert!(head.contains("Content-Length: 5\r\n"));
            assert_eq!(body, b"hello");
        }

        drop(stream);

        control.stop();
    }

    #[test]
    fn unknown_path_is_404_and_stays_open() {
        let (mut control, addr) = start_test_server();

        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(b"GET /nonexistent HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let (head, _) = read_reply(&mut stream);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

        // the connection survives the 404
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let (head, body) = read_reply(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"hello");

        drop(stream);

        control.stop();
    }

    #[test]
    fn query_parameters_decoded() {
        let (mut control, addr) = start_test_server();

        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(b"GET /q?a=hello%20world&b=%2B&c HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let (_, body) = read_reply(&mut stream);
        assert_eq!(str::from_utf8(&body).unwrap(), "a=hello world&b=+&c=");

        drop(stream);

        control.stop();
    }

    #[test]
    fn websocket_upgrade_and_echo() {
        let (mut control, addr) = start_test_server();

        let mut stream = TcpStream::connect(addr).unwrap();

        // the first frame rides along with the handshake bytes, so the
        // handoff must carry the buffered bytes into the websocket loop
        let mut handshake = Vec::new();
        handshake.extend_from_slice(
            b"GET /ws HTTP/1.1\r\n\
              Host: x\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        handshake.extend(client_frame(OPCODE_TEXT, b"hello"));

        stream.write_all(&handshake).unwrap();

        let (head, body) = read_reply(&mut stream);

        assert!(
            head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
            "head: {}",
            head
        );
        assert!(head.contains("Upgrade: websocket\r\n"));
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(body.is_empty());

        let (opcode, payload) = read_frame(&mut stream);
        assert_eq!(opcode, OPCODE_TEXT);
        assert_eq!(payload, b"hello");

        // a second message after the handshake round-trip
        stream.write_all(&client_frame(OPCODE_TEXT, b"again")).unwrap();

        let (opcode, payload) = read_frame(&mut stream);
        assert_eq!(opcode, OPCODE_TEXT);
        assert_eq!(payload, b"again");

        // close handshake
        stream.write_all(&client_frame(OPCODE_CLOSE, b"")).unwrap();

        let (opcode, _) = read_frame(&mut stream);
        assert_eq!(opcode, OPCODE_CLOSE);

        drop(stream);

        control.stop();
    }

    #[test]
    fn websocket_upgrade_refused_without_key() {
        let (mut control, addr) = start_test_server();

        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Host: x\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\r\n",
            )
            .unwrap();

        let (head, _) = read_reply(&mut stream);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        // refusal closes the connection
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        control.stop();
    }

    #[test]
    fn websocket_upgrade_refused_without_route() {
        let (mut control, addr) = start_test_server();

        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(
                b"GET /not-a-ws-route HTTP/1.1\r\n\
                  Host: x\r\n\
                  Upgrade: websocket\r\n\
                  Connection: keep-alive, Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .unwrap();

        let (head, _) = read_reply(&mut stream);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        control.stop();
    }

    #[test]
    fn stop_drains_connections() {
        let (mut control, addr) = start_test_server();

        // an idle keep-alive connection is shut down by stop()
        let mut stream = TcpStream::connect(addr).unwrap();

        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let (head, _) = read_reply(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

        control.stop();

        // the server closed the idle connection
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        // and nothing is listening anymore
        match TcpStream::connect(addr) {
            Ok(_) => panic!("connect succeeded after stop"),
            Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionRefused),
        }
    }

    #[test]
    fn shards_share_one_port() {
        let mut control = ServerControl::start("testserver", 2, 16);

        control.set_routes(demo_routes);

        let addr = control.listen("127.0.0.1:0".parse().unwrap()).unwrap();

        // both shards accept on the same resolved address
        for _ in 0..4 {
            let mut stream = TcpStream::connect(addr).unwrap();

            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .unwrap();

            let (head, body) = read_reply(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
            assert_eq!(body, b"hello");
        }

        control.stop();
    }
}
