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

use clap::Parser;
use filament::control::ServerControl;
use filament::http1::{Reply, Request};
use filament::net::AsyncTcpStream;
use filament::routes::{Routes, WsFnHandler};
use filament::websocket::WsSocket;
use log::{error, info, Level, LevelFilter, Metadata, Record};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process;
use std::str;
use time::macros::format_description;
use time::OffsetDateTime;

// safety value
const WORKERS_MAX: usize = 1024;

struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = OffsetDateTime::now_utc();

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .expect("failed to write timestamp");

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).expect("timestamp is not utf-8");

        let lname = match record.level() {
            Level::Error => "ERR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        println!("[{}] {} [{}] {}", lname, ts, record.target(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

#[derive(Parser)]
#[command(name = "filament", version, about = "HTTP/WebSocket server with one cooperative shard per core")]
struct Args {
    /// Port to listen on
    #[arg(long, value_name = "N", default_value_t = 10000)]
    port: u16,

    /// Number of shard threads
    #[arg(long, value_name = "N", default_value_t = 2)]
    workers: usize,

    /// Maximum concurrent connections per shard
    #[arg(long, value_name = "N", default_value_t = 10_000)]
    maxconn: usize,

    /// Log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(long, value_name = "N", default_value_t = 2)]
    log_level: u32,
}

fn set_routes(routes: &mut Routes) {
    routes.add("GET", "/", |_req: &Request, mut resp: Reply| {
        resp.set_content("hello", "text/html");

        resp
    });

    routes.add_ws(
        "/",
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

fn main() {
    let args = Args::parse();

    log::set_logger(&LOGGER).unwrap();

    let level = match args.log_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    log::set_max_level(level);

    if args.workers == 0 || args.workers > WORKERS_MAX {
        error!("workers must be between 1 and {}", WORKERS_MAX);
        process::exit(1);
    }

    let mut server = ServerControl::start("filament", args.workers, args.maxconn);

    server.set_routes(set_routes);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);

    match server.listen(addr) {
        Ok(addr) => info!("filament HTTP server listening on port {} ...", addr.port()),
        Err(e) => {
            error!("failed to listen on {}: {}", addr, e);
            process::exit(1);
        }
    }

    let mut signals = Signals::new([SIGINT, SIGTERM]).unwrap();

    // wait for termination
    signals.forever().next();

    info!("stopping");

    server.stop();
}
