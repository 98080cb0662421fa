//! The preview server: static file serving, live reload, optional tunnel.
//!
//! The HTTP side serves the output directory from a dedicated thread with
//! a current-thread tokio runtime. Live reload runs over a separate
//! websocket port: one thread accepts browser connections, another pushes
//! `"reload"` frames whenever a rebuilt event arrives. Delivery is
//! fire-and-forget; a slow or disconnected browser never blocks a rebuild.
//!
//! The tunnel leases a public subdomain from the relay and keeps a small
//! set of TCP connections open to it, proxying relayed traffic to the
//! local server. Any tunnel failure degrades to a warning.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::Router;
use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use crossbeam_channel::Receiver;
use serde::Deserialize;
use tower_http::services::ServeDir;
use tungstenite::WebSocket;

use crate::error::ServeError;
use crate::events::Rebuild;

/// First port probed for the HTTP side.
pub const DEFAULT_PORT: u16 = 3000;
/// How many sequential ports to probe before giving up.
const PORT_PROBE_WINDOW: u16 = 100;
/// Preferred websocket port, with an ephemeral fallback.
const WS_PORT: u16 = 1337;
/// Public relay endpoint for remote preview sessions.
const TUNNEL_RELAY: &str = "localtunnel.me:80";

#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub port: u16,
    /// Expose the session through the public relay. Unreachability of the
    /// relay is a warning, not a startup failure.
    pub tunnel: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            tunnel: false,
        }
    }
}

/// A running preview session: one bound HTTP port, one websocket port and
/// the set of connected browser clients behind it.
pub(crate) struct PreviewServer {
    pub port: u16,
    pub ws_port: u16,
}

impl PreviewServer {
    pub(crate) fn start(
        out_dir: &Utf8Path,
        options: ServeOptions,
        events: Receiver<Rebuild>,
    ) -> Result<Self, ServeError> {
        let (listener, port) = reserve_port(options.port)?;
        let (ws_listener, ws_port) = reserve_ws_port()?;

        let url = style(format!("http://localhost:{port}/")).yellow();
        tracing::info!(%url, "starting the preview server");

        let _thread_http = start_http(listener, out_dir.to_owned());

        let clients = Arc::new(Mutex::new(vec![]));
        let _thread_i = new_thread_ws_incoming(ws_listener, clients.clone());
        let (tx_reload, _thread_o) = new_thread_ws_reload(clients);

        // Bridge rebuilt events into reload pushes.
        let _thread_bridge = thread::spawn(move || {
            for _event in events.iter() {
                tx_reload.send(()).ok();
            }
        });

        if options.tunnel {
            open_tunnel(port);
        }

        Ok(Self { port, ws_port })
    }
}

/// Probe sequential ports starting from `start`. Two live sessions in the
/// same environment therefore land on distinct ports.
pub(crate) fn reserve_port(start: u16) -> Result<(TcpListener, u16), ServeError> {
    let end = start.saturating_add(PORT_PROBE_WINDOW);

    for port in start..end {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            return Ok((listener, port));
        }
    }

    Err(ServeError::NoFreePort { start, end })
}

fn reserve_ws_port() -> Result<(TcpListener, u16), ServeError> {
    let listener = match TcpListener::bind(("127.0.0.1", WS_PORT)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind(("127.0.0.1", 0))?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn start_http(
    listener: TcpListener,
    out_dir: Utf8PathBuf,
) -> JoinHandle<Result<(), anyhow::Error>> {
    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve_files(listener, out_dir))
    })
}

async fn serve_files(listener: TcpListener, out_dir: Utf8PathBuf) -> Result<(), anyhow::Error> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let router = Router::new().fallback_service(ServeDir::new(out_dir));

    axum::serve(listener, router).await?;

    Ok(())
}

fn new_thread_ws_incoming(
    server: TcpListener,
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else { continue };
            match tungstenite::accept(stream) {
                Ok(socket) => client.lock().unwrap().push(socket),
                Err(e) => tracing::error!("websocket handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(
    client: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = thread::spawn(move || {
        while rx.recv().is_ok() {
            let mut clients = client.lock().unwrap();
            let mut broken = vec![];

            for (i, socket) in clients.iter_mut().enumerate() {
                match socket.send("reload".into()) {
                    Ok(_) => {}
                    Err(tungstenite::error::Error::Io(e)) => {
                        if e.kind() == std::io::ErrorKind::BrokenPipe {
                            broken.push(i);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Error: {e:?}");
                    }
                }
            }

            for i in broken.into_iter().rev() {
                clients.remove(i);
            }

            // Close all but the last 10 connections
            let len = clients.len();
            if len > 10 {
                for mut socket in clients.drain(0..len - 10) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}

/// Session lease returned by the relay's `/?new` endpoint.
#[derive(Debug, Deserialize)]
struct TunnelLease {
    url: String,
    port: u16,
    max_conn_count: Option<usize>,
}

/// Lease a public session and keep it alive in the background. Failure at
/// any point is a warning; local serving continues either way.
fn open_tunnel(port: u16) {
    thread::spawn(move || match request_tunnel(TUNNEL_RELAY) {
        Ok(lease) => {
            let url = style(&lease.url).yellow();
            tracing::info!(%url, "tunnel open");

            let host = TUNNEL_RELAY.split(':').next().unwrap_or(TUNNEL_RELAY);
            let relay = format!("{host}:{}", lease.port);
            let conns = lease.max_conn_count.unwrap_or(4).clamp(1, 10);

            let workers: Vec<_> = (0..conns)
                .map(|_| {
                    let relay = relay.clone();
                    thread::spawn(move || relay_connection(&relay, port))
                })
                .collect();

            for worker in workers {
                worker.join().ok();
            }

            tracing::warn!("tunnel closed, serving locally only");
        }
        Err(e) => tracing::warn!("couldn't open a tunnel ({e}), serving locally only"),
    });
}

/// Ask the relay for a new session over plain HTTP/1.0.
fn request_tunnel(relay: &str) -> Result<TunnelLease, anyhow::Error> {
    let mut stream = TcpStream::connect(relay)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let host = relay.split(':').next().unwrap_or(relay);
    write!(stream, "GET /?new HTTP/1.0\r\nHost: {host}\r\n\r\n")?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;

    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .ok_or_else(|| anyhow::anyhow!("malformed response from relay {relay}"))?;

    Ok(serde_json::from_str(body)?)
}

/// One persistent relay connection: traffic the relay forwards for our
/// subdomain is proxied to the local server, reconnecting when the relay
/// side hangs up.
fn relay_connection(relay: &str, local_port: u16) {
    loop {
        let Ok(remote) = TcpStream::connect(relay) else {
            return;
        };
        let Ok(local) = TcpStream::connect(("127.0.0.1", local_port)) else {
            return;
        };
        pump(remote, local);
    }
}

/// Copy bytes both ways until either side closes.
fn pump(a: TcpStream, b: TcpStream) {
    let Ok(mut a_read) = a.try_clone() else { return };
    let Ok(mut b_read) = b.try_clone() else { return };
    let mut a_write = a;
    let mut b_write = b;

    let forward = thread::spawn(move || {
        io::copy(&mut a_read, &mut b_write).ok();
        b_write.shutdown(Shutdown::Write).ok();
    });

    io::copy(&mut b_read, &mut a_write).ok();
    a_write.shutdown(Shutdown::Write).ok();
    forward.join().ok();
}
