//! Push channel to connected browsers.
//!
//! Every browser tab opened in development mode connects over WebSocket.
//! After a task writes changed files the bus broadcasts one JSON message:
//!
//! ```json
//! {"kind":"css","paths":["css/main.css"]}
//! ```
//!
//! `css` asks the client to swap stylesheets in place, `reload` asks for a
//! full page reload. Delivery is best effort; a client which can't be
//! written to is dropped.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use camino::Utf8PathBuf;
use serde::Serialize;
use tungstenite::{Message, WebSocket};

use crate::engine::Category;

/// Port tried first when no port is requested explicitly.
pub const DEFAULT_PORT: u16 = 1337;

/// Older connections beyond this many are closed on the next broadcast.
const MAX_CLIENTS: usize = 10;

/// The receiving end of a broadcast.
pub trait Peer: Send {
    fn send_text(&mut self, text: &str) -> anyhow::Result<()>;

    fn close(&mut self) {}
}

impl Peer for WebSocket<TcpStream> {
    fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.send(Message::text(text.to_owned()))?;
        Ok(())
    }

    fn close(&mut self) {
        WebSocket::close(self, None).ok();
    }
}

#[derive(Serialize)]
struct Notice<'a> {
    kind: &'a str,
    paths: Vec<&'a str>,
}

type Clients = Arc<Mutex<Vec<Box<dyn Peer>>>>;

pub struct ReloadBus {
    port: Option<u16>,
    clients: Clients,
    running: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ReloadBus {
    /// A bus without a listener. Peers can only be added with [`connect`](Self::connect).
    pub fn detached() -> Self {
        Self {
            port: None,
            clients: Arc::default(),
            running: Arc::new(AtomicBool::new(false)),
            acceptor: Mutex::new(None),
        }
    }

    /// Listens on `127.0.0.1:port`, falling back to an ephemeral port when
    /// the requested one is taken.
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::debug!("reload port {port} unavailable ({err}), using an ephemeral one");
                TcpListener::bind("127.0.0.1:0")?
            }
        };

        let port = listener.local_addr()?.port();
        let clients = Clients::default();
        let running = Arc::new(AtomicBool::new(true));

        let acceptor = {
            let clients = clients.clone();
            let running = running.clone();
            std::thread::spawn(move || accept(listener, clients, running))
        };

        tracing::info!("reload channel listening on ws://localhost:{port}");

        Ok(Self {
            port: Some(port),
            clients,
            running,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// The port clients should connect to, if the bus is listening.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn connect(&self, peer: impl Peer + 'static) {
        self.clients.lock().unwrap().push(Box::new(peer));
    }

    pub fn clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Broadcasts a change. Returns the number of clients reached.
    pub fn notify(&self, category: Category, paths: &[Utf8PathBuf]) -> usize {
        let notice = Notice {
            kind: if category.is_injectable() { "css" } else { "reload" },
            paths: paths.iter().map(|path| path.as_str()).collect(),
        };

        let text = match serde_json::to_string(&notice) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!("couldn't encode reload message: {err}");
                return 0;
            }
        };

        let mut clients = self.clients.lock().unwrap();
        clients.retain_mut(|peer| match peer.send_text(&text) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("dropping reload client: {err}");
                false
            }
        });

        let len = clients.len();
        if len > MAX_CLIENTS {
            for mut peer in clients.drain(0..len - MAX_CLIENTS) {
                peer.close();
            }
        }

        tracing::debug!("sent {text} to {} client(s)", clients.len());
        clients.len()
    }

    /// Stops accepting connections and closes every client.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst)
            && let Some(port) = self.port
        {
            // wake the acceptor blocked in `incoming`
            TcpStream::connect(("127.0.0.1", port)).ok();
        }

        if let Some(acceptor) = self.acceptor.lock().unwrap().take() {
            acceptor.join().ok();
        }

        for mut peer in self.clients.lock().unwrap().drain(..) {
            peer.close();
        }
    }
}

impl Drop for ReloadBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept(listener: TcpListener, clients: Clients, running: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!("reload channel: {err}");
                continue;
            }
        };

        match tungstenite::accept(stream) {
            Ok(socket) => clients.lock().unwrap().push(Box::new(socket)),
            Err(err) => tracing::debug!("reload handshake failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{Receiver, Sender, channel};

    use super::*;

    struct Channel(Sender<String>);

    impl Peer for Channel {
        fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
            self.0.send(text.to_owned())?;
            Ok(())
        }
    }

    fn peer() -> (Channel, Receiver<String>) {
        let (tx, rx) = channel();
        (Channel(tx), rx)
    }

    #[test]
    fn test_styles_are_injected() {
        let bus = ReloadBus::detached();
        let (tx, rx) = peer();
        bus.connect(tx);

        let reached = bus.notify(Category::Styles, &["css/main.css".into()]);
        assert_eq!(reached, 1);
        assert_eq!(rx.recv().unwrap(), r#"{"kind":"css","paths":["css/main.css"]}"#);
    }

    #[test]
    fn test_other_categories_reload() {
        let bus = ReloadBus::detached();
        let (tx, rx) = peer();
        bus.connect(tx);

        for category in [Category::Markup, Category::Scripts, Category::Other] {
            bus.notify(category, &["index.html".into()]);
            assert_eq!(rx.recv().unwrap(), r#"{"kind":"reload","paths":["index.html"]}"#);
        }
    }

    #[test]
    fn test_disconnected_clients_are_dropped() {
        let bus = ReloadBus::detached();
        let (alive, rx) = peer();
        let (gone, gone_rx) = peer();
        bus.connect(alive);
        bus.connect(gone);
        drop(gone_rx);

        assert_eq!(bus.notify(Category::Markup, &[]), 1);
        assert_eq!(bus.clients(), 1);
        assert_eq!(rx.recv().unwrap(), r#"{"kind":"reload","paths":[]}"#);
    }

    #[test]
    fn test_bind_and_stop() {
        let bus = ReloadBus::bind(0).unwrap();
        assert!(bus.port().is_some_and(|port| port != 0));
        bus.stop();
        bus.stop();
    }
}
