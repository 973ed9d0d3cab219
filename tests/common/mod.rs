//! In-process fake device controller for integration tests.
#![allow(dead_code, clippy::panic)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};

use gcode_runner::client::{Connector, WsConnector, WsStream};
use gcode_runner::config::ClientConfig;
use gcode_runner::error::ClientError;

pub const HANDSHAKE: &str = r#"{"method":"get","params":{"reqProbedMatrix":1}}"#;
pub const CLEAN_ERR: &str = r#"{"method":"set","params":{"cleanErr":1}}"#;

/// A text frame the device received, tagged with the 1-based number of
/// the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
enum Control {
    Push(String),
    Drop,
    Stall,
}

/// WebSocket server standing in for the printer.
pub struct FakeDevice {
    pub port: u16,
    frames: mpsc::UnboundedReceiver<Frame>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl FakeDevice {
    pub async fn start() -> Self {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("failed to bind fake device");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("fake device has no address");
        };
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (control, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            frames_tx,
            control.clone(),
            Arc::clone(&connections),
            Arc::clone(&open),
        ));
        Self {
            port: addr.port(),
            frames,
            control,
            connections,
            open,
            accept_task,
        }
    }

    /// Client settings pointing at this device, with test-friendly timings.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("http://127.0.0.1")
            .with_ws_port(self.port)
            .with_connect_retry_interval(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_secs(3600))
            .with_send_timeout(Duration::from_secs(1))
    }

    /// Sends `text` to every open connection.
    pub fn push(&self, text: &str) {
        let _ = self.control.send(Control::Push(text.to_string()));
    }

    /// Drops every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Stops reading from every open connection, so the client's writes
    /// back up once the socket buffers are full.
    pub fn stall(&self) {
        let _ = self.control.send(Control::Stall);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections the client has not closed yet.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Next received frame, or `None` after five seconds.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frame_within(Duration::from_secs(5)).await
    }

    /// Next received frame if one arrives within `window`.
    pub async fn frame_within(&mut self, window: Duration) -> Option<Frame> {
        tokio::time::timeout(window, self.frames.recv())
            .await
            .ok()
            .flatten()
    }

    /// Every frame that arrives within `window`.
    pub async fn frames_during(&mut self, window: Duration) -> Vec<Frame> {
        let deadline = tokio::time::Instant::now() + window;
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.frames.recv()).await {
            frames.push(frame);
        }
        frames
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn accept_loop(
    listener: TcpListener,
    frames: mpsc::UnboundedSender<Frame>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
) {
    while let Ok((tcp, _)) = listener.accept().await {
        let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
            continue;
        };
        let connection = connections.fetch_add(1, Ordering::SeqCst) + 1;
        open.fetch_add(1, Ordering::SeqCst);
        let open = Arc::clone(&open);
        let served = serve(ws, connection, frames.clone(), control.subscribe());
        tokio::spawn(async move {
            served.await;
            open.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

async fn serve(
    ws: WebSocketStream<TcpStream>,
    connection: usize,
    frames: mpsc::UnboundedSender<Frame>,
    mut control: broadcast::Receiver<Control>,
) {
    let (mut tx, mut rx) = ws.split();
    loop {
        tokio::select! {
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames.send(Frame {
                        connection,
                        text: text.as_str().to_string(),
                    });
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = control.recv() => match command {
                Ok(Control::Push(text)) => {
                    if tx.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => break,
                Ok(Control::Stall) => {
                    wait_for_drop(&mut control).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// Keeps the connection open, unread, until it is dropped.
async fn wait_for_drop(control: &mut broadcast::Receiver<Control>) {
    loop {
        match control.recv().await {
            Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

/// Connector that refuses a number of attempts before delegating to the
/// real one.
pub struct FlakyConnector {
    failures_left: AtomicUsize,
    attempts: Arc<AtomicUsize>,
    refusing: Arc<AtomicBool>,
}

impl FlakyConnector {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            attempts: Arc::new(AtomicUsize::new(0)),
            refusing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }

    /// While set, every attempt is refused regardless of the failure budget.
    pub fn refusal_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.refusing)
    }
}

impl Connector for FlakyConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<WsStream, ClientError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = self.refusing.load(Ordering::SeqCst)
                || self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
            if refuse {
                return Err(ClientError::from(tungstenite::Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused by test connector",
                ))));
            }
            WsConnector.connect(url).await
        })
    }
}

/// Polls `condition` every 10 ms for up to five seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
