//! An in-process stand-in for a receiver's telnet control port.
//!
//! Used by the integration tests and the `fake-avr` binary. It greets every
//! client with a banner, answers commands from a fixed table, and can emit a
//! heartbeat whenever a client has been quiet for a while.

use crate::error::Result;
use crate::protocol::{to_bytes, TERMINATOR};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;

const WELCOME: &str = "Fake AVR1912 Telnet server";

/// Idle time after which a heartbeat is sent
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Builder for a fake receiver
#[derive(Debug, Clone)]
pub struct FakeAvr {
    listen: String,
    responses: HashMap<String, Vec<String>>,
    heartbeat: Option<String>,
}

impl Default for FakeAvr {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAvr {
    /// Create a fake listening on an ephemeral localhost port
    pub fn new() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            responses: HashMap::new(),
            heartbeat: None,
        }
    }

    /// Listen on a specific `host:port`
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = addr.into();
        self
    }

    /// Answer `command` with `lines`, in order
    ///
    /// An empty slice means the command is accepted but never answered.
    pub fn respond(mut self, command: &str, lines: &[&str]) -> Self {
        self.responses.insert(
            command.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    /// Send `line` whenever a client has been idle for 100ms
    pub fn heartbeat(mut self, line: impl Into<String>) -> Self {
        self.heartbeat = Some(line.into());
        self
    }

    /// Bind the listener and start accepting clients
    pub async fn serve(self) -> Result<FakeAvrHandle> {
        let listener = TcpListener::bind(&self.listen).await?;
        let addr = listener.local_addr()?;
        tracing::info!("listening on {}", addr);

        let (stop_tx, _) = broadcast::channel(1);
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(self.responses),
            self.heartbeat,
            received.clone(),
            stop_tx.clone(),
        ));

        Ok(FakeAvrHandle {
            addr,
            stop_tx,
            received,
            task: Some(task),
        })
    }
}

/// A running fake receiver
pub struct FakeAvrHandle {
    addr: SocketAddr,
    stop_tx: broadcast::Sender<()>,
    received: Arc<Mutex<Vec<String>>>,
    task: Option<JoinHandle<()>>,
}

impl FakeAvrHandle {
    /// Address the fake is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every command received so far, across all clients
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Stop listening and drop every client connection
    pub async fn close(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for FakeAvrHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    responses: Arc<HashMap<String, Vec<String>>>,
    heartbeat: Option<String>,
    received: Arc<Mutex<Vec<String>>>,
    stop_tx: broadcast::Sender<()>,
) {
    let mut stop_rx = stop_tx.subscribe();
    let mut clients = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("could not accept new connection: {}", e);
                        continue;
                    }
                };

                tracing::info!("client connected from {}", peer);
                clients.spawn(handle_client(
                    stream,
                    responses.clone(),
                    heartbeat.clone(),
                    received.clone(),
                    stop_tx.subscribe(),
                ));
            }
        }
    }

    tracing::info!("shutting down");
    while clients.join_next().await.is_some() {}
}

async fn handle_client(
    stream: TcpStream,
    responses: Arc<HashMap<String, Vec<String>>>,
    heartbeat: Option<String>,
    received: Arc<Mutex<Vec<String>>>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut reader = BufReader::new(stream);
    if let Err(e) = reader.get_mut().write_all(&to_bytes(WELCOME)).await {
        tracing::warn!("could not send welcome banner: {}", e);
        return;
    }

    let mut line = Vec::new();
    loop {
        let read = tokio::select! {
            _ = stop_rx.recv() => return,
            read = timeout(IDLE_INTERVAL, reader.read_until(TERMINATOR, &mut line)) => read,
        };

        match read {
            Err(_) => {
                if let Some(heartbeat) = &heartbeat {
                    if reader.get_mut().write_all(&to_bytes(heartbeat)).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Ok(Ok(0)) => return,
            Ok(Ok(_)) if line.last() != Some(&TERMINATOR) => return,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!("read error: {}", e);
                return;
            }
        }

        let command = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        line.clear();
        tracing::info!("received command: {}", command);
        received.lock().unwrap().push(command.clone());

        if let Some(lines) = responses.get(&command) {
            for resp in lines {
                if let Err(e) = reader.get_mut().write_all(&to_bytes(resp)).await {
                    tracing::warn!("could not write {}: {}", resp, e);
                    return;
                }
            }
        }
    }
}
