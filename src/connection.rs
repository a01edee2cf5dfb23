use crate::config::{validate_address, ConnectionConfig};
use crate::error::{AvrError, Result};
use crate::protocol::{drain_lines, AnyLine, Command, ResponseMatcher};
use crate::subscription::{DeviceEvent, EventReceiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, timeout_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// How long `close` waits for the connection task to wind down
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 512;

/// A command waiting to be written, and where to deliver its answer
struct Request {
    id: Uuid,
    command: Command,
    matcher: Box<dyn ResponseMatcher>,
    timeout: Duration,
    reply: oneshot::Sender<Result<String>>,
}

/// How a session on a live socket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown was requested; do not reconnect
    Clean,
    /// I/O error or peer disconnect; reconnect after the delay
    Unclean,
}

/// Persistent, self-healing connection to a receiver
///
/// A single background task owns the socket. Commands are handed to it one at
/// a time through a capacity-1 queue and each gets its answer back on a
/// one-shot channel, so the receiver only ever sees one outstanding command.
/// When the socket fails the task waits `reconnect_delay` and dials again,
/// until [`Connection::close`] is called.
pub struct Connection {
    address: Arc<Mutex<String>>,
    command_timeout: Duration,
    request_tx: mpsc::Sender<Request>,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
    event_tx: Mutex<Option<broadcast::Sender<DeviceEvent>>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Start the background connection task
    ///
    /// Returns immediately; the first dial happens in the background. Must be
    /// called from within a tokio runtime.
    pub fn start(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let address = Arc::new(Mutex::new(config.address.clone()));
        let (request_tx, request_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        let (event_tx, _) = broadcast::channel(100);

        let handle = tokio::spawn(run_connection(
            config.clone(),
            address.clone(),
            request_rx,
            event_tx.clone(),
            stop_rx,
        ));

        Ok(Self {
            address,
            command_timeout: config.command_timeout,
            request_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            event_tx: Mutex::new(Some(event_tx)),
            task_handle: Mutex::new(Some(handle)),
        })
    }

    /// Get the address used for the next dial
    pub fn address(&self) -> String {
        self.address.lock().unwrap().clone()
    }

    /// Point the connection at a new `host:port`
    ///
    /// The live session is left alone; the new address is used the next time
    /// the task dials.
    pub fn set_address(&self, address: impl Into<String>) -> Result<()> {
        let address = address.into();
        validate_address(&address)?;

        tracing::info!("target address changed to {}", address);
        *self.address.lock().unwrap() = address;
        Ok(())
    }

    /// Send a command and wait for the last line `matcher` accepts
    pub async fn request(
        &self,
        command: Command,
        matcher: impl ResponseMatcher + 'static,
    ) -> Result<String> {
        self.request_with_timeout(command, matcher, self.command_timeout)
            .await
    }

    /// Send a command with an explicit response timeout
    ///
    /// Waits for the queue if another command is in flight, or while the
    /// task is reconnecting. Returns `Timeout` if nothing matching arrives in
    /// time, and `ConnectionClosed` if the connection is shut down or the
    /// socket fails before an answer is delivered.
    pub async fn request_with_timeout(
        &self,
        command: Command,
        matcher: impl ResponseMatcher + 'static,
        timeout: Duration,
    ) -> Result<String> {
        if self.is_closed() {
            return Err(AvrError::ConnectionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            id: Uuid::new_v4(),
            command,
            matcher: Box::new(matcher),
            timeout,
            reply: reply_tx,
        };

        self.request_tx
            .send(request)
            .await
            .map_err(|_| AvrError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| AvrError::ConnectionClosed)?
    }

    /// Subscribe to lines the receiver sends on its own
    pub fn subscribe(&self) -> Result<EventReceiver> {
        self.event_tx
            .lock()
            .unwrap()
            .as_ref()
            .map(|tx| EventReceiver::new(tx.subscribe()))
            .ok_or(AvrError::ConnectionClosed)
    }

    /// Check whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.stop_tx.lock().unwrap().is_none()
    }

    /// Shut the connection down for good
    ///
    /// Safe to call more than once; later calls do nothing. A command in
    /// flight receives `ConnectionClosed`, as does every command issued
    /// afterwards.
    pub async fn close(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.event_tx.lock().unwrap().take();

        let handle = self.task_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("connection task did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }
    }
}

/// Dial, run a session, and redial until shut down
async fn run_connection(
    config: ConnectionConfig,
    address: Arc<Mutex<String>>,
    mut request_rx: mpsc::Receiver<Request>,
    event_tx: broadcast::Sender<DeviceEvent>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        let addr = address.lock().unwrap().clone();

        let dialed = tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("received shutdown signal while dialing {}", addr);
                return;
            }
            dialed = timeout(config.dial_timeout, TcpStream::connect(&addr)) => dialed,
        };

        match dialed {
            Ok(Ok(stream)) => {
                tracing::info!("connected to {}", addr);

                let mut session = Session::new(stream, &addr, &config, &event_tx);
                match session.run(&mut request_rx, &mut stop_rx).await {
                    SessionEnd::Clean => {
                        tracing::info!("connection to {} closed cleanly", addr);
                        return;
                    }
                    SessionEnd::Unclean => {
                        tracing::warn!("lost connection to {}", addr);
                    }
                }
            }
            Ok(Err(e)) => tracing::error!("could not dial {}: {}", addr, e),
            Err(_) => tracing::error!(
                "could not dial {}: timed out after {:?}",
                addr,
                config.dial_timeout
            ),
        }

        tracing::info!("waiting {:?} to reconnect", config.reconnect_delay);
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("received shutdown signal while waiting to reconnect");
                return;
            }
            _ = sleep(config.reconnect_delay) => {}
        }
    }
}

/// One live socket and the bytes read from it that do not yet form a line
struct Session<'a> {
    stream: TcpStream,
    addr: &'a str,
    buf: Vec<u8>,
    poll_interval: Duration,
    read_deadline: Duration,
    event_tx: &'a broadcast::Sender<DeviceEvent>,
}

impl<'a> Session<'a> {
    fn new(
        stream: TcpStream,
        addr: &'a str,
        config: &ConnectionConfig,
        event_tx: &'a broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            stream,
            addr,
            buf: Vec::new(),
            poll_interval: config.poll_interval,
            read_deadline: config.read_deadline,
            event_tx,
        }
    }

    /// Serve commands, drain unsolicited traffic, and watch for shutdown
    async fn run(
        &mut self,
        request_rx: &mut mpsc::Receiver<Request>,
        stop_rx: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    tracing::info!("received shutdown signal, closing {}", self.addr);
                    return SessionEnd::Clean;
                }
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        tracing::info!("all connection handles dropped, closing {}", self.addr);
                        return SessionEnd::Clean;
                    };

                    // Dropping the request on shutdown closes its reply channel.
                    tokio::select! {
                        _ = stop_rx.recv() => {
                            tracing::info!("received shutdown signal mid-command, closing {}", self.addr);
                            return SessionEnd::Clean;
                        }
                        handled = self.handle_request(request) => {
                            if let Err(e) = handled {
                                tracing::error!("I/O error on {}: {}", self.addr, e);
                                return SessionEnd::Unclean;
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = stop_rx.recv() => {
                            tracing::info!("received shutdown signal while draining, closing {}", self.addr);
                            return SessionEnd::Clean;
                        }
                        drained = self.drain() => {
                            if let Err(e) = drained {
                                tracing::error!("I/O error on {}: {}", self.addr, e);
                                return SessionEnd::Unclean;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Write one command and deliver its answer
    ///
    /// Only socket failures are returned as errors; a command that gets no
    /// answer in time is reported to its caller and the session carries on.
    async fn handle_request(&mut self, request: Request) -> Result<()> {
        let Request {
            id,
            command,
            matcher,
            timeout,
            reply,
        } = request;

        tracing::debug!(%id, "writing {}", command);
        if let Err(e) = self.stream.write_all(&command.encode()).await {
            let _ = reply.send(Err(AvrError::ConnectionClosed));
            return Err(e.into());
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let until = (Instant::now() + self.read_deadline).min(deadline);
            let mut lines = match self.read_lines(matcher.as_ref(), until).await {
                Ok(lines) => lines,
                Err(e) => {
                    let _ = reply.send(Err(AvrError::ConnectionClosed));
                    return Err(e);
                }
            };

            if let Some(last) = lines.pop() {
                tracing::debug!(%id, "responding to {} with {}", command, last);
                let _ = reply.send(Ok(last));
                return Ok(());
            }
        }

        tracing::warn!(%id, "no response to {} within {:?}", command, timeout);
        let _ = reply.send(Err(AvrError::Timeout));
        Ok(())
    }

    /// Read and drop whatever arrived between commands
    async fn drain(&mut self) -> Result<()> {
        let until = Instant::now() + self.read_deadline;
        for line in self.read_lines(&AnyLine, until).await? {
            tracing::warn!("unexpected event: {} (ignoring)", line);
            self.publish(line);
        }
        Ok(())
    }

    /// Read lines until `until`, however busy the socket is
    ///
    /// Returns the accepted lines in arrival order. Everything else is logged
    /// and published as an event. EOF and read errors end the session.
    async fn read_lines(
        &mut self,
        matcher: &dyn ResponseMatcher,
        until: Instant,
    ) -> Result<Vec<String>> {
        let mut accepted = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            for line in drain_lines(&mut self.buf) {
                if matcher.accepts(&line) {
                    accepted.push(line);
                } else {
                    tracing::warn!("unrequested response: {} (ignoring)", line);
                    self.publish(line);
                }
            }

            match timeout_at(until, self.stream.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => return Err(AvrError::ConnectionClosed),
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        Ok(accepted)
    }

    fn publish(&self, line: String) {
        // No subscribers is fine
        let _ = self.event_tx.send(DeviceEvent::new(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Family;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    fn test_config(addr: &str) -> ConnectionConfig {
        ConnectionConfig::new(addr)
            .with_reconnect_delay(Duration::from_millis(50))
            .with_command_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn last_matching_line_wins() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut line = Vec::new();
            reader.read_until(b'\r', &mut line).await.unwrap();
            assert_eq!(line, b"MV?\r".to_vec());
            reader
                .get_mut()
                .write_all(b"MV45\rHEARTBEAT\rMVMAX 800\rMV395\r")
                .await
                .unwrap();
            sleep(Duration::from_secs(1)).await;
        });

        let conn = Connection::start(test_config(&addr)).unwrap();
        let resp = conn
            .request(Command::query(Family::MasterVolume), Family::MasterVolume.matcher())
            .await
            .unwrap();
        assert_eq!(resp, "MV395");
        conn.close().await;
    }

    #[tokio::test]
    async fn partial_lines_are_reassembled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"PWST").await.unwrap();
            sleep(Duration::from_millis(50)).await;
            stream.write_all(b"ANDBY\r").await.unwrap();
            sleep(Duration::from_secs(1)).await;
        });

        let conn = Connection::start(test_config(&addr)).unwrap();
        let resp = conn
            .request(Command::new(Family::Power, "STANDBY"), Family::Power.matcher())
            .await
            .unwrap();
        assert_eq!(resp, "PWSTANDBY");
        conn.close().await;
    }

    #[tokio::test]
    async fn unsolicited_lines_are_published() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let conn = Connection::start(test_config(&addr)).unwrap();
        let mut events = conn.subscribe().unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"SIDVD\r").await.unwrap();

        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.line, "SIDVD");
        assert_eq!(event.family(), Some(Family::InputSource));
        conn.close().await;
    }

    /// Accept one client and write `HB` every 3ms, answering `PW?` with
    /// `answer` if given.
    async fn chatty_peer(listener: TcpListener, answer: Option<&'static [u8]>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let mut answered = false;
        loop {
            if let Some(answer) = answer {
                if !answered {
                    if let Ok(Ok(n)) = timeout(Duration::from_millis(1), stream.read(&mut buf)).await {
                        if n > 0 {
                            sleep(Duration::from_millis(20)).await;
                            stream.write_all(answer).await.unwrap();
                            answered = true;
                        }
                    }
                }
            }
            if stream.write_all(b"HB\r").await.is_err() {
                return;
            }
            sleep(Duration::from_millis(3)).await;
        }
    }

    #[tokio::test]
    async fn busy_line_still_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(chatty_peer(listener, None));

        let config = test_config(&addr).with_command_timeout(Duration::from_millis(200));
        let conn = Connection::start(config).unwrap();

        let started = Instant::now();
        let result = timeout(
            Duration::from_secs(3),
            conn.request(Command::query(Family::Power), Family::Power.matcher()),
        )
        .await
        .expect("request must not outlive its deadline");
        assert!(matches!(result, Err(AvrError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));

        timeout(Duration::from_secs(1), conn.close()).await.unwrap();
    }

    #[tokio::test]
    async fn busy_line_still_delivers_answer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(chatty_peer(listener, Some(&b"PWON\r"[..])));

        let config = test_config(&addr).with_command_timeout(Duration::from_secs(1));
        let conn = Connection::start(config).unwrap();

        let resp = timeout(
            Duration::from_secs(3),
            conn.request(Command::query(Family::Power), Family::Power.matcher()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resp, "PWON");
        conn.close().await;
    }

    #[tokio::test]
    async fn peer_hangup_mid_command_then_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // First session: read the command, then hang up without answering.
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            let mut line = Vec::new();
            reader.read_until(b'\r', &mut line).await.unwrap();
            drop(reader);

            // Second session: answer normally.
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(stream);
            line.clear();
            reader.read_until(b'\r', &mut line).await.unwrap();
            reader.get_mut().write_all(b"PWON\r").await.unwrap();
            sleep(Duration::from_secs(1)).await;
        });

        let conn = Connection::start(test_config(&addr)).unwrap();

        let err = timeout(
            Duration::from_secs(3),
            conn.request(Command::query(Family::Power), Family::Power.matcher()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, AvrError::ConnectionClosed));

        let resp = timeout(
            Duration::from_secs(3),
            conn.request(Command::query(Family::Power), Family::Power.matcher()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resp, "PWON");
        conn.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = Connection::start(test_config("127.0.0.1:1")).unwrap();
        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(conn.subscribe().is_err());
        let err = conn
            .request(Command::query(Family::Power), Family::Power.matcher())
            .await
            .unwrap_err();
        assert!(matches!(err, AvrError::ConnectionClosed));
    }

    #[tokio::test]
    async fn rejects_invalid_address() {
        assert!(matches!(
            Connection::start(ConnectionConfig::new("no-port")),
            Err(AvrError::Config(_))
        ));

        let conn = Connection::start(test_config("127.0.0.1:1")).unwrap();
        assert!(conn.set_address("nonsense").is_err());
        assert_eq!(conn.address(), "127.0.0.1:1");
        conn.close().await;
    }
}
