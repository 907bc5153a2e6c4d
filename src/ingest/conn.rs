//! Persistent outbound connection to the traffic-inspection agent.
//!
//! The manager owns the only socket to the agent and pushes every received
//! byte chunk onto an mpsc channel consumed by the decoder task, keeping
//! transport concerns out of the parser. Socket health is published through
//! a watch channel of [`ConnectionState`] transitions; that watch is the
//! only way consumers learn about connectivity.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, ReconnectConfig};

/// Read buffer size for the agent socket.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Extended-cooldown multiplier applied once the attempt ceiling is hit.
const COOLDOWN_MULTIPLIER: u32 = 6;

/// Connectivity state of the agent socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectWait,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ReconnectWait => "reconnect_wait",
        }
    }
}

/// Callback invoked when the consecutive-failure ceiling is reached,
/// with the failure count. Fires once per exhaustion, before the
/// extended cooldown.
pub type ExhaustedFn = Box<dyn Fn(u32) + Send + Sync>;

/// Manages the single persistent agent connection.
#[derive(Clone)]
pub struct ConnectionManager {
    addr: String,
    delay: Duration,
    max_attempts: u32,
    chunk_tx: mpsc::Sender<Vec<u8>>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    on_exhausted: Arc<parking_lot::Mutex<Option<ExhaustedFn>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("addr", &self.addr)
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager targeting the configured agent host:port. Received
    /// chunks are delivered through `chunk_tx`.
    pub fn new(
        agent: &AgentConfig,
        reconnect: &ReconnectConfig,
        chunk_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            addr: format!("{}:{}", agent.host, agent.port),
            delay: reconnect.delay,
            max_attempts: reconnect.max_attempts,
            chunk_tx,
            state_tx,
            attempts: Arc::new(AtomicU32::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            on_exhausted: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Subscribe to connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current consecutive-failure count.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Register the exhaustion callback. Must be set before `start`.
    pub fn on_exhausted(&self, f: ExhaustedFn) {
        *self.on_exhausted.lock() = Some(f);
    }

    /// Stops connection activity: no further connect attempt is issued
    /// until `restart`. Idempotent; any pending reconnect sleep is woken
    /// and suppressed.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a wake issued before the loop
        // parks is not lost.
        self.wake.notify_one();
    }

    /// Clears the shutdown flag, resets the attempt counter, and
    /// reconnects immediately.
    pub fn restart(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.shutdown.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Spawns the connection loop. Final teardown is the cancellation
    /// token; `stop`/`restart` only park and resume the loop.
    pub fn start(&self, cancel: CancellationToken) {
        let mgr = self.clone();

        info!(addr = %mgr.addr, "connection manager started");

        tokio::spawn(async move {
            mgr.run(cancel).await;
            debug!("connection manager task exited");
        });
    }

    async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            if self.shutdown.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.wake.notified() => continue,
                }
            }

            self.set_state(ConnectionState::Connecting);

            let connect = tokio::select! {
                _ = cancel.cancelled() => return,
                result = TcpStream::connect(&self.addr) => result,
            };

            match connect {
                Ok(stream) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    info!(addr = %self.addr, "connected to agent");

                    if !self.read_stream(stream, &cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(addr = %self.addr, error = %e, "connect failed");
                }
            }

            if cancel.is_cancelled() || self.shutdown.load(Ordering::SeqCst) {
                continue;
            }

            self.set_state(ConnectionState::ReconnectWait);

            let failures = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let (delay, reset) = backoff_after_failure(failures, self.delay, self.max_attempts);

            if reset {
                warn!(
                    failures,
                    cooldown = ?delay,
                    "reconnect attempts exhausted, entering extended cooldown",
                );
                if let Some(cb) = self.on_exhausted.lock().as_ref() {
                    cb(failures);
                }
                self.attempts.store(0, Ordering::SeqCst);
            } else {
                debug!(attempt = failures, delay = ?delay, "scheduling reconnect");
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Reads the connected stream until close, error, stop, or cancel.
    /// Returns false when the task should exit entirely.
    async fn read_stream(&self, mut stream: TcpStream, cancel: &CancellationToken) -> bool {
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.wake.notified() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        debug!("stop requested, closing agent socket");
                        return true;
                    }
                }
                read = stream.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            info!("agent closed the connection");
                            return true;
                        }
                        Ok(n) => {
                            if self.chunk_tx.send(buf[..n].to_vec()).await.is_err() {
                                debug!("chunk receiver dropped, stopping reads");
                                return false;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "socket read error");
                            return true;
                        }
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = current.as_str(), to = state.as_str(), "connection state");
                *current = state;
                true
            }
        });
    }
}

/// Backoff decision after the given number of consecutive failures:
/// the delay before the next attempt, and whether the counter resets
/// (extended cooldown taken).
pub(crate) fn backoff_after_failure(
    failures: u32,
    delay: Duration,
    max_attempts: u32,
) -> (Duration, bool) {
    if failures >= max_attempts {
        (delay * COOLDOWN_MULTIPLIER, true)
    } else {
        (delay, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_below_ceiling() {
        let base = Duration::from_secs(5);
        let (delay, reset) = backoff_after_failure(1, base, 9999);
        assert_eq!(delay, base);
        assert!(!reset);

        let (delay, reset) = backoff_after_failure(9998, base, 9999);
        assert_eq!(delay, base);
        assert!(!reset);
    }

    #[test]
    fn test_backoff_at_ceiling_enters_cooldown_and_resets() {
        let base = Duration::from_secs(5);
        let (delay, reset) = backoff_after_failure(9999, base, 9999);
        assert_eq!(delay, base * 6);
        assert!(reset);
    }

    #[test]
    fn test_connection_state_as_str() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionState::ReconnectWait.as_str(), "reconnect_wait");
    }

    #[tokio::test]
    async fn test_connect_receive_and_stop() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            sock.write_all(b"{\"type\":\"noop\"}\n").await.expect("write");
            // Hold the socket open until the client goes away.
            let mut scratch = [0u8; 16];
            let _ = sock.read(&mut scratch).await;
        });

        let agent = AgentConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let reconnect = ReconnectConfig {
            delay: Duration::from_millis(20),
            max_attempts: 3,
        };

        let (tx, mut rx) = mpsc::channel(16);
        let mgr = ConnectionManager::new(&agent, &reconnect, tx);
        let mut state = mgr.state();

        let cancel = CancellationToken::new();
        mgr.start(cancel.clone());

        let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("chunk within timeout")
            .expect("channel open");
        assert_eq!(chunk, b"{\"type\":\"noop\"}\n");
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);
        assert_eq!(mgr.attempts(), 0);

        // stop() must suppress reconnection and settle on Disconnected.
        mgr.stop();
        mgr.stop(); // idempotent

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                state.changed().await.expect("state channel open");
                if *state.borrow_and_update() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .expect("disconnected within timeout");

        cancel.cancel();
        server.abort();
    }

    #[tokio::test]
    async fn test_restart_reconnects_with_fresh_attempt_budget() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            // Serve two sessions: the pre-stop connection and the
            // post-restart one.
            for payload in [&b"before\n"[..], &b"after\n"[..]] {
                let (mut sock, _) = listener.accept().await.expect("accept");
                sock.write_all(payload).await.expect("write");
                let mut scratch = [0u8; 16];
                let _ = sock.read(&mut scratch).await;
            }
        });

        let agent = AgentConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let reconnect = ReconnectConfig {
            delay: Duration::from_millis(20),
            max_attempts: 9999,
        };

        let (tx, mut rx) = mpsc::channel(16);
        let mgr = ConnectionManager::new(&agent, &reconnect, tx);
        let mut state = mgr.state();

        let cancel = CancellationToken::new();
        mgr.start(cancel.clone());

        let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first chunk within timeout")
            .expect("channel open");
        assert_eq!(chunk, b"before\n");

        mgr.stop();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                state.changed().await.expect("state channel open");
                if *state.borrow_and_update() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .expect("disconnected within timeout");

        // restart() clears the shutdown flag, zeroes the counter, and
        // dials again without waiting out a reconnect delay.
        mgr.restart();

        let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("post-restart chunk within timeout")
            .expect("channel open");
        assert_eq!(chunk, b"after\n");
        assert_eq!(*mgr.state().borrow(), ConnectionState::Connected);
        assert_eq!(mgr.attempts(), 0);

        cancel.cancel();
        server.abort();
    }

    #[tokio::test]
    async fn test_failed_connect_counts_attempts() {
        // Bind then drop to get a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let agent = AgentConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let reconnect = ReconnectConfig {
            delay: Duration::from_millis(10),
            max_attempts: 9999,
        };

        let (tx, _rx) = mpsc::channel(16);
        let mgr = ConnectionManager::new(&agent, &reconnect, tx);

        let cancel = CancellationToken::new();
        mgr.start(cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), async {
            while mgr.attempts() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("attempts should accumulate");

        cancel.cancel();
    }
}
