//! Ships logger-bus batches to the remote log service.
//!
//! The shipper is the bus's single consumer. Batches are encoded with the
//! wire format of `cadenza_protocol::log` and written to a persistent
//! authenticated connection. A failed send reconnects with capped
//! backoff and resends the batch; duplicate appends are acceptable, the
//! server treats activity records idempotently. After the bus closes the
//! shipper drains what is left within a grace window, then exits.

use std::time::Duration;

use futures::SinkExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use cadenza_logger::LoggerBus;
use cadenza_protocol::log::encode_batch;

use crate::error::AgentError;
use crate::retry::RetryPolicy;

/// A connected log socket. One batch per `send`.
pub trait LogSocket: Send {
    fn send(
        &mut self,
        batch: &[u8],
    ) -> impl std::future::Future<Output = Result<(), AgentError>> + Send;
}

/// Establishes log sockets; the shipper reconnects through this after a
/// send failure.
pub trait LogConnector: Send + Sync {
    type Socket: LogSocket;

    fn connect(
        &self,
    ) -> impl std::future::Future<Output = Result<Self::Socket, AgentError>> + Send;
}

pub struct LogShipper<C: LogConnector> {
    bus: LoggerBus,
    connector: C,
    policy: RetryPolicy,
    batch_size: usize,
    close_grace: Duration,
}

impl<C: LogConnector> LogShipper<C> {
    pub fn new(
        bus: LoggerBus,
        connector: C,
        policy: RetryPolicy,
        batch_size: usize,
        close_grace: Duration,
    ) -> Self {
        Self {
            bus,
            connector,
            policy,
            batch_size: batch_size.max(1),
            close_grace,
        }
    }

    /// Run until the bus is closed and drained (or the drain grace
    /// expires). Never returns an error: delivery problems are retried
    /// forever while the build runs and abandoned only past the grace.
    pub async fn run(self) {
        let mut socket: Option<C::Socket> = None;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            let entries = self.bus.pop_many(self.batch_size).await;
            if entries.is_empty() {
                // Closed and fully drained.
                break;
            }
            if drain_deadline.is_none() && self.bus.is_closed() {
                drain_deadline = Some(tokio::time::Instant::now() + self.close_grace);
            }

            let batch = encode_batch(&entries);
            if !self.deliver(&mut socket, &batch, drain_deadline).await {
                warn!(
                    remaining = self.bus.len(),
                    "Log drain grace expired, abandoning remaining batches"
                );
                break;
            }
        }

        let dropped = self.bus.dropped();
        if dropped > 0 {
            info!("Log bus shed {dropped} entries under pressure");
        }
    }

    /// Deliver one batch, reconnecting as needed. Returns false when the
    /// drain deadline passed before the batch could be sent.
    async fn deliver(
        &self,
        socket: &mut Option<C::Socket>,
        batch: &[u8],
        deadline: Option<tokio::time::Instant>,
    ) -> bool {
        let mut attempt = 0u32;
        loop {
            if let Some(deadline) = deadline
                && tokio::time::Instant::now() >= deadline
            {
                return false;
            }

            if socket.is_none() {
                match self.connector.connect().await {
                    Ok(connected) => {
                        debug!("Log socket connected");
                        *socket = Some(connected);
                    }
                    Err(e) => {
                        warn!("Log socket connect failed: {e}");
                        self.backoff(&mut attempt).await;
                        continue;
                    }
                }
            }

            match socket.as_mut().unwrap().send(batch).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Log batch send failed, reconnecting: {e}");
                    *socket = None;
                    self.backoff(&mut attempt).await;
                }
            }
        }
    }

    async fn backoff(&self, attempt: &mut u32) {
        let delay = self.policy.delay(*attempt);
        // Cap the exponent; the shipper retries indefinitely.
        *attempt = attempt.saturating_add(1).min(16);
        tokio::time::sleep(delay).await;
    }
}

/// Production socket: a long-lived streaming POST to
/// `https://<host><path>` carrying one body chunk per batch.
pub struct HttpLogSocket {
    chunks: futures::channel::mpsc::Sender<Result<Vec<u8>, std::io::Error>>,
    request: tokio::task::JoinHandle<Result<(), String>>,
}

impl LogSocket for HttpLogSocket {
    async fn send(&mut self, batch: &[u8]) -> Result<(), AgentError> {
        if self.request.is_finished() {
            return Err(AgentError::LogSocket("log stream closed by server".into()));
        }
        self.chunks
            .send(Ok(batch.to_vec()))
            .await
            .map_err(|e| AgentError::LogSocket(format!("log stream broken: {e}")))
    }
}

pub struct HttpLogConnector {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpLogConnector {
    pub fn new(host: &str, path: &str, token: &str) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::LogSocket(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: format!("https://{host}{path}"),
            token: token.to_string(),
        })
    }
}

impl LogConnector for HttpLogConnector {
    type Socket = HttpLogSocket;

    async fn connect(&self) -> Result<HttpLogSocket, AgentError> {
        let (chunks, body_stream) =
            futures::channel::mpsc::channel::<Result<Vec<u8>, std::io::Error>>(16);

        let request = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send();

        // The response only resolves once the body stream ends (or the
        // server hangs up); park it so sends can detect a dead stream.
        let request = tokio::spawn(async move {
            match request.await {
                Ok(response) if response.status().is_success() => Ok(()),
                Ok(response) => Err(format!("log endpoint returned {}", response.status())),
                Err(e) => Err(format!("log stream failed: {e}")),
            }
        });

        Ok(HttpLogSocket { chunks, request })
    }
}

/// Watchable shutdown handle for a spawned shipper (close the bus, then
/// await the signal flipping to `true`).
pub type ShipperDone = watch::Receiver<bool>;

/// Spawn a shipper onto the runtime; returns a receiver that flips to
/// `true` when the shipper has exited.
pub fn spawn_shipper<C: LogConnector + 'static>(shipper: LogShipper<C>) -> ShipperDone {
    let (done_tx, done_rx) = watch::channel(false);
    tokio::spawn(async move {
        shipper.run().await;
        let _ = done_tx.send(true);
    });
    done_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use cadenza_protocol::log::{Level, LogEntry, decode_batch};

    fn msg(text: &str) -> LogEntry {
        LogEntry::Msg {
            level: Level::Info,
            ms: 0,
            text: text.into(),
        }
    }

    /// Records batches; fails every other send when `flaky` is set.
    #[derive(Clone)]
    struct MemoryConnector {
        batches: Arc<Mutex<Vec<Vec<u8>>>>,
        flaky: bool,
        sends: Arc<Mutex<u32>>,
        connects: Arc<Mutex<u32>>,
    }

    impl MemoryConnector {
        fn new(flaky: bool) -> Self {
            Self {
                batches: Arc::new(Mutex::new(Vec::new())),
                flaky,
                sends: Arc::new(Mutex::new(0)),
                connects: Arc::new(Mutex::new(0)),
            }
        }

        fn entries(&self) -> Vec<LogEntry> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|b| decode_batch(b).unwrap())
                .collect()
        }
    }

    struct MemorySocket {
        connector: MemoryConnector,
    }

    impl LogSocket for MemorySocket {
        async fn send(&mut self, batch: &[u8]) -> Result<(), AgentError> {
            let mut sends = self.connector.sends.lock().unwrap();
            *sends += 1;
            if self.connector.flaky && *sends % 2 == 1 {
                return Err(AgentError::LogSocket("flaky".into()));
            }
            self.connector.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    impl LogConnector for MemoryConnector {
        type Socket = MemorySocket;

        async fn connect(&self) -> Result<MemorySocket, AgentError> {
            *self.connects.lock().unwrap() += 1;
            Ok(MemorySocket {
                connector: self.clone(),
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_ships_all_entries_in_order() {
        let bus = LoggerBus::new(64);
        let connector = MemoryConnector::new(false);
        let shipper = LogShipper::new(
            bus.clone(),
            connector.clone(),
            fast_policy(),
            2,
            Duration::from_secs(1),
        );

        for i in 0..7 {
            bus.push(msg(&format!("line {i}")));
        }
        bus.close();
        shipper.run().await;

        let shipped: Vec<_> = connector.entries();
        assert_eq!(shipped.len(), 7);
        for (i, entry) in shipped.iter().enumerate() {
            assert_eq!(entry, &msg(&format!("line {i}")));
        }
    }

    #[tokio::test]
    async fn test_flaky_socket_reconnects_without_losing_batches() {
        let bus = LoggerBus::new(64);
        let connector = MemoryConnector::new(true);
        let shipper = LogShipper::new(
            bus.clone(),
            connector.clone(),
            fast_policy(),
            3,
            Duration::from_secs(5),
        );

        for i in 0..9 {
            bus.push(msg(&format!("line {i}")));
        }
        bus.close();
        shipper.run().await;

        let shipped = connector.entries();
        assert_eq!(shipped.len(), 9, "every entry must survive reconnects");
        assert!(
            *connector.connects.lock().unwrap() > 1,
            "failed sends must reconnect"
        );
    }
}
