//! Asynchronous console shipping.
//!
//! Producers append lines without ever waiting on the network. A background
//! task drains the buffer on a fixed interval and ships each batch in one
//! call. A batch that fails to ship is put back at the front of the buffer
//! and retried on the next flush, so a line may be delivered twice but is
//! never dropped by a transport failure. The buffer is bounded; past its
//! capacity the oldest lines are evicted.

use async_trait::async_trait;
use gantry_config::ConsoleSettings;
use gantry_core::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Remote endpoint appending to a job's console log.
#[async_trait]
pub trait ConsoleTransport: Send + Sync {
    /// Append one newline-joined batch of lines.
    async fn append(&self, content: String) -> Result<()>;
}

struct Buffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    /// Serialises flushes so batches leave in order.
    flushing: tokio::sync::Mutex<()>,
    transport: Arc<dyn ConsoleTransport>,
}

impl Buffer {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        lines.push_back(line);
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    async fn flush(&self) -> bool {
        let _flushing = self.flushing.lock().await;

        let batch: Vec<String> = self.lines.lock().drain(..).collect();
        if batch.is_empty() {
            return true;
        }

        match self.transport.append(batch.join("\n")).await {
            Ok(()) => {
                debug!(lines = batch.len(), "Flushed console output");
                true
            }
            Err(e) => {
                warn!(lines = batch.len(), error = %e, "Console flush failed, will retry");
                self.requeue(batch);
                false
            }
        }
    }

    /// Put a failed batch back ahead of anything queued since it was drained.
    fn requeue(&self, batch: Vec<String>) {
        let mut lines = self.lines.lock();
        let queued = std::mem::take(&mut *lines);
        let mut rebuilt: VecDeque<String> = batch.into();
        rebuilt.extend(queued);
        while rebuilt.len() > self.capacity {
            rebuilt.pop_front();
        }
        *lines = rebuilt;
    }
}

/// Buffers console lines and ships them to the server in the background.
pub struct ConsoleRelay {
    buffer: Arc<Buffer>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleRelay {
    /// Create a relay without a flush task; lines ship only on [`ConsoleRelay::flush`].
    pub fn new(transport: Arc<dyn ConsoleTransport>, capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Buffer {
                lines: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                flushing: tokio::sync::Mutex::new(()),
                transport,
            }),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Create a relay and start its periodic flush task.
    pub fn start(transport: Arc<dyn ConsoleTransport>, settings: &ConsoleSettings) -> Self {
        let relay = Self::new(transport, settings.capacity);
        relay.spawn_flusher(settings.flush_interval);
        relay
    }

    fn spawn_flusher(&self, interval: Duration) {
        let (tx, mut rx) = oneshot::channel();
        let buffer = self.buffer.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        buffer.flush().await;
                    }
                    _ = &mut rx => break,
                }
            }
        });

        *self.shutdown.lock() = Some(tx);
        *self.task.lock() = Some(handle);
    }

    /// Queue one line. Never blocks on the network.
    pub fn consume_line(&self, line: impl Into<String>) {
        self.buffer.push(line.into());
    }

    /// Ship everything buffered now. Returns `false` if the transport failed.
    pub async fn flush(&self) -> bool {
        self.buffer.flush().await
    }

    /// Number of lines waiting to be shipped.
    pub fn len(&self) -> usize {
        self.buffer.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Halt the flush task and ship whatever is left.
    pub async fn stop(&self) {
        let shutdown = self.shutdown.lock().take();
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                warn!(error = %e, "Console flush task ended abnormally");
            }
        }
        if !self.buffer.flush().await {
            warn!(lines = self.len(), "Final console flush failed");
        }
    }
}

impl Drop for ConsoleRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every batch, failing the first `failures` calls.
    #[derive(Default)]
    struct FlakyTransport {
        failures: AtomicUsize,
        batches: Mutex<Vec<String>>,
    }

    impl FlakyTransport {
        fn failing(times: usize) -> Self {
            Self {
                failures: AtomicUsize::new(times),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn delivered_lines(&self) -> Vec<String> {
            self.batches
                .lock()
                .iter()
                .flat_map(|b| b.split('\n').map(String::from).collect::<Vec<_>>())
                .collect()
        }
    }

    #[async_trait]
    impl ConsoleTransport for FlakyTransport {
        async fn append(&self, content: String) -> Result<()> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Transport("connection reset".to_string()));
            }
            self.batches.lock().push(content);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_in_order() {
        let transport = Arc::new(FlakyTransport::failing(1));
        let relay = ConsoleRelay::new(transport.clone(), 10_240);

        for i in 1..=5 {
            relay.consume_line(format!("line {}", i));
        }
        assert!(!relay.flush().await);
        assert_eq!(relay.len(), 5);

        relay.consume_line("line 6");
        assert!(relay.flush().await);

        let expected: Vec<String> = (1..=6).map(|i| format!("line {}", i)).collect();
        assert_eq!(transport.delivered_lines(), expected);
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest_past_capacity() {
        let transport = Arc::new(FlakyTransport::default());
        let relay = ConsoleRelay::new(transport.clone(), 10_240);

        for i in 1..=10_241 {
            relay.consume_line(format!("line {}", i));
        }
        assert_eq!(relay.len(), 10_240);

        relay.flush().await;
        let delivered = transport.delivered_lines();
        assert_eq!(delivered.first().map(String::as_str), Some("line 2"));
        assert_eq!(delivered.last().map(String::as_str), Some("line 10241"));
    }

    #[tokio::test]
    async fn test_requeue_stays_bounded() {
        let transport = Arc::new(FlakyTransport::failing(1));
        let relay = ConsoleRelay::new(transport, 3);

        relay.consume_line("a");
        relay.consume_line("b");
        relay.flush().await;
        relay.consume_line("c");
        relay.consume_line("d");

        assert_eq!(relay.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_call_transport() {
        let transport = Arc::new(FlakyTransport::failing(1));
        let relay = ConsoleRelay::new(transport.clone(), 10);
        assert!(relay.flush().await);
        assert_eq!(transport.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_periodic_flush_and_final_flush_on_stop() {
        let transport = Arc::new(FlakyTransport::default());
        let settings = ConsoleSettings {
            flush_interval: Duration::from_millis(20),
            capacity: 100,
        };
        let relay = ConsoleRelay::start(transport.clone(), &settings);

        relay.consume_line("first");
        for _ in 0..100 {
            if !transport.batches.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(transport.delivered_lines(), vec!["first".to_string()]);

        relay.consume_line("last");
        relay.stop().await;
        assert_eq!(
            transport.delivered_lines(),
            vec!["first".to_string(), "last".to_string()]
        );
    }
}
