use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::error::{ProcessError, QueueError};
use crate::notify::Notifier;
use crate::userop::UserOpMessage;

/// What a queued message carries.
#[derive(Debug, Clone)]
pub enum Payload {
    UserOp(Box<UserOpMessage>),
    /// Untyped payload from a producer no processor understands yet.
    Raw(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            retry_count: 0,
            payload,
        }
    }

    pub fn user_op(message: UserOpMessage) -> Self {
        Self::new(Payload::UserOp(Box::new(message)))
    }
}

/// Consumer of message batches. Returns the messages that failed, each with
/// its own error; everything not returned counts as processed.
pub trait Processor: Send + Sync + 'static {
    fn process(
        &self,
        batch: Vec<Message>,
    ) -> impl Future<Output = Vec<(Message, ProcessError)>> + Send;
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub capacity: usize,
    pub max_batch_size: usize,
    pub batch_window: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_batch_size: 100,
            batch_window: Duration::from_millis(250),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("queue {queue}: message {id} dropped after {attempts} attempt(s): {source}")]
struct DroppedMessage {
    queue: String,
    id: String,
    attempts: u32,
    source: ProcessError,
}

const LEVEL_NORMAL: u8 = 0;
const LEVEL_ALMOST_FULL: u8 = 1;
const LEVEL_FULL: u8 = 2;

/// Bounded FIFO of messages feeding one batch processor, with retries.
pub struct RetryQueue {
    name: String,
    options: QueueOptions,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    closed: watch::Sender<bool>,
    notifier: Arc<dyn Notifier>,
    level: AtomicU8,
}

impl RetryQueue {
    pub fn new(
        name: impl Into<String>,
        options: QueueOptions,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let (closed, _) = watch::channel(false);

        Self {
            name: name.into(),
            options,
            tx,
            rx: Mutex::new(rx),
            closed,
            notifier,
            level: AtomicU8::new(LEVEL_NORMAL),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Appends a message, waiting while the queue is at capacity.
    pub async fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let id = message.id.clone();
        tokio::select! {
            sent = self.tx.send(message) => {
                sent.map_err(|_| QueueError::Closed(self.name.clone()))?;
            }
            _ = closed.wait_for(|closed| *closed) => {
                return Err(QueueError::Closed(self.name.clone()));
            }
        }

        debug!("Queue {}: enqueued message {}", self.name, id);
        self.check_occupancy();
        Ok(())
    }

    fn check_occupancy(&self) {
        let len = self.len();
        let capacity = self.tx.max_capacity();
        let level = if len >= capacity {
            LEVEL_FULL
        } else if len * 10 >= capacity * 8 {
            LEVEL_ALMOST_FULL
        } else {
            LEVEL_NORMAL
        };

        let previous = self.level.swap(level, Ordering::Relaxed);
        if level <= previous {
            return;
        }

        let state = if level == LEVEL_FULL {
            "full"
        } else {
            "almost full"
        };
        self.notifier.notify(&format!(
            "queue {} is {} ({}/{})",
            self.name, state, len, capacity
        ));
    }

    /// Stops accepting messages. Buffered messages are still delivered once.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(
                "Queue {} closing, {} message(s) buffered",
                self.name,
                self.len()
            );
        }
    }

    /// Delivers batches to `processor` until the queue is closed and drained.
    pub async fn start<P: Processor>(&self, processor: P) {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed.subscribe();
        info!("Queue {} consumer started", self.name);

        loop {
            let first = if *closed.borrow_and_update() {
                match rx.try_recv() {
                    Ok(message) => message,
                    Err(_) => break,
                }
            } else {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = closed.changed() => continue,
                }
            };

            let batch = self.collect_batch(&mut rx, first).await;
            debug!("Queue {}: processing batch of {}", self.name, batch.len());

            let failed = processor.process(batch).await;
            for (message, error) in failed {
                self.handle_failure(message, error);
            }
        }

        info!("Queue {} consumer stopped", self.name);
    }

    async fn collect_batch(
        &self,
        rx: &mut mpsc::Receiver<Message>,
        first: Message,
    ) -> Vec<Message> {
        let mut batch = vec![first];
        let deadline = Instant::now() + self.options.batch_window;

        while batch.len() < self.options.max_batch_size {
            if let Ok(message) = rx.try_recv() {
                batch.push(message);
                continue;
            }
            if self.is_closed() {
                break;
            }
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(message)) => batch.push(message),
                _ => break,
            }
        }

        if self.len() < self.tx.max_capacity() * 8 / 10 {
            self.level.store(LEVEL_NORMAL, Ordering::Relaxed);
        }
        batch
    }

    fn handle_failure(&self, mut message: Message, error: ProcessError) {
        let attempts = message.retry_count + 1;
        let give_up = !error.is_retryable()
            || self.is_closed()
            || message.retry_count >= self.options.max_retries;

        if give_up {
            self.notifier.notify_error(&DroppedMessage {
                queue: self.name.clone(),
                id: message.id,
                attempts,
                source: error,
            });
            return;
        }

        message.retry_count += 1;
        let delay = if self.is_empty() {
            self.options.retry_backoff * message.retry_count
        } else {
            Duration::ZERO
        };
        warn!(
            "Queue {}: message {} failed ({}), retry {} in {:?}",
            self.name, message.id, error, message.retry_count, delay
        );

        // Re-enqueued from a task so a full queue cannot stall the consumer.
        let tx = self.tx.clone();
        let closed = self.closed.subscribe();
        let notifier = self.notifier.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if *closed.borrow() {
                notifier.notify_error(&DroppedMessage {
                    queue: name,
                    id: message.id,
                    attempts,
                    source: error,
                });
                return;
            }
            if let Err(mpsc::error::SendError(message)) = tx.send(message).await {
                notifier.notify_error(&DroppedMessage {
                    queue: name,
                    id: message.id,
                    attempts,
                    source: error,
                });
            }
        });
    }
}
