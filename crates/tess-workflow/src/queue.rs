use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use tess_types::TessError;

/// A message handed to one consumer, pending `ack` or `nak`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub stream: String,
    pub consumer: String,
    pub sequence: u64,
    /// 1 on first delivery.
    pub attempt: u32,
    pub payload: Vec<u8>,
}

/// Durable work queue: every message goes to exactly one consumer of its
/// stream and stays outstanding until acknowledged.
pub trait Queue: Send + Sync + 'static {
    fn add_stream(&self, stream: &str) -> impl Future<Output = Result<(), TessError>> + Send;

    fn add_consumer(
        &self,
        stream: &str,
        consumer: &str,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    fn publish(
        &self,
        stream: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TessError>> + Send;

    /// Waits for the next message; `None` once the queue is closed.
    fn next(
        &self,
        stream: &str,
        consumer: &str,
    ) -> impl Future<Output = Result<Option<Delivery>, TessError>> + Send;

    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), TessError>> + Send;

    /// Returns the message to the stream for redelivery.
    fn nak(&self, delivery: &Delivery) -> impl Future<Output = Result<(), TessError>> + Send;
}

/// Runs `handler` for every message `consumer` receives: acknowledged on
/// `Ok`, negatively acknowledged on `Err`.
pub fn queue_subscribe<Q, F, Fut>(
    queue: Arc<Q>,
    stream: String,
    consumer: String,
    handler: F,
) -> JoinHandle<()>
where
    Q: Queue,
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TessError>> + Send,
{
    tokio::spawn(async move {
        loop {
            let delivery = match queue.next(&stream, &consumer).await {
                Ok(Some(d)) => d,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(stream = %stream, consumer = %consumer, error = %e, "queue receive failed");
                    break;
                }
            };
            let sequence = delivery.sequence;
            let settled = match handler(delivery.payload.clone()).await {
                Ok(()) => queue.ack(&delivery).await,
                Err(e) => {
                    tracing::warn!(stream = %stream, sequence, attempt = delivery.attempt, error = %e, "task failed, requeueing");
                    queue.nak(&delivery).await
                }
            };
            if let Err(e) = settled {
                tracing::error!(stream = %stream, sequence, error = %e, "settling delivery failed");
            }
        }
        tracing::debug!(stream = %stream, consumer = %consumer, "consumer stopped");
    })
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub pending: usize,
    pub in_flight: usize,
    pub acked: u64,
    pub naked: u64,
    pub dropped: u64,
}

struct Message {
    sequence: u64,
    attempt: u32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Stream {
    next_sequence: u64,
    pending: VecDeque<Message>,
    in_flight: HashMap<u64, Message>,
    consumers: BTreeSet<String>,
    stats: StreamStats,
}

/// In-process `Queue` with bounded redelivery.
pub struct MemQueue {
    streams: Mutex<HashMap<String, Stream>>,
    notify: Notify,
    closed: AtomicBool,
    max_deliver: u32,
}

impl Default for MemQueue {
    fn default() -> Self {
        MemQueue::new(5)
    }
}

impl MemQueue {
    /// A message nak'd on its `max_deliver`th attempt is dropped.
    pub fn new(max_deliver: u32) -> Self {
        MemQueue {
            streams: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            max_deliver: max_deliver.max(1),
        }
    }

    pub fn stats(&self, stream: &str) -> Option<StreamStats> {
        self.streams.lock().get(stream).map(|s| StreamStats {
            pending: s.pending.len(),
            in_flight: s.in_flight.len(),
            ..s.stats
        })
    }

    /// Wakes every waiting consumer; `next` returns `None` from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn try_take(&self, stream: &str, consumer: &str) -> Result<Option<Delivery>, TessError> {
        let mut streams = self.streams.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| TessError::Queue(format!("stream {stream} not found")))?;
        if !s.consumers.contains(consumer) {
            return Err(TessError::Queue(format!("consumer {consumer} not registered on {stream}")));
        }
        let Some(mut msg) = s.pending.pop_front() else {
            return Ok(None);
        };
        msg.attempt += 1;
        let delivery = Delivery {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            sequence: msg.sequence,
            attempt: msg.attempt,
            payload: msg.payload.clone(),
        };
        s.in_flight.insert(msg.sequence, msg);
        Ok(Some(delivery))
    }

    fn settle(&self, delivery: &Delivery) -> Result<(Message, parking_lot::MappedMutexGuard<'_, Stream>), TessError> {
        let streams = self.streams.lock();
        let mut s = parking_lot::MutexGuard::try_map(streams, |m| m.get_mut(&delivery.stream))
            .map_err(|_| TessError::Queue(format!("stream {} not found", delivery.stream)))?;
        let msg = s.in_flight.remove(&delivery.sequence).ok_or_else(|| {
            TessError::Queue(format!("message {} is not outstanding", delivery.sequence))
        })?;
        Ok((msg, s))
    }
}

impl Queue for MemQueue {
    async fn add_stream(&self, stream: &str) -> Result<(), TessError> {
        self.streams.lock().entry(stream.to_string()).or_default();
        Ok(())
    }

    async fn add_consumer(&self, stream: &str, consumer: &str) -> Result<(), TessError> {
        let mut streams = self.streams.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| TessError::Queue(format!("stream {stream} not found")))?;
        s.consumers.insert(consumer.to_string());
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<(), TessError> {
        {
            let mut streams = self.streams.lock();
            let s = streams
                .get_mut(stream)
                .ok_or_else(|| TessError::Queue(format!("stream {stream} not found")))?;
            s.next_sequence += 1;
            let sequence = s.next_sequence;
            s.pending.push_back(Message { sequence, attempt: 0, payload });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next(&self, stream: &str, consumer: &str) -> Result<Option<Delivery>, TessError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(delivery) = self.try_take(stream, consumer)? {
                return Ok(Some(delivery));
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TessError> {
        let (_, mut s) = self.settle(delivery)?;
        s.stats.acked += 1;
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> Result<(), TessError> {
        {
            let (msg, mut s) = self.settle(delivery)?;
            s.stats.naked += 1;
            if msg.attempt >= self.max_deliver {
                s.stats.dropped += 1;
                tracing::warn!(stream = %delivery.stream, sequence = msg.sequence, attempts = msg.attempt, "message dropped after max deliveries");
                return Ok(());
            }
            s.pending.push_back(msg);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn queue_with(stream: &str, consumers: &[&str]) -> Arc<MemQueue> {
        let queue = Arc::new(MemQueue::new(3));
        queue.add_stream(stream).await.unwrap();
        for c in consumers {
            queue.add_consumer(stream, c).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn ack_is_exactly_once() {
        let queue = queue_with("s", &["c"]).await;
        queue.publish("s", b"one".to_vec()).await.unwrap();

        let d = queue.next("s", "c").await.unwrap().unwrap();
        assert_eq!((d.payload.as_slice(), d.attempt), (b"one".as_slice(), 1));
        queue.ack(&d).await.unwrap();
        assert!(queue.ack(&d).await.is_err());
        assert!(queue.nak(&d).await.is_err());
        assert_eq!(queue.stats("s").unwrap().acked, 1);
    }

    #[tokio::test]
    async fn nak_redelivers_until_limit() {
        let queue = queue_with("s", &["c"]).await;
        queue.publish("s", b"bad".to_vec()).await.unwrap();

        for attempt in 1..=3 {
            let d = queue.next("s", "c").await.unwrap().unwrap();
            assert_eq!(d.attempt, attempt);
            queue.nak(&d).await.unwrap();
        }
        let stats = queue.stats("s").unwrap();
        assert_eq!((stats.naked, stats.dropped, stats.pending), (3, 1, 0));
    }

    #[tokio::test]
    async fn unknown_stream_or_consumer() {
        let queue = queue_with("s", &["c"]).await;
        assert!(queue.publish("other", Vec::new()).await.is_err());
        assert!(queue.next("s", "stranger").await.is_err());
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish_and_close() {
        let queue = queue_with("s", &["c"]).await;
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next("s", "c").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish("s", b"late".to_vec()).await.unwrap();
        let d = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(d.payload, b"late");

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next("s", "c").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert_eq!(waiter.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn subscriber_acks_success_and_naks_failure() {
        let queue = queue_with("s", &["c"]).await;
        let handle = queue_subscribe(queue.clone(), "s".into(), "c".into(), |payload: Vec<u8>| async move {
            if payload == b"good" {
                Ok(())
            } else {
                Err(TessError::Operation("rejected".into()))
            }
        });
        queue.publish("s", b"good".to_vec()).await.unwrap();
        queue.publish("s", b"bad".to_vec()).await.unwrap();

        for _ in 0..100 {
            let stats = queue.stats("s").unwrap();
            if stats.dropped == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = queue.stats("s").unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.naked, 3);
        assert_eq!(stats.dropped, 1);

        queue.close();
        handle.await.unwrap();
    }
}
