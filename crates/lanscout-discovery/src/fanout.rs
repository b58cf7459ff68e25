//! Subscriber fan-out.
//!
//! A session pump pushes device payloads into a bounded queue; a dispatcher
//! task drains it and invokes every subscriber in registration order. A
//! panicking subscriber is logged and skipped, the others still get the
//! payload.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Subscriber callback, invoked with one device JSON object per update.
pub type DeviceCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifier handed out when a callback subscribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    callback: DeviceCallback,
}

/// Ordered subscriber list of one session.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    list: RwLock<Vec<Subscriber>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, callback: DeviceCallback) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.list.write().push(Subscriber { id, callback });
        id
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    pub fn clear(&self) {
        self.list.write().clear();
    }

    /// Invokes every subscriber with `payload`. Returns how many returned
    /// normally.
    pub fn deliver(&self, service_type: &str, payload: &str, slow_after: Duration) -> usize {
        // Snapshot so a callback may subscribe without deadlocking.
        let subscribers = self.list.read().clone();
        let mut delivered = 0;

        for subscriber in subscribers {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(payload)));
            let elapsed = started.elapsed();

            match outcome {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    service_type = %service_type,
                    subscriber = subscriber.id.0,
                    "Subscriber panicked while handling device update"
                ),
            }

            if elapsed > slow_after {
                warn!(
                    service_type = %service_type,
                    subscriber = subscriber.id.0,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Slow subscriber"
                );
            }
        }

        delivered
    }
}

/// Sending side of a session's fan-out queue.
pub struct Fanout {
    service_type: String,
    tx: async_channel::Sender<String>,
    grace: Duration,
}

impl Fanout {
    /// Creates the queue and spawns its dispatcher. Payloads are delivered
    /// only while `running` is set.
    pub fn spawn(
        service_type: impl Into<String>,
        subscribers: Arc<Subscribers>,
        running: Arc<AtomicBool>,
        capacity: usize,
        grace: Duration,
    ) -> (Self, JoinHandle<()>) {
        let service_type = service_type.into();
        let (tx, rx) = async_channel::bounded::<String>(capacity);

        let task_type = service_type.clone();
        let task = tokio::spawn(async move {
            while let Ok(payload) = rx.recv().await {
                if !running.load(Ordering::SeqCst) {
                    debug!(service_type = %task_type, "Discarding device update after stop");
                    continue;
                }
                subscribers.deliver(&task_type, &payload, grace);
            }
            debug!(service_type = %task_type, "Fan-out dispatcher stopped");
        });

        (
            Self {
                service_type,
                tx,
                grace,
            },
            task,
        )
    }

    /// Queues a payload, waiting at most the grace period for room.
    pub async fn publish(&self, payload: String) -> bool {
        match tokio::time::timeout(self.grace, self.tx.send(payload)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                debug!(service_type = %self.service_type, "Fan-out queue closed");
                false
            }
            Err(_) => {
                warn!(
                    service_type = %self.service_type,
                    grace_ms = self.grace.as_millis() as u64,
                    "Subscribers are not keeping up, dropping device update"
                );
                false
            }
        }
    }

    /// Closes the queue; the dispatcher exits once it has drained it.
    pub fn close(&self) {
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_delivery_order_and_isolation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscribers = Subscribers::new();

        let first = seen.clone();
        subscribers.push(Arc::new(move |p: &str| first.lock().unwrap().push(format!("1:{p}"))));
        subscribers.push(Arc::new(|_: &str| panic!("subscriber bug")));
        let third = seen.clone();
        subscribers.push(Arc::new(move |p: &str| third.lock().unwrap().push(format!("3:{p}"))));

        let delivered = subscribers.deliver("_svc._tcp", "{}", Duration::from_secs(1));

        assert_eq!(delivered, 2);
        assert_eq!(*seen.lock().unwrap(), vec!["1:{}", "3:{}"]);
    }

    #[tokio::test]
    async fn test_dispatcher_stops_delivering_once_not_running() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscribers = Arc::new(Subscribers::new());
        let sink = seen.clone();
        subscribers.push(Arc::new(move |p: &str| sink.lock().unwrap().push(p.to_string())));

        let running = Arc::new(AtomicBool::new(true));
        let (fanout, task) = Fanout::spawn(
            "_svc._tcp",
            subscribers,
            running.clone(),
            4,
            Duration::from_millis(100),
        );

        assert!(fanout.publish("a".to_string()).await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        running.store(false, Ordering::SeqCst);
        assert!(fanout.publish("b".to_string()).await);
        fanout.close();
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_gives_up_after_grace() {
        let subscribers = Arc::new(Subscribers::new());
        let gate = Arc::new(std::sync::Barrier::new(2));
        let blocker = gate.clone();
        subscribers.push(Arc::new(move |_: &str| {
            blocker.wait();
        }));

        let running = Arc::new(AtomicBool::new(true));
        let (fanout, task) = Fanout::spawn(
            "_svc._tcp",
            subscribers,
            running,
            1,
            Duration::from_millis(20),
        );

        // First payload blocks the dispatcher, second fills the queue.
        assert!(fanout.publish("1".to_string()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fanout.publish("2".to_string()).await);
        assert!(!fanout.publish("3".to_string()).await);

        gate.wait();
        gate.wait();
        fanout.close();
        task.await.unwrap();
    }
}
