use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Single-lane variant of the blocking queue contract, for handoffs where
///  ordering across priorities does not matter (e.g. moving completed
///  requests to the answer-delivery worker).
///
/// Same contract as [PacketQueue](crate::queue::packet_queue::PacketQueue):
///  `terminate` is permanent and broadcast, `wake_up` unblocks waiting
///  dequeues without delivering an item.
pub struct Fifo<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

struct Inner<T> {
    items: VecDeque<T>,
    terminated: bool,
    wake_generation: u64,
}

impl<T> Fifo<T> {
    pub fn new() -> Fifo<T> {
        Fifo {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                terminated: false,
                wake_generation: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminated {
                debug!("enqueue on a terminated fifo - dropping the item");
                return;
            }
            inner.items.push_back(item);
        }
        self.notify.notify_waiters();
    }

    /// Unblock every waiting dequeue without delivering an item.
    pub fn wake_up(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.wake_generation += 1;
        }
        self.notify.notify_waiters();
    }

    pub fn terminate(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.terminated = true;
        }
        self.notify.notify_waiters();
    }

    pub async fn dequeue(&self) -> Option<T> {
        let mut observed_wake = None;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if inner.terminated {
                    return None;
                }
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                match observed_wake {
                    None => observed_wake = Some(inner.wake_generation),
                    Some(generation) if generation != inner.wake_generation => return None,
                    Some(_) => {}
                }
            }

            notified.await;
        }
    }

    pub async fn dequeue_timeout(&self, max_wait: Duration) -> Option<T> {
        tokio::time::timeout(max_wait, self.dequeue()).await.unwrap_or(None)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}
