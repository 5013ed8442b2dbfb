use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::packet::packet::Packet;
use crate::packet::types::NBR_PRIORITIES;

/// Concurrent handoff structure between the receiving transport and the pool
///  of dispatch workers: one FIFO lane per packet priority, consumed strictly
///  in priority order (lane 0 first).
///
/// `enqueue` is callable from any number of threads concurrently; `dequeue`
///  suspends until an item is available or the queue has been terminated.
///  Termination is permanent and broadcast: every blocked and future dequeue
///  returns no item, even for items still queued or enqueued afterwards.
///
/// The internal mutex is never held across a suspension point.
pub struct PacketQueue {
    inner: Mutex<Lanes>,
    notify: Notify,
}

struct Lanes {
    lanes: [VecDeque<Packet>; NBR_PRIORITIES],
    terminated: bool,
    /// bumped by [PacketQueue::wake_up]; a blocked dequeue observing a bump
    ///  returns without an item
    wake_generation: u64,
}

/// Diagnostic snapshot, O(number of lanes).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueueStatistics {
    pub nbr_queued: usize,
}

impl PacketQueue {
    pub fn new() -> PacketQueue {
        PacketQueue {
            inner: Mutex::new(Lanes {
                lanes: std::array::from_fn(|_| VecDeque::new()),
                terminated: false,
                wake_generation: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Classify by the packet's own priority and append to that lane. Packets
    ///  enqueued after termination are dropped.
    pub fn enqueue(&self, packet: Packet) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminated {
                debug!("enqueue on a terminated queue - dropping {:?}", packet);
                return;
            }
            inner.lanes[packet.priority().lane()].push_back(packet);
        }
        self.notify.notify_waiters();
    }

    /// Wake every currently blocked dequeue without delivering an item; each
    ///  returns `None` and the caller re-checks whatever external condition it
    ///  is watching. Dequeues arriving later are unaffected.
    pub fn wake_up(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.wake_generation += 1;
        }
        self.notify.notify_waiters();
    }

    /// Permanently shut the queue down and wake everyone.
    pub fn terminate(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.terminated = true;
        }
        self.notify.notify_waiters();
    }

    /// Take the next packet, scanning lanes from highest priority to lowest,
    ///  suspending while all lanes are empty. Returns `None` once the queue is
    ///  terminated or when woken by [PacketQueue::wake_up].
    pub async fn dequeue(&self) -> Option<Packet> {
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
                for lane in inner.lanes.iter_mut() {
                    if let Some(packet) = lane.pop_front() {
                        return Some(packet);
                    }
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

    /// Like [PacketQueue::dequeue], but gives up after `max_wait` with no item
    ///  and no side effects.
    pub async fn dequeue_timeout(&self, max_wait: Duration) -> Option<Packet> {
        tokio::time::timeout(max_wait, self.dequeue()).await.unwrap_or(None)
    }

    pub fn statistics(&self) -> QueueStatistics {
        let inner = self.inner.lock().unwrap();
        QueueStatistics {
            nbr_queued: inner.lanes.iter().map(|l| l.len()).sum(),
        }
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::packet::types::{MapId, PacketType, Priority};
    use super::*;

    fn packet_with_priority(priority: u8, marker: u32) -> Packet {
        Packet::request(PacketType::SearchRequest, Priority::new(priority).unwrap(),
                        MapId(marker), &[])
    }

    fn marker_of(packet: &Packet) -> u32 {
        packet.request_map_id().unwrap().0
    }

    #[tokio::test]
    async fn test_strict_priority_across_lanes() {
        let queue = PacketQueue::new();
        queue.enqueue(packet_with_priority(7, 1));
        queue.enqueue(packet_with_priority(0, 2));
        queue.enqueue(packet_with_priority(3, 3));
        queue.enqueue(packet_with_priority(0, 4));

        let order: Vec<u32> = [
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
        ].iter().map(marker_of).collect();

        // lane 0 drains first (in arrival order), then lane 3, then lane 7
        assert_eq!(order, vec![2, 4, 3, 1]);
        assert_eq!(queue.statistics().nbr_queued, 0);
    }

    #[tokio::test]
    async fn test_fifo_within_one_lane() {
        let queue = PacketQueue::new();
        for marker in 0..5 {
            queue.enqueue(packet_with_priority(2, marker));
        }
        for expected in 0..5 {
            assert_eq!(marker_of(&queue.dequeue().await.unwrap()), expected);
        }
    }

    #[tokio::test]
    async fn test_dequeue_suspends_until_enqueue() {
        let queue = Arc::new(PacketQueue::new());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue(packet_with_priority(5, 42));
        let packet = consumer.await.unwrap().unwrap();
        assert_eq!(marker_of(&packet), 42);
    }

    #[tokio::test]
    async fn test_termination_is_absorbing() {
        let queue = PacketQueue::new();
        queue.enqueue(packet_with_priority(1, 1));
        queue.terminate();

        // queued items are not delivered after termination...
        assert!(queue.dequeue().await.is_none());
        // ...and neither are items enqueued afterwards
        queue.enqueue(packet_with_priority(1, 2));
        assert!(queue.dequeue().await.is_none());
        assert!(queue.dequeue_timeout(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_wakes_blocked_dequeues() {
        let queue = Arc::new(PacketQueue::new());
        let consumers: Vec<_> = (0..3).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        }).collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.terminate();
        for consumer in consumers {
            assert!(consumer.await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_wake_up_unblocks_without_item_or_termination() {
        let queue = Arc::new(PacketQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.wake_up();
        assert!(consumer.await.unwrap().is_none());

        // the queue keeps working afterwards
        queue.enqueue(packet_with_priority(4, 7));
        assert_eq!(marker_of(&queue.dequeue().await.unwrap()), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_timeout_expires_empty_handed() {
        let queue = PacketQueue::new();
        assert!(queue.dequeue_timeout(Duration::from_millis(100)).await.is_none());

        queue.enqueue(packet_with_priority(6, 9));
        let packet = queue.dequeue_timeout(Duration::from_millis(100)).await.unwrap();
        assert_eq!(marker_of(&packet), 9);
    }
}
