//! 定时器服务
//!
//! Min-heap of pending timers driven by one task. Expired timers are published to the
//! message bus as events carrying their id. Cancellation is lazy.

use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bus::MessageBus;
use crate::event::Event;
use crate::traits::TimerService;
use crate::types::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Election,
    Heartbeat,
    LeaderTransfer,
}

#[derive(Debug)]
struct TimerEvent {
    timer_id: TimerId,
    kind: TimerKind,
    trigger_time: Instant,
}

impl PartialEq for TimerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.trigger_time.eq(&other.trigger_time)
    }
}

impl Eq for TimerEvent {}

impl PartialOrd for TimerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // 反转顺序实现最小堆
        other.trigger_time.cmp(&self.trigger_time)
    }
}

struct TimerInner {
    timer_id_counter: AtomicU64,
    timer_heap: Mutex<BinaryHeap<TimerEvent>>,
    cancelled_timers: Mutex<HashSet<TimerId>>,
    notify: Notify,
    bus: MessageBus,
}

#[derive(Clone)]
pub struct Timers {
    inner: Arc<TimerInner>,
}

impl Timers {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                timer_id_counter: AtomicU64::new(1),
                timer_heap: Mutex::new(BinaryHeap::new()),
                cancelled_timers: Mutex::new(HashSet::new()),
                notify: Notify::new(),
                bus,
            }),
        }
    }

    fn add_timer(&self, kind: TimerKind, delay: Duration) -> TimerId {
        let timer_id = self.inner.timer_id_counter.fetch_add(1, Ordering::Relaxed);
        self.inner.timer_heap.lock().push(TimerEvent {
            timer_id,
            kind,
            trigger_time: Instant::now() + delay,
        });
        self.inner.notify.notify_one();
        trace!("Added {:?} timer {} with delay {:?}", kind, timer_id, delay);
        timer_id
    }

    /// Pops expired timers and reports how long until the next one.
    fn process_expired_timers(&self) -> (Vec<TimerEvent>, Option<Duration>) {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut timer_heap = self.inner.timer_heap.lock();
        let mut cancelled = self.inner.cancelled_timers.lock();

        while let Some(timer_event) = timer_heap.peek() {
            if cancelled.remove(&timer_event.timer_id) {
                timer_heap.pop();
                continue;
            }
            if timer_event.trigger_time > now {
                return (events, Some(timer_event.trigger_time - now));
            }
            if let Some(event) = timer_heap.pop() {
                events.push(event);
            }
        }

        (events, None)
    }

    /// Drops cancellation marks of timers that already fired.
    fn cleanup_cancelled(&self) {
        let mut cancelled = self.inner.cancelled_timers.lock();
        if cancelled.len() > 1000 {
            let timer_heap = self.inner.timer_heap.lock();
            let active_ids: HashSet<_> = timer_heap.iter().map(|t| t.timer_id).collect();
            cancelled.retain(|id| active_ids.contains(id));
        }
    }

    /// Runs until `shutdown` is cancelled or the bus consumer goes away.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let (expired, wait) = self.process_expired_timers();
            for timer in expired {
                let event = match timer.kind {
                    TimerKind::Election => Event::ElectionTimeout(timer.timer_id),
                    TimerKind::Heartbeat => Event::HeartbeatTimeout(timer.timer_id),
                    TimerKind::LeaderTransfer => Event::LeaderTransferTimeout(timer.timer_id),
                };
                if !self.inner.bus.publish(event) {
                    debug!("Timer loop exiting: bus is closed");
                    return;
                }
            }
            self.cleanup_cancelled();

            let sleep = tokio::time::sleep(wait.unwrap_or(Duration::from_secs(3600)));
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Timer loop stopped");
                    return;
                }
                _ = sleep => {}
                _ = self.inner.notify.notified() => {}
            }
        }
    }
}

impl TimerService for Timers {
    fn del_timer(&self, timer_id: TimerId) {
        self.inner.cancelled_timers.lock().insert(timer_id);
    }

    fn set_election_timer(&self, dur: Duration) -> TimerId {
        self.add_timer(TimerKind::Election, dur)
    }

    fn set_heartbeat_timer(&self, dur: Duration) -> TimerId {
        self.add_timer(TimerKind::Heartbeat, dur)
    }

    fn set_leader_transfer_timer(&self, dur: Duration) -> TimerId {
        self.add_timer(TimerKind::LeaderTransfer, dur)
    }
}
