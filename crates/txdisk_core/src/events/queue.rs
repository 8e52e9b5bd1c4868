//! In-memory side of the event queue.
//!
//! Committed events are sent over a channel to one dispatcher thread. For
//! each event it picks the first interested subscriber, waits for a free
//! delivery slot and hands the delivery to the scheduler. The durable side
//! (enqueue and dequeue records) lives in the log; this queue only holds
//! what is waiting to be delivered in this run.

use super::{EventFilter, EventSubscriber};
use crate::error::TxResult;
use crate::log::QueuedEvent;
use crate::scheduler::WorkScheduler;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Performs one delivery. `None` means no subscriber wanted the event.
pub type DeliverFn = Arc<dyn Fn(QueuedEvent, Option<Arc<dyn EventSubscriber>>) + Send + Sync>;

type Subscribers = RwLock<Vec<(EventFilter, Arc<dyn EventSubscriber>)>>;

/// Bounds the number of deliveries running at once.
#[derive(Debug)]
struct Slots {
    max: usize,
    in_flight: Mutex<usize>,
    cond: Condvar,
    closed: AtomicBool,
}

impl Slots {
    /// Waits for a free slot. Returns false once closed.
    fn acquire(&self) -> bool {
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= self.max && !self.closed.load(Ordering::SeqCst) {
            self.cond.wait(&mut in_flight);
        }
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        *in_flight += 1;
        true
    }

    fn release(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.cond.notify_all();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.in_flight.lock();
        self.cond.notify_all();
    }

    /// Waits until nothing is in flight or `timeout` passes.
    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight.lock();
        while *in_flight > 0 {
            if self.cond.wait_until(&mut in_flight, deadline).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }
}

struct SlotGuard(Arc<Slots>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Events waiting for delivery and the subscribers that receive them.
pub struct EventQueue {
    subscribers: Arc<Subscribers>,
    slots: Arc<Slots>,
    sender: Mutex<Option<Sender<QueuedEvent>>>,
    receiver: Mutex<Option<Receiver<QueuedEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    enqueued: AtomicU64,
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("subscribers", &self.subscribers.read().len())
            .field("enqueued", &self.enqueued.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl EventQueue {
    /// Creates a queue allowing `max_concurrent` deliveries at once.
    /// Events enqueued before [`start`](Self::start) are held.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            slots: Arc::new(Slots {
                max: max_concurrent.max(1),
                in_flight: Mutex::new(0),
                cond: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(None),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Adds a subscriber. Earlier subscribers take precedence.
    pub fn register(&self, filter: EventFilter, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push((filter, subscriber));
        debug!("event subscriber registered");
    }

    /// Queues committed events for delivery.
    pub fn enqueue(&self, events: Vec<QueuedEvent>) {
        if events.is_empty() {
            return;
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            // stopped: the events stay in the log for the next boot
            return;
        };
        for event in events {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            if sender.send(event).is_err() {
                return;
            }
        }
    }

    /// Number of events queued since creation.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::SeqCst)
    }

    /// Starts the dispatcher thread. Does nothing if already started.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(&self, scheduler: Arc<dyn WorkScheduler>, deliver: DeliverFn) -> TxResult<()> {
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        let subscribers = Arc::clone(&self.subscribers);
        let slots = Arc::clone(&self.slots);
        let handle = thread::Builder::new()
            .name("txdisk-event-dispatcher".into())
            .spawn(move || Self::dispatch(&receiver, &subscribers, &slots, scheduler.as_ref(), &deliver))?;
        *self.dispatcher.lock() = Some(handle);
        info!("event dispatcher started");
        Ok(())
    }

    fn dispatch(
        receiver: &Receiver<QueuedEvent>,
        subscribers: &Subscribers,
        slots: &Arc<Slots>,
        scheduler: &dyn WorkScheduler,
        deliver: &DeliverFn,
    ) {
        while let Ok(event) = receiver.recv() {
            if !slots.acquire() {
                break;
            }
            let subscriber = subscribers
                .read()
                .iter()
                .find(|(filter, _)| filter.matches(&event.event))
                .map(|(_, subscriber)| Arc::clone(subscriber));
            let guard = SlotGuard(Arc::clone(slots));
            let deliver = Arc::clone(deliver);
            let event_id = event.id;
            let job = Box::new(move || {
                let _guard = guard;
                deliver(event, subscriber);
            });
            if let Err(e) = scheduler.schedule("txdisk-event-delivery", job) {
                error!(event_id, error = %e, "could not schedule event delivery");
            }
        }
        debug!("event dispatcher stopped");
    }

    /// Stops dispatching and waits up to `timeout` for running
    /// deliveries. Undelivered events remain in the log.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.sender.lock().take();
        self.slots.close();
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!("event dispatcher panicked");
            }
        }
        self.slots.drain(timeout)
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.stop(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventMask, FileStateChangeEvent, SubscriberError};
    use crate::path::ResourcePath;
    use crate::scheduler::ThreadScheduler;
    use crate::session::Session;
    use std::sync::atomic::AtomicUsize;

    fn queued(id: u64, path: &str) -> QueuedEvent {
        QueuedEvent {
            id,
            event: FileStateChangeEvent::new(ResourcePath::parse(path).unwrap(), false, EventMask::CREATED),
        }
    }

    fn noop(_: &FileStateChangeEvent, _: &Session) -> Result<(), SubscriberError> {
        Ok(())
    }

    #[test]
    fn routes_to_first_interested_subscriber() {
        let queue = EventQueue::new(4);
        queue.register(
            EventFilter::new().watch(ResourcePath::parse("/a").unwrap(), EventMask::CREATED),
            Arc::new(noop),
        );
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let deliver: DeliverFn = Arc::new(move |event, subscriber| {
            let _ = tx.lock().send((event.id, subscriber.is_some()));
        });
        queue.enqueue(vec![queued(1, "/a"), queued(2, "/b")]);
        queue.start(Arc::new(ThreadScheduler), deliver).unwrap();

        let mut seen = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![(1, true), (2, false)]);
        assert!(queue.stop(Duration::from_secs(5)));
        assert_eq!(queue.enqueued(), 2);
    }

    #[test]
    fn concurrency_is_bounded() {
        let queue = EventQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let deliver: DeliverFn = {
            let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
            Arc::new(move |_, _| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
        };
        queue.start(Arc::new(ThreadScheduler), deliver).unwrap();
        queue.enqueue((1..=8).map(|i| queued(i, "/x")).collect());
        let deadline = Instant::now() + Duration::from_secs(10);
        while done.load(Ordering::SeqCst) < 8 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
