//! In-process publish/subscribe router.
//!
//! Synchronous publishes run every handler on the caller's thread, in
//! subscription order, over a snapshot of the subscriber list taken when the
//! publish starts. Handlers may subscribe, unsubscribe or publish while being
//! dispatched. Asynchronous publishes hand one job per handler to a fixed
//! pool of dispatcher threads.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};

use crate::event::Event;

pub const DEFAULT_DISPATCH_WORKERS: usize = 4;

/// Something that reacts to events. Any `Fn(&Event) -> anyhow::Result<()>`
/// closure qualifies.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

impl Subscriber {
    fn is(&self, handler: &Arc<dyn EventHandler>) -> bool {
        same_handler(&self.handler, handler)
    }
}

fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    // compare data pointers only; vtables may differ across codegen units
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Outcome of a synchronous publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Handlers invoked, including the ones that failed.
    pub delivered: usize,
    /// One entry per failed or panicking handler.
    pub errors: Vec<String>,
}

impl Delivery {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// At least one handler ran and none of them failed.
    pub fn handled(&self) -> bool {
        self.delivered > 0 && self.errors.is_empty()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct DispatchPool {
    sender: UnboundedSender<Job>,
}

impl DispatchPool {
    fn start(workers: usize) -> Self {
        let (sender, receiver) = unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for index in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let spawned = thread::Builder::new()
                .name(format!("bus-dispatch-{index}"))
                .spawn(move || worker_loop(receiver));
            if let Err(err) = spawned {
                warn!(%err, "could not start bus dispatcher {index}");
            }
        }
        Self { sender }
    }
}

fn worker_loop(receiver: Arc<Mutex<UnboundedReceiver<Job>>>) {
    loop {
        let job = {
            let mut rx = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            rx.blocking_recv()
        };
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

pub struct EventBus {
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    workers: usize,
    pool: OnceLock<DispatchPool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_workers(DEFAULT_DISPATCH_WORKERS)
    }

    /// Bus whose asynchronous deliveries share `workers` dispatcher threads.
    /// The threads are started on the first asynchronous publish.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            workers,
            pool: OnceLock::new(),
        }
    }

    /// Registers `handler` for `name`. Subscribing the same handler twice
    /// returns the id of the first subscription.
    pub fn subscribe(&self, name: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let mut list = self.subscribers.entry(name.to_string()).or_default();
        if let Some(existing) = list.iter().find(|s| s.is(&handler)) {
            return existing.id;
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        list.push(Subscriber { id, handler });
        trace!(event = name, %id, "subscribed");
        id
    }

    pub fn subscribe_fn<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(handler))
    }

    /// Returns false when no such subscription exists.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> bool {
        self.remove_where(name, |s| s.id == id)
    }

    pub fn unsubscribe_handler(&self, name: &str, handler: &Arc<dyn EventHandler>) -> bool {
        self.remove_where(name, |s| s.is(handler))
    }

    fn remove_where(&self, name: &str, pred: impl Fn(&Subscriber) -> bool) -> bool {
        let Some(mut list) = self.subscribers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| !pred(s));
        let removed = list.len() != before;
        let empty = list.is_empty();
        drop(list);
        if empty {
            self.subscribers.remove_if(name, |_, l| l.is_empty());
        }
        removed
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers.get(name).map(|l| l.len()).unwrap_or(0)
    }

    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn snapshot(&self, name: &str) -> Vec<Subscriber> {
        // the shard guard is released before any handler runs
        self.subscribers
            .get(name)
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Delivers the event to every current subscriber before returning.
    pub fn publish(&self, name: &str, payload: Value) -> Delivery {
        let event = Event::new(name, payload);
        let mut delivery = Delivery::default();
        for subscriber in self.snapshot(name) {
            delivery.delivered += 1;
            if let Err(err) = dispatch(&subscriber, &event) {
                delivery.errors.push(err);
            }
        }
        if delivery.delivered == 0 {
            debug!(event = name, "published with no subscribers");
        }
        delivery
    }

    /// Fire-and-forget delivery through the dispatcher pool. Returns the
    /// number of handlers queued; nothing is known about their completion.
    pub fn publish_async(&self, name: &str, payload: Value) -> usize {
        let subscribers = self.snapshot(name);
        if subscribers.is_empty() {
            return 0;
        }
        let event = Arc::new(Event::new(name, payload));
        let pool = self.pool.get_or_init(|| DispatchPool::start(self.workers));
        let mut queued = 0;
        for subscriber in subscribers {
            let event = Arc::clone(&event);
            let job: Job = Box::new(move || {
                let _ = dispatch(&subscriber, &event);
            });
            if pool.sender.send(job).is_ok() {
                queued += 1;
            }
        }
        queued
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.event_names())
            .field("workers", &self.workers)
            .finish()
    }
}

fn dispatch(subscriber: &Subscriber, event: &Event) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| subscriber.handler.handle(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            warn!(event = %event.name, id = %subscriber.id, error = %err, "event handler failed");
            Err(err.to_string())
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            warn!(event = %event.name, id = %subscriber.id, panic = %msg, "event handler panicked");
            Err(format!("handler panicked: {msg}"))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
