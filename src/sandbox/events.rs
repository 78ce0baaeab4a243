//! Event emitter backing `process`, servers, sockets and streams

use crate::loader::Value;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A subscribed callback
pub type Listener = Rc<dyn Fn(&[Value])>;

/// Handle returned by `on`/`once`, accepted by `off`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

struct Registration {
    event: String,
    listener: Listener,
    once: bool,
    /// Subscription order; slab keys are reused and say nothing about it
    seq: u64,
}

#[derive(Default)]
struct EmitterInner {
    listeners: RefCell<Slab<Registration>>,
    next_seq: Cell<u64>,
}

/// on/once/off/emit with subscription-order delivery. Clones share the
/// listener table.
#[derive(Clone, Default)]
pub struct EventEmitter {
    inner: Rc<EmitterInner>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + 'static,
    {
        self.subscribe(event, Rc::new(listener), false)
    }

    /// Subscribe for the next emission only
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&[Value]) + 'static,
    {
        self.subscribe(event, Rc::new(listener), true)
    }

    fn subscribe(&self, event: &str, listener: Listener, once: bool) -> ListenerId {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        let key = self.inner.listeners.borrow_mut().insert(Registration {
            event: event.to_string(),
            listener,
            once,
            seq,
        });
        ListenerId(key)
    }

    /// Unsubscribe. Returns false if the id is not subscribed to `event`.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.borrow_mut();
        match listeners.get(id.0) {
            Some(reg) if reg.event == event => {
                listeners.remove(id.0);
                true
            }
            _ => false,
        }
    }

    pub fn remove_all(&self, event: &str) {
        self.inner
            .listeners
            .borrow_mut()
            .retain(|_, reg| reg.event != event);
    }

    /// Call every listener of `event` in subscription order. Returns
    /// whether there was any.
    ///
    /// Listeners may subscribe, unsubscribe or emit again while running;
    /// the set called is the one subscribed when `emit` started.
    pub fn emit(&self, event: &str, args: &[Value]) -> bool {
        let mut batch: Vec<(u64, Listener)> = Vec::new();
        {
            let mut listeners = self.inner.listeners.borrow_mut();
            let mut spent = Vec::new();
            for (key, reg) in listeners.iter() {
                if reg.event == event {
                    batch.push((reg.seq, reg.listener.clone()));
                    if reg.once {
                        spent.push(key);
                    }
                }
            }
            for key in spent {
                listeners.remove(key);
            }
        }

        batch.sort_by_key(|(seq, _)| *seq);
        for (_, listener) in &batch {
            listener(args);
        }
        !batch.is_empty()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .borrow()
            .iter()
            .filter(|(_, reg)| reg.event == event)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&[Value])>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let make = move |tag: &str| -> Box<dyn Fn(&[Value])> {
            let sink = sink.clone();
            let tag = tag.to_string();
            Box::new(move |args: &[Value]| {
                let arg = args.first().map(Value::display).unwrap_or_default();
                sink.borrow_mut().push(format!("{}:{}", tag, arg));
            })
        };
        (log, make)
    }

    #[test]
    fn test_subscription_order_survives_key_reuse() {
        let emitter = EventEmitter::new();
        let (log, make) = recorder();

        let a = emitter.on("data", make("a"));
        emitter.on("data", make("b"));
        assert!(emitter.off("data", a));
        // Reuses a's slab slot but subscribed last
        emitter.on("data", make("c"));

        emitter.emit("data", &[Value::from("x")]);
        assert_eq!(*log.borrow(), vec!["b:x", "c:x"]);
    }

    #[test]
    fn test_once() {
        let emitter = EventEmitter::new();
        let (log, make) = recorder();
        emitter.once("exit", make("bye"));

        assert!(emitter.emit("exit", &[Value::from(0.0)]));
        assert!(!emitter.emit("exit", &[Value::from(1.0)]));
        assert_eq!(*log.borrow(), vec!["bye:0"]);
        assert_eq!(emitter.listener_count("exit"), 0);
    }

    #[test]
    fn test_off_checks_event() {
        let emitter = EventEmitter::new();
        let id = emitter.on("a", |_| {});
        assert!(!emitter.off("b", id));
        assert!(emitter.off("a", id));
        assert!(!emitter.off("a", id));
    }

    #[test]
    fn test_listener_may_reenter() {
        let emitter = EventEmitter::new();
        let inner = emitter.clone();
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();

        emitter.on("ping", move |_| {
            seen.set(seen.get() + 1);
            inner.on("ping", |_| {});
            inner.emit("pong", &[]);
        });

        emitter.emit("ping", &[]);
        assert_eq!(count.get(), 1);
        assert_eq!(emitter.listener_count("ping"), 2);
    }
}
