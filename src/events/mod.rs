//! Per-process input event queues.
//!
//! Drivers push events from interrupt context; user processes drain them
//! through the event syscalls. The queue is a fixed-capacity lock-free ring
//! so the push side never blocks.

use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    None = 0,
    KeyDown = 1,
    KeyUp = 2,
    MouseMove = 3,
    MouseButton = 4,
    Tick = 5,
}

/// One input event. `lower`/`upper` carry kind-specific payload (scancode,
/// cursor deltas, button mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub lower: u32,
    pub upper: u32,
}

impl Event {
    pub const fn none() -> Self {
        Event {
            kind: EventKind::None,
            lower: 0,
            upper: 0,
        }
    }
}

pub struct EventQueue {
    queue: ArrayQueue<Event>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Queues an event. When the queue is full the oldest pending events are
    /// kept and the new one is dropped.
    pub fn push(&self, event: Event) {
        if self.queue.push(event).is_err() {
            log::warn!("event queue full, dropping {:?}", event.kind);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Pops the oldest event, or [`Event::none`] when empty.
    pub fn pop(&self) -> Event {
        self.queue.pop().unwrap_or(Event::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_come_out_in_push_order() {
        let q = EventQueue::new(4);
        q.push(Event {
            kind: EventKind::KeyDown,
            lower: 0x1c,
            upper: 0,
        });
        q.push(Event {
            kind: EventKind::KeyUp,
            lower: 0x1c,
            upper: 0,
        });
        assert_eq!(q.pending(), 2);
        assert_eq!(q.pop().kind, EventKind::KeyDown);
        assert_eq!(q.pop().kind, EventKind::KeyUp);
        assert_eq!(q.pop(), Event::none());
    }

    #[test]
    fn full_queue_drops_the_newest() {
        let q = EventQueue::new(2);
        for i in 0..3 {
            q.push(Event {
                kind: EventKind::Tick,
                lower: i,
                upper: 0,
            });
        }
        assert_eq!(q.pending(), 2);
        assert_eq!(q.pop().lower, 0);
        assert_eq!(q.pop().lower, 1);
    }
}
