//! Event queues: FIFO holding areas for decoded events and failure markers,
//! drained by `dispatch_pending`/`dispatch`/`roundtrip`.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::proxy::{EventArg, Object};

/// One pending item in a queue: either a decoded event bound for a proxy, or
/// a failure marker that must be raised the next time the queue is drained
/// (spec.md §9, "exception-for-control-flow" replaced by tagged markers).
pub enum QueueEntry {
    Event { object: Object, opcode: u16, args: Vec<EventArg> },
    UnknownObject(u32),
    DisplayError {
        object_id: u32,
        /// The offending object as a live proxy handle, if it is still
        /// (or ever was) registered. `None` for id 0 (the server is allowed
        /// to report an unattributed error) or an id the client never saw.
        object: Option<crate::proxy::Proxy>,
        code: u32,
        message: String,
        code_name: Option<String>,
    },
}

/// A cheap, clonable handle to a FIFO queue of pending events. Every proxy
/// is created pointing at some `Queue`; by default that is the connection's
/// default queue, but `Proxy::set_queue` can retarget it at any time.
#[derive(Clone)]
pub struct Queue(Rc<std::cell::RefCell<VecDeque<QueueEntry>>>);

impl Queue {
    pub fn new() -> Self {
        Queue(Rc::new(std::cell::RefCell::new(VecDeque::new())))
    }

    pub fn push(&self, entry: QueueEntry) {
        self.0.borrow_mut().push_back(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn pop_front(&self) -> Option<QueueEntry> {
        self.0.borrow_mut().pop_front()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
