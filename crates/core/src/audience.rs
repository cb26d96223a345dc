//! Observer lists.
//!
//! An [`Audience`] owns the callbacks registered with it. Notification walks
//! a snapshot of the list in registration order, so an observer may remove
//! itself (or others) while being notified without disturbing delivery.

use std::fmt;
use std::rc::Rc;

/// Handle returned by [`Audience::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub struct Audience<F: ?Sized> {
    observers: Vec<(ObserverId, Rc<F>)>,
    next_id: u64,
}

impl<F: ?Sized> Audience<F> {
    pub fn new() -> Self {
        Audience {
            observers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn add(&mut self, observer: Rc<F>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Returns false if the observer was not registered.
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Current observers in registration order.
    pub fn snapshot(&self) -> Vec<Rc<F>> {
        self.observers.iter().map(|(_, o)| Rc::clone(o)).collect()
    }

    pub fn notify(&self, mut deliver: impl FnMut(&F)) {
        for observer in self.snapshot() {
            deliver(&observer);
        }
    }
}

impl<F: ?Sized> Default for Audience<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for Audience<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Audience")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Callback = dyn Fn(i32);

    #[test]
    fn test_delivery_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut audience: Audience<Callback> = Audience::new();
        for tag in 0..3 {
            let log = Rc::clone(&log);
            audience.add(Rc::new(move |v| log.borrow_mut().push((tag, v))));
        }
        audience.notify(|cb| cb(7));
        assert_eq!(*log.borrow(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn test_remove() {
        let count = Rc::new(RefCell::new(0));
        let mut audience: Audience<Callback> = Audience::new();
        let c = Rc::clone(&count);
        let id = audience.add(Rc::new(move |_| *c.borrow_mut() += 1));
        assert!(audience.remove(id));
        assert!(!audience.remove(id));
        audience.notify(|cb| cb(1));
        assert_eq!(*count.borrow(), 0);
        assert!(audience.is_empty());
    }
}
