// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded blocking FIFO used for free slot pools and the output supply queue.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

/// Error returned by [`BoundedQueue::push`], handing the rejected item back.
#[derive(Debug, Error)]
pub enum QueueError<T> {
    #[error("timed out waiting for room in the queue")]
    Timeout(T),
    #[error("queue is inactive")]
    Inactive(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    /// Blocked operations return as soon as the queue is deactivated.
    active: bool,
}

/// A FIFO holding at most `capacity` items.
///
/// Blocking operations take an optional timeout: `None` waits until the operation can complete
/// or the queue is deactivated.
pub struct BoundedQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                capacity,
                active: true,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Appends `item`, waiting up to `timeout` for room if the queue is full.
    pub fn push(&self, item: T, timeout: Option<Duration>) -> Result<(), QueueError<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();

        loop {
            if !state.active {
                return Err(QueueError::Inactive(item));
            }
            if state.items.len() < state.capacity {
                break;
            }
            state = match deadline {
                None => self
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout(item));
                    }
                    self.not_full
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();

        Ok(())
    }

    /// Appends `item` if there is room, without waiting.
    pub fn try_push(&self, item: T) -> Result<(), QueueError<T>> {
        self.push(item, Some(Duration::ZERO))
    }

    /// Puts `item` back at the head of the queue, ignoring capacity and activity.
    ///
    /// Only used to return items previously popped from this same queue.
    pub fn push_front(&self, item: T) {
        self.lock().items.push_front(item);
        self.not_empty.notify_one();
    }

    /// Removes the oldest item, waiting up to `timeout` for one if the queue is empty.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if !state.active {
                return None;
            }
            state = match deadline {
                None => self
                    .not_empty
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.not_empty
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Removes the oldest item if there is one, without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Removes and returns all items.
    pub fn clear(&self) -> Vec<T> {
        let items = self.lock().items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    /// Activates or deactivates the queue. Deactivating wakes every blocked operation.
    pub fn set_active(&self, active: bool) {
        self.lock().active = active;
        if !active {
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn fifo_and_capacity() {
        let queue = BoundedQueue::new("test", 2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert!(matches!(queue.try_push(3), Err(QueueError::Timeout(3))));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Some(1));
        queue.push_front(0);
        assert_eq!(queue.try_pop(), Some(0));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn push_waits_for_room() {
        let queue = Arc::new(BoundedQueue::new("test", 1));
        queue.try_push(1).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.try_pop()
            })
        };

        queue.push(2, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
    }

    #[test]
    fn pop_timeout() {
        let queue = BoundedQueue::<u32>::new("test", 1);
        let start = Instant::now();
        assert_eq!(queue.pop(Some(Duration::from_millis(10))), None);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn deactivate_wakes_waiters() {
        let queue = Arc::new(BoundedQueue::new("test", 1));
        queue.try_push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2, None))
        };

        thread::sleep(Duration::from_millis(20));
        queue.set_active(false);
        assert!(matches!(
            producer.join().unwrap(),
            Err(QueueError::Inactive(2))
        ));

        // Items already queued can still be drained.
        assert_eq!(queue.pop(None), Some(1));
        assert_eq!(queue.pop(None), None);

        queue.set_active(true);
        queue.try_push(3).unwrap();
    }

    #[test]
    fn clear_makes_room() {
        let queue = BoundedQueue::new("test", 2);
        queue.try_push(0).unwrap();
        queue.try_push(1).unwrap();
        assert!(matches!(queue.try_push(2), Err(QueueError::Timeout(2))));

        assert_eq!(queue.clear(), vec![0, 1]);
        assert!(queue.is_empty());
        queue.try_push(2).unwrap();
    }
}
