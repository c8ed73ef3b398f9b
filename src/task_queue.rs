//! Cross-thread task hand-off into the loop worker.
//!
//! A bounded ring of fixed-size slots guarded by a mutex, paired with a
//! counting wake fd registered as a read watcher. Producers on any thread
//! post; the loop worker drains. The wake counter mirrors the number of
//! pending items, so one readiness event services exactly the batch that was
//! pending when it fired and later posts wait for the next event.

use crate::config::TaskQueueConfig;
use crate::error::Error;
use crate::event_loop::{EventLoop, FdWatcher, WatchFor, WatcherId};
use crate::wake::WakeFd;
use log::debug;
use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};

/// Receives drained task payloads on the loop worker.
pub trait TaskHandler {
    fn on_task(&mut self, event_loop: &EventLoop, data: &[u8]);
}

struct Ring {
    slot_bytes: usize,
    capacity: usize,
    // capacity * slot_bytes payload bytes plus one stored length per slot.
    slots: Vec<u8>,
    lens: Vec<usize>,
    head: usize,
    count: usize,
}

impl Ring {
    fn new(config: &TaskQueueConfig) -> Self {
        Self {
            slot_bytes: config.slot_bytes,
            capacity: config.capacity,
            slots: vec![0; config.slot_bytes * config.capacity],
            lens: vec![0; config.capacity],
            head: 0,
            count: 0,
        }
    }

    fn push_tail(&mut self, data: &[u8]) -> bool {
        if self.count == self.capacity {
            return false;
        }
        let raw_idx = (self.head + self.count) % self.capacity;
        let slot = raw_idx * self.slot_bytes;
        self.slots[slot..slot + data.len()].copy_from_slice(data);
        self.lens[raw_idx] = data.len();
        self.count += 1;
        true
    }

    fn pop_head(&mut self, bounce: &mut [u8]) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let slot = self.head * self.slot_bytes;
        let len = self.lens[self.head];
        bounce[..len].copy_from_slice(&self.slots[slot..slot + len]);
        self.head = (self.head + 1) % self.capacity;
        self.count -= 1;
        Some(len)
    }
}

struct Shared {
    ring: Mutex<Ring>,
    wake: WakeFd,
}

/// Posting handle; cheap to clone and usable from any thread.
#[derive(Clone)]
pub struct TaskPoster {
    shared: Arc<Shared>,
}

impl TaskPoster {
    /// Copies `data` into the queue and wakes the loop. `data` must fit one
    /// slot. Returns [`Error::QueueFull`] when the ring is at capacity.
    pub fn post(&self, data: &[u8]) -> Result<(), Error> {
        let mut ring = self.shared.ring.lock().map_err(|_| Error::InvalidState("queue poisoned"))?;
        if data.len() > ring.slot_bytes {
            return Err(Error::InvalidArg("task larger than slot"));
        }
        if !ring.push_tail(data) {
            return Err(Error::QueueFull);
        }
        // Count the item while still holding the lock, so the drain's
        // sampled count and the wake counter stay in step.
        self.shared.wake.write(1)?;
        Ok(())
    }
}

/// The consumer half, registered with the loop as a read watcher on the wake
/// fd. Dropping it (after removing the watcher) shuts the queue down.
pub struct TaskQueue<H: TaskHandler> {
    shared: Arc<Shared>,
    bounce: Vec<u8>,
    handler: H,
    watcher_id: Option<WatcherId>,
}

impl<H: TaskHandler + 'static> TaskQueue<H> {
    /// Creates the queue and registers its wake watcher with `event_loop`.
    pub fn new(
        event_loop: &Rc<EventLoop>,
        config: TaskQueueConfig,
        handler: H,
    ) -> Result<Rc<RefCell<Self>>, Error> {
        config.validate()?;

        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring::new(&config)),
            wake: WakeFd::new(0, true)?,
        });

        let queue = Rc::new(RefCell::new(Self {
            shared,
            bounce: vec![0; config.slot_bytes],
            handler,
            watcher_id: None,
        }));

        let weak_concrete: Weak<RefCell<Self>> = Rc::downgrade(&queue);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        let fd = queue.borrow().shared.wake.as_raw_fd();
        let watcher_id = event_loop.add_watcher(fd, WatchFor::READ, weak)?;
        queue.borrow_mut().watcher_id = Some(watcher_id);
        Ok(queue)
    }

    pub fn poster(&self) -> TaskPoster {
        TaskPoster { shared: Arc::clone(&self.shared) }
    }

    /// The registration to pass to [`EventLoop::remove_watcher`] on shutdown.
    pub fn watcher_id(&self) -> Option<WatcherId> {
        self.watcher_id
    }

    fn drain(&mut self, event_loop: &EventLoop) {
        let mut ring = match self.shared.ring.lock() {
            Ok(ring) => ring,
            Err(_) => return,
        };

        // The batch is what was pending when the readiness event fired;
        // items posted during the callbacks below wait for the next event.
        let pending = ring.count;
        if pending == 0 {
            return;
        }
        let woken = match self.shared.wake.read() {
            Ok(value) => value,
            Err(err) => {
                debug!("wake drain failed: {}", err);
                return;
            }
        };
        // One write per post, so the counter matches the pending count —
        // unless an earlier drain broke off for a loop stop, which leaves
        // items behind without counter backing.
        debug_assert!(woken <= pending as u64);

        for _ in 0..pending {
            let len = match ring.pop_head(&mut self.bounce) {
                Some(len) => len,
                None => break,
            };
            // The callback runs without the lock so producers never wait on
            // user code.
            drop(ring);
            self.handler.on_task(event_loop, &self.bounce[..len]);
            if event_loop.should_stop() {
                return;
            }
            ring = match self.shared.ring.lock() {
                Ok(ring) => ring,
                Err(_) => return,
            };
        }
    }
}

impl<H: TaskHandler + 'static> FdWatcher for TaskQueue<H> {
    fn on_can_read(&mut self, event_loop: &EventLoop, _fd: RawFd) {
        self.drain(event_loop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use std::cell::Cell;
    use std::thread;

    struct Recorder {
        seen: Rc<RefCell<Vec<Vec<u8>>>>,
        stop_after: usize,
    }

    impl TaskHandler for Recorder {
        fn on_task(&mut self, event_loop: &EventLoop, data: &[u8]) {
            self.seen.borrow_mut().push(data.to_vec());
            if self.seen.borrow().len() >= self.stop_after {
                event_loop.stop().unwrap();
            }
        }
    }

    fn small_config() -> TaskQueueConfig {
        TaskQueueConfig { slot_bytes: 8, capacity: 4 }
    }

    #[test]
    fn config_is_validated() {
        let event_loop = Rc::new(EventLoop::new(LoopConfig::default()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let bad = TaskQueueConfig { slot_bytes: 0, capacity: 4 };
        assert!(TaskQueue::new(&event_loop, bad, Recorder { seen, stop_after: 1 }).is_err());
    }

    #[test]
    fn posts_are_delivered_in_fifo_order() {
        let event_loop = Rc::new(EventLoop::new(LoopConfig { poll_timeout_ms: 10 }));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let queue = TaskQueue::new(
            &event_loop,
            small_config(),
            Recorder { seen: Rc::clone(&seen), stop_after: 3 },
        )
        .unwrap();
        let poster = queue.borrow().poster();

        let producer = thread::spawn(move || {
            for payload in [b"one".as_slice(), b"two", b"three"] {
                poster.post(payload).unwrap();
            }
        });
        producer.join().unwrap();

        event_loop.run().unwrap();
        assert_eq!(*seen.borrow(), vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn oversized_post_is_rejected() {
        let event_loop = Rc::new(EventLoop::new(LoopConfig::default()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let queue = TaskQueue::new(&event_loop, small_config(), Recorder { seen, stop_after: 1 }).unwrap();
        let poster = queue.borrow().poster();
        assert!(matches!(poster.post(&[0u8; 9]), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn full_queue_rejects_the_post() {
        let event_loop = Rc::new(EventLoop::new(LoopConfig::default()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let queue = TaskQueue::new(&event_loop, small_config(), Recorder { seen, stop_after: 1 }).unwrap();
        let poster = queue.borrow().poster();

        for i in 0..4u8 {
            poster.post(&[i]).unwrap();
        }
        assert!(matches!(poster.post(&[4]), Err(Error::QueueFull)));
    }

    struct CountAndRepost {
        poster: Option<TaskPoster>,
        delivered: Rc<Cell<usize>>,
    }

    impl TaskHandler for CountAndRepost {
        fn on_task(&mut self, event_loop: &EventLoop, _data: &[u8]) {
            let n = self.delivered.get() + 1;
            self.delivered.set(n);
            if n == 3 {
                // A post after the batch was sampled waits for the next
                // readiness event.
                self.poster.take().unwrap().post(b"late").unwrap();
            }
            if n == 4 {
                event_loop.stop().unwrap();
            }
        }
    }

    #[test]
    fn batch_post_wakes_once_and_later_posts_wake_again() {
        let event_loop = Rc::new(EventLoop::new(LoopConfig { poll_timeout_ms: 10 }));
        let delivered = Rc::new(Cell::new(0));
        let queue = TaskQueue::new(
            &event_loop,
            small_config(),
            CountAndRepost { poster: None, delivered: Rc::clone(&delivered) },
        )
        .unwrap();
        let poster = queue.borrow().poster();
        queue.borrow_mut().handler.poster = Some(poster.clone());

        let producer = thread::spawn(move || {
            for i in 0..3u8 {
                poster.post(&[i]).unwrap();
            }
        });
        producer.join().unwrap();

        event_loop.run().unwrap();
        assert_eq!(delivered.get(), 4);
    }
}
