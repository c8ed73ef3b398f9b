//! Single-threaded cooperative event loop over `poll(2)`.
//!
//! One owning worker thread calls [`EventLoop::run`]; watchers registered for
//! file descriptors get their readiness callbacks on that thread. Producers
//! on other threads interact with the loop only through a wake fd (see
//! [`crate::task_queue`]).

use crate::config::LoopConfig;
use crate::error::Error;
use log::warn;
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Readiness interest reported by [`FdWatcher::on_will_select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchFor(u8);

impl WatchFor {
    pub const NONE: WatchFor = WatchFor(0);
    pub const WRITE: WatchFor = WatchFor(1);
    pub const READ: WatchFor = WatchFor(2);
    pub const READ_WRITE: WatchFor = WatchFor(3);

    pub fn wants_write(self) -> bool {
        self.0 & WatchFor::WRITE.0 != 0
    }

    pub fn wants_read(self) -> bool {
        self.0 & WatchFor::READ.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for WatchFor {
    type Output = WatchFor;

    fn bitor(self, rhs: WatchFor) -> WatchFor {
        WatchFor(self.0 | rhs.0)
    }
}

/// Callbacks for one watched file descriptor. All of them run on the loop
/// worker; none may call [`EventLoop::run`], [`EventLoop::add_watcher`] or
/// [`EventLoop::remove_watcher`].
pub trait FdWatcher {
    /// Called before each poll to pick this iteration's interest. `None`
    /// falls back to the interest given at registration.
    fn on_will_select(&mut self, event_loop: &EventLoop, fd: RawFd) -> Option<WatchFor> {
        let _ = (event_loop, fd);
        None
    }

    fn on_can_read(&mut self, event_loop: &EventLoop, fd: RawFd) {
        let _ = (event_loop, fd);
    }

    fn on_can_write(&mut self, event_loop: &EventLoop, fd: RawFd) {
        let _ = (event_loop, fd);
    }
}

/// Loop lifecycle hooks. `on_start` and `on_stop` fire exactly once per
/// [`EventLoop::run`]; `on_idle` fires on iterations that dispatched nothing.
pub trait LoopHooks {
    fn on_start(&mut self, event_loop: &EventLoop) {
        let _ = event_loop;
    }

    fn on_stop(&mut self, event_loop: &EventLoop) {
        let _ = event_loop;
    }

    fn on_idle(&mut self, event_loop: &EventLoop) {
        let _ = event_loop;
    }
}

struct NoHooks;

impl LoopHooks for NoHooks {}

/// Token returned by [`EventLoop::add_watcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherId(u64);

struct WatcherEntry {
    id: WatcherId,
    fd: RawFd,
    interest: WatchFor,
    // Weak so a watcher registration can't keep its handler alive; the
    // application holds the owning Rc.
    handler: Weak<RefCell<dyn FdWatcher>>,
    active: Cell<bool>,
}

pub struct EventLoop {
    config: LoopConfig,
    hooks: RefCell<Box<dyn LoopHooks>>,
    watchers: RefCell<Vec<Rc<WatcherEntry>>>,
    next_watcher_id: Cell<u64>,
    is_running: Cell<bool>,
    should_stop: Cell<bool>,
    dispatching: Cell<bool>,
    did_work: Cell<bool>,
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Self {
        Self::with_hooks(config, Box::new(NoHooks))
    }

    pub fn with_hooks(config: LoopConfig, hooks: Box<dyn LoopHooks>) -> Self {
        Self {
            config,
            hooks: RefCell::new(hooks),
            watchers: RefCell::new(Vec::new()),
            next_watcher_id: Cell::new(0),
            is_running: Cell::new(false),
            should_stop: Cell::new(false),
            dispatching: Cell::new(false),
            did_work: Cell::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.get()
    }

    pub fn should_stop(&self) -> bool {
        !self.is_running.get() || self.should_stop.get()
    }

    /// Asks a running loop to stop; observed between callbacks and at
    /// iteration boundaries. Only legal from inside a callback or from the
    /// loop thread between iterations.
    pub fn stop(&self) -> Result<(), Error> {
        if !self.is_running.get() {
            return Err(Error::InvalidState("loop is not running"));
        }
        self.should_stop.set(true);
        Ok(())
    }

    /// Marks the current iteration as having done work, suppressing the idle
    /// hook. Used by watchers that consume buffered input from
    /// `on_will_select`, outside the poll's accounting.
    pub fn note_activity(&self) {
        self.did_work.set(true);
    }

    /// Registers a watcher for `fd`. `interest` is the default readiness set
    /// used when the watcher's `on_will_select` returns `None`. Must not be
    /// called from inside an FD callback.
    pub fn add_watcher(
        &self,
        fd: RawFd,
        interest: WatchFor,
        handler: Weak<RefCell<dyn FdWatcher>>,
    ) -> Result<WatcherId, Error> {
        if fd < 0 {
            return Err(Error::InvalidArg("negative fd"));
        }
        if interest.is_none() {
            return Err(Error::InvalidArg("watcher without interest"));
        }
        if self.dispatching.get() {
            return Err(Error::InvalidState("add_watcher from an fd callback"));
        }

        let id = WatcherId(self.next_watcher_id.get());
        self.next_watcher_id.set(id.0 + 1);

        let entry = Rc::new(WatcherEntry {
            id,
            fd,
            interest,
            handler,
            active: Cell::new(true),
        });
        // New watchers go at the head of the list.
        self.watchers.borrow_mut().insert(0, entry);
        Ok(id)
    }

    /// Unregisters a watcher. Must not be called from inside an FD callback.
    pub fn remove_watcher(&self, id: WatcherId) -> Result<(), Error> {
        if self.dispatching.get() {
            return Err(Error::InvalidState("remove_watcher from an fd callback"));
        }
        let mut watchers = self.watchers.borrow_mut();
        match watchers.iter().position(|entry| entry.id == id) {
            Some(index) => {
                watchers[index].active.set(false);
                watchers.remove(index);
                Ok(())
            }
            None => Err(Error::InvalidArg("unknown watcher")),
        }
    }

    /// Runs until [`EventLoop::stop`] is called. `on_start`/`on_stop` fire
    /// exactly once per call, even when the loop exits early.
    pub fn run(&self) -> Result<(), Error> {
        if self.is_running.get() {
            return Err(Error::InvalidState("loop already running"));
        }
        self.is_running.set(true);
        self.should_stop.set(false);

        self.hooks.borrow_mut().on_start(self);
        while self.iterate() {}
        self.hooks.borrow_mut().on_stop(self);

        self.is_running.set(false);
        Ok(())
    }

    // One loop iteration. Returns false when the loop should exit.
    fn iterate(&self) -> bool {
        if self.should_stop.get() {
            return false;
        }

        self.did_work.set(false);

        // Snapshot the registry so callbacks never observe a borrowed list;
        // removals are honored through the per-entry active flag.
        let snapshot: Vec<Rc<WatcherEntry>> = {
            let mut watchers = self.watchers.borrow_mut();
            watchers.retain(|entry| entry.handler.strong_count() > 0);
            watchers.iter().cloned().collect()
        };

        // Will-select pass: collect this iteration's interest per watcher.
        let mut poll_fds: Vec<libc::pollfd> = Vec::with_capacity(snapshot.len());
        let mut polled: Vec<(Rc<WatcherEntry>, usize)> = Vec::with_capacity(snapshot.len());
        for entry in &snapshot {
            let handler = match entry.handler.upgrade() {
                Some(handler) => handler,
                None => continue,
            };
            self.dispatching.set(true);
            let selected = handler.borrow_mut().on_will_select(self, entry.fd);
            self.dispatching.set(false);
            if self.should_stop.get() {
                return false;
            }

            let interest = selected.unwrap_or(entry.interest);
            if interest.is_none() {
                continue;
            }
            let mut events: libc::c_short = 0;
            if interest.wants_read() {
                events |= libc::POLLIN;
            }
            if interest.wants_write() {
                events |= libc::POLLOUT;
            }
            polled.push((Rc::clone(entry), poll_fds.len()));
            poll_fds.push(libc::pollfd { fd: entry.fd, events, revents: 0 });
        }

        let timeout = self.config.poll_timeout_ms.min(i32::MAX as u32) as libc::c_int;
        let ready = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, timeout) };

        if ready > 0 {
            for (entry, index) in &polled {
                if !entry.active.get() {
                    continue;
                }
                let handler = match entry.handler.upgrade() {
                    Some(handler) => handler,
                    None => continue,
                };
                let revents = poll_fds[*index].revents;

                // Writes first, then reads, per watcher.
                if revents & (libc::POLLOUT | libc::POLLERR) != 0 {
                    self.dispatching.set(true);
                    handler.borrow_mut().on_can_write(self, entry.fd);
                    self.dispatching.set(false);
                    if self.should_stop.get() {
                        return false;
                    }
                }
                if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    self.dispatching.set(true);
                    handler.borrow_mut().on_can_read(self, entry.fd);
                    self.dispatching.set(false);
                    if self.should_stop.get() {
                        return false;
                    }
                }
            }
            self.did_work.set(true);
        } else if ready < 0 {
            // Treated the same as a timeout: nothing ready this iteration.
            warn!("poll failed: {}", std::io::Error::last_os_error());
        }

        if self.should_stop.get() {
            return false;
        }

        if !self.did_work.get() {
            self.hooks.borrow_mut().on_idle(self);
            if self.should_stop.get() {
                return false;
            }
        }

        true
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("is_running", &self.is_running.get())
            .field("watchers", &self.watchers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wake::WakeFd;
    use std::os::unix::io::AsRawFd;

    #[derive(Default)]
    struct CountingHooks {
        starts: Rc<Cell<u32>>,
        stops: Rc<Cell<u32>>,
        idles: Rc<Cell<u32>>,
        stop_after_idles: u32,
    }

    impl LoopHooks for CountingHooks {
        fn on_start(&mut self, _event_loop: &EventLoop) {
            self.starts.set(self.starts.get() + 1);
        }

        fn on_stop(&mut self, _event_loop: &EventLoop) {
            self.stops.set(self.stops.get() + 1);
        }

        fn on_idle(&mut self, event_loop: &EventLoop) {
            self.idles.set(self.idles.get() + 1);
            if self.idles.get() >= self.stop_after_idles {
                event_loop.stop().unwrap();
            }
        }
    }

    struct WakeWatcher {
        wake: Rc<WakeFd>,
        reads: u32,
        on_read: Box<dyn FnMut(&EventLoop, u32)>,
    }

    impl FdWatcher for WakeWatcher {
        fn on_can_read(&mut self, event_loop: &EventLoop, _fd: RawFd) {
            self.wake.read().unwrap();
            self.reads += 1;
            (self.on_read)(event_loop, self.reads);
        }
    }

    fn quick_config() -> LoopConfig {
        LoopConfig { poll_timeout_ms: 10 }
    }

    #[test]
    fn start_and_stop_fire_once_per_run() {
        let starts = Rc::new(Cell::new(0));
        let stops = Rc::new(Cell::new(0));
        let idles = Rc::new(Cell::new(0));
        let hooks = CountingHooks {
            starts: Rc::clone(&starts),
            stops: Rc::clone(&stops),
            idles: Rc::clone(&idles),
            stop_after_idles: 1,
        };
        let event_loop = EventLoop::with_hooks(quick_config(), Box::new(hooks));

        event_loop.run().unwrap();
        assert_eq!(starts.get(), 1);
        assert_eq!(stops.get(), 1);
        assert!(idles.get() >= 1);

        event_loop.run().unwrap();
        assert_eq!(starts.get(), 2);
        assert_eq!(stops.get(), 2);
    }

    #[test]
    fn stop_outside_run_is_an_error() {
        let event_loop = EventLoop::new(quick_config());
        assert!(matches!(event_loop.stop(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn ready_fd_dispatches_read_callback() {
        let event_loop = EventLoop::new(quick_config());
        let wake = Rc::new(WakeFd::new(0, true).unwrap());
        wake.write(1).unwrap();

        let watcher = Rc::new(RefCell::new(WakeWatcher {
            wake: Rc::clone(&wake),
            reads: 0,
            on_read: Box::new(|event_loop, _reads| {
                event_loop.stop().unwrap();
            }),
        }));
        let weak_concrete: Weak<RefCell<WakeWatcher>> = Rc::downgrade(&watcher);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        event_loop.add_watcher(wake.as_raw_fd(), WatchFor::READ, weak).unwrap();

        event_loop.run().unwrap();
        assert_eq!(watcher.borrow().reads, 1);
    }

    #[test]
    fn idle_fires_when_nothing_is_ready() {
        let idles = Rc::new(Cell::new(0));
        let hooks = CountingHooks {
            starts: Rc::new(Cell::new(0)),
            stops: Rc::new(Cell::new(0)),
            idles: Rc::clone(&idles),
            stop_after_idles: 3,
        };
        let event_loop = EventLoop::with_hooks(quick_config(), Box::new(hooks));

        // A watcher whose fd never becomes readable.
        let wake = Rc::new(WakeFd::new(0, true).unwrap());
        let watcher = Rc::new(RefCell::new(WakeWatcher {
            wake: Rc::clone(&wake),
            reads: 0,
            on_read: Box::new(|_, _| {}),
        }));
        let weak_concrete: Weak<RefCell<WakeWatcher>> = Rc::downgrade(&watcher);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        event_loop.add_watcher(wake.as_raw_fd(), WatchFor::READ, weak).unwrap();

        event_loop.run().unwrap();
        assert_eq!(idles.get(), 3);
        assert_eq!(watcher.borrow().reads, 0);
    }

    #[test]
    fn add_watcher_rejects_bad_arguments() {
        let event_loop = EventLoop::new(quick_config());
        let wake = Rc::new(WakeFd::new(0, true).unwrap());
        let watcher = Rc::new(RefCell::new(WakeWatcher {
            wake: Rc::clone(&wake),
            reads: 0,
            on_read: Box::new(|_, _| {}),
        }));
        let weak_concrete: Weak<RefCell<WakeWatcher>> = Rc::downgrade(&watcher);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        assert!(matches!(
            event_loop.add_watcher(-1, WatchFor::READ, weak.clone()),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            event_loop.add_watcher(wake.as_raw_fd(), WatchFor::NONE, weak),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn removed_watcher_no_longer_dispatches() {
        let idles = Rc::new(Cell::new(0));
        let hooks = CountingHooks {
            starts: Rc::new(Cell::new(0)),
            stops: Rc::new(Cell::new(0)),
            idles: Rc::clone(&idles),
            stop_after_idles: 2,
        };
        let event_loop = EventLoop::with_hooks(quick_config(), Box::new(hooks));

        let wake = Rc::new(WakeFd::new(0, true).unwrap());
        wake.write(1).unwrap();
        let watcher = Rc::new(RefCell::new(WakeWatcher {
            wake: Rc::clone(&wake),
            reads: 0,
            on_read: Box::new(|_, _| {}),
        }));
        let weak_concrete: Weak<RefCell<WakeWatcher>> = Rc::downgrade(&watcher);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        let id = event_loop.add_watcher(wake.as_raw_fd(), WatchFor::READ, weak).unwrap();
        event_loop.remove_watcher(id).unwrap();
        assert!(matches!(event_loop.remove_watcher(id), Err(Error::InvalidArg(_))));

        event_loop.run().unwrap();
        // The wake stayed readable the whole time; nobody serviced it.
        assert_eq!(watcher.borrow().reads, 0);
    }

    #[test]
    fn dropped_watcher_is_purged() {
        let idles = Rc::new(Cell::new(0));
        let hooks = CountingHooks {
            starts: Rc::new(Cell::new(0)),
            stops: Rc::new(Cell::new(0)),
            idles: Rc::clone(&idles),
            stop_after_idles: 2,
        };
        let event_loop = EventLoop::with_hooks(quick_config(), Box::new(hooks));

        let wake = Rc::new(WakeFd::new(0, true).unwrap());
        wake.write(1).unwrap();
        let watcher = Rc::new(RefCell::new(WakeWatcher {
            wake: Rc::clone(&wake),
            reads: 0,
            on_read: Box::new(|_, _| {}),
        }));
        let weak_concrete: Weak<RefCell<WakeWatcher>> = Rc::downgrade(&watcher);
        let weak: Weak<RefCell<dyn FdWatcher>> = weak_concrete;
        event_loop.add_watcher(wake.as_raw_fd(), WatchFor::READ, weak).unwrap();
        drop(watcher);

        event_loop.run().unwrap();
        assert_eq!(idles.get(), 2);
    }
}
