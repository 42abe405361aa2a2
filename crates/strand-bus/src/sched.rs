//! Single-threaded cooperative scheduler.
//!
//! Coroutines are `'static` non-`Send` futures polled strictly FIFO. A
//! coroutine runs until it finishes or parks itself via [`SchedHandle::suspend`];
//! there is no preemption. [`SchedHandle::wake`] moves a parked coroutine back
//! to the tail of the ready queue in O(1).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use tracing::trace;

/// Identifies a spawned coroutine. Ids are never reused within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoroState {
    /// In the ready queue, waiting to be polled.
    Queued,
    /// Currently being polled.
    Running,
    /// Parked until someone calls `wake`.
    Suspended,
}

struct Coro {
    /// Taken out of the slot while the coroutine is being polled.
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    state: CoroState,
}

#[derive(Default)]
struct Inner {
    coros: Vec<Option<Coro>>,
    ready: VecDeque<CoroId>,
    current: Option<CoroId>,
}

/// The scheduler itself. Owns the coroutines; `run` drives them to completion.
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

/// Cheaply cloneable handle used from inside coroutines to park, wake, and
/// identify themselves.
#[derive(Clone)]
pub struct SchedHandle {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::default())),
        }
    }

    pub fn handle(&self) -> SchedHandle {
        SchedHandle {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Queue a new coroutine. It will not run before `run` is called.
    pub fn spawn<F>(&self, future: F) -> CoroId
    where
        F: Future<Output = ()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = CoroId(inner.coros.len());
        inner.coros.push(Some(Coro {
            future: Some(Box::pin(future)),
            state: CoroState::Queued,
        }));
        inner.ready.push_back(id);
        trace!(coro = id.0, "spawned");
        id
    }

    /// Poll ready coroutines FIFO until none are ready. Coroutines that are
    /// parked and never woken are left in place; the caller can observe them
    /// through return values collected by the coroutines themselves.
    pub fn run(&mut self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            let id = match self.inner.borrow_mut().ready.pop_front() {
                Some(id) => id,
                None => break,
            };

            let mut future = {
                let mut inner = self.inner.borrow_mut();
                let slot = match inner.coros[id.0].as_mut() {
                    Some(slot) => slot,
                    // Finished while a stale entry was still queued.
                    None => continue,
                };
                slot.state = CoroState::Running;
                let future = slot.future.take().expect("coroutine polled reentrantly");
                inner.current = Some(id);
                future
            };

            let poll = future.as_mut().poll(&mut cx);

            let mut inner = self.inner.borrow_mut();
            inner.current = None;
            match poll {
                Poll::Ready(()) => {
                    trace!(coro = id.0, "finished");
                    inner.coros[id.0] = None;
                }
                Poll::Pending => {
                    let slot = inner.coros[id.0].as_mut().expect("live coroutine");
                    slot.future = Some(future);
                    // A wake that arrived mid-poll already re-queued us.
                    if slot.state == CoroState::Running {
                        slot.state = CoroState::Suspended;
                    }
                }
            }
        }
    }
}

impl SchedHandle {
    /// Id of the coroutine currently being polled.
    ///
    /// # Panics
    ///
    /// Panics when called from outside `Scheduler::run`.
    pub fn current(&self) -> CoroId {
        self.inner
            .borrow()
            .current
            .expect("SchedHandle::current called outside a running coroutine")
    }

    /// Move a parked coroutine to the tail of the ready queue. No-op for
    /// finished or already-queued coroutines.
    pub fn wake(&self, id: CoroId) {
        let mut inner = self.inner.borrow_mut();
        let mut queue = false;
        if let Some(slot) = inner.coros.get_mut(id.0).and_then(|s| s.as_mut()) {
            if slot.state != CoroState::Queued {
                slot.state = CoroState::Queued;
                queue = true;
            }
        }
        if queue {
            trace!(coro = id.0, "woken");
            inner.ready.push_back(id);
        }
    }

    /// Park the current coroutine until `wake` is called for it.
    pub fn suspend(&self) -> Suspend {
        Suspend { parked: false }
    }
}

/// Future returned by [`SchedHandle::suspend`]. Pends once, then resolves.
pub struct Suspend {
    parked: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            Poll::Ready(())
        } else {
            self.parked = true;
            Poll::Pending
        }
    }
}

// The scheduler tracks readiness in its own queues; the std waker mechanism is
// unused, so a no-op waker suffices.
fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(|_| RAW, |_| {}, |_| {}, |_| {});
    const RAW: RawWaker = RawWaker::new(std::ptr::null(), &VTABLE);
    unsafe { Waker::from_raw(RAW) }
}
