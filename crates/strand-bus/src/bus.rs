//! Bounded FIFO channels multiplexed over the cooperative scheduler.
//!
//! A [`Bus`] owns a table of channel slots indexed by [`ChannelId`]. Each
//! channel carries a bounded message queue plus two FIFO waiter queues: one
//! for producers parked on a full channel, one for consumers parked on an
//! empty one. Blocking operations re-validate the slot after every resume —
//! a channel closed mid-suspension surfaces as [`BusError::NoChannel`].

use std::cell::RefCell;
use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::sched::{CoroId, SchedHandle};
use crate::{BusError, Result};

/// Index of a channel slot. Slots are reused lowest-first by `channel_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub usize);

struct Channel {
    capacity: usize,
    data: VecDeque<u32>,
    /// Producers parked until the channel is not full, FIFO.
    send_waiters: VecDeque<CoroId>,
    /// Consumers parked until the channel is not empty, FIFO.
    recv_waiters: VecDeque<CoroId>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: VecDeque::new(),
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }
}

#[derive(Default)]
struct Slots {
    channels: Vec<Option<Channel>>,
}

impl Slots {
    fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    fn is_open(&self, id: ChannelId) -> bool {
        matches!(self.channels.get(id.0), Some(Some(_)))
    }
}

/// The bus. Shared across coroutines by reference (typically `Rc<Bus>`).
pub struct Bus {
    sched: SchedHandle,
    slots: RefCell<Slots>,
}

/// Outcome of one non-suspending attempt inside a blocking loop.
enum Attempt<T> {
    Done(T),
    Park,
}

impl Bus {
    pub fn new(sched: SchedHandle) -> Self {
        Self {
            sched,
            slots: RefCell::new(Slots::default()),
        }
    }

    /// Open a channel with the given capacity, reusing the lowest vacant slot
    /// if one exists. The slot table never shrinks.
    pub fn channel_open(&self, capacity: usize) -> ChannelId {
        let mut slots = self.slots.borrow_mut();
        for (i, slot) in slots.channels.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Channel::new(capacity));
                debug!(channel = i, capacity, "channel reopened");
                return ChannelId(i);
            }
        }
        slots.channels.push(Some(Channel::new(capacity)));
        let id = ChannelId(slots.channels.len() - 1);
        debug!(channel = id.0, capacity, "channel opened");
        id
    }

    /// Close a channel. Out-of-range or vacant slots are a no-op. Every
    /// parked producer and consumer is woken; each re-checks the slot on
    /// resume and fails with `NoChannel`. Never suspends.
    pub fn channel_close(&self, id: ChannelId) {
        let waiters = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.channels.get_mut(id.0) else {
                return;
            };
            let Some(chan) = slot.take() else {
                return;
            };
            debug!(
                channel = id.0,
                pending = chan.data.len(),
                waiters = chan.send_waiters.len() + chan.recv_waiters.len(),
                "channel closed"
            );
            chan.send_waiters
                .into_iter()
                .chain(chan.recv_waiters)
                .collect::<Vec<_>>()
        };
        for coro in waiters {
            self.sched.wake(coro);
        }
    }

    /// Close every slot in order.
    pub fn close_all(&self) {
        let count = self.slots.borrow().channels.len();
        for i in 0..count {
            self.channel_close(ChannelId(i));
        }
    }

    /// Send one value, parking while the channel is full.
    pub async fn send(&self, id: ChannelId, value: u32) -> Result<()> {
        if !self.slots.borrow().is_open(id) {
            return Err(BusError::NoChannel);
        }
        loop {
            let attempt = {
                let mut slots = self.slots.borrow_mut();
                let Some(chan) = slots.get_mut(id) else {
                    return Err(BusError::NoChannel);
                };
                if chan.is_full() {
                    chan.send_waiters.push_back(self.sched.current());
                    Attempt::Park
                } else {
                    chan.data.push_back(value);
                    Attempt::Done(chan.recv_waiters.pop_front())
                }
            };
            match attempt {
                Attempt::Done(receiver) => {
                    if let Some(coro) = receiver {
                        self.sched.wake(coro);
                    }
                    return Ok(());
                }
                Attempt::Park => {
                    trace!(channel = id.0, "send parked on full channel");
                    self.sched.suspend().await;
                }
            }
        }
    }

    /// Send one value without parking; `WouldBlock` when full.
    pub fn try_send(&self, id: ChannelId, value: u32) -> Result<()> {
        let receiver = {
            let mut slots = self.slots.borrow_mut();
            let chan = slots.get_mut(id).ok_or(BusError::NoChannel)?;
            if chan.is_full() {
                return Err(BusError::WouldBlock);
            }
            chan.data.push_back(value);
            chan.recv_waiters.pop_front()
        };
        if let Some(coro) = receiver {
            self.sched.wake(coro);
        }
        Ok(())
    }

    /// Receive one value, parking while the channel is empty.
    pub async fn recv(&self, id: ChannelId) -> Result<u32> {
        if !self.slots.borrow().is_open(id) {
            return Err(BusError::NoChannel);
        }
        loop {
            let attempt = {
                let mut slots = self.slots.borrow_mut();
                let Some(chan) = slots.get_mut(id) else {
                    return Err(BusError::NoChannel);
                };
                match chan.data.pop_front() {
                    Some(value) => {
                        let sender = if chan.data.len() < chan.capacity {
                            chan.send_waiters.pop_front()
                        } else {
                            None
                        };
                        Attempt::Done((value, sender))
                    }
                    None => {
                        chan.recv_waiters.push_back(self.sched.current());
                        Attempt::Park
                    }
                }
            };
            match attempt {
                Attempt::Done((value, sender)) => {
                    if let Some(coro) = sender {
                        self.sched.wake(coro);
                    }
                    return Ok(value);
                }
                Attempt::Park => {
                    trace!(channel = id.0, "recv parked on empty channel");
                    self.sched.suspend().await;
                }
            }
        }
    }

    /// Receive one value without parking; `WouldBlock` when empty.
    pub fn try_recv(&self, id: ChannelId) -> Result<u32> {
        let (value, sender) = {
            let mut slots = self.slots.borrow_mut();
            let chan = slots.get_mut(id).ok_or(BusError::NoChannel)?;
            let value = chan.data.pop_front().ok_or(BusError::WouldBlock)?;
            let sender = if chan.data.len() < chan.capacity {
                chan.send_waiters.pop_front()
            } else {
                None
            };
            (value, sender)
        };
        if let Some(coro) = sender {
            self.sched.wake(coro);
        }
        Ok(value)
    }

    /// Batched send: park until at least one slot is free, then push as many
    /// values as fit without suspending mid-batch. Returns how many were sent.
    pub async fn send_v(&self, id: ChannelId, values: &[u32]) -> Result<usize> {
        if !self.slots.borrow().is_open(id) {
            return Err(BusError::NoChannel);
        }
        loop {
            let attempt = {
                let mut slots = self.slots.borrow_mut();
                let Some(chan) = slots.get_mut(id) else {
                    return Err(BusError::NoChannel);
                };
                if chan.is_full() {
                    chan.send_waiters.push_back(self.sched.current());
                    Attempt::Park
                } else {
                    Attempt::Done(push_batch(chan, values))
                }
            };
            match attempt {
                Attempt::Done((sent, receiver)) => {
                    if let Some(coro) = receiver {
                        self.sched.wake(coro);
                    }
                    return Ok(sent);
                }
                Attempt::Park => {
                    trace!(channel = id.0, "send_v parked on full channel");
                    self.sched.suspend().await;
                }
            }
        }
    }

    /// Batched send without parking; `WouldBlock` when full.
    pub fn try_send_v(&self, id: ChannelId, values: &[u32]) -> Result<usize> {
        let (sent, receiver) = {
            let mut slots = self.slots.borrow_mut();
            let chan = slots.get_mut(id).ok_or(BusError::NoChannel)?;
            if chan.is_full() {
                return Err(BusError::WouldBlock);
            }
            push_batch(chan, values)
        };
        if let Some(coro) = receiver {
            self.sched.wake(coro);
        }
        Ok(sent)
    }

    /// Batched receive: park until non-empty, then drain up to `out.len()`
    /// values without suspending. Returns how many were received.
    pub async fn recv_v(&self, id: ChannelId, out: &mut [u32]) -> Result<usize> {
        if !self.slots.borrow().is_open(id) {
            return Err(BusError::NoChannel);
        }
        loop {
            let attempt = {
                let mut slots = self.slots.borrow_mut();
                let Some(chan) = slots.get_mut(id) else {
                    return Err(BusError::NoChannel);
                };
                if chan.data.is_empty() {
                    chan.recv_waiters.push_back(self.sched.current());
                    Attempt::Park
                } else {
                    Attempt::Done(pop_batch(chan, out))
                }
            };
            match attempt {
                Attempt::Done((received, sender)) => {
                    if let Some(coro) = sender {
                        self.sched.wake(coro);
                    }
                    return Ok(received);
                }
                Attempt::Park => {
                    trace!(channel = id.0, "recv_v parked on empty channel");
                    self.sched.suspend().await;
                }
            }
        }
    }

    /// Batched receive without parking; `WouldBlock` when empty.
    pub fn try_recv_v(&self, id: ChannelId, out: &mut [u32]) -> Result<usize> {
        let (received, sender) = {
            let mut slots = self.slots.borrow_mut();
            let chan = slots.get_mut(id).ok_or(BusError::NoChannel)?;
            if chan.data.is_empty() {
                return Err(BusError::WouldBlock);
            }
            pop_batch(chan, out)
        };
        if let Some(coro) = sender {
            self.sched.wake(coro);
        }
        Ok(received)
    }

    /// Send one value to every live channel, atomically from the caller's
    /// perspective: park on the first full channel found and re-evaluate from
    /// scratch after every resume, since channels may have been opened or
    /// closed during the suspension.
    pub async fn broadcast(&self, value: u32) -> Result<()> {
        if !self.any_live() {
            return Err(BusError::NoChannel);
        }
        loop {
            let attempt = {
                let mut slots = self.slots.borrow_mut();
                match scan_for_full(&slots) {
                    Scan::Dead => return Err(BusError::NoChannel),
                    Scan::Full(i) => {
                        let me = self.sched.current();
                        slots.channels[i]
                            .as_mut()
                            .expect("scanned channel is live")
                            .send_waiters
                            .push_back(me);
                        Attempt::Park
                    }
                    Scan::AllHaveRoom => Attempt::Done(push_all(&mut slots, value)),
                }
            };
            match attempt {
                Attempt::Done(receivers) => {
                    for coro in receivers {
                        self.sched.wake(coro);
                    }
                    return Ok(());
                }
                Attempt::Park => {
                    trace!("broadcast parked on a full channel");
                    self.sched.suspend().await;
                }
            }
        }
    }

    /// Broadcast without parking; `WouldBlock` if any live channel is full.
    pub fn try_broadcast(&self, value: u32) -> Result<()> {
        let receivers = {
            let mut slots = self.slots.borrow_mut();
            match scan_for_full(&slots) {
                Scan::Dead => return Err(BusError::NoChannel),
                Scan::Full(_) => return Err(BusError::WouldBlock),
                Scan::AllHaveRoom => push_all(&mut slots, value),
            }
        };
        for coro in receivers {
            self.sched.wake(coro);
        }
        Ok(())
    }

    fn any_live(&self) -> bool {
        self.slots
            .borrow()
            .channels
            .iter()
            .any(|slot| slot.is_some())
    }
}

enum Scan {
    /// No live channel exists.
    Dead,
    /// Index of the first full live channel.
    Full(usize),
    AllHaveRoom,
}

fn scan_for_full(slots: &Slots) -> Scan {
    let mut any_live = false;
    for (i, slot) in slots.channels.iter().enumerate() {
        let Some(chan) = slot else { continue };
        any_live = true;
        if chan.is_full() {
            return Scan::Full(i);
        }
    }
    if any_live {
        Scan::AllHaveRoom
    } else {
        Scan::Dead
    }
}

/// Push into every live channel and collect one receiver to wake per channel.
fn push_all(slots: &mut Slots, value: u32) -> Vec<CoroId> {
    let mut receivers = Vec::new();
    for chan in slots.channels.iter_mut().flatten() {
        chan.data.push_back(value);
        if let Some(coro) = chan.recv_waiters.pop_front() {
            receivers.push(coro);
        }
    }
    receivers
}

/// Push as many values as fit; pick one receiver to wake if data is pending.
fn push_batch(chan: &mut Channel, values: &[u32]) -> (usize, Option<CoroId>) {
    let mut sent = 0;
    while sent != values.len() && !chan.is_full() {
        chan.data.push_back(values[sent]);
        sent += 1;
    }
    let receiver = if chan.data.is_empty() {
        None
    } else {
        chan.recv_waiters.pop_front()
    };
    (sent, receiver)
}

/// Drain up to `out.len()` values; pick one sender to wake if room remains.
fn pop_batch(chan: &mut Channel, out: &mut [u32]) -> (usize, Option<CoroId>) {
    let mut received = 0;
    while received != out.len() {
        match chan.data.pop_front() {
            Some(value) => {
                out[received] = value;
                received += 1;
            }
            None => break,
        }
    }
    let sender = if chan.data.len() < chan.capacity {
        chan.send_waiters.pop_front()
    } else {
        None
    };
    (received, sender)
}
