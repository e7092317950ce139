// SPDX-License-Identifier: MIT
//
// `IpcCore<P>`: the singleton-per-CPU owner of the block pool, channel
// registry, and the two queues (`send_q`, `recv_staging_q`) that used to
// be process-wide statics in `fifosystem.c` (spec §9's "Global mutable
// state" note). One `Mutex<Inner>` stands in for the critical section
// that, on real hardware, is just masked interrupts — holding the lock
// and calling `Port::enter_critical`/`leave_critical` together give a
// hosted, multi-threaded test harness the same mutual exclusion a single
// CPU gets from masking its own interrupts for free.
//
// `wait_alloc`'s suspension (spec §4.1/§9) is a `Condvar` owned by this
// type, notified by `on_send_irq` once it has freed at least one block.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::block::{BlockPool, Control, Queue, TERM};
use crate::channel::ChannelRegistry;
use crate::error::{ChannelError, SendError};
use crate::port::{CriticalGuard, IrqVector, Port};
use crate::spin_lock::ChannelMutex;
use crate::{recv, reset, send, wire};
use crate::wire::WireWord;
use crate::{C, MAX_DATAMSG_WORDS};

pub(crate) struct Inner {
    pool: BlockPool,
    channels: ChannelRegistry,
    send_q: Queue,
    recv_staging_q: Queue,
    /// Single-level reentrancy guard for the receive IRQ (spec §4.3).
    processing: bool,
}

/// The singleton-per-CPU engine. One instance per side of the FIFO link;
/// the two instances never share memory, only the `Port` they're each
/// wired to.
pub struct IpcCore<P: Port> {
    inner: Mutex<Inner>,
    send_cv: Condvar,
    port: P,
    /// One cooperative mutex per channel (spec §4.4's `acquire`/`release`),
    /// kept outside `inner` so a caller blocked in `ChannelMutex::acquire`
    /// never holds `inner`'s lock and stalls every other channel and API
    /// call behind it.
    channel_mutexes: Box<[ChannelMutex]>,
}

impl<P: Port + Send + Sync + 'static> IpcCore<P> {
    /// `init()` (spec §4.5): clear the hardware FIFO, reset all pool and
    /// channel state, install the IRQ vectors, and enable delivery.
    pub fn init(port: P) -> Arc<Self> {
        port.clear();
        let inner = Inner {
            pool: BlockPool::new(),
            channels: ChannelRegistry::new(),
            send_q: Queue::empty(),
            recv_staging_q: Queue::empty(),
            processing: false,
        };
        let mut channel_mutexes = Vec::with_capacity(C);
        channel_mutexes.resize_with(C, ChannelMutex::new);
        let core = Arc::new(Self {
            inner: Mutex::new(inner),
            send_cv: Condvar::new(),
            port,
            channel_mutexes: channel_mutexes.into_boxed_slice(),
        });

        let for_send = Arc::clone(&core);
        core.port.register_irq(IrqVector::SendEmpty, Box::new(move || for_send.on_send_irq()));
        let for_recv = Arc::clone(&core);
        core.port.register_irq(IrqVector::RecvNotEmpty, Box::new(move || for_recv.on_recv_irq()));
        core.port.set_irq_enabled(IrqVector::SendEmpty, true);
        core.port.set_irq_enabled(IrqVector::RecvNotEmpty, true);

        log::debug!("fifo_ipc: init complete ({} blocks, {} channels)", crate::N_BLOCKS, C);
        core
    }

    // ---------------------------------------------------------------
    // Send side
    // ---------------------------------------------------------------

    /// Frame `words` (a header word plus zero or more follow-up words) onto
    /// `send_q` atomically, then arm the send-empty IRQ.
    ///
    /// Per scenario S6 / testable property 6, a transient shortfall of free
    /// blocks blocks the caller (via `wait_alloc`'s condvar) rather than
    /// failing fast — see `DESIGN.md` for why this crate reads §4.2's
    /// "return would-block (false)" precheck as covering only structurally
    /// oversized requests, not ordinary pool pressure.
    fn internal_send(&self, words: &[u32]) -> bool {
        let needed = words.len();
        if needed == 0 || needed > 1 + MAX_DATAMSG_WORDS {
            log::warn!("internal_send: rejecting structurally invalid word count {needed}");
            return false;
        }

        let mut token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();

        let mut blocks = Vec::with_capacity(needed);
        while blocks.len() < needed {
            match inner.pool.alloc() {
                Some(b) => blocks.push(b),
                None => {
                    log::debug!("internal_send: pool exhausted, blocking in wait_alloc");
                    self.port.arm_send_irq();
                    // Mirrors the original's `REG_IME = 1; swiIntrWait(...); REG_IME = 0;`:
                    // interrupts must be unmasked while parked, or the send-empty IRQ that
                    // wakes this wait can never fire.
                    self.port.leave_critical(token);
                    inner = self.send_cv.wait(inner).unwrap();
                    token = self.port.enter_critical();
                }
            }
        }

        for (&block, &word) in blocks.iter().zip(words) {
            inner.pool.set_data(block, word);
            let Inner { pool, send_q, .. } = &mut *inner;
            pool.enqueue(send_q, block);
        }
        self.port.arm_send_irq();

        drop(inner);
        self.port.leave_critical(token);
        true
    }

    /// Send an `ADDRESS` message. Validates `channel < C` and that `addr`
    /// lies in the 16 MiB window (spec §6).
    pub fn send_address(&self, channel: u32, addr: u32) -> bool {
        if channel as usize >= C {
            log::warn!("send_address: {:?}", SendError::ChannelOutOfRange);
            return false;
        }
        if !wire::is_address_in_window(addr) {
            log::warn!("send_address: {:?}", SendError::AddressOutOfRange);
            return false;
        }
        self.internal_send(&[wire::pack_address(channel, addr)])
    }

    /// Send a `VALUE32` message, inline if it fits the 25-bit payload,
    /// otherwise as a header plus one full-width extra word.
    pub fn send_value32(&self, channel: u32, value: u32) -> bool {
        if channel as usize >= C {
            log::warn!("send_value32: {:?}", SendError::ChannelOutOfRange);
            return false;
        }
        if wire::value32_needs_extra(value) {
            self.internal_send(&[wire::pack_value32_extra_header(channel), value])
        } else {
            self.internal_send(&[wire::pack_value32_inline(channel, value)])
        }
    }

    /// Send a `DATAMSG` of `bytes.len()` bytes (`< FIFO_MAX_DATA_BYTES`),
    /// zero-padding the tail word. Length 0 is legal (a header-only message).
    pub fn send_datamsg(&self, channel: u32, bytes: &[u8]) -> bool {
        if channel as usize >= C {
            log::warn!("send_datamsg: {:?}", SendError::ChannelOutOfRange);
            return false;
        }
        if bytes.len() >= crate::FIFO_MAX_DATA_BYTES {
            log::warn!("send_datamsg: {:?} ({} bytes)", SendError::PayloadTooLarge, bytes.len());
            return false;
        }

        let len = bytes.len() as u32;
        let w = wire::words_for_len(len) as usize;
        let mut words = [0u32; 1 + MAX_DATAMSG_WORDS];
        words[0] = wire::pack_datamsg_header(channel, len);
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut buf = [0u8; 4];
            buf[..chunk.len()].copy_from_slice(chunk);
            words[1 + i] = u32::from_le_bytes(buf);
        }
        self.internal_send(&words[..1 + w])
    }

    fn on_send_irq(&self) {
        let token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();
        if inner.send_q.is_empty() {
            self.port.disarm_send_irq();
            drop(inner);
            self.port.leave_critical(token);
            return;
        }
        let freed = {
            let Inner { pool, send_q, .. } = &mut *inner;
            send::drain_to_hardware(pool, send_q, &self.port)
        };
        if inner.send_q.is_empty() {
            self.port.disarm_send_irq();
        }
        drop(inner);
        if freed > 0 {
            self.send_cv.notify_all();
        }
        self.port.leave_critical(token);
    }

    // ---------------------------------------------------------------
    // Receive side
    // ---------------------------------------------------------------

    fn on_recv_irq(&self) {
        let token = self.port.enter_critical();
        let nested = {
            let mut inner = self.inner.lock().unwrap();
            {
                let Inner { pool, recv_staging_q, .. } = &mut *inner;
                recv::drain_phase(pool, recv_staging_q, &self.port);
            }
            let nested = inner.processing;
            if !nested {
                inner.processing = true;
            }
            nested
        };
        self.port.leave_critical(token);

        if nested {
            // Nested IRQ entry: the drain above is all a reentrant call does.
            return;
        }

        self.parse_loop();

        let token = self.port.enter_critical();
        self.inner.lock().unwrap().processing = false;
        self.port.leave_critical(token);
    }

    /// Walks `recv_staging_q` classifying and delivering one message at a
    /// time (spec §4.3). Re-enters the critical section/lock around every
    /// step except the handler invocation itself, which spec §4.3/§5
    /// requires to run with interrupts re-enabled.
    fn parse_loop(&self) {
        let mut token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.recv_staging_q.is_empty() {
                break;
            }
            let head = inner.recv_staging_q.head;
            let word = inner.pool.data(head);

            match wire::classify(word) {
                WireWord::Special { command } => {
                    {
                        let Inner { pool, recv_staging_q, .. } = &mut *inner;
                        pool.pop_head(recv_staging_q);
                    }
                    inner.pool.free(head);
                    if command == wire::PEER_REQUESTS_RESET {
                        drop(inner);
                        self.port.leave_critical(token);
                        reset::run_rendezvous(&self.port);
                    }
                    // Other specials are currently ignored.
                }
                WireWord::Address { channel, addr } => {
                    {
                        let Inner { pool, recv_staging_q, .. } = &mut *inner;
                        pool.pop_head(recv_staging_q);
                    }
                    let (new_inner, new_token) = self.deliver_address(inner, token, channel, head, addr);
                    inner = new_inner;
                    token = new_token;
                }
                WireWord::Value32Inline { channel, value } => {
                    {
                        let Inner { pool, recv_staging_q, .. } = &mut *inner;
                        pool.pop_head(recv_staging_q);
                    }
                    let (new_inner, new_token) = self.deliver_value32(inner, token, channel, head, value);
                    inner = new_inner;
                    token = new_token;
                }
                WireWord::Value32Extra { channel } => {
                    let next = inner.pool.next(head);
                    if next == TERM {
                        // Data word hasn't arrived yet; retry on the next IRQ entry.
                        break;
                    }
                    {
                        let Inner { pool, recv_staging_q, .. } = &mut *inner;
                        pool.pop_head(recv_staging_q);
                    }
                    inner.pool.free(head);
                    {
                        let Inner { pool, recv_staging_q, .. } = &mut *inner;
                        pool.pop_head(recv_staging_q);
                    }
                    let value = inner.pool.data(next);
                    let (new_inner, new_token) = self.deliver_value32(inner, token, channel, next, value);
                    inner = new_inner;
                    token = new_token;
                }
                WireWord::DatamsgHeader { channel, len } => {
                    let w = wire::words_for_len(len);
                    match recv::find_nth_successor(&inner.pool, head, w) {
                        None => break, // Run not fully arrived yet; retry later.
                        Some(last) => {
                            for _ in 0..=w {
                                let Inner { pool, recv_staging_q, .. } = &mut *inner;
                                pool.pop_head(recv_staging_q);
                            }
                            let first_data = if w == 0 { head } else { inner.pool.next(head) };
                            if w > 0 {
                                inner.pool.free(head);
                            }
                            inner.pool.set_control_keep_next(first_data, Control::DataStart, len);
                            {
                                let Inner { pool, channels, .. } = &mut *inner;
                                pool.splice(&mut channels.get_mut(channel).data_q, first_data, last);
                            }

                            let (new_inner, new_token) = self.deliver_datamsg(inner, token, channel, len);
                            inner = new_inner;
                            token = new_token;
                        }
                    }
                }
            }
        }

        drop(inner);
        self.port.leave_critical(token);
    }

    /// Deliver a decoded `ADDRESS` payload: dispatch to the installed
    /// handler with the critical section released, or splice the block
    /// into `address_q[channel]` for polling.
    fn deliver_address<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        token: CriticalGuard,
        channel: u32,
        block: u16,
        addr: u32,
    ) -> (MutexGuard<'a, Inner>, CriticalGuard) {
        match inner.channels.get_mut(channel).address_fn.begin_call() {
            Some((mut handler, snapshot)) => {
                inner.pool.free(block);
                drop(inner);
                self.port.leave_critical(token);

                handler(addr);

                let token = self.port.enter_critical();
                let mut inner = self.inner.lock().unwrap();
                inner.channels.get_mut(channel).address_fn.end_call(handler, snapshot);
                (inner, token)
            }
            None => {
                inner.pool.set_data(block, addr);
                {
                    let Inner { pool, channels, .. } = &mut *inner;
                    pool.enqueue(&mut channels.get_mut(channel).address_q, block);
                }
                (inner, token)
            }
        }
    }

    /// Deliver a decoded `VALUE32` payload (inline or extra-word path share
    /// this once the value and its carrying block are known).
    fn deliver_value32<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        token: CriticalGuard,
        channel: u32,
        block: u16,
        value: u32,
    ) -> (MutexGuard<'a, Inner>, CriticalGuard) {
        match inner.channels.get_mut(channel).value32_fn.begin_call() {
            Some((mut handler, snapshot)) => {
                inner.pool.free(block);
                drop(inner);
                self.port.leave_critical(token);

                handler(value);

                let token = self.port.enter_critical();
                let mut inner = self.inner.lock().unwrap();
                inner.channels.get_mut(channel).value32_fn.end_call(handler, snapshot);
                (inner, token)
            }
            None => {
                inner.pool.set_data(block, value);
                {
                    let Inner { pool, channels, .. } = &mut *inner;
                    pool.enqueue(&mut channels.get_mut(channel).value32_q, block);
                }
                (inner, token)
            }
        }
    }

    /// Deliver a freshly spliced data-message run: call the handler with
    /// interrupts re-enabled, then, if it didn't itself drain the message,
    /// drain it with a zero-length read (mirrors `fifoInternalRecvInterrupt`'s
    /// `if (block == fifo_data_queue[channel].head) fifoGetDatamsg(channel, 0, 0)`).
    fn deliver_datamsg<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        token: CriticalGuard,
        channel: u32,
        len: u32,
    ) -> (MutexGuard<'a, Inner>, CriticalGuard) {
        match inner.channels.get_mut(channel).datamsg_fn.begin_call() {
            Some((mut handler, snapshot)) => {
                let delivered_head = inner.channels.get(channel).data_q.head;
                drop(inner);
                self.port.leave_critical(token);

                handler(len as usize);

                let token = self.port.enter_critical();
                let mut inner = self.inner.lock().unwrap();
                inner.channels.get_mut(channel).datamsg_fn.end_call(handler, snapshot);
                if inner.channels.get(channel).data_q.head == delivered_head {
                    Self::drain_datamsg_locked(&mut inner, channel, &mut []);
                }
                (inner, token)
            }
            None => (inner, token),
        }
    }

    // ---------------------------------------------------------------
    // Polling API
    // ---------------------------------------------------------------

    pub fn check_address(&self, channel: u32) -> bool {
        self.with_channel(channel, |inner| inner.channels.get(channel).address_q.head != TERM)
            .unwrap_or(false)
    }

    pub fn check_value32(&self, channel: u32) -> bool {
        self.with_channel(channel, |inner| inner.channels.get(channel).value32_q.head != TERM)
            .unwrap_or(false)
    }

    pub fn check_datamsg(&self, channel: u32) -> bool {
        self.with_channel(channel, |inner| inner.channels.get(channel).data_q.head != TERM)
            .unwrap_or(false)
    }

    /// `extra` of the head `data_q` block, or `-1` if none (spec §4.4).
    pub fn check_datamsg_length(&self, channel: u32) -> isize {
        self.with_channel(channel, |inner| {
            let head = inner.channels.get(channel).data_q.head;
            if head == TERM {
                -1
            } else {
                inner.pool.extra(head) as isize
            }
        })
        .unwrap_or(-1)
    }

    pub fn get_address(&self, channel: u32) -> Option<u32> {
        self.with_channel(channel, |inner| {
            let q = &mut inner.channels.get_mut(channel).address_q;
            let block = inner.pool.pop_head(q)?;
            let addr = inner.pool.data(block);
            inner.pool.free(block);
            Some(addr)
        })
        .flatten()
    }

    pub fn get_value32(&self, channel: u32) -> Option<u32> {
        self.with_channel(channel, |inner| {
            let q = &mut inner.channels.get_mut(channel).value32_q;
            let block = inner.pool.pop_head(q)?;
            let value = inner.pool.data(block);
            inner.pool.free(block);
            Some(value)
        })
        .flatten()
    }

    /// Read the head `data_q[channel]` message into `buf`, truncating to
    /// `buf.len()` bytes and freeing the message's blocks regardless
    /// (spec §4.4/§7's truncation rule). Returns `-1` if the channel is out
    /// of range or the queue is empty.
    pub fn get_datamsg(&self, channel: u32, buf: &mut [u8]) -> isize {
        if channel as usize >= C {
            log::warn!("get_datamsg: {:?}", ChannelError::ChannelOutOfRange);
            return -1;
        }
        let token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();
        let n = Self::drain_datamsg_locked(&mut inner, channel, buf);
        drop(inner);
        self.port.leave_critical(token);
        n
    }

    /// Shared by `get_datamsg` and `deliver_datamsg`'s drain-on-behalf-of
    /// caller path. Must be called with the critical section held.
    fn drain_datamsg_locked(inner: &mut Inner, channel: u32, buf: &mut [u8]) -> isize {
        let head = inner.channels.get(channel).data_q.head;
        if head == TERM {
            return -1;
        }
        let len = inner.pool.extra(head);
        let w = wire::words_for_len(len) as usize;
        // A zero-length message still has one block in its run: the header
        // block, promoted in place of a (nonexistent) first data block.
        let blocks_in_run = w.max(1);

        let mut words = [0u32; MAX_DATAMSG_WORDS];
        for slot in words.iter_mut().take(blocks_in_run) {
            let q = &mut inner.channels.get_mut(channel).data_q;
            let block = inner.pool.pop_head(q).expect("data_q run shorter than its recorded length");
            *slot = inner.pool.data(block);
            inner.pool.free(block);
        }

        let n = (len as usize).min(buf.len());
        for (i, out) in buf.iter_mut().take(n).enumerate() {
            *out = words[i / 4].to_le_bytes()[i % 4];
        }
        n as isize
    }

    /// `set_<kind>_handler` semantics shared by the three kinds: install
    /// atomically, then replay every already-queued message of that kind
    /// through the new handler exactly once (spec §4.4, supplemented by
    /// `fifoSetAddressHandler`'s replay-drain loop — see `DESIGN.md`).
    pub fn set_address_handler(&self, channel: u32, handler: Option<crate::channel::AddressHandler>) -> bool {
        if channel as usize >= C {
            return false;
        }
        let mut token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();
        inner.channels.get_mut(channel).address_fn.set(handler);
        loop {
            if inner.channels.get(channel).address_fn.is_none() || inner.channels.get(channel).address_q.head == TERM {
                drop(inner);
                self.port.leave_critical(token);
                return true;
            }
            let block = {
                let Inner { pool, channels, .. } = &mut *inner;
                pool.pop_head(&mut channels.get_mut(channel).address_q).unwrap()
            };
            let addr = inner.pool.data(block);
            inner.pool.free(block);
            let (mut h, snapshot) = inner.channels.get_mut(channel).address_fn.begin_call().unwrap();
            drop(inner);
            self.port.leave_critical(token);
            h(addr);
            token = self.port.enter_critical();
            inner = self.inner.lock().unwrap();
            inner.channels.get_mut(channel).address_fn.end_call(h, snapshot);
        }
    }

    pub fn set_value32_handler(&self, channel: u32, handler: Option<crate::channel::Value32Handler>) -> bool {
        if channel as usize >= C {
            return false;
        }
        let mut token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();
        inner.channels.get_mut(channel).value32_fn.set(handler);
        loop {
            if inner.channels.get(channel).value32_fn.is_none() || inner.channels.get(channel).value32_q.head == TERM {
                drop(inner);
                self.port.leave_critical(token);
                return true;
            }
            let block = {
                let Inner { pool, channels, .. } = &mut *inner;
                pool.pop_head(&mut channels.get_mut(channel).value32_q).unwrap()
            };
            let value = inner.pool.data(block);
            inner.pool.free(block);
            let (mut h, snapshot) = inner.channels.get_mut(channel).value32_fn.begin_call().unwrap();
            drop(inner);
            self.port.leave_critical(token);
            h(value);
            token = self.port.enter_critical();
            inner = self.inner.lock().unwrap();
            inner.channels.get_mut(channel).value32_fn.end_call(h, snapshot);
        }
    }

    pub fn set_datamsg_handler(&self, channel: u32, handler: Option<crate::channel::DatamsgHandler>) -> bool {
        if channel as usize >= C {
            return false;
        }
        let mut token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();
        inner.channels.get_mut(channel).datamsg_fn.set(handler);
        loop {
            if inner.channels.get(channel).datamsg_fn.is_none() || inner.channels.get(channel).data_q.head == TERM {
                drop(inner);
                self.port.leave_critical(token);
                return true;
            }
            let head = inner.channels.get(channel).data_q.head;
            let len = inner.pool.extra(head);
            let (mut h, snapshot) = inner.channels.get_mut(channel).datamsg_fn.begin_call().unwrap();
            drop(inner);
            self.port.leave_critical(token);
            h(len as usize);

            token = self.port.enter_critical();
            inner = self.inner.lock().unwrap();
            inner.channels.get_mut(channel).datamsg_fn.end_call(h, snapshot);
            // As in the IRQ-time delivery path, a handler that didn't drain
            // its own message gets a zero-length read so the blocks are freed.
            if inner.channels.get(channel).data_q.head == head {
                Self::drain_datamsg_locked(&mut inner, channel, &mut []);
            }
        }
    }

    // ---------------------------------------------------------------
    // Cooperative per-channel mutex and reset rendezvous
    // ---------------------------------------------------------------

    /// Acquire channel `channel`'s cooperative mutex (spec §4.4/§5). Not
    /// related to the interrupt-masking critical section, and — since this
    /// call blocks — never taken while holding `inner`'s lock.
    pub fn acquire(&self, channel: u32) -> bool {
        if channel as usize >= C {
            return false;
        }
        self.channel_mutexes[channel as usize].acquire();
        true
    }

    pub fn release(&self, channel: u32) -> bool {
        if channel as usize >= C {
            return false;
        }
        self.channel_mutexes[channel as usize].release();
        true
    }

    /// Originate the two-CPU reset rendezvous (spec §4.6): send the
    /// reserved `PEER_REQUESTS_RESET` special word, then run the same
    /// peer-sync handshake the receiving side runs on its own IPC core.
    /// Never returns.
    pub fn request_peer_reset(&self) -> ! {
        self.internal_send(&[wire::pack_special(wire::PEER_REQUESTS_RESET)]);
        reset::run_rendezvous(&self.port)
    }

    // ---------------------------------------------------------------
    // Internal helpers
    // ---------------------------------------------------------------

    fn with_channel<R>(&self, channel: u32, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        if channel as usize >= C {
            return None;
        }
        let token = self.port.enter_critical();
        let mut inner = self.inner.lock().unwrap();
        let r = f(&mut inner);
        drop(inner);
        self.port.leave_critical(token);
        Some(r)
    }
}
