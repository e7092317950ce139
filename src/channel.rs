// SPDX-License-Identifier: MIT
//
// Per-channel state (spec §3/§4.4): three ready queues and three optional
// handlers, times `C` channels. The cooperative per-channel mutex lives on
// `IpcCore` itself, not here — see `core.rs` for why.
//
// The C reference passes handlers as a function pointer plus an opaque
// `void *` cookie; the idiomatic Rust shape for "function plus its own
// state" is a boxed closure, so handlers here are `FnMut` trait objects
// that close over whatever the cookie would have pointed at.

use crate::block::Queue;
use crate::C;

pub type AddressHandler = Box<dyn FnMut(u32) + Send>;
pub type Value32Handler = Box<dyn FnMut(u32) + Send>;
pub type DatamsgHandler = Box<dyn FnMut(usize) + Send>;

/// A handler slot that can tell "nobody touched this while the lock was
/// released" apart from "the handler itself explicitly cleared this during
/// its own invocation" — plain `Option::take`/restore can't make that
/// distinction, since both end in `None`.
pub struct HandlerSlot<T> {
    value: Option<T>,
    generation: u64,
}

impl<T> HandlerSlot<T> {
    fn new() -> Self {
        Self { value: None, generation: 0 }
    }

    pub fn is_some(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_none(&self) -> bool {
        self.value.is_none()
    }

    /// Install (or clear) the handler. Bumps the generation so any call
    /// currently in flight (between `begin_call` and `end_call`) knows the
    /// slot was touched and must not be restored over this install.
    pub fn set(&mut self, value: Option<T>) {
        self.value = value;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Take the handler out to call it with the lock released, snapshotting
    /// the generation to check against on return. `None` if the slot is empty.
    pub fn begin_call(&mut self) -> Option<(T, u64)> {
        let handler = self.value.take()?;
        Some((handler, self.generation))
    }

    /// Put the handler back, but only if nothing called `set` on this slot
    /// while it was out.
    pub fn end_call(&mut self, handler: T, snapshot: u64) {
        if self.generation == snapshot {
            self.value = Some(handler);
        }
    }
}

impl<T> Default for HandlerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Channel {
    pub address_q: Queue,
    pub value32_q: Queue,
    pub data_q: Queue,
    pub address_fn: HandlerSlot<AddressHandler>,
    pub value32_fn: HandlerSlot<Value32Handler>,
    pub datamsg_fn: HandlerSlot<DatamsgHandler>,
}

impl Channel {
    fn new() -> Self {
        Self {
            address_q: Queue::empty(),
            value32_q: Queue::empty(),
            data_q: Queue::empty(),
            address_fn: HandlerSlot::new(),
            value32_fn: HandlerSlot::new(),
            datamsg_fn: HandlerSlot::new(),
        }
    }
}

/// The `C`-channel table. Indexing is bounds-checked by every public
/// `IpcCore` entry point before reaching here (spec §7: "channel out of
/// range" is rejected at the API boundary), so this type itself just
/// panics on an out-of-range index — a defect in the caller, not
/// something this layer is asked to validate again.
pub struct ChannelRegistry {
    channels: Box<[Channel]>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        let mut channels = Vec::with_capacity(C);
        channels.resize_with(C, Channel::new);
        Self { channels: channels.into_boxed_slice() }
    }

    pub fn get(&self, channel: u32) -> &Channel {
        &self.channels[channel as usize]
    }

    pub fn get_mut(&mut self, channel: u32) -> &mut Channel {
        &mut self.channels[channel as usize]
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
