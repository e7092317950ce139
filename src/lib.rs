// SPDX-License-Identifier: MIT
//
// A message-queue engine that multiplexes address, 32-bit value, and
// variable-length data messages over a narrow 32-bit hardware FIFO shared
// by two CPUs, with interrupt-driven send/receive pumps and a two-CPU
// soft-reset rendezvous.
//
// Port of the `fifosystem.c` subsystem of the libnds console runtime,
// restructured around a singleton `IpcCore<P>` held behind `Arc` instead
// of process-wide statics, and a `Port` trait standing in for the
// hardware registers, interrupt controller, and peer-sync register it
// previously touched directly.

mod block;
mod channel;
pub mod core;
pub mod error;
pub mod port;
mod recv;
mod reset;
mod send;
mod spin_lock;
pub mod wire;

pub use crate::channel::{AddressHandler, DatamsgHandler, Value32Handler};
pub use crate::core::IpcCore;
pub use crate::error::{ChannelError, SendError};
pub use crate::port::{CriticalGuard, FifoPort, FifoStatus, InterruptPort, IrqPort, IrqVector, Port, ResetPort};

/// Number of slots in the shared block pool (spec: reference size 256).
pub const N_BLOCKS: usize = 256;
/// Number of logical channels multiplexed over the FIFO (spec: reference 16).
pub const C: usize = 16;
/// Largest `send_datamsg`/`get_datamsg` payload this crate will frame, in bytes.
pub const FIFO_MAX_DATA_BYTES: usize = 128;
/// `FIFO_MAX_DATA_BYTES` expressed in whole 32-bit words, rounded up.
pub(crate) const MAX_DATAMSG_WORDS: usize = (FIFO_MAX_DATA_BYTES + 3) / 4;

const _: () = assert!(N_BLOCKS <= 0xFFFF, "N_BLOCKS must leave 0xFFFF free as the TERM sentinel");
const _: () = assert!(C <= 16, "channel id is packed into 4 wire bits");
