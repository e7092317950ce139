// SPDX-License-Identifier: MIT
//
// The receive engine's drain phase (spec §4.3) and a couple of pure
// helpers the parse loop in `core.rs` needs. The parse phase itself lives
// in `core.rs` because it interleaves pool/queue mutation (needs the
// critical section) with user handler invocation (needs the critical
// section *released* — spec §4.3's "temporarily enable interrupts" step),
// and only the type holding the `Mutex` can do that interleaving.
//
// Grounded on `original_source/source/common/fifosystem.c`'s
// `fifoInternalRecvInterrupt`.

use crate::block::{BlockPool, Queue, TERM};
use crate::port::FifoPort;

/// Drain hardware-received words into `recv_staging_q`, one block per word,
/// until the hardware reports empty or the pool is exhausted. Returns the
/// number of words drained.
///
/// Mirrors the first `while` loop in `fifoInternalRecvInterrupt`: running
/// out of blocks stops the drain early and leaves the remaining words on
/// the hardware FIFO for a later IRQ entry.
pub(crate) fn drain_phase(pool: &mut BlockPool, recv_staging_q: &mut Queue, port: &dyn FifoPort) -> u32 {
    let mut drained = 0u32;
    while !port.status().recv_empty {
        let Some(block) = pool.alloc() else { break };
        let word = port.pop_word();
        pool.set_data(block, word);
        pool.enqueue(recv_staging_q, block);
        drained += 1;
    }
    drained
}

/// Walk `recv_staging_q` from `first` looking for `needed` more blocks
/// after it. Returns the index of the block `needed` steps past `first`
/// if the run is fully present, or `None` if staging runs out first.
///
/// Used by the `DATAMSG_HEADER` parse case to decide whether all of a
/// message's data words have arrived yet (spec §4.3: "Walk staging to
/// confirm at least `W` successor blocks are present; if not, stop
/// parsing").
pub(crate) fn find_nth_successor(pool: &BlockPool, first: u16, needed: u32) -> Option<u16> {
    let mut cur = first;
    for _ in 0..needed {
        cur = pool.next(cur);
        if cur == TERM {
            return None;
        }
    }
    Some(cur)
}
