// SPDX-License-Identifier: MIT
//
// The send engine's pure queue mechanics (spec §4.2). Allocation that can
// block (`wait_alloc`) and the critical-section/port plumbing around it
// live in `core.rs`, which is the only place holding both the mutex guard
// and the port — these functions just move words between the pool and
// `send_q` once blocks are already in hand.
//
// Grounded on `original_source/source/common/fifosystem.c`'s
// `fifoInternalSend` / `fifoInternalSendInterrupt`.

use crate::block::{BlockPool, Queue};
use crate::port::FifoPort;

/// Append one already-allocated block carrying `word` to the tail of `send_q`.
pub(crate) fn push_word(pool: &mut BlockPool, send_q: &mut Queue, block: u16, word: u32) {
    pool.set_data(block, word);
    pool.enqueue(send_q, block);
}

/// Drain `send_q` into the hardware FIFO until it's either empty or the
/// hardware reports full. Returns the number of blocks freed, so the
/// caller can decide whether to notify anything waiting on `wait_alloc`.
///
/// Mirrors `fifoInternalSendInterrupt`: when `send_q` was already empty on
/// entry, the caller is expected to disarm the send-empty IRQ instead of
/// calling this at all.
pub(crate) fn drain_to_hardware(pool: &mut BlockPool, send_q: &mut Queue, port: &dyn FifoPort) -> u32 {
    let mut freed = 0u32;
    while !send_q.is_empty() {
        if port.status().send_full {
            break;
        }
        let head = send_q.head;
        let word = pool.data(head);
        port.push_word(word);
        pool.pop_head(send_q);
        pool.free(head);
        freed += 1;
    }
    freed
}
