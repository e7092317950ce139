// SPDX-License-Identifier: MIT
//
// The two-CPU reset rendezvous (spec §4.6). `fifosystem.c` splits this
// into an "initiator" path (send the request, then reset) and a
// "requestee" path (run the sync-register handshake on receipt) that
// differ only in *when* the handshake starts, not in what it does — both
// CPUs end up running the identical write/wait/clear/reset sequence on
// the shared peer-sync register, one started by `IpcCore::request_peer_reset`,
// the other by the receive parser's `PEER_REQUESTS_RESET` case. This
// crate shares the one sequence rather than modeling "ARM7 vs ARM9" as a
// distinct type.

use crate::port::ResetPort;

const SYNC_ARMED: u32 = 0x100;
const SYNC_ACK_MASK: u32 = 0x0F;
const SYNC_ACK_VALUE: u32 = 1;
const SYNC_CLEAR: u32 = 0;

/// Run the two-write handshake on the peer-sync register, then reset.
/// Never returns (the final step is a soft reset).
///
/// Mirrors the ARM7 branch of `fifoInternalRecvInterrupt` in
/// `fifosystem.c`: write the armed pattern, busy-wait for the peer's ack
/// nibble, clear, reset.
pub(crate) fn run_rendezvous(port: &dyn ResetPort) -> ! {
    log::trace!("reset rendezvous: writing armed pattern 0x{SYNC_ARMED:x}");
    port.write_peer_sync(SYNC_ARMED);
    while port.read_peer_sync() & SYNC_ACK_MASK != SYNC_ACK_VALUE {
        std::hint::spin_loop();
    }
    log::trace!("reset rendezvous: peer acked, clearing sync register");
    port.write_peer_sync(SYNC_CLEAR);
    port.soft_reset();
}
