// SPDX-License-Identifier: MIT
//
// The seam between this crate and the hardware it is ultimately meant to
// run against: a 32-bit FIFO shared by two CPUs, an interrupt controller,
// and the peer-sync register used for the reset rendezvous.
//
// `IpcCore` is generic over `Port` so the same engine drives real hardware
// registers on target and a loopback simulator under test (see
// `tests/support`). `wait_alloc`'s suspension point lives entirely at the
// `IpcCore` level (see `core.rs`) rather than here: a systems build would
// park the waiting flow on a `swiIntrWait`-style intrinsic, a hosted
// harness parks it on a `Condvar` — neither needs help from this trait
// beyond the critical-section masking it already provides.

/// Status bits of the hardware FIFO, as read through [`FifoPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoStatus {
    pub send_full: bool,
    pub recv_empty: bool,
}

/// The narrow 32-bit hardware FIFO connecting the two CPUs.
///
/// All methods are expected to be cheap register accesses; none of them
/// block. Blocking is layered on top by [`InterruptPort`].
pub trait FifoPort {
    /// Push one word to the hardware FIFO. Caller must have checked
    /// `!send_full()` first; pushing while full is a logic error.
    fn push_word(&self, word: u32);

    /// Pop one word from the hardware FIFO. Caller must have checked
    /// `!recv_empty()` first; popping while empty is a logic error.
    fn pop_word(&self) -> u32;

    /// Current status bits.
    fn status(&self) -> FifoStatus;

    /// Arm the "send queue empty" interrupt so a future drain of the
    /// hardware FIFO (by the peer) raises it again.
    fn arm_send_irq(&self);

    /// Disarm the "send queue empty" interrupt (nothing left to send).
    fn disarm_send_irq(&self);

    /// Reset the FIFO hardware to its empty, cleared state.
    fn clear(&self);
}

/// An opaque token proving a critical section is held. Only the port
/// layer can construct or consume one; the core never inspects it.
pub struct CriticalGuard(());

impl CriticalGuard {
    /// Constructed only by [`InterruptPort::enter_critical`] implementations.
    pub fn new() -> Self {
        Self(())
    }
}

impl Default for CriticalGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt masking. The actual "wait for send-empty" suspension point
/// (spec §5) is implemented once, at the `IpcCore` level, as a condition
/// variable that `on_send_irq` notifies after freeing a block — matching
/// §9's note that a hosted harness maps `wait_alloc`'s blocking onto "a
/// condition variable notified by the simulated send IRQ". A bare-metal
/// port only needs to implement interrupt masking; it does not need its
/// own blocking primitive.
pub trait InterruptPort {
    /// Mask interrupts, returning a cookie that restores the previous
    /// mask state when passed to [`leave_critical`](Self::leave_critical).
    fn enter_critical(&self) -> CriticalGuard;

    /// Restore the interrupt mask state captured by `enter_critical`.
    fn leave_critical(&self, guard: CriticalGuard);
}

/// The two IRQ vectors this subsystem owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqVector {
    /// Hardware FIFO transitioned to send-empty.
    SendEmpty,
    /// Hardware FIFO transitioned to receive-not-empty.
    RecvNotEmpty,
}

/// Soft reset and the two-CPU peer-sync register used by the rendezvous
/// (spec §4.6).
pub trait ResetPort {
    /// Write to the peer-sync register.
    fn write_peer_sync(&self, value: u32);

    /// Read the peer-sync register.
    fn read_peer_sync(&self) -> u32;

    /// Issue a soft reset. Does not return.
    fn soft_reset(&self) -> !;
}

/// Vector registration. `IpcCore::init` calls this once per vector with a
/// closure that calls back into the core (captured via `Arc`, per §9's
/// "expose a pointer captured at init time" redesign note — `Arc` is the
/// safe-Rust form of that pointer).
pub trait IrqPort {
    fn register_irq(&self, vector: IrqVector, handler: Box<dyn Fn() + Send + Sync>);

    /// Enable/disable delivery of a vector at the interrupt controller.
    fn set_irq_enabled(&self, vector: IrqVector, enabled: bool);
}

/// Aggregate of the four port facilities §2 describes, so `IpcCore<P>`
/// only needs one type parameter.
pub trait Port: FifoPort + InterruptPort + ResetPort + IrqPort {}

impl<T: FifoPort + InterruptPort + ResetPort + IrqPort> Port for T {}
