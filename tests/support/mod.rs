// SPDX-License-Identifier: MIT
//
// A loopback hardware simulator wiring two `fifo_ipc::Port` instances
// back to back, standing in for the narrow 32-bit FIFO, its interrupt
// controller, and the peer-sync register (SPEC_FULL.md §A's "sim"
// module). Each `LoopbackPort` runs a background pump thread that polls
// the shared queues and fires the registered IRQ closures, playing the
// role real hardware plays by raising interrupts on fill-level
// transitions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fifo_ipc::{CriticalGuard, FifoPort, FifoStatus, InterruptPort, IrqPort, IrqVector, ResetPort};

/// How often the pump thread re-checks queue state. Real hardware is
/// edge/level-triggered and instantaneous; this is the cost of modeling
/// interrupts with polling on top of `std::thread`.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Depth of the simulated hardware FIFO in each direction (the real NDS
/// FIFO is a handful of words deep; a small number here is what actually
/// exercises send-full/recv-empty transitions in tests).
const HW_FIFO_DEPTH: usize = 4;

struct Queue {
    words: Mutex<VecDeque<u32>>,
}

impl Queue {
    fn new() -> Self {
        Self { words: Mutex::new(VecDeque::new()) }
    }
}

struct Link {
    a_to_b: Queue,
    b_to_a: Queue,
    sync_out_a: AtomicU32,
    sync_out_b: AtomicU32,
}

struct PortShared {
    link: Arc<Link>,
    is_a: bool,
    send_irq: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    recv_irq: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    send_irq_enabled: AtomicBool,
    recv_irq_enabled: AtomicBool,
    send_armed: AtomicBool,
    stop: AtomicBool,
}

impl PortShared {
    fn outgoing(&self) -> &Queue {
        if self.is_a { &self.link.a_to_b } else { &self.link.b_to_a }
    }

    fn incoming(&self) -> &Queue {
        if self.is_a { &self.link.b_to_a } else { &self.link.a_to_b }
    }

    fn my_sync_out(&self) -> &AtomicU32 {
        if self.is_a { &self.link.sync_out_a } else { &self.link.sync_out_b }
    }

    fn peer_sync_out(&self) -> &AtomicU32 {
        if self.is_a { &self.link.sync_out_b } else { &self.link.sync_out_a }
    }
}

/// One endpoint of the simulated FIFO link. Cheap to clone (an `Arc`
/// underneath) so the same handle can be moved into an `IpcCore` and also
/// kept around to start/stop the pump thread.
#[derive(Clone)]
pub struct LoopbackPort {
    shared: Arc<PortShared>,
}

impl LoopbackPort {
    /// Build a connected pair of endpoints, A and B.
    pub fn pair() -> (LoopbackPort, LoopbackPort) {
        let link = Arc::new(Link {
            a_to_b: Queue::new(),
            b_to_a: Queue::new(),
            sync_out_a: AtomicU32::new(0),
            sync_out_b: AtomicU32::new(0),
        });
        let a = LoopbackPort {
            shared: Arc::new(PortShared {
                link: Arc::clone(&link),
                is_a: true,
                send_irq: Mutex::new(None),
                recv_irq: Mutex::new(None),
                send_irq_enabled: AtomicBool::new(false),
                recv_irq_enabled: AtomicBool::new(false),
                send_armed: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
        };
        let b = LoopbackPort {
            shared: Arc::new(PortShared {
                link,
                is_a: false,
                send_irq: Mutex::new(None),
                recv_irq: Mutex::new(None),
                send_irq_enabled: AtomicBool::new(false),
                recv_irq_enabled: AtomicBool::new(false),
                send_armed: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    /// Start the background pump thread. Call once `IpcCore::init` has
    /// registered this endpoint's IRQ handlers.
    pub fn spawn_pump(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || loop {
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            if shared.recv_irq_enabled.load(Ordering::Acquire) {
                let non_empty = !shared.incoming().words.lock().unwrap().is_empty();
                if non_empty {
                    if let Some(h) = shared.recv_irq.lock().unwrap().as_ref() {
                        h();
                    }
                }
            }
            if shared.send_irq_enabled.load(Ordering::Acquire) && shared.send_armed.load(Ordering::Acquire) {
                let empty = shared.outgoing().words.lock().unwrap().is_empty();
                if empty {
                    if let Some(h) = shared.send_irq.lock().unwrap().as_ref() {
                        h();
                    }
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        })
    }

    /// Stop the pump thread so the `JoinHandle` returned by `spawn_pump`
    /// can be joined without the test hanging.
    pub fn stop_pump(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

impl FifoPort for LoopbackPort {
    fn push_word(&self, word: u32) {
        self.shared.outgoing().words.lock().unwrap().push_back(word);
    }

    fn pop_word(&self) -> u32 {
        self.shared.incoming().words.lock().unwrap().pop_front().expect("pop_word called while recv_empty")
    }

    fn status(&self) -> FifoStatus {
        FifoStatus {
            send_full: self.shared.outgoing().words.lock().unwrap().len() >= HW_FIFO_DEPTH,
            recv_empty: self.shared.incoming().words.lock().unwrap().is_empty(),
        }
    }

    fn arm_send_irq(&self) {
        self.shared.send_armed.store(true, Ordering::Release);
    }

    fn disarm_send_irq(&self) {
        self.shared.send_armed.store(false, Ordering::Release);
    }

    fn clear(&self) {
        self.shared.outgoing().words.lock().unwrap().clear();
        self.shared.incoming().words.lock().unwrap().clear();
    }
}

impl InterruptPort for LoopbackPort {
    fn enter_critical(&self) -> CriticalGuard {
        // The pump thread only ever calls into `IpcCore` through the
        // registered IRQ closures, and `IpcCore` serializes all access
        // through its own `Mutex`; there is no separate hardware mask to
        // simulate here.
        CriticalGuard::new()
    }

    fn leave_critical(&self, _guard: CriticalGuard) {}
}

impl IrqPort for LoopbackPort {
    fn register_irq(&self, vector: IrqVector, handler: Box<dyn Fn() + Send + Sync>) {
        match vector {
            IrqVector::SendEmpty => *self.shared.send_irq.lock().unwrap() = Some(handler),
            IrqVector::RecvNotEmpty => *self.shared.recv_irq.lock().unwrap() = Some(handler),
        }
    }

    fn set_irq_enabled(&self, vector: IrqVector, enabled: bool) {
        match vector {
            IrqVector::SendEmpty => self.shared.send_irq_enabled.store(enabled, Ordering::Release),
            IrqVector::RecvNotEmpty => self.shared.recv_irq_enabled.store(enabled, Ordering::Release),
        }
    }
}

impl ResetPort for LoopbackPort {
    fn write_peer_sync(&self, value: u32) {
        self.shared.my_sync_out().store(value, Ordering::SeqCst);
    }

    fn read_peer_sync(&self) -> u32 {
        (self.shared.peer_sync_out().load(Ordering::SeqCst) >> 8) & 0x0F
    }

    fn soft_reset(&self) -> ! {
        panic!("loopback soft_reset reached on side {}", if self.shared.is_a { "A" } else { "B" });
    }
}

/// Convenience: build a pair of initialised cores with their pumps
/// already running, and a guard that stops both pumps on drop.
pub struct Harness {
    pub core_a: Arc<fifo_ipc::IpcCore<LoopbackPort>>,
    pub core_b: Arc<fifo_ipc::IpcCore<LoopbackPort>>,
    port_a: LoopbackPort,
    port_b: LoopbackPort,
    pump_a: Option<JoinHandle<()>>,
    pump_b: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        let (port_a, port_b) = LoopbackPort::pair();
        let core_a = fifo_ipc::IpcCore::init(port_a.clone());
        let core_b = fifo_ipc::IpcCore::init(port_b.clone());
        let pump_a = port_a.spawn_pump();
        let pump_b = port_b.spawn_pump();
        Self { core_a, core_b, port_a, port_b, pump_a: Some(pump_a), pump_b: Some(pump_b) }
    }
}

/// Poll `condition` until it's true or `timeout` elapses. Integration
/// tests use this instead of a fixed sleep since message delivery here
/// runs on the pump threads, asynchronously to the test's own thread.
pub fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.port_a.stop_pump();
        self.port_b.stop_pump();
        if let Some(h) = self.pump_a.take() {
            let _ = h.join();
        }
        if let Some(h) = self.pump_b.take() {
            let _ = h.join();
        }
    }
}
