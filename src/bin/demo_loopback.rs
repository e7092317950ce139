// SPDX-License-Identifier: MIT
//
// Two `IpcCore`s joined by the loopback simulator, trading an address, an
// inline value, an extra-word value, and a data message in each direction.
// There's no real dual-CPU hardware to run this crate against from a host
// binary, so this stands in for `demo_send_recv` — a runnable example
// rather than a second process pair.
//
// Usage:
//   demo_loopback

use std::time::Duration;

#[path = "../../tests/support/mod.rs"]
mod support;

fn wait_or_panic(mut ready: impl FnMut() -> bool, what: &str) {
    if !support::wait_until(&mut ready, Duration::from_secs(2)) {
        panic!("timed out waiting for {what}");
    }
}

fn main() {
    env_logger::init();

    let h = support::Harness::new();

    println!("sending an address on channel 3...");
    h.core_a.send_address(3, 0x0200_abcd);
    wait_or_panic(|| h.core_b.check_address(3), "address on channel 3");
    println!("received: {:#010x}", h.core_b.get_address(3).unwrap());

    println!("sending an inline value32 on channel 0...");
    h.core_a.send_value32(0, 0x1234);
    wait_or_panic(|| h.core_b.check_value32(0), "inline value32 on channel 0");
    println!("received: {:#010x}", h.core_b.get_value32(0).unwrap());

    println!("sending a value32 needing an extra word on channel 7...");
    h.core_a.send_value32(7, 0xdead_beef);
    wait_or_panic(|| h.core_b.check_value32(7), "extra value32 on channel 7");
    println!("received: {:#010x}", h.core_b.get_value32(7).unwrap());

    println!("sending a 10-byte data message on channel 2...");
    let payload: Vec<u8> = (0..10u8).collect();
    h.core_a.send_datamsg(2, &payload);
    wait_or_panic(|| h.core_b.check_datamsg(2), "data message on channel 2");
    let mut buf = [0u8; 10];
    let n = h.core_b.get_datamsg(2, &mut buf);
    println!("received {n} bytes: {:?}", &buf[..n as usize]);

    println!("installing a value32 handler on channel 5 and sending through it...");
    h.core_b.set_value32_handler(
        5,
        Some(Box::new(|value| println!("handler fired with value {value:#010x}"))),
    );
    h.core_a.send_value32(5, 0x5555);
    std::thread::sleep(Duration::from_millis(50));

    println!("done.");
}
