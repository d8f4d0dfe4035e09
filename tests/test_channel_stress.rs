// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Full-scale throughput scenarios: a million publications through the raw
// ring, and concurrent multi-sender channel traffic.

use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use shmcast::circ::{ElemArray, RingArray};
use shmcast::Channel;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("shmcast_stress_{tag}_{n}_{}", std::process::id())
}

fn new_array<A: RingArray>() -> &'static A {
    unsafe {
        let mem = std::alloc::alloc_zeroed(std::alloc::Layout::new::<A>());
        A::attach(mem)
    }
}

fn ring_1vn(consumers: usize, loops: u64) {
    let ca: &'static ElemArray<12> = new_array();
    let ready = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..consumers {
        let r = Arc::clone(&ready);
        threads.push(thread::spawn(move || {
            ca.connect();
            let mut cur = ca.cursor();
            r.fetch_add(1, Ordering::Release);

            let mut expected = 0u64;
            loop {
                while cur != ca.cursor() {
                    let p = ca.take(cur);
                    let val = unsafe { ptr::read_unaligned(p as *const u64) };
                    unsafe { ca.put(p) };
                    cur = cur.wrapping_add(1);
                    if val == u64::MAX {
                        assert_eq!(expected, loops, "all publications observed in order");
                        return;
                    }
                    assert_eq!(val, expected);
                    expected += 1;
                }
                thread::yield_now();
            }
        }));
    }

    while ready.load(Ordering::Acquire) != consumers {
        thread::yield_now();
    }

    let start = Instant::now();
    for i in 0..loops {
        let p = ca.acquire();
        unsafe {
            ptr::write_unaligned(p as *mut u64, i);
            ca.commit(p);
        }
    }
    let p = ca.acquire();
    unsafe {
        ptr::write_unaligned(p as *mut u64, u64::MAX);
        ca.commit(p);
    }
    let elapsed = start.elapsed();

    for t in threads {
        t.join().unwrap();
    }
    eprintln!(
        "ring 1v{consumers}: {loops} msgs in {:.1}ms ({:.0} msg/s)",
        elapsed.as_secs_f64() * 1000.0,
        loops as f64 / elapsed.as_secs_f64()
    );
}

#[test]
fn ring_1v1_million() {
    ring_1vn(1, 1_000_000);
}

#[test]
fn ring_1v3_million() {
    ring_1vn(3, 1_000_000);
}

// Two senders, four receivers; every receiver reassembles the union of
// both senders' messages.
#[test]
fn channel_2v4_union() {
    const SENDERS: usize = 2;
    const RECEIVERS: usize = 4;
    const PER_SENDER: usize = 20_000;

    let name = unique_name("2v4");
    Channel::clear_storage(&name);

    let ready = Arc::new(AtomicUsize::new(0));

    let mut receivers = Vec::new();
    for _ in 0..RECEIVERS {
        let n = name.clone();
        let r = Arc::clone(&ready);
        receivers.push(thread::spawn(move || {
            let mut ch = Channel::connect(&n).expect("receiver");
            assert!(ch.try_recv().is_none()); // register before senders start
            r.fetch_add(1, Ordering::Release);

            let mut got = HashSet::new();
            for _ in 0..SENDERS * PER_SENDER {
                let buf = ch.recv();
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(buf.data());
                assert!(got.insert(u64::from_le_bytes(bytes)), "no duplication");
            }
            got
        }));
    }

    while ready.load(Ordering::Acquire) != RECEIVERS {
        thread::yield_now();
    }

    let mut senders = Vec::new();
    for s in 0..SENDERS {
        let n = name.clone();
        senders.push(thread::spawn(move || {
            let ch = Channel::connect(&n).expect("sender");
            for i in 0..PER_SENDER {
                let val = ((s as u64) << 32) | i as u64;
                assert!(ch.send(&val.to_le_bytes()));
            }
        }));
    }

    let mut expected = HashSet::new();
    for s in 0..SENDERS as u64 {
        for i in 0..PER_SENDER as u64 {
            expected.insert((s << 32) | i);
        }
    }

    for s in senders {
        s.join().unwrap();
    }
    for r in receivers {
        let got = r.join().unwrap();
        assert_eq!(got, expected, "union of both senders' messages");
    }
}
