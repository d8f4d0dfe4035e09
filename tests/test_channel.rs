// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Channel behavior over real shared memory: fragmentation round-trips,
// loopback suppression, late-join visibility, and concurrent senders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shmcast::Channel;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("shmcast_t_{tag}_{n}_{}", std::process::id())
}

#[test]
fn connect_reports_name() {
    let name = unique_name("ctor");
    Channel::clear_storage(&name);

    let ch = Channel::connect(&name).expect("connect");
    assert_eq!(ch.name(), name);
}

#[test]
fn empty_send_is_rejected() {
    let name = unique_name("empty");
    Channel::clear_storage(&name);

    let ch = Channel::connect(&name).expect("connect");
    assert!(!ch.send(&[]));
}

#[test]
fn send_recv_one_fragment() {
    let name = unique_name("one_frag");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    let mut receiver = Channel::connect(&name).expect("receiver");

    assert!(receiver.try_recv().is_none()); // registers as receiver
    assert!(sender.send(b"hi"));
    assert_eq!(receiver.recv().data(), b"hi");
}

#[test]
fn send_recv_65_bytes_exact() {
    let name = unique_name("s3");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    let mut receiver = Channel::connect(&name).expect("receiver");
    assert!(receiver.try_recv().is_none());

    let mut payload = Vec::new();
    payload.extend_from_slice(b"hello, world!!!");
    payload.extend_from_slice(&[b'x'; 50]);
    assert_eq!(payload.len(), 65);

    assert!(sender.send(&payload));
    let buf = receiver.recv();
    assert_eq!(buf.len(), 65);
    assert_eq!(buf.data(), &payload[..]);
}

#[test]
fn send_recv_boundary_sizes() {
    let name = unique_name("sizes");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    let mut receiver = Channel::connect(&name).expect("receiver");
    assert!(receiver.try_recv().is_none());

    for size in [1usize, 15, 16, 17, 31, 32, 33, 64, 255, 1000] {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 % 256) as u8).collect();
        assert!(sender.send(&payload), "send {size} bytes");
        let buf = receiver.recv();
        assert_eq!(buf.data(), &payload[..], "round-trip {size} bytes");
    }
}

#[test]
fn own_messages_are_suppressed() {
    let name = unique_name("echo");
    Channel::clear_storage(&name);

    let mut ch = Channel::connect(&name).expect("connect");
    assert!(ch.try_recv().is_none()); // registers as receiver
    assert!(ch.send(b"to everyone else"));
    assert!(ch.try_recv().is_none(), "own message must not echo back");
}

#[test]
fn recv_count_and_wait_for_recv() {
    let name = unique_name("count");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    assert_eq!(sender.recv_count(), 0);
    assert!(!sender.wait_for_recv(1, Some(50)), "times out with no receiver");

    let mut receiver = Channel::connect(&name).expect("receiver");
    assert!(receiver.try_recv().is_none());
    assert_eq!(sender.recv_count(), 1);
    assert!(sender.wait_for_recv(1, Some(1000)));
}

#[test]
fn late_joining_receiver_misses_earlier_sends() {
    let name = unique_name("s5");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    let mut c1 = Channel::connect(&name).expect("c1");
    assert!(c1.try_recv().is_none());

    assert!(sender.send(b"first"));
    assert_eq!(c1.recv().data(), b"first");

    // c2 joins only now; "first" was published before its snapshot.
    let mut c2 = Channel::connect(&name).expect("c2");
    assert!(c2.try_recv().is_none());

    assert!(sender.send(b"second"));
    assert_eq!(c1.recv().data(), b"second");
    assert_eq!(c2.recv().data(), b"second");
    assert!(c2.try_recv().is_none());
}

#[test]
fn clear_recv_resets_the_ring() {
    let name = unique_name("clear");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    let mut receiver = Channel::connect(&name).expect("receiver");
    assert!(receiver.try_recv().is_none());
    assert!(sender.send(b"stale"));

    receiver.clear_recv();
    assert_eq!(receiver.recv_count(), 0);
    assert!(receiver.try_recv().is_none(), "cleared ring yields nothing");
}

#[test]
fn interleaved_senders_reassemble_exactly() {
    let name = unique_name("interleave");
    Channel::clear_storage(&name);

    let mut receiver = Channel::connect(&name).expect("receiver");
    assert!(receiver.try_recv().is_none());

    let a: Vec<u8> = (0..900).map(|i| (i % 251) as u8).collect();
    let b: Vec<u8> = (0..700).map(|i| (i % 241 + 1) as u8).collect();

    let mut senders = Vec::new();
    for payload in [a.clone(), b.clone()] {
        let n = name.clone();
        senders.push(thread::spawn(move || {
            let ch = Channel::connect(&n).expect("sender");
            assert!(ch.send(&payload));
        }));
    }

    let mut got = Vec::new();
    for _ in 0..2 {
        got.push(receiver.recv().into_vec());
    }
    for s in senders {
        s.join().unwrap();
    }

    got.sort_by_key(|v| v.len());
    let mut expected = vec![a, b];
    expected.sort_by_key(|v| v.len());
    assert_eq!(got, expected, "fragments interleave, messages reassemble");
}

#[test]
fn sender_blocks_until_lagging_receiver_drains() {
    let name = unique_name("lag");
    Channel::clear_storage(&name);

    let sender = Channel::connect(&name).expect("sender");
    let mut receiver = Channel::connect(&name).expect("receiver");
    assert!(receiver.try_recv().is_none());

    // More fragments than the ring holds; the sender can only finish while
    // the receiver keeps draining.
    let payload: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
    let p = payload.clone();
    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        assert!(sender.send(&p));
    });

    let buf = receiver.recv();
    assert_eq!(buf.data(), &payload[..]);
    t.join().unwrap();
}
