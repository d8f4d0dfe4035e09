// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Usage:
//   demo_msg_que s    (sender — measures throughput)
//   demo_msg_que r    (receiver — measures throughput)
//
// The sender publishes messages of cycling sizes (128 B – 16 KB) as fast
// as the ring accepts them and prints throughput every second; the
// receiver reassembles and does the same.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmcast::Channel;

const CHANNEL_NAME: &str = "shmcast-msg-que";
const MIN_SZ: usize = 128;
const MAX_SZ: usize = 1024 * 16;

fn str_of_size(sz: usize) -> String {
    if sz > 1024 * 1024 {
        format!("{} MB", sz / (1024 * 1024))
    } else if sz > 1024 {
        format!("{} KB", sz / 1024)
    } else {
        format!("{sz} bytes")
    }
}

fn counting_thread(quit: Arc<AtomicBool>, counter: Arc<AtomicUsize>) {
    let mut i = 0usize;
    while !quit.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
        i += 1;
        if i % 10 != 0 {
            continue;
        }
        i = 0;
        let bytes = counter.swap(0, Ordering::Relaxed);
        println!("{}/s", str_of_size(bytes));
    }
}

fn do_send(quit: Arc<AtomicBool>) {
    println!(
        "do_send: start [{} - {}]...",
        str_of_size(MIN_SZ),
        str_of_size(MAX_SZ)
    );

    let que = Channel::connect(CHANNEL_NAME).expect("connect sender");
    que.wait_for_recv(1, None);

    let counter = Arc::new(AtomicUsize::new(0));
    let counting = {
        let q = Arc::clone(&quit);
        let c = Arc::clone(&counter);
        thread::spawn(move || counting_thread(q, c))
    };

    let mut sz = MIN_SZ;
    while !quit.load(Ordering::Acquire) {
        let buffer = vec![b'M'; sz];
        if que.send(&buffer) {
            counter.fetch_add(sz, Ordering::Relaxed);
        }
        sz = if sz >= MAX_SZ { MIN_SZ } else { sz * 2 };
    }

    counting.join().unwrap();
    println!("do_send: quit...");
}

fn do_recv(quit: Arc<AtomicBool>) {
    println!("do_recv: start...");

    let mut que = Channel::connect(CHANNEL_NAME).expect("connect receiver");

    let counter = Arc::new(AtomicUsize::new(0));
    let counting = {
        let q = Arc::clone(&quit);
        let c = Arc::clone(&counter);
        thread::spawn(move || counting_thread(q, c))
    };

    while !quit.load(Ordering::Acquire) {
        let buf = que.recv();
        counter.fetch_add(buf.len(), Ordering::Relaxed);
    }

    counting.join().unwrap();
    println!("do_recv: quit...");
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_msg_que s|r");
        std::process::exit(1);
    }

    let quit = Arc::new(AtomicBool::new(false));

    {
        let q = Arc::clone(&quit);
        on_terminate(move || q.store(true, Ordering::Release));
    }

    match args[1].as_str() {
        "s" => {
            Channel::clear_storage(CHANNEL_NAME);
            do_send(quit);
        }
        "r" => do_recv(quit),
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(1);
        }
    }
}

// Minimal signal hook: sets the quit flag on SIGINT / SIGTERM / SIGHUP.
fn on_terminate(f: impl Fn() + Send + 'static) {
    use std::sync::Mutex;
    static CB: std::sync::OnceLock<Mutex<Box<dyn Fn() + Send>>> = std::sync::OnceLock::new();
    CB.get_or_init(|| Mutex::new(Box::new(f)));
    extern "C" fn handler(_: libc::c_int) {
        if let Some(cb) = CB.get() {
            if let Ok(g) = cb.lock() {
                g();
            }
        }
    }
    unsafe {
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handler as *const () as libc::sighandler_t);
    }
}
