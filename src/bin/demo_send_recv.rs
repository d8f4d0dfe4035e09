// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmcast contributors
//
// Usage:
//   demo_send_recv send <size> <interval_ms>
//   demo_send_recv recv <interval_ms>
//
// Two processes share a channel named "shmcast-demo". The sender fills a
// buffer of <size> bytes with 'A' and publishes it every <interval_ms>
// milliseconds. The receiver polls with the same interval and prints the
// received size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmcast::Channel;

const CHANNEL_NAME: &str = "shmcast-demo";

fn do_send(size: usize, interval_ms: u64, quit: Arc<AtomicBool>) {
    let ipc = Channel::connect(CHANNEL_NAME).expect("connect sender");
    println!("send: waiting for receiver...");
    ipc.wait_for_recv(1, None);
    println!("send: receiver connected, starting");
    let buffer = vec![b'A'; size];
    while !quit.load(Ordering::Acquire) {
        println!("send size: {}", buffer.len());
        ipc.send(&buffer);
        thread::sleep(Duration::from_millis(interval_ms));
    }
}

fn do_recv(interval_ms: u64, quit: Arc<AtomicBool>) {
    let mut ipc = Channel::connect(CHANNEL_NAME).expect("connect receiver");
    let mut k = 1usize;
    while !quit.load(Ordering::Acquire) {
        match ipc.try_recv() {
            Some(buf) => {
                println!("recv size: {}", buf.len());
                k = 1;
            }
            None => {
                println!("recv waiting... {k}");
                k += 1;
                thread::sleep(Duration::from_millis(interval_ms));
            }
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: demo_send_recv send <size> <interval_ms>");
        eprintln!("       demo_send_recv recv <interval_ms>");
        std::process::exit(1);
    }

    let quit = Arc::new(AtomicBool::new(false));

    {
        let q = Arc::clone(&quit);
        on_terminate(move || q.store(true, Ordering::Release));
    }

    match args[1].as_str() {
        "send" => {
            if args.len() < 4 {
                eprintln!("usage: demo_send_recv send <size> <interval_ms>");
                std::process::exit(1);
            }
            let size: usize = args[2].parse().expect("size");
            let interval: u64 = args[3].parse().expect("interval");
            Channel::clear_storage(CHANNEL_NAME);
            do_send(size, interval, quit);
        }
        "recv" => {
            let interval: u64 = args[2].parse().expect("interval");
            do_recv(interval, quit);
        }
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
