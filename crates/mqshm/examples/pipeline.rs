// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-process pipeline example.
//!
//! Run a producer and any number of consumers in separate terminals; all
//! of them meet in shared memory.
//!
//! Terminal 1 (producer):
//! ```bash
//! cargo run --example pipeline -- produce
//! ```
//!
//! Terminal 2..n (consumers):
//! ```bash
//! cargo run --example pipeline -- consume
//! ```
//!
//! Cleanup of leftover segments:
//! ```bash
//! cargo run --example pipeline -- cleanup
//! ```

use mqshm::config::{port_segment_name, ShmConfig};
use mqshm::{cleanup_stale_segments, PortQueue, Registry, ShmError, ShmManager, Timestamp};
use std::sync::Arc;
use std::time::Duration;

const QUEUE_CAPACITY: usize = 64;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("Usage: {} <produce|consume|cleanup>", args[0]);
        return;
    }

    match args[1].as_str() {
        "produce" => run_producer(),
        "consume" => run_consumer(),
        "cleanup" => run_cleanup(),
        other => println!("Unknown command: {other}"),
    }
}

fn attach(role: &str) -> (ShmManager, String) {
    let registry = Arc::new(Registry::init_or_attach().expect("registry"));
    let process_id = registry.register_process(role).expect("process slot");
    let manager = ShmManager::new(registry, process_id, ShmConfig::default_config())
        .expect("manager");
    (manager, port_segment_name(1, 0, 2, 0))
}

fn run_producer() {
    let (manager, queue_name) = attach("pipeline_producer");
    let queue = PortQueue::create(&queue_name, 1, QUEUE_CAPACITY, manager.allocator())
        .expect("queue (is another producer running?)");

    println!("Producer ready on {queue_name}. Ctrl+C to stop.");

    let mut seq = 0u64;
    loop {
        let msg = format!("sample #{seq} from pid {}", std::process::id());
        let mut buf = match manager.allocate(msg.len()) {
            Ok(buf) => buf,
            Err(e) => {
                // Exhaustion is backpressure, not failure
                log::warn!("allocate: {e}");
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        buf.data_mut().copy_from_slice(msg.as_bytes());
        buf.set_timestamp(Timestamp::now());

        match queue.push_with_timeout(&buf, Duration::from_secs(1)) {
            Ok(()) => {
                println!("[TX] {msg} (consumers={})", queue.consumer_count());
                seq += 1;
            }
            Err(ShmError::QueueFull) => log::warn!("queue full, retrying"),
            Err(e) => {
                log::error!("push: {e}");
                break;
            }
        }

        std::thread::sleep(Duration::from_millis(500));
    }
}

fn run_consumer() {
    let (manager, queue_name) = attach("pipeline_consumer");

    let queue = loop {
        match PortQueue::open(&queue_name, manager.allocator()) {
            Ok(queue) => break queue,
            Err(e) => {
                println!("Waiting for producer ({e})");
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    };

    let consumer = queue.register_consumer().expect("consumer slot");
    println!("Consumer {consumer} attached to {queue_name}.");

    loop {
        match queue.pop_with_timeout(consumer, Duration::from_secs(1)) {
            Ok(buf) => {
                let text = String::from_utf8_lossy(buf.data());
                println!("[RX:{consumer}] {text} (ts={})", buf.timestamp().to_nanos());
            }
            Err(ShmError::QueueEmpty) => {}
            Err(ShmError::Closed) => {
                println!("Queue closed by producer; unregistering.");
                queue.unregister_consumer(consumer).ok();
                return;
            }
            Err(e) => {
                log::error!("pop: {e}");
                queue.unregister_consumer(consumer).ok();
                return;
            }
        }
    }
}

fn run_cleanup() {
    let cleaned = cleanup_stale_segments();
    println!("Cleaned {cleaned} stale queue segments.");

    println!("Remaining mqshm segments in /dev/shm:");
    let mut found = false;
    if let Ok(entries) = std::fs::read_dir("/dev/shm") {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("mqshm_") {
                    println!("  {name}");
                    found = true;
                }
            }
        }
    }
    if !found {
        println!("  (none)");
    }
}
