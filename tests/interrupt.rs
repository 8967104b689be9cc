// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! SIGTERM ends a live pipeline through the orderly shutdown path.
//! Kept in its own test binary: a process holds one interrupt handler.

#![cfg(unix)]

use edgeguard::config::TransportKind;
use edgeguard::transport::{LocalBus, Transport};
use edgeguard::{EdgeConfig, EdgePipeline};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn sigterm_cancels_wait_and_disconnects() {
    let bus = LocalBus::new();
    let mut cfg = EdgeConfig::default();
    cfg.transport.kind = TransportKind::Local;
    cfg.pipeline.yolo_enabled = false;
    cfg.pipeline.shutdown_timeout_ms = 1000;
    let mut pipeline = EdgePipeline::builder(cfg)
        .transport(Arc::new(bus.clone()))
        .start()
        .unwrap();
    let signal = pipeline.shutdown_signal();
    signal.cancel_on_interrupt().unwrap();

    let pid = std::process::id().to_string();
    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        std::process::Command::new("kill")
            .args(["-TERM", &pid])
            .status()
            .unwrap()
    });

    let start = Instant::now();
    pipeline.wait(None);
    assert!(killer.join().unwrap().success());
    assert!(signal.is_cancelled());
    assert!(start.elapsed() < Duration::from_secs(5));

    pipeline.shutdown();
    assert!(bus.subscribe("adrve/commands/adrve_edge").is_err(), "transport still connected");
}
