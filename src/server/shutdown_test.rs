//! Tests for the stopping flag

use super::shutdown::*;
use std::time::Duration;

#[test]
fn test_flag_starts_cleared() {
    let (_controller, signal) = shutdown_channel();

    assert!(!signal.is_stopping());
    assert_eq!(signal.reason(), None);
}

#[test]
fn test_first_stop_reason_is_kept() {
    let (controller, signal) = shutdown_channel();
    let observer = signal.clone();

    controller.stop("SIGTERM");
    controller.stop("controller stream ended");

    assert!(signal.is_stopping());
    assert_eq!(observer.reason(), Some("SIGTERM"));
}

#[tokio::test(start_paused = true)]
async fn test_stopped_resolves_when_flag_set_elsewhere() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        controller.stop("SIGINT");
    });

    let start = tokio::time::Instant::now();
    signal.stopped().await;

    assert!(start.elapsed() >= Duration::from_secs(5));
    assert_eq!(signal.reason(), Some("SIGINT"));
}

#[tokio::test]
async fn test_stopped_resolves_at_once_when_already_stopping() {
    let (controller, mut signal) = shutdown_channel();
    controller.stop("SIGTERM");

    let result = tokio::time::timeout(Duration::from_secs(1), signal.stopped()).await;

    assert!(result.is_ok());
}

/// A dropped controller releases waiters without setting the flag
#[tokio::test]
async fn test_stopped_resolves_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let result = tokio::time::timeout(Duration::from_secs(1), signal.stopped()).await;

    assert!(result.is_ok());
    assert!(!signal.is_stopping());
}
