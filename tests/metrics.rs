#![cfg(feature = "metrics")]
//! Tests for `relayframe` metrics helpers.
//!
//! These tests verify that counters, gauges and histograms update as
//! expected using `metrics_util::debugging::DebuggingRecorder`.
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use relayframe::metrics::{self as m, Direction};
use rstest::rstest;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

#[rstest]
#[case(Direction::Outbound)]
#[case(Direction::Inbound)]
fn frame_metric_increments(#[case] direction: Direction) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || m::inc_frames(direction));

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == m::FRAMES_PROCESSED
            && k.key()
                .labels()
                .any(|l| l.key() == "direction" && l.value() == direction.as_str())
            && matches!(v, DebugValue::Counter(c) if *c > 0)
    });
    assert!(found, "{} frames metric not recorded", direction.as_str());
}

#[rstest]
#[case(1)]
#[case(3)]
fn error_metric_counts(#[case] expected: u64) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        (0..expected).for_each(|_| m::inc_errors("transport"));
    });
    assert_counter_eq(&snapshotter, m::ERRORS_TOTAL, expected);
}

#[test]
fn backend_gauge_tracks_service() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        m::inc_backends("user");
        m::inc_backends("user");
        m::dec_backends("user");
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == m::BACKENDS_ACTIVE
            && k.key().labels().any(|l| l.key() == "service" && l.value() == "user")
            && matches!(v, DebugValue::Gauge(g) if (g.into_inner() - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "backend gauge not recorded: {metrics:#?}");
}

#[test]
fn latency_histogram_records_per_method() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        m::record_latency("user", "get", Duration::from_millis(3));
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == m::CALL_LATENCY
            && k.key().labels().any(|l| l.key() == "method" && l.value() == "get")
            && matches!(v, DebugValue::Histogram(h) if h.len() == 1)
    });
    assert!(found, "latency histogram not recorded");
}

fn assert_counter_eq(snapshotter: &Snapshotter, name: &str, expected: u64) {
    let metrics = snapshotter.snapshot().into_vec();
    assert!(
        metrics.iter().any(|(key, _, _, value)| {
            key.key().name() == name && matches!(value, DebugValue::Counter(c) if *c == expected)
        }),
        "expected {name} == {expected}, got {metrics:#?}"
    );
}
