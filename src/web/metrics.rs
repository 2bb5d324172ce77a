use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use once_cell::sync::Lazy;

static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

static MATTERMOST_EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MATTERMOST_EVENTS_DROPPED: AtomicU64 = AtomicU64::new(0);
static MATTERMOST_EVENTS_FORWARDED: AtomicU64 = AtomicU64::new(0);
static MATTERMOST_EVENTS_FAILED: AtomicU64 = AtomicU64::new(0);
static MATRIX_EVENTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static MATRIX_EVENTS_FORWARDED: AtomicU64 = AtomicU64::new(0);
static MATRIX_EVENTS_FAILED: AtomicU64 = AtomicU64::new(0);
static WEBSOCKET_RECONNECTS: AtomicU64 = AtomicU64::new(0);
static SLASH_COMMANDS: AtomicU64 = AtomicU64::new(0);

/// Process-wide counters. Methods are associated functions so any layer can bump them
/// without holding a handle.
pub struct Metrics;

impl Metrics {
    /// Pins the uptime origin. Called once at startup.
    pub fn start() {
        Lazy::force(&STARTED_AT);
    }

    pub fn mattermost_event_received() {
        MATTERMOST_EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    /// Loop-prevention and classification drops.
    pub fn mattermost_event_dropped() {
        MATTERMOST_EVENTS_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mattermost_event_forwarded() {
        MATTERMOST_EVENTS_FORWARDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mattermost_event_failed() {
        MATTERMOST_EVENTS_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matrix_event_received() {
        MATRIX_EVENTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matrix_event_forwarded() {
        MATRIX_EVENTS_FORWARDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matrix_event_failed() {
        MATRIX_EVENTS_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_reconnect() {
        WEBSOCKET_RECONNECTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slash_command() {
        SLASH_COMMANDS.fetch_add(1, Ordering::Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: &AtomicU64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n\n",
        value.load(Ordering::Relaxed)
    ));
}

pub fn format_prometheus() -> String {
    let mut out = format!(
        "# HELP bridge_uptime_seconds Number of seconds the bridge has been running\n\
         # TYPE bridge_uptime_seconds gauge\n\
         bridge_uptime_seconds {}\n\n",
        STARTED_AT.elapsed().as_secs()
    );
    counter(
        &mut out,
        "mattermost_events_received_total",
        "Mattermost websocket events received",
        &MATTERMOST_EVENTS_RECEIVED,
    );
    counter(
        &mut out,
        "mattermost_events_dropped_total",
        "Mattermost events dropped before dispatch",
        &MATTERMOST_EVENTS_DROPPED,
    );
    counter(
        &mut out,
        "mattermost_events_forwarded_total",
        "Mattermost events queued for Matrix",
        &MATTERMOST_EVENTS_FORWARDED,
    );
    counter(
        &mut out,
        "mattermost_events_failed_total",
        "Mattermost events that could not be queued or delivered",
        &MATTERMOST_EVENTS_FAILED,
    );
    counter(
        &mut out,
        "matrix_events_received_total",
        "Matrix events received from the homeserver",
        &MATRIX_EVENTS_RECEIVED,
    );
    counter(
        &mut out,
        "matrix_events_forwarded_total",
        "Matrix events written to Mattermost",
        &MATRIX_EVENTS_FORWARDED,
    );
    counter(
        &mut out,
        "matrix_events_failed_total",
        "Matrix events that failed to reach Mattermost",
        &MATRIX_EVENTS_FAILED,
    );
    counter(
        &mut out,
        "websocket_reconnects_total",
        "Mattermost websocket reconnect attempts",
        &WEBSOCKET_RECONNECTS,
    );
    counter(
        &mut out,
        "slash_commands_total",
        "Slash command requests handled",
        &SLASH_COMMANDS,
    );
    out
}
