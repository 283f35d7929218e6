//! Wall-clock timestamps recorded on instances.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current UTC time as RFC 3339 with millisecond precision.
///
/// Strictly increasing within the process: two calls in the same millisecond
/// get distinct stamps, so `created` tells apart records that reuse an id.
pub fn now() -> String {
    let wall = Utc::now().timestamp_millis();
    let mut last = LAST_MILLIS.load(Ordering::Relaxed);
    let millis = loop {
        let next = wall.max(last + 1);
        match LAST_MILLIS.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(actual) => last = actual,
        }
    };
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(stamp) => stamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}
