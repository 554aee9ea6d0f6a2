use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A stored record: user data plus the metadata the engine maintains.
///
/// `id` is assigned at insert and never changes; `created_at` and
/// `updated_at` are milliseconds since the Unix epoch. The engine only
/// refreshes `updated_at` through explicit update operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document<T> {
    pub id: String,
    pub data: T,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<T> Document<T> {
    pub(crate) fn new(id: String, data: T, now: i64) -> Self {
        Self {
            id,
            data,
            created_at: now,
            updated_at: now,
        }
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Milliseconds since epoch, strictly increasing within the process.
///
/// Successive updates of the same document must observe a growing
/// `updated_at` even when the wall clock has not advanced a full
/// millisecond, so ties bump past the last value handed out.
pub(crate) fn now_ms() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}
