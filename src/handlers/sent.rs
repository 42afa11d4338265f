//! Message-IDs that already got outbound mail in this process.
//!
//! A handler that sent its reply but then failed on the mailbox side is run
//! again on the next pass. The log lets it skip the send the second time.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use super::HandlerKind;

const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded set of `(handler, Message-ID)` pairs. Oldest entries are evicted
/// first once the capacity is reached.
pub struct SentLog {
    inner: Mutex<Entries>,
    capacity: usize,
}

#[derive(Default)]
struct Entries {
    set: HashSet<(HandlerKind, String)>,
    order: VecDeque<(HandlerKind, String)>,
}

impl Default for SentLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SentLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Entries::default()),
            capacity: capacity.max(1),
        }
    }

    /// Whether `handler` already sent mail for `message_id`.
    pub fn contains(&self, handler: HandlerKind, message_id: &str) -> bool {
        self.inner
            .lock()
            .map(|e| e.set.contains(&(handler, message_id.to_string())))
            .unwrap_or(false)
    }

    pub fn record(&self, handler: HandlerKind, message_id: &str) {
        let Ok(mut entries) = self.inner.lock() else {
            return;
        };
        let key = (handler, message_id.to_string());
        if !entries.set.insert(key.clone()) {
            return;
        }
        entries.order.push_back(key);
        while entries.order.len() > self.capacity {
            if let Some(old) = entries.order.pop_front() {
                entries.set.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|e| e.set.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
