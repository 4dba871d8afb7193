use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

/// Longest admission window honoured; larger configured values are clamped.
pub const MAX_WINDOW: Duration = Duration::from_secs(30 * 86_400);

/// Identifies one detected change: a node within a detection-time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChangeSignature {
    pub node_id: String,
    pub bucket: i64,
}

impl ChangeSignature {
    pub fn new(node_id: impl Into<String>, detected_at: OffsetDateTime, bucket_width: Duration) -> Self {
        let width = i64::try_from(bucket_width.as_secs().max(1)).unwrap_or(i64::MAX);
        Self {
            node_id: node_id.into(),
            bucket: detected_at.unix_timestamp().div_euclid(width),
        }
    }
}

/// Expiring set of admitted change signatures.
///
/// Expired entries are dropped lazily on lookup and in bulk by [`sweep`].
///
/// [`sweep`]: ChangeDeduplicator::sweep
pub struct ChangeDeduplicator {
    window: Duration,
    bucket_width: Duration,
    admitted: Mutex<HashMap<ChangeSignature, Instant>>,
}

impl ChangeDeduplicator {
    pub fn new(window: Duration, bucket_width: Duration) -> Self {
        Self {
            window: window.min(MAX_WINDOW),
            bucket_width,
            admitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn signature_for(&self, node_id: &str, detected_at: OffsetDateTime) -> ChangeSignature {
        ChangeSignature::new(node_id, detected_at, self.bucket_width)
    }

    pub fn should_process(&self, signature: &ChangeSignature) -> bool {
        self.should_process_at(signature, Instant::now())
    }

    /// Admits `signature` unless an unexpired admission exists at `now`.
    pub fn should_process_at(&self, signature: &ChangeSignature, now: Instant) -> bool {
        let mut admitted = self.admitted.lock();
        match admitted.get(signature) {
            Some(expires_at) if now < *expires_at => false,
            _ => {
                let expires_at = now.checked_add(self.window).unwrap_or(now);
                admitted.insert(signature.clone(), expires_at);
                true
            }
        }
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Removes every admission expired at `now`; returns how many were dropped.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut admitted = self.admitted.lock();
        let before = admitted.len();
        admitted.retain(|_, expires_at| now < *expires_at);
        before - admitted.len()
    }

    pub fn len(&self) -> usize {
        self.admitted.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
