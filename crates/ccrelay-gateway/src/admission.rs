//! Per-session admission control: one in-flight request per session, and
//! suppression of exact duplicates inside a short window.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Two identical bodies inside this window are duplicates.
pub const DEDUPE_WINDOW: Duration = Duration::from_secs(2);
/// Dedupe entries are evictable after this long.
const DEDUPE_TTL: Duration = Duration::from_secs(60);
/// Active requests older than this are considered abandoned.
const SESSION_TTL: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct ActiveRequest {
    started: Instant,
    content_hash: String,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct DedupeEntry {
    first_seen: Instant,
    in_progress: bool,
}

#[derive(Debug)]
pub struct Rejection {
    pub reason: String,
}

#[derive(Default, Debug)]
pub struct Admission {
    active: DashMap<String, ActiveRequest>,
    dedupe: DashMap<String, DedupeEntry>,
}

/// Releases the session slot when dropped, so teardown fires on success,
/// on error, and on client disconnect alike.
#[derive(Debug)]
pub struct AdmissionGuard {
    admission: Arc<Admission>,
    session_key: String,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.admission.end(&self.session_key);
    }
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a request, or reject it as a duplicate / busy session.
    pub fn begin(
        self: &Arc<Self>,
        session_key: &str,
        content_hash: &str,
    ) -> Result<(AdmissionGuard, CancellationToken), Rejection> {
        // Duplicate suppression first: an in-progress entry younger than
        // the window wins over the session check.
        match self.dedupe.entry(content_hash.to_string()) {
            Entry::Occupied(mut entry) => {
                let seen = entry.get();
                if seen.in_progress && seen.first_seen.elapsed() < DEDUPE_WINDOW {
                    return Err(Rejection {
                        reason: "Duplicate request already in progress".into(),
                    });
                }
                entry.insert(DedupeEntry {
                    first_seen: Instant::now(),
                    in_progress: true,
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(DedupeEntry {
                    first_seen: Instant::now(),
                    in_progress: true,
                });
            }
        }

        let cancel = CancellationToken::new();
        match self.active.entry(session_key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().started.elapsed() < SESSION_TTL {
                    // roll back the dedupe claim made above
                    if let Some(mut seen) = self.dedupe.get_mut(content_hash) {
                        seen.in_progress = false;
                    }
                    return Err(Rejection {
                        reason: "Session busy with another request".into(),
                    });
                }
                // abandoned entry — cancel whatever held it and take over
                entry.get().cancel.cancel();
                entry.insert(ActiveRequest {
                    started: Instant::now(),
                    content_hash: content_hash.to_string(),
                    cancel: cancel.clone(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(ActiveRequest {
                    started: Instant::now(),
                    content_hash: content_hash.to_string(),
                    cancel: cancel.clone(),
                });
            }
        }

        debug!(session = session_key, "request admitted");
        Ok((
            AdmissionGuard {
                admission: self.clone(),
                session_key: session_key.to_string(),
            },
            cancel,
        ))
    }

    /// Release the session slot; the dedupe entry stays for the rest of
    /// its window with `in_progress` off.
    fn end(&self, session_key: &str) {
        if let Some((_, active)) = self.active.remove(session_key) {
            if let Some(mut seen) = self.dedupe.get_mut(&active.content_hash) {
                seen.in_progress = false;
            }
        }
    }

    /// Evict abandoned sessions (cancelling their pipelines) and expired
    /// dedupe entries.
    pub fn sweep(&self) {
        let before = self.active.len();
        self.active.retain(|_, req| {
            let keep = req.started.elapsed() < SESSION_TTL;
            if !keep {
                req.cancel.cancel();
            }
            keep
        });
        self.dedupe
            .retain(|_, seen| seen.first_seen.elapsed() < DEDUPE_TTL);
        let evicted = before.saturating_sub(self.active.len());
        if evicted > 0 {
            info!(evicted, "swept abandoned sessions");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        let admission = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // skip the immediate first tick
            loop {
                tick.tick().await;
                admission.sweep();
            }
        });
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        self.active.len()
    }
}

/// Derive the session key from the request body: explicit `session_id`,
/// else the shape-specific first-element hash. Including the sequence
/// length keeps successive turns of a tool-calling loop from colliding.
pub fn session_key(body: &Value) -> String {
    if let Some(id) = body.get("session_id").and_then(|v| v.as_str()) {
        return id.to_string();
    }
    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        if let Some(first) = messages.first() {
            return format!("msg_{}_{}", messages.len(), short_hash(first));
        }
    }
    if let Some(input) = body.get("input").and_then(|m| m.as_array()) {
        if let Some(first) = input.first() {
            return format!("input_{}_{}", input.len(), short_hash(first));
        }
    }
    format!("req_{}", short_hash(body))
}

/// Full digest of the whole body, for duplicate detection.
pub fn content_hash(body: &Value) -> String {
    hex::encode(Sha256::digest(body.to_string().as_bytes()))
}

fn short_hash(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    hex::encode(&digest[..8])
}
