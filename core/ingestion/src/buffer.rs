//! Per-session transcript buffering and silence segmentation.
//!
//! A [`SessionBuffer`] coalesces streaming segments into messages and moves
//! through three phases:
//!
//! - `Idle`: nothing buffered.
//! - `Buffering`: messages pending the next analysis window.
//! - `Silent`: the session went quiet for longer than the silence threshold.
//!   Buffered messages were dropped and the buffer waits for enough new words
//!   before analysis resumes.
//!
//! All transitions take the current time as an argument so the machine can be
//! exercised without a live clock. [`BufferManager`] owns the buffers for the
//! whole process and loads or creates them against the store on first use.

use jarvis_schemas::{word_count, BufferedMessage, Segment, SessionId, SessionRecord, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{format_timestamp, parse_timestamp};
use crate::database::Database;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Inactivity after which the next request starts a silence period
    pub silence_threshold_secs: f64,
    /// Minimum time between two flushes
    pub analysis_interval_secs: f64,
    /// Words needed after silence before analysis resumes
    pub min_words_after_silence: usize,
    /// Max start-time gap for two same-speaker segments to merge
    pub merge_window_secs: f64,
    /// Inactivity after which a buffer is evicted from memory
    pub idle_eviction_secs: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            silence_threshold_secs: 120.0,
            analysis_interval_secs: 30.0,
            min_words_after_silence: 5,
            merge_window_secs: 2.0,
            idle_eviction_secs: 3600.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPhase {
    Idle,
    Buffering,
    Silent { words_after_silence: usize },
}

#[derive(Debug, Clone)]
pub struct SessionBuffer {
    session_id: SessionId,
    uid: Option<UserId>,
    messages: Vec<BufferedMessage>,
    last_analysis_time: f64,
    last_activity: f64,
    phase: BufferPhase,
}

impl SessionBuffer {
    pub fn new(session_id: SessionId, now: f64) -> Self {
        Self {
            session_id,
            uid: None,
            messages: Vec::new(),
            last_analysis_time: now,
            last_activity: now,
            phase: BufferPhase::Idle,
        }
    }

    /// Rebuild a buffer from its persisted row. The analysis window restarts
    /// at `now`; `last_activity` comes from the row so a long-dormant session
    /// still enters silence on its next segment.
    pub fn restore(record: SessionRecord, now: f64) -> Self {
        let last_activity = parse_timestamp(&record.last_activity).unwrap_or(now);
        let phase = if record.messages.is_empty() {
            BufferPhase::Idle
        } else {
            BufferPhase::Buffering
        };

        Self {
            session_id: record.session_id,
            uid: record.uid,
            messages: record.messages,
            last_analysis_time: now,
            last_activity,
            phase,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn uid(&self) -> Option<&UserId> {
        self.uid.as_ref()
    }

    pub fn set_uid(&mut self, uid: UserId) {
        self.uid = Some(uid);
    }

    pub fn messages(&self) -> &[BufferedMessage] {
        &self.messages
    }

    pub fn phase(&self) -> BufferPhase {
        self.phase
    }

    pub fn silence_detected(&self) -> bool {
        matches!(self.phase, BufferPhase::Silent { .. })
    }

    pub fn words_after_silence(&self) -> usize {
        match self.phase {
            BufferPhase::Silent {
                words_after_silence,
            } => words_after_silence,
            _ => 0,
        }
    }

    pub fn last_activity(&self) -> f64 {
        self.last_activity
    }

    pub fn last_analysis_time(&self) -> f64 {
        self.last_analysis_time
    }

    /// Feed one webhook delivery into the buffer
    pub fn ingest(&mut self, segments: &[Segment], now: f64, config: &BufferConfig) {
        if now - self.last_activity > config.silence_threshold_secs {
            debug!(
                "Silence detected for session {} after {:.1}s",
                self.session_id,
                now - self.last_activity
            );
            self.messages.clear();
            self.phase = BufferPhase::Silent {
                words_after_silence: 0,
            };
        }

        for segment in segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }

            if let BufferPhase::Silent {
                words_after_silence,
            } = self.phase
            {
                let words = words_after_silence + word_count(text);
                if words >= config.min_words_after_silence {
                    debug!("Silence ended for session {}", self.session_id);
                    self.phase = BufferPhase::Buffering;
                    self.last_analysis_time = now;
                } else {
                    self.phase = BufferPhase::Silent {
                        words_after_silence: words,
                    };
                }
            }

            self.append(
                text,
                segment.start.unwrap_or(now),
                segment.is_user.unwrap_or(false),
                config,
            );
        }

        self.last_activity = now;
        self.settle_phase();
    }

    /// Merge into the last message when the speaker matches and the start
    /// times are within the merge window, otherwise start a new message.
    fn append(&mut self, text: &str, timestamp: f64, is_user: bool, config: &BufferConfig) {
        if let Some(last) = self.messages.last_mut() {
            if last.is_user == is_user && (last.timestamp - timestamp).abs() < config.merge_window_secs
            {
                last.text.push(' ');
                last.text.push_str(text);
                return;
            }
        }

        self.messages.push(BufferedMessage {
            text: text.to_string(),
            timestamp,
            is_user,
        });
    }

    /// Append a whole message without merging (chat turns)
    pub fn push_message(&mut self, message: BufferedMessage, now: f64) {
        self.messages.push(message);
        self.last_activity = now;
        self.settle_phase();
    }

    fn settle_phase(&mut self) {
        if !self.silence_detected() {
            self.phase = if self.messages.is_empty() {
                BufferPhase::Idle
            } else {
                BufferPhase::Buffering
            };
        }
    }

    pub fn flush_due(&self, now: f64, config: &BufferConfig) -> bool {
        now - self.last_analysis_time >= config.analysis_interval_secs
            && !self.messages.is_empty()
            && !self.silence_detected()
    }

    /// End the current buffering epoch when due, returning what was buffered
    pub fn flush_if_due(&mut self, now: f64, config: &BufferConfig) -> Option<Vec<BufferedMessage>> {
        if !self.flush_due(now, config) {
            return None;
        }

        self.last_analysis_time = now;
        self.phase = BufferPhase::Idle;
        Some(std::mem::take(&mut self.messages))
    }

    pub fn is_idle_since(&self, cutoff: f64) -> bool {
        self.last_activity < cutoff
    }
}

/// Process-wide map of live session buffers
pub struct BufferManager {
    buffers: Mutex<HashMap<SessionId, Arc<Mutex<SessionBuffer>>>>,
    config: BufferConfig,
}

impl BufferManager {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Return the live buffer for a session, loading it from the store or
    /// creating (and persisting) a fresh one. Store failures fall back to an
    /// in-memory buffer.
    pub async fn get_buffer(
        &self,
        db: &Mutex<Database>,
        session_id: &SessionId,
        now: f64,
    ) -> Arc<Mutex<SessionBuffer>> {
        let mut buffers = self.buffers.lock().await;
        if let Some(existing) = buffers.get(session_id) {
            return existing.clone();
        }

        let buffer = {
            let db = db.lock().await;
            match db.get_session(session_id) {
                Ok(Some(record)) => {
                    info!("Restored session {} from store", session_id);
                    SessionBuffer::restore(record, now)
                }
                Ok(None) => {
                    if let Err(e) = db.create_session(session_id, None, &format_timestamp(now)) {
                        warn!("Failed to create session row {}: {}", session_id, e);
                    }
                    info!("Created session buffer {}", session_id);
                    SessionBuffer::new(session_id.clone(), now)
                }
                Err(e) => {
                    warn!(
                        "Failed to load session {}, using in-memory buffer: {}",
                        session_id, e
                    );
                    SessionBuffer::new(session_id.clone(), now)
                }
            }
        };

        let handle = Arc::new(Mutex::new(buffer));
        buffers.insert(session_id.clone(), handle.clone());
        handle
    }

    /// Live buffer for a session, without touching the store
    pub async fn peek(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionBuffer>>> {
        self.buffers.lock().await.get(session_id).cloned()
    }

    pub async fn active_sessions(&self) -> usize {
        self.buffers.lock().await.len()
    }

    /// Drop buffers idle for longer than the eviction window. A buffer whose
    /// handle is held outside the map belongs to an in-flight request and is
    /// skipped. Handles are only cloned under the map lock, so the count
    /// cannot grow while we hold it.
    pub async fn evict_idle(&self, now: f64) -> usize {
        let cutoff = now - self.config.idle_eviction_secs;
        let mut buffers = self.buffers.lock().await;
        let before = buffers.len();

        buffers.retain(|session_id, handle| {
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            match handle.try_lock() {
                Ok(buffer) => {
                    let keep = !buffer.is_idle_since(cutoff);
                    if !keep {
                        debug!("Evicting idle session buffer {}", session_id);
                    }
                    keep
                }
                Err(_) => true,
            }
        });

        before - buffers.len()
    }
}

/// Best-effort write of a buffer's current state to its session row
pub fn persist_buffer(db: &Database, buffer: &SessionBuffer) -> anyhow::Result<()> {
    db.save_session(
        buffer.session_id(),
        buffer.uid(),
        buffer.messages(),
        &format_timestamp(buffer.last_activity()),
    )
}
