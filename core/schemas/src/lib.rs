use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Webhook Schema
// ============================================================================

/// A single speech-to-text fragment delivered by the capture device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub text: String,
    pub start: Option<f64>,
    pub is_user: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub session_id: Option<String>,
    pub uid: Option<String>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

/// Coalesced message held in a session buffer and mirrored into the
/// persisted session row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub text: String,
    pub timestamp: f64, // seconds since the unix epoch
    #[serde(rename = "isUser")]
    pub is_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub prompt: String,
    pub params: Vec<String>,
    pub context: NotificationContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationContext {
    pub filters: NotificationFilters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilters {
    pub people: Vec<String>,
    pub entities: Vec<String>,
    pub topics: Vec<String>,
}

// ============================================================================
// Session Storage Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub uid: Option<UserId>,
    pub messages: Vec<BufferedMessage>,
    pub last_activity: String, // RFC3339
    pub created_at: String,    // RFC3339
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub text: String,
    pub messages: Vec<BufferedMessage>,
    pub created: String, // RFC3339
    pub session_id: SessionId,
}

impl From<SessionRecord> for Transcript {
    fn from(record: SessionRecord) -> Self {
        let text = record
            .messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            id: record.session_id.0.clone(),
            text,
            messages: record.messages,
            created: record.created_at,
            session_id: record.session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentSession {
    pub session_id: SessionId,
    pub message_count: usize,
    pub last_activity: String, // RFC3339
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub uid: UserId,
    pub total_sessions: usize,
    pub total_messages: usize,
    pub total_actions: usize,
    pub last_activity: Option<String>, // RFC3339
    pub recent_sessions: Vec<RecentSession>,
}

// ============================================================================
// Action (Goal) Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    #[serde(rename = "task")]
    Task,
    #[serde(rename = "reminder")]
    Reminder,
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "note")]
    Note,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Task => "task",
            ActionType::Reminder => "reminder",
            ActionType::Event => "event",
            ActionType::Note => "note",
        }
    }
}

impl Default for ActionType {
    fn default() -> Self {
        ActionType::Task
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: i64, // creation time in unix millis
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub text: String,
    pub date: Option<String>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: String,           // RFC3339
    pub completed_at: Option<String>, // RFC3339
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActionRequest {
    pub uid: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ActionType,
    pub text: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateActionRequest {
    pub uid: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<ActionType>,
    pub text: Option<String>,
    pub date: Option<String>,
    pub completed: Option<bool>,
}

// ============================================================================
// Preferences
// ============================================================================

pub const DEFAULT_SALUTATION: &str = "sir";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub salutation: String,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            salutation: DEFAULT_SALUTATION.to_string(),
        }
    }
}

// ============================================================================
// Chat API Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRequest {
    pub uid: Option<String>,
    pub session_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageResponse {
    pub session_id: SessionId,
    pub reply: String,
    pub degraded: bool,
    pub messages: Vec<BufferedMessage>,
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_chat_session_id() -> SessionId {
    SessionId(format!("chat_{}", ulid::Ulid::new()))
}

/// Count whitespace-separated words, the unit used for silence recovery.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
