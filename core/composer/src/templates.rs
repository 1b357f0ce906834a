use chrono::{DateTime, Utc};
use jarvis_schemas::{BufferedMessage, Notification, NotificationContext};

/// Template parameters the capture service fills in before running a
/// notification prompt.
pub const NOTIFICATION_PARAMS: [&str; 2] = ["user_name", "user_facts"];

/// Renders the persona, notification and fallback texts for one assistant name
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    assistant_name: String,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new("Jarvis")
    }
}

impl PromptRenderer {
    pub fn new(assistant_name: impl Into<String>) -> Self {
        Self {
            assistant_name: assistant_name.into(),
        }
    }

    pub fn assistant_name(&self) -> &str {
        &self.assistant_name
    }

    /// System prompt sent ahead of every chat-completion attempt
    pub fn persona_system_prompt(&self, salutation: &str) -> String {
        format!(
            "You are {name}, a highly capable personal AI assistant with a dry wit and impeccable manners. \
             Always address the user as \"{salutation}\". \
             Keep replies brief and conversational: two or three sentences unless asked for detail. \
             Never mention that you are a language model.",
            name = self.assistant_name,
            salutation = salutation,
        )
    }

    /// Prompt emitted when a flushed buffer mentions the assistant by name.
    /// `{{user_name}}` and `{{user_facts}}` stay unexpanded.
    pub fn notification_prompt(&self, messages: &[BufferedMessage]) -> String {
        let mut lines = vec![
            format!(
                "You are {}, an AI assistant listening in on {{{{user_name}}}}'s conversation.",
                self.assistant_name
            ),
            format!(
                "Someone just addressed you by name. Respond in one or two short sentences, \
                 the way {} would, directly to what was asked.",
                self.assistant_name
            ),
            String::new(),
            "What you know about {{user_name}}:".to_string(),
            "{{user_facts}}".to_string(),
            String::new(),
            "Conversation:".to_string(),
        ];

        for message in messages {
            lines.push(format!(
                "[{}] {}: {}",
                format_clock(message.timestamp),
                speaker_label(message),
                message.text
            ));
        }

        lines.join("\n")
    }

    /// Webhook notification for a flushed buffer. Context filters are left
    /// empty for the capture service to fill.
    pub fn notification(&self, messages: &[BufferedMessage]) -> Notification {
        Notification {
            prompt: self.notification_prompt(messages),
            params: NOTIFICATION_PARAMS.iter().map(|p| p.to_string()).collect(),
            context: NotificationContext::default(),
        }
    }

    /// Canned reply used when no provider answers
    pub fn fallback_reply(&self, salutation: &str) -> String {
        format!(
            "My apologies, {}, but I'm unable to reach my reasoning services at the moment. \
             Please try again shortly.",
            salutation
        )
    }
}

fn speaker_label(message: &BufferedMessage) -> &'static str {
    if message.is_user {
        "User"
    } else {
        "Other"
    }
}

/// `HH:MM:SS` in UTC, or the raw offset for relative segment times
fn format_clock(timestamp: f64) -> String {
    match DateTime::<Utc>::from_timestamp(timestamp.trunc() as i64, 0) {
        Some(dt) if timestamp >= 86_400.0 => dt.format("%H:%M:%S").to_string(),
        _ => format!("{:.1}s", timestamp),
    }
}
