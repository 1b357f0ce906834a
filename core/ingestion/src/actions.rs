//! In-place edits of a user's goals array. The store wraps these in a
//! versioned read-modify-write (see `Database::modify_actions`).

use jarvis_schemas::{Action, CreateActionRequest, UpdateActionRequest};
use thiserror::Error;

pub const MAX_ACTION_TEXT_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action {0} not found")]
    NotFound(i64),

    #[error("{0}")]
    Invalid(String),

    #[error("actions for {0} were modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Creation-time millis, moved past the largest existing id on collision
pub fn next_action_id(actions: &[Action], now_millis: i64) -> i64 {
    actions
        .iter()
        .map(|a| a.id)
        .max()
        .map_or(now_millis, |max_id| now_millis.max(max_id + 1))
}

fn validate_text(text: &str) -> Result<String, ActionError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ActionError::Invalid("text is required".to_string()));
    }
    if text.chars().count() > MAX_ACTION_TEXT_LEN {
        return Err(ActionError::Invalid(format!(
            "text must be at most {} characters",
            MAX_ACTION_TEXT_LEN
        )));
    }
    Ok(text.to_string())
}

pub fn create_action(
    actions: &mut Vec<Action>,
    request: &CreateActionRequest,
    now_millis: i64,
    now_rfc3339: &str,
) -> Result<Action, ActionError> {
    let text = validate_text(request.text.as_deref().unwrap_or_default())?;

    let action = Action {
        id: next_action_id(actions, now_millis),
        kind: request.kind,
        text,
        date: request.date.clone(),
        completed: false,
        created_at: now_rfc3339.to_string(),
        completed_at: None,
    };

    actions.push(action.clone());
    Ok(action)
}

pub fn update_action(
    actions: &mut [Action],
    id: i64,
    request: &UpdateActionRequest,
    now_rfc3339: &str,
) -> Result<Action, ActionError> {
    let text = request.text.as_deref().map(validate_text).transpose()?;

    let action = actions
        .iter_mut()
        .find(|a| a.id == id)
        .ok_or(ActionError::NotFound(id))?;

    if let Some(text) = text {
        action.text = text;
    }
    if let Some(kind) = request.kind {
        action.kind = kind;
    }
    if let Some(ref date) = request.date {
        action.date = Some(date.clone());
    }
    if let Some(completed) = request.completed {
        if completed && !action.completed {
            action.completed_at = Some(now_rfc3339.to_string());
        } else if !completed {
            action.completed_at = None;
        }
        action.completed = completed;
    }

    Ok(action.clone())
}

pub fn delete_action(actions: &mut Vec<Action>, id: i64) -> Result<Action, ActionError> {
    let index = actions
        .iter()
        .position(|a| a.id == id)
        .ok_or(ActionError::NotFound(id))?;
    Ok(actions.remove(index))
}
