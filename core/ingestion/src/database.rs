use anyhow::Result;
use jarvis_schemas::{
    Action, AnalyticsSummary, BufferedMessage, Preferences, RecentSession, SessionId,
    SessionRecord, UserId,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::path::Path;
use tracing::{debug, info};

use crate::actions::ActionError;

/// Attempts at a versioned goals write before giving up
const MAX_GOAL_WRITE_ATTEMPTS: usize = 3;

const RECENT_SESSION_LIMIT: usize = 5;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file and make sure the schema exists
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        let db = Self { conn };
        db.init_schema()?;

        info!("Database initialized");
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        // Sessions mirror the in-memory buffers
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                uid TEXT,
                messages TEXT NOT NULL DEFAULT '[]',
                last_activity TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_uid ON sessions(uid)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_last_activity ON sessions(last_activity)",
            [],
        )?;

        // One row per user: goals array, analytics blob, encrypted OMI key
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                uid TEXT PRIMARY KEY,
                goals TEXT NOT NULL DEFAULT '[]',
                goals_version INTEGER NOT NULL DEFAULT 0,
                analytics TEXT NOT NULL DEFAULT '{}',
                omi_key TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Cheap round trip used by readiness checks
    pub fn ping(&self) -> Result<()> {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ========== SESSIONS ==========

    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT session_id, uid, messages, last_activity, created_at
                 FROM sessions WHERE session_id = ?1",
                params![session_id.0],
                session_from_row,
            )
            .optional()?;

        Ok(record)
    }

    /// Insert an empty row for a new session; an existing row is left alone
    pub fn create_session(
        &self,
        session_id: &SessionId,
        uid: Option<&UserId>,
        now: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, uid, messages, last_activity, created_at)
             VALUES (?1, ?2, '[]', ?3, ?3)",
            params![session_id.0, uid.map(|u| u.0.as_str()), now],
        )?;

        debug!("Created session row: {}", session_id);
        Ok(())
    }

    /// Upsert the buffered state of a session. A missing uid keeps the stored one.
    pub fn save_session(
        &self,
        session_id: &SessionId,
        uid: Option<&UserId>,
        messages: &[BufferedMessage],
        last_activity: &str,
    ) -> Result<()> {
        let messages_json = serde_json::to_string(messages)?;

        self.conn.execute(
            "INSERT INTO sessions (session_id, uid, messages, last_activity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
                uid = COALESCE(excluded.uid, sessions.uid),
                messages = excluded.messages,
                last_activity = excluded.last_activity",
            params![
                session_id.0,
                uid.map(|u| u.0.as_str()),
                messages_json,
                last_activity
            ],
        )?;

        debug!(
            "Saved session {} ({} messages)",
            session_id,
            messages.len()
        );
        Ok(())
    }

    pub fn count_sessions(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Sessions owned by a user, most recently active first
    pub fn sessions_for_user(&self, uid: &UserId) -> Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, uid, messages, last_activity, created_at
             FROM sessions
             WHERE uid = ?1
             ORDER BY last_activity DESC",
        )?;

        let sessions = stmt
            .query_map(params![uid.0], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// Delete rows whose last activity is before `cutoff` (RFC3339)
    pub fn delete_sessions_inactive_before(&self, cutoff: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM sessions WHERE last_activity < ?1",
            params![cutoff],
        )?;

        if deleted > 0 {
            info!("Deleted {} stale session rows", deleted);
        }
        Ok(deleted)
    }

    // ========== USERS ==========

    fn ensure_user(&self, uid: &UserId, now: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO users (uid, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![uid.0, now],
        )?;
        Ok(())
    }

    fn read_goals(&self, uid: &UserId) -> Result<(Vec<Action>, i64), ActionError> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT goals, goals_version FROM users WHERE uid = ?1",
                params![uid.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((goals, version)) => Ok((serde_json::from_str(&goals)?, version)),
            None => Ok((Vec::new(), 0)),
        }
    }

    pub fn get_actions(&self, uid: &UserId) -> Result<Vec<Action>> {
        let (actions, _) = self.read_goals(uid)?;
        Ok(actions)
    }

    /// Read-modify-write of the goals array guarded by `goals_version`. The
    /// write only lands if nobody bumped the version since the read;
    /// otherwise the edit is replayed on fresh data.
    pub fn modify_actions<T, F>(
        &self,
        uid: &UserId,
        now: &str,
        mut apply: F,
    ) -> Result<T, ActionError>
    where
        F: FnMut(&mut Vec<Action>) -> Result<T, ActionError>,
    {
        self.ensure_user(uid, now)?;

        for attempt in 1..=MAX_GOAL_WRITE_ATTEMPTS {
            let (mut actions, version) = self.read_goals(uid)?;
            let outcome = apply(&mut actions)?;

            let updated = self.conn.execute(
                "UPDATE users
                 SET goals = ?1, goals_version = goals_version + 1, updated_at = ?2
                 WHERE uid = ?3 AND goals_version = ?4",
                params![
                    serde_json::to_string(&actions)?,
                    now,
                    uid.0,
                    version
                ],
            )?;

            if updated == 1 {
                return Ok(outcome);
            }

            debug!(
                "Goals version conflict for {} (attempt {}/{})",
                uid, attempt, MAX_GOAL_WRITE_ATTEMPTS
            );
        }

        Err(ActionError::Conflict(uid.0.clone()))
    }

    fn read_analytics(&self, uid: &UserId) -> Result<Value> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT analytics FROM users WHERE uid = ?1",
                params![uid.0],
                |row| row.get(0),
            )
            .optional()?;

        Ok(match raw {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|_| json!({})),
            None => json!({}),
        })
    }

    pub fn get_preferences(&self, uid: &UserId) -> Result<Preferences> {
        let analytics = self.read_analytics(uid)?;

        let preferences = match analytics["preferences"]["salutation"].as_str() {
            Some(salutation) if !salutation.trim().is_empty() => Preferences {
                salutation: salutation.to_string(),
            },
            _ => Preferences::default(),
        };

        Ok(preferences)
    }

    pub fn set_salutation(&self, uid: &UserId, salutation: &str, now: &str) -> Result<Preferences> {
        self.ensure_user(uid, now)?;

        let mut analytics = self.read_analytics(uid)?;
        if !analytics.is_object() {
            analytics = json!({});
        }
        if !analytics["preferences"].is_object() {
            analytics["preferences"] = json!({});
        }
        analytics["preferences"]["salutation"] = json!(salutation);

        self.conn.execute(
            "UPDATE users SET analytics = ?1, updated_at = ?2 WHERE uid = ?3",
            params![analytics.to_string(), now, uid.0],
        )?;

        debug!("Updated salutation for {}", uid);
        Ok(Preferences {
            salutation: salutation.to_string(),
        })
    }

    pub fn get_omi_key(&self, uid: &UserId) -> Result<Option<String>> {
        let key: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT omi_key FROM users WHERE uid = ?1",
                params![uid.0],
                |row| row.get(0),
            )
            .optional()?;

        Ok(key.flatten())
    }

    /// Store (or clear, with `None`) the encrypted OMI key
    pub fn set_omi_key(&self, uid: &UserId, encrypted: Option<&str>, now: &str) -> Result<()> {
        self.ensure_user(uid, now)?;
        self.conn.execute(
            "UPDATE users SET omi_key = ?1, updated_at = ?2 WHERE uid = ?3",
            params![encrypted, now, uid.0],
        )?;
        Ok(())
    }

    // ========== ANALYTICS ==========

    pub fn analytics_summary(&self, uid: &UserId) -> Result<AnalyticsSummary> {
        let sessions = self.sessions_for_user(uid)?;
        let total_actions = self.get_actions(uid)?.len();

        let total_messages = sessions.iter().map(|s| s.messages.len()).sum();
        let last_activity = sessions.first().map(|s| s.last_activity.clone());
        let recent_sessions = sessions
            .iter()
            .take(RECENT_SESSION_LIMIT)
            .map(|s| RecentSession {
                session_id: s.session_id.clone(),
                message_count: s.messages.len(),
                last_activity: s.last_activity.clone(),
            })
            .collect();

        Ok(AnalyticsSummary {
            uid: uid.clone(),
            total_sessions: sessions.len(),
            total_messages,
            total_actions,
            last_activity,
            recent_sessions,
        })
    }
}

fn session_from_row(row: &Row) -> rusqlite::Result<SessionRecord> {
    let messages_json: String = row.get(2)?;
    let messages: Vec<BufferedMessage> = serde_json::from_str(&messages_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;

    Ok(SessionRecord {
        session_id: SessionId(row.get(0)?),
        uid: row.get::<_, Option<String>>(1)?.map(UserId),
        messages,
        last_activity: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{create_action, delete_action, update_action};
    use jarvis_schemas::{ActionType, CreateActionRequest, UpdateActionRequest};
    use tempfile::NamedTempFile;

    fn message(text: &str, timestamp: f64) -> BufferedMessage {
        BufferedMessage {
            text: text.to_string(),
            timestamp,
            is_user: true,
        }
    }

    fn uid(raw: &str) -> UserId {
        UserId(raw.to_string())
    }

    #[test]
    fn test_database_creation() {
        let temp = NamedTempFile::new().unwrap();
        let db = Database::new(temp.path()).unwrap();

        assert_eq!(db.count_sessions().unwrap(), 0);
        db.ping().unwrap();
    }

    #[test]
    fn test_session_create_save_and_reload() {
        let temp = NamedTempFile::new().unwrap();
        let session_id = SessionId("S1".to_string());

        {
            let db = Database::new(temp.path()).unwrap();
            db.create_session(&session_id, None, "2025-11-07T00:00:00.000Z")
                .unwrap();
            db.save_session(
                &session_id,
                Some(&uid("u1")),
                &[message("hello jarvis", 10.0)],
                "2025-11-07T00:00:05.000Z",
            )
            .unwrap();
        }

        let db = Database::new(temp.path()).unwrap();
        let record = db.get_session(&session_id).unwrap().unwrap();
        assert_eq!(record.uid, Some(uid("u1")));
        assert_eq!(record.messages, vec![message("hello jarvis", 10.0)]);
        assert_eq!(record.last_activity, "2025-11-07T00:00:05.000Z");
        assert_eq!(record.created_at, "2025-11-07T00:00:00.000Z");
    }

    #[test]
    fn test_save_without_uid_keeps_owner() {
        let db = Database::in_memory().unwrap();
        let session_id = SessionId("S1".to_string());

        db.save_session(&session_id, Some(&uid("u1")), &[], "2025-11-07T00:00:00.000Z")
            .unwrap();
        db.save_session(&session_id, None, &[message("x", 1.0)], "2025-11-07T00:00:01.000Z")
            .unwrap();

        let record = db.get_session(&session_id).unwrap().unwrap();
        assert_eq!(record.uid, Some(uid("u1")));
        assert_eq!(record.messages.len(), 1);
    }

    #[test]
    fn test_create_session_does_not_clobber() {
        let db = Database::in_memory().unwrap();
        let session_id = SessionId("S1".to_string());

        db.save_session(&session_id, None, &[message("kept", 1.0)], "2025-11-07T00:00:00.000Z")
            .unwrap();
        db.create_session(&session_id, None, "2025-11-08T00:00:00.000Z")
            .unwrap();

        let record = db.get_session(&session_id).unwrap().unwrap();
        assert_eq!(record.messages.len(), 1);
    }

    #[test]
    fn test_sessions_for_user_and_cleanup() {
        let db = Database::in_memory().unwrap();

        db.save_session(&SessionId("old".into()), Some(&uid("u1")), &[], "2025-11-01T00:00:00.000Z")
            .unwrap();
        db.save_session(&SessionId("new".into()), Some(&uid("u1")), &[], "2025-11-07T00:00:00.000Z")
            .unwrap();
        db.save_session(&SessionId("other".into()), Some(&uid("u2")), &[], "2025-11-07T00:00:00.000Z")
            .unwrap();

        let sessions = db.sessions_for_user(&uid("u1")).unwrap();
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.0.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        let deleted = db
            .delete_sessions_inactive_before("2025-11-06T00:00:00.000Z")
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.count_sessions().unwrap(), 2);
    }

    #[test]
    fn test_modify_actions_round_trip() {
        let db = Database::in_memory().unwrap();
        let owner = uid("u1");

        let created = db
            .modify_actions(&owner, "2025-11-07T00:00:00.000Z", |actions| {
                create_action(
                    actions,
                    &CreateActionRequest {
                        uid: Some("u1".to_string()),
                        kind: ActionType::Event,
                        text: Some("Team dinner".to_string()),
                        date: Some("2025-11-08T19:00:00Z".to_string()),
                    },
                    1_000,
                    "2025-11-07T00:00:00Z",
                )
            })
            .unwrap();

        let updated = db
            .modify_actions(&owner, "2025-11-08T21:00:00.000Z", |actions| {
                update_action(
                    actions,
                    created.id,
                    &UpdateActionRequest {
                        completed: Some(true),
                        ..Default::default()
                    },
                    "2025-11-08T21:00:00Z",
                )
            })
            .unwrap();
        assert!(updated.completed);

        let stored = db.get_actions(&owner).unwrap();
        assert_eq!(stored, vec![updated]);

        let err = db
            .modify_actions(&owner, "2025-11-08T22:00:00.000Z", |actions| delete_action(actions, 7))
            .unwrap_err();
        assert!(matches!(err, ActionError::NotFound(7)));
        assert_eq!(db.get_actions(&owner).unwrap().len(), 1);

        db.modify_actions(&owner, "2025-11-08T22:00:00.000Z", |actions| {
            delete_action(actions, created.id)
        })
            .unwrap();
        assert!(db.get_actions(&owner).unwrap().is_empty());
        assert!(db.get_actions(&uid("nobody")).unwrap().is_empty());
    }

    #[test]
    fn test_modify_actions_replays_after_version_bump() {
        let db = Database::in_memory().unwrap();
        let owner = uid("u1");
        let mut calls = 0;

        let result = db.modify_actions(&owner, "t", |actions| {
            calls += 1;
            if calls == 1 {
                // Simulate a competing writer landing between read and write
                db.conn
                    .execute(
                        "UPDATE users SET goals_version = goals_version + 1 WHERE uid = 'u1'",
                        [],
                    )
                    .unwrap();
            }
            create_action(
                actions,
                &CreateActionRequest {
                    uid: None,
                    kind: ActionType::Note,
                    text: Some("remember".to_string()),
                    date: None,
                },
                5,
                "t",
            )
        });

        assert!(result.is_ok());
        assert_eq!(calls, 2);
        assert_eq!(db.get_actions(&owner).unwrap().len(), 1);
    }

    #[test]
    fn test_preferences() {
        let db = Database::in_memory().unwrap();
        let owner = uid("u1");

        assert_eq!(db.get_preferences(&owner).unwrap().salutation, "sir");

        db.set_salutation(&owner, "captain", "2025-11-07T00:00:00.000Z")
            .unwrap();
        assert_eq!(db.get_preferences(&owner).unwrap().salutation, "captain");
    }

    #[test]
    fn test_omi_key_storage() {
        let db = Database::in_memory().unwrap();
        let owner = uid("u1");

        assert!(db.get_omi_key(&owner).unwrap().is_none());
        db.set_omi_key(&owner, Some("ciphertext"), "2025-11-07T00:00:00.000Z")
            .unwrap();
        assert_eq!(db.get_omi_key(&owner).unwrap().as_deref(), Some("ciphertext"));
        db.set_omi_key(&owner, None, "2025-11-07T00:05:00.000Z")
            .unwrap();
        assert!(db.get_omi_key(&owner).unwrap().is_none());
    }

    fn user_timestamps(db: &Database, owner: &UserId) -> (String, String) {
        db.conn
            .query_row(
                "SELECT created_at, updated_at FROM users WHERE uid = ?1",
                params![owner.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap()
    }

    #[test]
    fn test_user_timestamps_come_from_caller() {
        let db = Database::in_memory().unwrap();
        let owner = uid("u1");

        db.set_salutation(&owner, "captain", "2025-11-07T00:00:00.000Z")
            .unwrap();
        assert_eq!(
            user_timestamps(&db, &owner),
            (
                "2025-11-07T00:00:00.000Z".to_string(),
                "2025-11-07T00:00:00.000Z".to_string()
            )
        );

        db.set_omi_key(&owner, Some("sealed"), "2025-11-07T01:00:00.000Z")
            .unwrap();
        assert_eq!(user_timestamps(&db, &owner).1, "2025-11-07T01:00:00.000Z");

        db.modify_actions(&owner, "2025-11-07T02:00:00.000Z", |actions| {
            create_action(
                actions,
                &CreateActionRequest {
                    uid: None,
                    kind: ActionType::Task,
                    text: Some("stamp".to_string()),
                    date: None,
                },
                1,
                "2025-11-07T02:00:00.000Z",
            )
        })
        .unwrap();
        assert_eq!(
            user_timestamps(&db, &owner),
            (
                "2025-11-07T00:00:00.000Z".to_string(),
                "2025-11-07T02:00:00.000Z".to_string()
            )
        );
    }

    #[test]
    fn test_analytics_summary() {
        let db = Database::in_memory().unwrap();
        let owner = uid("u1");

        for i in 0..6 {
            db.save_session(
                &SessionId(format!("S{}", i)),
                Some(&owner),
                &[message("a", 1.0), message("b", 5.0)],
                &format!("2025-11-0{}T00:00:00.000Z", i + 1),
            )
            .unwrap();
        }
        db.modify_actions(&owner, "2025-11-07T00:00:00.000Z", |actions| {
            create_action(
                actions,
                &CreateActionRequest {
                    uid: None,
                    kind: ActionType::Task,
                    text: Some("one".to_string()),
                    date: None,
                },
                1,
                "t",
            )
        })
        .unwrap();

        let summary = db.analytics_summary(&owner).unwrap();
        assert_eq!(summary.total_sessions, 6);
        assert_eq!(summary.total_messages, 12);
        assert_eq!(summary.total_actions, 1);
        assert_eq!(summary.last_activity.as_deref(), Some("2025-11-06T00:00:00.000Z"));
        assert_eq!(summary.recent_sessions.len(), 5);
        assert_eq!(summary.recent_sessions[0].session_id.0, "S5");
    }
}
