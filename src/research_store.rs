use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::ProcessedEvent;

const RESEARCH_HISTORY_KEY: &str = "research_history";

/// One saved research session, ready for the history listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    pub session_id: String,
    pub started_at: i64,
    pub summary: String,
    pub events: Vec<ProcessedEvent>,
}

/// Best-effort local cache of research activity per session. Not
/// authoritative: the backend owns the conversation, this only lets the
/// client re-show past research after a restart.
pub struct ResearchStore {
    conn: Mutex<Connection>,
}

impl ResearchStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS client_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )"#,
            [],
        )?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT value FROM client_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO client_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn read_map(&self) -> Result<BTreeMap<String, Vec<ProcessedEvent>>> {
        match self.get_state(RESEARCH_HISTORY_KEY)? {
            Some(raw) => serde_json::from_str(&raw).context("Failed to decode research history"),
            None => Ok(BTreeMap::new()),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, Vec<ProcessedEvent>>) -> Result<()> {
        let raw = serde_json::to_string(map).context("Failed to encode research history")?;
        self.set_state(RESEARCH_HISTORY_KEY, &raw)
    }

    /// Saves the session's current activity sequence. A session only enters
    /// the cache once it has produced at least one event; after that, every
    /// change overwrites its entry, including resets back to empty.
    pub fn save(&self, session_id: &str, events: &[ProcessedEvent]) -> Result<()> {
        let mut map = self.read_map()?;
        if events.is_empty() && !map.contains_key(session_id) {
            return Ok(());
        }
        map.insert(session_id.to_string(), events.to_vec());
        self.write_map(&map)
    }

    pub fn load(&self, session_id: &str) -> Result<Option<Vec<ProcessedEvent>>> {
        Ok(self.read_map()?.remove(session_id))
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let mut map = self.read_map()?;
        let removed = map.remove(session_id).is_some();
        if removed {
            self.write_map(&map)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.write_map(&BTreeMap::new())
    }

    /// All saved sessions, most recent first.
    pub fn sessions(&self) -> Result<Vec<ResearchSession>> {
        let mut sessions: Vec<ResearchSession> = self
            .read_map()?
            .into_iter()
            .map(|(session_id, events)| {
                let started_at = parse_session_start(&session_id);
                let summary = summarize_events(&events);
                ResearchSession {
                    session_id,
                    started_at,
                    summary,
                    events,
                }
            })
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }
}

/// Session ids look like `session_<epochMillis>_<random>`; the middle part
/// doubles as the start time. Unparseable ids sort last.
pub fn parse_session_start(session_id: &str) -> i64 {
    session_id
        .split('_')
        .nth(1)
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0)
}

pub fn generate_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let hex = uuid::Uuid::new_v4().simple().to_string();
    let len = 6 + (hex.as_bytes()[0] % 4) as usize;
    format!("session_{}_{}", millis, &hex[..len])
}

/// One-line description for the history listing: the queries a session
/// researched, or a count of its search activity.
pub fn summarize_events(events: &[ProcessedEvent]) -> String {
    let search_like: Vec<&ProcessedEvent> = events
        .iter()
        .filter(|event| {
            let title = event.title.as_str().to_lowercase();
            title.contains("search") || title.contains("actor")
        })
        .collect();

    if search_like.is_empty() {
        return "Không có kết quả tìm kiếm".to_string();
    }

    let topics: Vec<&str> = search_like
        .iter()
        .filter_map(|event| event_query(event))
        .take(2)
        .collect();

    if topics.is_empty() {
        format!("{} kết quả tìm kiếm", search_like.len())
    } else {
        topics.join(", ")
    }
}

fn event_query(event: &ProcessedEvent) -> Option<&str> {
    event
        .details
        .as_ref()
        .and_then(|details| details.get("query"))
        .and_then(Value::as_str)
        .or_else(|| event.data.get("query").and_then(Value::as_str))
        .filter(|query| !query.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{classify, EventTitle};
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, ResearchStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResearchStore::open(dir.path().join("research.db")).expect("store init");
        (dir, store)
    }

    fn sample_events() -> Vec<ProcessedEvent> {
        vec![
            classify(&json!({"generate_query": {"search_query": ["AI là gì"]}})).unwrap(),
            classify(&json!({"finalize_answer": {}})).unwrap(),
        ]
    }

    #[test]
    fn save_load_delete_roundtrip() {
        let (_dir, store) = temp_store();
        let events = sample_events();

        store.save("session_1000_abcdef", &events).expect("save");
        let loaded = store
            .load("session_1000_abcdef")
            .expect("load")
            .expect("entry exists");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].title, EventTitle::GeneratingSearchQueries);

        assert!(store.delete("session_1000_abcdef").expect("delete"));
        assert!(!store.delete("session_1000_abcdef").expect("second delete"));
        assert!(store.load("session_1000_abcdef").expect("load").is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("research.db");

        {
            let store = ResearchStore::open(&path).expect("store init");
            store.save("session_5_x1y2z3", &sample_events()).expect("save");
        }

        let store = ResearchStore::open(&path).expect("reopen");
        assert!(store.load("session_5_x1y2z3").expect("load").is_some());
    }

    #[test]
    fn empty_sessions_enter_cache_only_after_first_event() {
        let (_dir, store) = temp_store();

        store.save("session_1_aaaaaa", &[]).expect("empty save");
        assert!(store.load("session_1_aaaaaa").expect("load").is_none());

        store.save("session_1_aaaaaa", &sample_events()).expect("save");
        store.save("session_1_aaaaaa", &[]).expect("reset save");
        let entry = store.load("session_1_aaaaaa").expect("load").expect("entry");
        assert!(entry.is_empty());
    }

    #[test]
    fn sessions_sorted_most_recent_first() {
        let (_dir, store) = temp_store();

        store.save("session_1000_aaaaaa", &sample_events()).expect("save");
        store.save("session_3000_bbbbbb", &sample_events()).expect("save");
        store.save("session_2000_cccccc", &sample_events()).expect("save");

        let sessions = store.sessions().expect("sessions");
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["session_3000_bbbbbb", "session_2000_cccccc", "session_1000_aaaaaa"]
        );
        assert_eq!(sessions[0].started_at, 3000);
    }

    #[test]
    fn session_ids_carry_timestamp_and_short_suffix() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<i64>().unwrap() > 0);
        assert!((6..=9).contains(&parts[2].len()));
        assert!(parse_session_start(&id) > 0);
        assert_eq!(parse_session_start("corrupted"), 0);
    }

    #[test]
    fn summary_prefers_queries_then_counts() {
        let with_query = vec![ProcessedEvent {
            title: EventTitle::WebResearch,
            data: json!("Gathered 3 sources. Related to: N/A."),
            sources: None,
            queries: None,
            details: Some(json!({"query": "lượng tử"})),
        }];
        assert_eq!(summarize_events(&with_query), "lượng tử");

        let without_query = sample_events();
        assert_eq!(summarize_events(&without_query), "1 kết quả tìm kiếm");

        assert_eq!(summarize_events(&[]), "Không có kết quả tìm kiếm");
    }
}
