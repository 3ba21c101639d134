use std::collections::HashMap;

use chrono::Utc;
use nickel_contracts::{
    CancelResponse, PendingAction, PendingActionSummary, PendingStatus, ToolId,
};
use nickel_kernel::parse_rfc3339;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pending action not found")]
    NotFound,
    #[error("explicit confirmation is required")]
    ConfirmationRequired,
    #[error("pending action store is corrupt: {0}")]
    Corrupt(String),
    #[error("pending action store write failed: {0}")]
    Persist(String),
}

/// Proof that a pending action was explicitly confirmed and removed from the
/// store. Only [`ConfirmationStore::confirm`] can produce one.
#[derive(Debug)]
pub struct ConfirmedAction {
    action: PendingAction,
    confirmed_at: String,
}

impl ConfirmedAction {
    pub fn action_id(&self) -> &str {
        &self.action.action_id
    }

    pub fn tool(&self) -> ToolId {
        self.action.tool
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.action.payload
    }

    pub fn confirmed_at(&self) -> &str {
        &self.confirmed_at
    }
}

pub struct ConfirmationStore {
    backend: Mutex<StoreBackend>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

#[derive(Default)]
struct MemoryStore {
    pending: HashMap<String, PendingAction>,
}

struct SqliteStore {
    conn: Connection,
}

impl ConfirmationStore {
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(StoreBackend::Memory(MemoryStore::default())),
        }
    }

    /// Opens the database and validates every stored row before accepting it.
    pub fn sqlite(path: &str) -> Result<Self, StoreError> {
        let store = SqliteStore::new(path)?;
        let restored = store.load_all()?;
        info!(path, restored = restored.len(), "pending action store loaded");
        Ok(Self {
            backend: Mutex::new(StoreBackend::Sqlite(store)),
        })
    }

    pub async fn require_confirmation(
        &self,
        tool: ToolId,
        payload: Map<String, Value>,
    ) -> Result<PendingActionSummary, StoreError> {
        let action = PendingAction {
            action_id: uuid::Uuid::new_v4().to_string(),
            tool,
            payload,
            created_at: Utc::now().to_rfc3339(),
            status: PendingStatus::PendingConfirmation,
        };
        let mut backend = self.backend.lock().await;
        backend.insert(&action)?;
        Ok(action.summary())
    }

    /// Takes the action out of the store. Concurrent callers for the same id
    /// are serialized, so at most one of them gets a `ConfirmedAction`.
    pub async fn confirm(&self, action_id: &str, confirmed: bool) -> Result<ConfirmedAction, StoreError> {
        if !confirmed {
            return Err(StoreError::ConfirmationRequired);
        }
        let mut backend = self.backend.lock().await;
        let mut action = backend.take(action_id)?.ok_or(StoreError::NotFound)?;
        action.status = PendingStatus::Confirmed;
        Ok(ConfirmedAction {
            action,
            confirmed_at: Utc::now().to_rfc3339(),
        })
    }

    pub async fn cancel(&self, action_id: &str, confirmed: bool) -> Result<CancelResponse, StoreError> {
        if !confirmed {
            return Err(StoreError::ConfirmationRequired);
        }
        let mut backend = self.backend.lock().await;
        let action = backend.take(action_id)?.ok_or(StoreError::NotFound)?;
        Ok(CancelResponse {
            status: PendingStatus::Cancelled,
            action_id: action.action_id,
            tool: action.tool,
            cancelled_at: Utc::now().to_rfc3339(),
        })
    }

    pub async fn list(&self) -> Result<Vec<PendingActionSummary>, StoreError> {
        let backend = self.backend.lock().await;
        let mut actions = backend.all()?;
        actions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.action_id.cmp(&b.action_id))
        });
        Ok(actions.iter().map(PendingAction::summary).collect())
    }
}

impl StoreBackend {
    fn insert(&mut self, action: &PendingAction) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store
                    .pending
                    .insert(action.action_id.clone(), action.clone());
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.save_pending(action),
        }
    }

    fn take(&mut self, action_id: &str) -> Result<Option<PendingAction>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.pending.remove(action_id)),
            StoreBackend::Sqlite(store) => store.take_pending(action_id),
        }
    }

    fn all(&self) -> Result<Vec<PendingAction>, StoreError> {
        match self {
            StoreBackend::Memory(store) => Ok(store.pending.values().cloned().collect()),
            StoreBackend::Sqlite(store) => store.load_all(),
        }
    }
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Persist(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pending_actions (
                action_id TEXT PRIMARY KEY,
                tool TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Self { conn })
    }

    fn save_pending(&mut self, action: &PendingAction) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(&action.payload)
            .map_err(|e| StoreError::Persist(e.to_string()))?;
        self.conn
            .execute(
                "
                INSERT INTO pending_actions(action_id, tool, payload_json, created_at, status)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    action.action_id,
                    action.tool.as_str(),
                    payload_json,
                    action.created_at,
                    action.status.as_str()
                ],
            )
            .map_err(|e| StoreError::Persist(e.to_string()))?;
        Ok(())
    }

    fn take_pending(&mut self, action_id: &str) -> Result<Option<PendingAction>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT action_id, tool, payload_json, created_at, status FROM pending_actions WHERE action_id = ?1",
                params![action_id],
                read_row,
            )
            .optional()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let action = row.into_action()?;
        self.conn
            .execute(
                "DELETE FROM pending_actions WHERE action_id = ?1",
                params![action_id],
            )
            .map_err(|e| StoreError::Persist(e.to_string()))?;
        Ok(Some(action))
    }

    fn load_all(&self) -> Result<Vec<PendingAction>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT action_id, tool, payload_json, created_at, status FROM pending_actions")
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let rows = stmt
            .query_map([], read_row)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut actions = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StoreError::Corrupt(e.to_string()))?;
            actions.push(row.into_action()?);
        }
        Ok(actions)
    }
}

struct StoredRow {
    action_id: String,
    tool: String,
    payload_json: String,
    created_at: String,
    status: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        action_id: row.get(0)?,
        tool: row.get(1)?,
        payload_json: row.get(2)?,
        created_at: row.get(3)?,
        status: row.get(4)?,
    })
}

impl StoredRow {
    fn into_action(self) -> Result<PendingAction, StoreError> {
        let corrupt = |detail: &str| StoreError::Corrupt(format!("row {}: {detail}", self.action_id));

        if self.action_id.trim().is_empty() {
            return Err(StoreError::Corrupt("row with empty action_id".to_string()));
        }
        let tool = ToolId::parse(&self.tool).ok_or_else(|| corrupt("unknown tool"))?;
        let payload = match serde_json::from_str::<Value>(&self.payload_json) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(corrupt("payload is not an object")),
            Err(_) => return Err(corrupt("payload is not valid JSON")),
        };
        if parse_rfc3339(&self.created_at).is_none() {
            return Err(corrupt("created_at is not a timestamp"));
        }
        if self.status != PendingStatus::PendingConfirmation.as_str() {
            return Err(corrupt("status is not pending_confirmation"));
        }

        Ok(PendingAction {
            action_id: self.action_id,
            tool,
            payload,
            created_at: self.created_at,
            status: PendingStatus::PendingConfirmation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db(label: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("nickel-store-{label}-{nanos}.db"))
            .to_string_lossy()
            .to_string()
    }

    fn payload() -> Map<String, Value> {
        json!({"raw_base64": "aGVsbG8=", "user_id": "me"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn confirm_requires_literal_true_and_does_not_mutate() {
        let store = ConfirmationStore::in_memory();
        let summary = store
            .require_confirmation(ToolId::EmailSend, payload())
            .await
            .unwrap();

        let err = store.confirm(&summary.action_id, false).await.unwrap_err();
        assert!(matches!(err, StoreError::ConfirmationRequired));
        assert_eq!(store.list().await.unwrap().len(), 1);

        let confirmed = store.confirm(&summary.action_id, true).await.unwrap();
        assert_eq!(confirmed.tool(), ToolId::EmailSend);
        assert_eq!(confirmed.payload(), &payload());
        assert!(store.list().await.unwrap().is_empty());

        let err = store.confirm(&summary.action_id, true).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn cancel_removes_and_blocks_confirm() {
        let store = ConfirmationStore::in_memory();
        let summary = store
            .require_confirmation(ToolId::NotesCreate, Map::new())
            .await
            .unwrap();
        assert!(matches!(
            store.cancel(&summary.action_id, false).await,
            Err(StoreError::ConfirmationRequired)
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
        let cancelled = store.cancel(&summary.action_id, true).await.unwrap();
        assert_eq!(cancelled.status, PendingStatus::Cancelled);
        assert!(matches!(
            store.confirm(&summary.action_id, true).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.cancel(&summary.action_id, true).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_confirms_yield_one_winner() {
        let store = Arc::new(ConfirmationStore::in_memory());
        let summary = store
            .require_confirmation(ToolId::TasksCreate, Map::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = summary.action_id.clone();
            handles.push(tokio::spawn(async move { store.confirm(&id, true).await }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let path = temp_db("reopen");
        let id = {
            let store = ConfirmationStore::sqlite(&path).unwrap();
            store
                .require_confirmation(ToolId::CalendarCreateEvent, json!({"summary": "1:1"}).as_object().cloned().unwrap())
                .await
                .unwrap()
                .action_id
        };

        let store = ConfirmationStore::sqlite(&path).unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].action_id, id);
        let confirmed = store.confirm(&id, true).await.unwrap();
        assert_eq!(confirmed.payload()["summary"], "1:1");

        let reopened = ConfirmationStore::sqlite(&path).unwrap();
        assert!(reopened.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation() {
        let store = ConfirmationStore::in_memory();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                store
                    .require_confirmation(ToolId::NotesCreate, Map::new())
                    .await
                    .unwrap()
                    .action_id,
            );
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let listed: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.action_id)
            .collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn invalid_rows_are_rejected_at_load() {
        let path = temp_db("badrow");
        {
            let store = SqliteStore::new(&path).unwrap();
            store
                .conn
                .execute(
                    "INSERT INTO pending_actions VALUES ('a1', 'email.delete', '{}', '2026-01-01T00:00:00Z', 'pending_confirmation')",
                    [],
                )
                .unwrap();
        }
        assert!(matches!(
            ConfirmationStore::sqlite(&path),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn non_database_file_is_corrupt() {
        let path = temp_db("garbage");
        std::fs::write(&path, "not a sqlite database\n".repeat(256)).unwrap();
        assert!(matches!(
            ConfirmationStore::sqlite(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
