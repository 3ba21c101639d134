use std::path::PathBuf;

use chrono::Utc;
use nickel_kernel::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Append-only JSONL log. Each record is chained to the previous one by hash.
///
/// Records go through a channel to a single writer task, so callers never wait
/// on the file and a write survives the request that produced it.
pub struct TelemetryLog {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

enum WriterCommand {
    Append(TelemetryRecord),
    Flush(oneshot::Sender<()>),
}

struct ChainWriter {
    file: tokio::fs::File,
    immutable_mirror: Option<tokio::fs::File>,
    last_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub audit_id: String,
    pub kind: String,
    pub status: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl TelemetryRecord {
    pub fn new(kind: &str, status: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            kind: kind.to_string(),
            status: status.to_string(),
            ts: Utc::now().to_rfc3339(),
            correlation_id: None,
            action_id: None,
            payload: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(|v| v.to_string());
        self
    }

    pub fn with_action(mut self, action_id: &str) -> Self {
        self.action_id = Some(action_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

impl TelemetryLog {
    /// Opens the log and starts its writer task on the current runtime.
    pub async fn new(path: &str, immutable_mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line).ok().and_then(|v| {
                    v.get("record_hash")
                        .and_then(|hash| hash.as_str())
                        .map(|s| s.to_string())
                })
            })
        });

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("create audit dir failed: {e}"))?;
            }
        }
        let file = open_append(path).await?;
        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(open_append(path).await?),
            _ => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(
            rx,
            ChainWriter {
                file,
                immutable_mirror,
                last_hash,
            },
        ));

        Ok(Self {
            path: PathBuf::from(path),
            tx,
        })
    }

    /// Queues a record and returns at once. Write errors are logged by the
    /// writer task and never reach the caller.
    pub fn record(&self, rec: TelemetryRecord) {
        if let Err(mpsc::error::SendError(WriterCommand::Append(rec))) =
            self.tx.send(WriterCommand::Append(rec))
        {
            warn!(kind = %rec.kind, "telemetry writer stopped; record dropped");
        }
    }

    /// Waits until every record queued before this call is on disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(done_tx)).is_err() {
            warn!("telemetry writer stopped; nothing to flush");
            return;
        }
        let _ = done_rx.await;
    }

    /// Most recent records, oldest first, optionally filtered by kind.
    pub async fn list(&self, kind: Option<&str>, limit: Option<usize>) -> Result<Vec<TelemetryRecord>, String> {
        self.flush().await;
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.to_string()),
        };
        let mut records: Vec<TelemetryRecord> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|rec: &TelemetryRecord| kind.map(|k| rec.kind == k).unwrap_or(true))
            .collect();
        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        Ok(records)
    }
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<WriterCommand>, mut writer: ChainWriter) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(rec) => writer.append(rec).await,
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl ChainWriter {
    async fn append(&mut self, mut rec: TelemetryRecord) {
        rec.prev_hash = self.last_hash.clone();
        rec.record_hash.clear();
        let seed = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind = %rec.kind, "telemetry serialize failed: {e}");
                return;
            }
        };
        rec.record_hash = sha256_hex(seed.as_bytes());

        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                warn!(kind = %rec.kind, "telemetry serialize failed: {e}");
                return;
            }
        };
        if let Err(e) = write_line(&mut self.file, &line).await {
            warn!(kind = %rec.kind, "telemetry write failed: {e}");
            return;
        }
        if let Some(mirror) = self.immutable_mirror.as_mut() {
            if let Err(e) = write_line(mirror, &line).await {
                warn!(kind = %rec.kind, "telemetry mirror write failed: {e}");
            }
        }
        self.last_hash = Some(rec.record_hash);
    }
}

async fn open_append(path: &str) -> Result<tokio::fs::File, String> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("open {path} failed: {e}"))
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: TelemetryRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = sha256_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

pub fn verify_audit_chain_with_mirror(path: &str, mirror: Option<&str>) -> Result<String, String> {
    let summary = verify_audit_chain(path)?;
    if let Some(mirror) = mirror {
        let primary = std::fs::read(path).map_err(|e| e.to_string())?;
        let copy = std::fs::read(mirror).map_err(|e| e.to_string())?;
        if primary != copy {
            return Err(format!("mirror {mirror} diverges from {path}"));
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(label: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("nickel-telemetry-{label}-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn chain_survives_restart_and_detects_tampering() {
        let path = temp_path("chain");
        {
            let log = TelemetryLog::new(&path, None).await.unwrap();
            log.record(TelemetryRecord::new("llm.chat.completions", "ok").with_payload(
                json!({"model": "m", "duration_ms": 12, "status": "ok", "error_summary": null}),
            ));
            log.flush().await;
        }
        let log = TelemetryLog::new(&path, None).await.unwrap();
        log.record(TelemetryRecord::new("pending_action.created", "pending_confirmation").with_action("a1"));
        log.flush().await;
        assert!(verify_audit_chain(&path).is_ok());

        let mut lines: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| line.to_string())
            .collect();
        let mut tampered: Value = serde_json::from_str(&lines[1]).unwrap();
        tampered["status"] = Value::String("confirmed".to_string());
        lines[1] = serde_json::to_string(&tampered).unwrap();
        std::fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();
        assert!(verify_audit_chain(&path).is_err());
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_limit() {
        let path = temp_path("list");
        let log = TelemetryLog::new(&path, None).await.unwrap();
        for status in ["ok", "error", "ok"] {
            log.record(TelemetryRecord::new("llm.chat.completions", status));
        }
        log.record(TelemetryRecord::new("orchestrator.mismatch", "fallback"));

        let llm = log.list(Some("llm.chat.completions"), None).await.unwrap();
        assert_eq!(llm.len(), 3);
        let last_two = log.list(None, Some(2)).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[1].kind, "orchestrator.mismatch");
    }

    #[tokio::test]
    async fn mirror_matches_primary() {
        let path = temp_path("primary");
        let mirror = format!("{path}.mirror");
        let log = TelemetryLog::new(&path, Some(&mirror)).await.unwrap();
        log.record(TelemetryRecord::new("tool.execute", "ok"));
        log.flush().await;
        assert!(verify_audit_chain_with_mirror(&path, Some(&mirror)).is_ok());

        std::fs::write(&mirror, "").unwrap();
        assert!(verify_audit_chain_with_mirror(&path, Some(&mirror)).is_err());
    }

    #[tokio::test]
    async fn concurrent_records_keep_a_linear_chain() {
        let path = temp_path("concurrent");
        let log = std::sync::Arc::new(TelemetryLog::new(&path, None).await.unwrap());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                log.record(TelemetryRecord::new("tool.execute", "ok").with_action(&format!("a{i}")));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(log.list(None, None).await.unwrap().len(), 16);
        assert_eq!(
            verify_audit_chain(&path).unwrap(),
            "audit chain verified: 16 records"
        );
    }
}
