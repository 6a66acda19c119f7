use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use uuid::Uuid;

use crate::config::ConfigProvider;

const FLUSH_BATCH_SIZE: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogKind {
    SessionInit,
    SessionClose,
    ServerInit,
    ServerClose,
    ServerCapabilityUpdate,
    RequestTool,
    RequestResource,
    RequestPrompt,
    ResponseTool,
    ResponseResource,
    ResponsePrompt,
    ResponseToolList,
    ResponseResourceList,
    ResponsePromptList,
    ErrorInternal,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::SessionInit => "SessionInit",
            LogKind::SessionClose => "SessionClose",
            LogKind::ServerInit => "ServerInit",
            LogKind::ServerClose => "ServerClose",
            LogKind::ServerCapabilityUpdate => "ServerCapabilityUpdate",
            LogKind::RequestTool => "RequestTool",
            LogKind::RequestResource => "RequestResource",
            LogKind::RequestPrompt => "RequestPrompt",
            LogKind::ResponseTool => "ResponseTool",
            LogKind::ResponseResource => "ResponseResource",
            LogKind::ResponsePrompt => "ResponsePrompt",
            LogKind::ResponseToolList => "ResponseToolList",
            LogKind::ResponseResourceList => "ResponseResourceList",
            LogKind::ResponsePromptList => "ResponsePromptList",
            LogKind::ErrorInternal => "ErrorInternal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub id: Uuid,
    pub ts_ms: i64,
    pub kind: LogKind,
    pub session_id: Option<String>,
    pub upstream_request_id: Option<String>,
    pub uniform_request_id: Option<String>,
    pub server_id: Option<String>,
    pub params: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub status_code: Option<i64>,
}

impl LogEvent {
    pub fn new(kind: LogKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_ms: now_millis(),
            kind,
            session_id: None,
            upstream_request_id: None,
            uniform_request_id: None,
            server_id: None,
            params: None,
            result: None,
            error: None,
            duration_ms: None,
            status_code: None,
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Object-safe sink so sessions and the supervisor can share one publisher
/// without generic plumbing.
pub trait LogPublisher: Send + Sync {
    fn publish(&self, event: LogEvent);
}

#[derive(Default, Clone)]
pub struct NullPublisher;

impl LogPublisher for NullPublisher {
    fn publish(&self, _event: LogEvent) {}
}

#[derive(Default)]
pub struct BufferingPublisher(pub std::sync::Mutex<Vec<LogEvent>>);

impl LogPublisher for BufferingPublisher {
    fn publish(&self, event: LogEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[derive(Clone)]
pub struct LoggerCfg {
    pub db_path: PathBuf,
    pub redact_keys: Vec<String>, // lowercased
}

/// Sqlite-backed publisher. Events are redacted on the caller's thread, then
/// handed to a background writer that batches inserts.
#[derive(Clone)]
pub struct SqlitePublisher {
    tx: mpsc::Sender<LogEvent>,
    cfg: Arc<LoggerCfg>,
}

impl SqlitePublisher {
    pub fn start(cp: &dyn ConfigProvider) -> Self {
        let cfg = LoggerCfg {
            db_path: cp.base_dir().join("logs.sqlite"),
            redact_keys: default_redact_list(),
        };
        let (tx, rx) = mpsc::channel::<LogEvent>(8_192);
        let task_cfg = Arc::new(cfg);
        let writer_cfg = task_cfg.clone();
        tokio::spawn(async move { writer_task(writer_cfg, rx).await });
        Self { tx, cfg: task_cfg }
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.cfg.db_path
    }
}

impl LogPublisher for SqlitePublisher {
    fn publish(&self, mut event: LogEvent) {
        event.params = event.params.map(|v| redact_json(v, &self.cfg.redact_keys));
        event.result = event.result.map(|v| redact_json(v, &self.cfg.redact_keys));
        let _ = self.tx.try_send(event);
    }
}

async fn writer_task(cfg: Arc<LoggerCfg>, mut rx: mpsc::Receiver<LogEvent>) {
    if let Some(parent) = cfg.db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let options = SqliteConnectOptions::new()
        .filename(&cfg.db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .disable_statement_logging();
    let mut conn = match options.connect().await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(target = "logging", path=%cfg.db_path.display(), error=%e, "open_failed");
            return;
        }
    };
    if let Err(e) = create_schema(&mut conn).await {
        tracing::error!(target = "logging", error=%e, "schema_failed");
        return;
    }

    let mut buf: Vec<LogEvent> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut last = Instant::now();
    loop {
        match timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(e)) => {
                buf.push(e);
                if buf.len() >= FLUSH_BATCH_SIZE || last.elapsed() >= FLUSH_INTERVAL {
                    if let Err(e) = flush_events(&mut conn, &buf).await {
                        tracing::warn!(target = "logging", count = buf.len(), error=%e, "flush_failed");
                    }
                    buf.clear();
                    last = Instant::now();
                }
            }
            // Channel closed: flush any pending and exit
            Ok(None) => {
                if !buf.is_empty() {
                    if let Err(e) = flush_events(&mut conn, &buf).await {
                        tracing::warn!(target = "logging", count = buf.len(), error=%e, "final_flush_failed");
                    }
                }
                break;
            }
            // Idle timeout: flush pending items, then continue
            Err(_) => {
                if !buf.is_empty() {
                    if let Err(e) = flush_events(&mut conn, &buf).await {
                        tracing::warn!(target = "logging", count = buf.len(), error=%e, "flush_failed");
                    }
                    buf.clear();
                }
                last = Instant::now();
            }
        }
    }
}

async fn create_schema(conn: &mut SqliteConnection) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS log_events (
            id TEXT PRIMARY KEY,
            ts_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            session_id TEXT,
            upstream_request_id TEXT,
            uniform_request_id TEXT,
            server_id TEXT,
            params TEXT,
            result TEXT,
            error TEXT,
            duration_ms INTEGER,
            status_code INTEGER
        );
        "#,
    )
    .execute(&mut *conn)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_events_ts ON log_events(ts_ms)")
        .execute(&mut *conn)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_events_session ON log_events(session_id)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn flush_events(conn: &mut SqliteConnection, events: &[LogEvent]) -> sqlx::Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    let mut tx = conn.begin().await?;
    for e in events {
        let params = e.params.as_ref().map(|v| v.to_string());
        let result = e.result.as_ref().map(|v| v.to_string());
        sqlx::query(
            "INSERT INTO log_events (id, ts_ms, kind, session_id, upstream_request_id, uniform_request_id, server_id, params, result, error, duration_ms, status_code)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(e.id.to_string())
        .bind(e.ts_ms)
        .bind(e.kind.as_str())
        .bind(&e.session_id)
        .bind(&e.upstream_request_id)
        .bind(&e.uniform_request_id)
        .bind(&e.server_id)
        .bind(params)
        .bind(result)
        .bind(&e.error)
        .bind(e.duration_ms)
        .bind(e.status_code)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

fn default_redact_list() -> Vec<String> {
    vec![
        "authorization".into(),
        "token".into(),
        "password".into(),
        "secret".into(),
        "api_key".into(),
        "access_token".into(),
    ]
}

pub fn redact_json(mut v: JsonValue, keys_lc: &[String]) -> JsonValue {
    fn rec(v: &mut JsonValue, keys_lc: &[String]) {
        match v {
            JsonValue::Object(map) => {
                for (k, val) in map.iter_mut() {
                    if keys_lc.iter().any(|x| x == &k.to_lowercase()) {
                        *val = JsonValue::String("***".to_string());
                    } else {
                        rec(val, keys_lc);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for item in arr.iter_mut() {
                    rec(item, keys_lc);
                }
            }
            _ => {}
        }
    }
    rec(&mut v, keys_lc);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_keys_recursively() {
        let v = serde_json::json!({
            "Authorization": "Bearer x",
            "nested": { "password": "p", "keep": 1 },
            "arr": [ {"token": "a"}, {"ok": true} ]
        });
        let out = redact_json(v, &default_redact_list());
        let s = out.to_string();
        assert!(s.contains("***"));
        assert!(!s.contains("Bearer x"));
        assert!(!s.contains("\"p\""));
        assert!(!s.contains("\"a\""));
        assert!(s.contains("\"keep\":1"));
    }

    #[test]
    fn builders_fill_routing_fields() {
        let e = LogEvent::new(LogKind::RequestTool)
            .session("sess-1")
            .server("srv-a");
        assert_eq!(e.kind, LogKind::RequestTool);
        assert_eq!(e.session_id.as_deref(), Some("sess-1"));
        assert_eq!(e.server_id.as_deref(), Some("srv-a"));
        assert!(e.error.is_none());
    }
}
