//! SQLite-backed persistent store for prompt sections, critiques, arena
//! sessions, regression cases, analyses, and the intelligence bus.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;

use crate::scores::JudgeScores;

// =============================================================================
// Types
// =============================================================================

/// How a prompt section version came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionOrigin {
    ReactiveFix,
    ProactiveMutation,
    Manual,
}

impl SectionOrigin {
    fn as_str(self) -> &'static str {
        match self {
            Self::ReactiveFix => "reactive-fix",
            Self::ProactiveMutation => "proactive-mutation",
            Self::Manual => "manual",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "reactive-fix" => Self::ReactiveFix,
            "proactive-mutation" => Self::ProactiveMutation,
            _ => Self::Manual,
        }
    }
}

/// One rejected candidate in a section's genealogy. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub changelog: String,
    pub fail_reason: String,
    pub attempted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSection {
    pub id: i64,
    pub section_key: String,
    pub version: i64,
    pub content: String,
    pub is_active: bool,
    pub created_by: SectionOrigin,
    pub changelog: String,
    pub parent_version: Option<i64>,
    pub order_index: i64,
    pub arena_win_rate: Option<f64>,
    pub failed_attempts: Vec<FailedAttempt>,
    pub created_at: i64,
}

/// One diagnosed weakness in a critique report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weakness {
    pub dimension: String,
    pub avg_score: f64,
    pub affected_sections: Vec<String>,
    pub pattern: String,
    pub severity: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CritiqueReport {
    pub id: i64,
    pub weaknesses: Vec<Weakness>,
    /// section_key -> dimensions implicating it.
    pub section_mappings: BTreeMap<String, Vec<String>>,
    /// section_key -> severity 0..=5.
    pub severity_scores: BTreeMap<String, u8>,
    pub period_start: i64,
    pub period_end: i64,
    pub addressed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaSession {
    pub id: i64,
    pub section_key: String,
    pub challenger_version: i64,
    pub baseline_version: i64,
    pub trigger: String,
    pub status: SessionStatus,
    pub win_rate: Option<f64>,
    pub match_count: i64,
    pub regression_passed: Option<bool>,
    pub deployed: bool,
    pub summary: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchWinner {
    Baseline,
    Challenger,
    Tie,
}

impl MatchWinner {
    fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Challenger => "challenger",
            Self::Tie => "tie",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "baseline" => Self::Baseline,
            "challenger" => Self::Challenger,
            _ => Self::Tie,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaMatch {
    pub id: i64,
    pub session_id: i64,
    pub scenario_name: String,
    /// "live" for scenarios sampled from real analyses, "synthetic" otherwise.
    pub scenario_source: String,
    pub occasion: String,
    pub setting: String,
    pub vibe: String,
    pub baseline_response: String,
    pub challenger_response: String,
    pub winner: MatchWinner,
    pub rationale: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionCase {
    pub id: i64,
    pub name: String,
    pub occasion: String,
    pub setting: String,
    pub vibe: String,
    pub context_snapshot: String,
    pub baseline_scores: JudgeScores,
    pub is_active: bool,
    pub created_at: i64,
}

/// One production analysis, the raw material the piggyback judge scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub occasion: String,
    pub setting: String,
    pub vibe: String,
    pub ai_score: f64,
    pub feedback: String,
    pub judge_scores: Option<JudgeScores>,
    pub judge_evaluated: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub created_at: i64,
}

/// Raw bus row. Payload decoding happens in the bus module, at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEntry {
    pub id: i64,
    pub agent: String,
    pub entry_type: String,
    pub payload: String,
    pub created_at: i64,
    pub expires_at: i64,
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct LoopStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls to prevent Tokio blocking pool starvation.
    /// Only one blocking thread waits on the mutex at a time.
    sem: Arc<Semaphore>,
}

impl LoopStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TAILOR_STORE") {
            return PathBuf::from(path);
        }
        PathBuf::from(".tailor_loop.sqlite")
    }

    /// Acquire the semaphore, then lock the connection.
    /// Recover from mutex poisoning; the SQLite connection is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    fn with_conn_mut<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS prompt_sections (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               section_key TEXT NOT NULL,\
               version INTEGER NOT NULL,\
               content TEXT NOT NULL,\
               is_active INTEGER NOT NULL DEFAULT 0,\
               created_by TEXT NOT NULL DEFAULT 'manual',\
               changelog TEXT NOT NULL DEFAULT '',\
               parent_version INTEGER,\
               order_index INTEGER NOT NULL DEFAULT 0,\
               arena_win_rate REAL,\
               failed_attempts TEXT NOT NULL DEFAULT '[]',\
               created_at INTEGER NOT NULL,\
               UNIQUE(section_key, version)\
             );\
             CREATE TABLE IF NOT EXISTS critique_reports (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               weaknesses TEXT NOT NULL DEFAULT '[]',\
               section_mappings TEXT NOT NULL DEFAULT '{}',\
               severity_scores TEXT NOT NULL DEFAULT '{}',\
               period_start INTEGER NOT NULL,\
               period_end INTEGER NOT NULL,\
               addressed INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS arena_sessions (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               section_key TEXT NOT NULL,\
               challenger_version INTEGER NOT NULL,\
               baseline_version INTEGER NOT NULL,\
               trigger TEXT NOT NULL DEFAULT '',\
               status TEXT NOT NULL DEFAULT 'running',\
               win_rate REAL,\
               match_count INTEGER NOT NULL DEFAULT 0,\
               regression_passed INTEGER,\
               deployed INTEGER NOT NULL DEFAULT 0,\
               summary TEXT,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS arena_matches (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               session_id INTEGER NOT NULL REFERENCES arena_sessions(id) ON DELETE CASCADE,\
               scenario_name TEXT NOT NULL,\
               scenario_source TEXT NOT NULL DEFAULT 'synthetic',\
               occasion TEXT NOT NULL DEFAULT '',\
               setting TEXT NOT NULL DEFAULT '',\
               vibe TEXT NOT NULL DEFAULT '',\
               baseline_response TEXT NOT NULL,\
               challenger_response TEXT NOT NULL,\
               winner TEXT NOT NULL,\
               rationale TEXT NOT NULL DEFAULT '',\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS regression_cases (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               name TEXT NOT NULL,\
               occasion TEXT NOT NULL DEFAULT '',\
               setting TEXT NOT NULL DEFAULT '',\
               vibe TEXT NOT NULL DEFAULT '',\
               context_snapshot TEXT NOT NULL DEFAULT '',\
               baseline_scores TEXT NOT NULL,\
               is_active INTEGER NOT NULL DEFAULT 1,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS analyses (\
               id TEXT PRIMARY KEY,\
               occasion TEXT NOT NULL DEFAULT '',\
               setting TEXT NOT NULL DEFAULT '',\
               vibe TEXT NOT NULL DEFAULT '',\
               ai_score REAL NOT NULL DEFAULT 0,\
               feedback TEXT NOT NULL,\
               judge_scores TEXT,\
               judge_evaluated INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS follow_ups (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               question TEXT NOT NULL,\
               answer TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS bus_entries (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               agent TEXT NOT NULL,\
               entry_type TEXT NOT NULL,\
               payload TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               expires_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS daily_token_usage (\
               date TEXT PRIMARY KEY,\
               budget INTEGER NOT NULL,\
               spent INTEGER NOT NULL DEFAULT 0,\
               breakdown TEXT NOT NULL DEFAULT '{}'\
             );\
             CREATE INDEX IF NOT EXISTS idx_sections_key_active ON prompt_sections(section_key, is_active);\
             CREATE INDEX IF NOT EXISTS idx_critiques_addressed ON critique_reports(addressed, created_at);\
             CREATE INDEX IF NOT EXISTS idx_matches_session ON arena_matches(session_id);\
             CREATE INDEX IF NOT EXISTS idx_analyses_judge ON analyses(judge_evaluated, created_at);\
             CREATE INDEX IF NOT EXISTS idx_bus_type_created ON bus_entries(entry_type, created_at);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Prompt sections
    // -------------------------------------------------------------------------

    /// Insert a new, inactive version of a section. The version number is
    /// allocated inside the write lock, so concurrent creators never collide.
    pub async fn create_section_version(
        &self,
        section_key: &str,
        content: &str,
        created_by: SectionOrigin,
        changelog: &str,
        parent_version: Option<i64>,
        order_index: i64,
    ) -> Result<PromptSection, StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let content = content.to_string();
        let changelog = changelog.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let now = now_epoch();
                let version: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_sections WHERE section_key = ?1",
                    params![section_key],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO prompt_sections (section_key, version, content, is_active, \
                     created_by, changelog, parent_version, order_index, created_at) \
                     VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        section_key,
                        version,
                        content,
                        created_by.as_str(),
                        changelog,
                        parent_version,
                        order_index,
                        now,
                    ],
                )?;
                Ok(PromptSection {
                    id: conn.last_insert_rowid(),
                    section_key,
                    version,
                    content,
                    is_active: false,
                    created_by,
                    changelog,
                    parent_version,
                    order_index,
                    arena_win_rate: None,
                    failed_attempts: Vec::new(),
                    created_at: now,
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Promote one version of a section to active, atomically.
    ///
    /// Runs deactivate-all and activate-one in a single transaction. If the
    /// target version does not exist the transaction rolls back and the
    /// previously active version stays active.
    pub async fn activate_section(
        &self,
        section_key: &str,
        version: i64,
        arena_win_rate: Option<f64>,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn_mut(|conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE prompt_sections SET is_active = 0 WHERE section_key = ?1",
                    params![section_key],
                )?;
                let rows = tx.execute(
                    "UPDATE prompt_sections SET is_active = 1, arena_win_rate = ?1 \
                     WHERE section_key = ?2 AND version = ?3",
                    params![arena_win_rate, section_key, version],
                )?;
                if rows == 0 {
                    // Implicit rollback on drop restores the previous active row.
                    return Err(StoreError::NotFound(format!(
                        "section {section_key} v{version}"
                    )));
                }
                tx.commit()?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get_active_section(
        &self,
        section_key: &str,
    ) -> Result<Option<PromptSection>, StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, section_key, version, content, is_active, created_by, changelog, \
                     parent_version, order_index, arena_win_rate, failed_attempts, created_at \
                     FROM prompt_sections WHERE section_key = ?1 AND is_active = 1",
                )?;
                let mut rows = stmt.query(params![section_key])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_section(row)?)),
                    None => Ok(None),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get_section(
        &self,
        section_key: &str,
        version: i64,
    ) -> Result<Option<PromptSection>, StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, section_key, version, content, is_active, created_by, changelog, \
                     parent_version, order_index, arena_win_rate, failed_attempts, created_at \
                     FROM prompt_sections WHERE section_key = ?1 AND version = ?2",
                )?;
                let mut rows = stmt.query(params![section_key, version])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_section(row)?)),
                    None => Ok(None),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// All active sections whose keys are in `keys`, ordered for assembly.
    pub async fn active_sections(
        &self,
        keys: &[&str],
    ) -> Result<Vec<PromptSection>, StoreError> {
        let store = self.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, section_key, version, content, is_active, created_by, changelog, \
                     parent_version, order_index, arena_win_rate, failed_attempts, created_at \
                     FROM prompt_sections WHERE is_active = 1 \
                     ORDER BY order_index ASC, section_key ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut sections = Vec::new();
                while let Some(row) = rows.next()? {
                    let section = row_to_section(row)?;
                    if keys.iter().any(|k| k == &section.section_key) {
                        sections.push(section);
                    }
                }
                Ok(sections)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Append one failed attempt to a section version's genealogy.
    /// The list is append-only. Existing entries are never rewritten.
    pub async fn record_failed_attempt(
        &self,
        section_key: &str,
        version: i64,
        changelog: &str,
        fail_reason: &str,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let changelog = changelog.to_string();
        let fail_reason = fail_reason.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let raw: String = conn
                    .query_row(
                        "SELECT failed_attempts FROM prompt_sections \
                         WHERE section_key = ?1 AND version = ?2",
                        params![section_key, version],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            StoreError::NotFound(format!("section {section_key} v{version}"))
                        }
                        other => StoreError::Sqlite(other),
                    })?;
                let mut attempts: Vec<FailedAttempt> =
                    serde_json::from_str(&raw).unwrap_or_default();
                attempts.push(FailedAttempt {
                    changelog,
                    fail_reason,
                    attempted_at: now_epoch(),
                });
                let encoded = serde_json::to_string(&attempts)?;
                conn.execute(
                    "UPDATE prompt_sections SET failed_attempts = ?1 \
                     WHERE section_key = ?2 AND version = ?3",
                    params![encoded, section_key, version],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Active sections ordered oldest-first, for mutation target selection.
    pub async fn active_sections_by_age(&self) -> Result<Vec<PromptSection>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, section_key, version, content, is_active, created_by, changelog, \
                     parent_version, order_index, arena_win_rate, failed_attempts, created_at \
                     FROM prompt_sections WHERE is_active = 1 ORDER BY created_at ASC, id ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut sections = Vec::new();
                while let Some(row) = rows.next()? {
                    sections.push(row_to_section(row)?);
                }
                Ok(sections)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Version history for one section, newest first.
    pub async fn section_history(
        &self,
        section_key: &str,
        limit: usize,
    ) -> Result<Vec<PromptSection>, StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, section_key, version, content, is_active, created_by, changelog, \
                     parent_version, order_index, arena_win_rate, failed_attempts, created_at \
                     FROM prompt_sections WHERE section_key = ?1 \
                     ORDER BY version DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![section_key, limit as i64])?;
                let mut sections = Vec::new();
                while let Some(row) = rows.next()? {
                    sections.push(row_to_section(row)?);
                }
                Ok(sections)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Critique reports
    // -------------------------------------------------------------------------

    pub async fn insert_critique(
        &self,
        weaknesses: &[Weakness],
        section_mappings: &BTreeMap<String, Vec<String>>,
        severity_scores: &BTreeMap<String, u8>,
        period_start: i64,
        period_end: i64,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let weaknesses = serde_json::to_string(weaknesses)?;
        let section_mappings = serde_json::to_string(section_mappings)?;
        let severity_scores = serde_json::to_string(severity_scores)?;
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO critique_reports (weaknesses, section_mappings, severity_scores, \
                     period_start, period_end, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        weaknesses,
                        section_mappings,
                        severity_scores,
                        period_start,
                        period_end,
                        now_epoch(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Most recent critique not yet consumed by the surgeon.
    pub async fn latest_unaddressed_critique(
        &self,
    ) -> Result<Option<CritiqueReport>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, weaknesses, section_mappings, severity_scores, period_start, \
                     period_end, addressed, created_at FROM critique_reports \
                     WHERE addressed = 0 ORDER BY created_at DESC, id DESC LIMIT 1",
                )?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_critique(row)?)),
                    None => Ok(None),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Mark a critique consumed. Returns false if it was already addressed,
    /// so repeat calls are harmless.
    pub async fn mark_critique_addressed(&self, id: i64) -> Result<bool, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE critique_reports SET addressed = 1 WHERE id = ?1 AND addressed = 0",
                    params![id],
                )?;
                Ok(rows > 0)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Arena sessions and matches
    // -------------------------------------------------------------------------

    pub async fn create_arena_session(
        &self,
        section_key: &str,
        challenger_version: i64,
        baseline_version: i64,
        trigger: &str,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let section_key = section_key.to_string();
        let trigger = trigger.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO arena_sessions (section_key, challenger_version, \
                     baseline_version, trigger, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        section_key,
                        challenger_version,
                        baseline_version,
                        trigger,
                        SessionStatus::Running.as_str(),
                        now,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn complete_arena_session(
        &self,
        id: i64,
        win_rate: f64,
        match_count: i64,
        regression_passed: bool,
        deployed: bool,
        summary: &str,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let summary = summary.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE arena_sessions SET status = ?1, win_rate = ?2, match_count = ?3, \
                     regression_passed = ?4, deployed = ?5, summary = ?6, updated_at = ?7 \
                     WHERE id = ?8",
                    params![
                        SessionStatus::Completed.as_str(),
                        win_rate,
                        match_count,
                        regression_passed as i64,
                        deployed as i64,
                        summary,
                        now_epoch(),
                        id,
                    ],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!("arena session {id}")));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn fail_arena_session(&self, id: i64, summary: &str) -> Result<(), StoreError> {
        let store = self.clone();
        let summary = summary.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE arena_sessions SET status = ?1, summary = ?2, updated_at = ?3 \
                     WHERE id = ?4",
                    params![SessionStatus::Failed.as_str(), summary, now_epoch(), id],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!("arena session {id}")));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get_arena_session(&self, id: i64) -> Result<ArenaSession, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.query_row(
                    "SELECT id, section_key, challenger_version, baseline_version, trigger, \
                     status, win_rate, match_count, regression_passed, deployed, summary, \
                     created_at, updated_at FROM arena_sessions WHERE id = ?1",
                    params![id],
                    row_to_session,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("arena session {id}"))
                    }
                    other => StoreError::Sqlite(other),
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn insert_arena_match(
        &self,
        session_id: i64,
        scenario_name: &str,
        scenario_source: &str,
        occasion: &str,
        setting: &str,
        vibe: &str,
        baseline_response: &str,
        challenger_response: &str,
        winner: MatchWinner,
        rationale: &str,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let scenario_name = scenario_name.to_string();
        let scenario_source = scenario_source.to_string();
        let occasion = occasion.to_string();
        let setting = setting.to_string();
        let vibe = vibe.to_string();
        let baseline_response = baseline_response.to_string();
        let challenger_response = challenger_response.to_string();
        let rationale = rationale.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO arena_matches (session_id, scenario_name, scenario_source, \
                     occasion, setting, vibe, baseline_response, challenger_response, winner, \
                     rationale, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        session_id,
                        scenario_name,
                        scenario_source,
                        occasion,
                        setting,
                        vibe,
                        baseline_response,
                        challenger_response,
                        winner.as_str(),
                        rationale,
                        now_epoch(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn matches_for_session(
        &self,
        session_id: i64,
    ) -> Result<Vec<ArenaMatch>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, scenario_name, scenario_source, occasion, setting, \
                     vibe, baseline_response, challenger_response, winner, rationale, created_at \
                     FROM arena_matches WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let mut rows = stmt.query(params![session_id])?;
                let mut matches = Vec::new();
                while let Some(row) = rows.next()? {
                    matches.push(row_to_match(row)?);
                }
                Ok(matches)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Regression cases
    // -------------------------------------------------------------------------

    pub async fn insert_regression_case(
        &self,
        name: &str,
        occasion: &str,
        setting: &str,
        vibe: &str,
        context_snapshot: &str,
        baseline_scores: &JudgeScores,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let name = name.to_string();
        let occasion = occasion.to_string();
        let setting = setting.to_string();
        let vibe = vibe.to_string();
        let context_snapshot = context_snapshot.to_string();
        let baseline = serde_json::to_string(baseline_scores)?;
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO regression_cases (name, occasion, setting, vibe, \
                     context_snapshot, baseline_scores, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        name,
                        occasion,
                        setting,
                        vibe,
                        context_snapshot,
                        baseline,
                        now_epoch(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn active_regression_cases(
        &self,
        limit: usize,
    ) -> Result<Vec<RegressionCase>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, occasion, setting, vibe, context_snapshot, \
                     baseline_scores, is_active, created_at FROM regression_cases \
                     WHERE is_active = 1 ORDER BY id ASC LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit as i64])?;
                let mut cases = Vec::new();
                while let Some(row) = rows.next()? {
                    cases.push(row_to_regression_case(row)?);
                }
                Ok(cases)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn update_regression_baseline(
        &self,
        id: i64,
        baseline_scores: &JudgeScores,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let baseline = serde_json::to_string(baseline_scores)?;
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE regression_cases SET baseline_scores = ?1 WHERE id = ?2",
                    params![baseline, id],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!("regression case {id}")));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Analyses and follow-ups
    // -------------------------------------------------------------------------

    pub async fn insert_analysis(
        &self,
        id: &str,
        occasion: &str,
        setting: &str,
        vibe: &str,
        ai_score: f64,
        feedback: &str,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let id = id.to_string();
        let occasion = occasion.to_string();
        let setting = setting.to_string();
        let vibe = vibe.to_string();
        let feedback = feedback.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO analyses (id, occasion, setting, vibe, ai_score, feedback, \
                     created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, occasion, setting, vibe, ai_score, feedback, now_epoch()],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Analyses not yet judge-scored, newest first, bounded.
    pub async fn unevaluated_analyses(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<Analysis>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, occasion, setting, vibe, ai_score, feedback, judge_scores, \
                     judge_evaluated, created_at FROM analyses \
                     WHERE judge_evaluated = 0 AND created_at >= ?1 \
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![since, limit as i64])?;
                let mut analyses = Vec::new();
                while let Some(row) = rows.next()? {
                    analyses.push(row_to_analysis(row)?);
                }
                Ok(analyses)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Record judge scores for one analysis and mark it evaluated.
    pub async fn set_judge_scores(
        &self,
        analysis_id: &str,
        scores: &JudgeScores,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let analysis_id = analysis_id.to_string();
        let encoded = serde_json::to_string(scores)?;
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE analyses SET judge_scores = ?1, judge_evaluated = 1 WHERE id = ?2",
                    params![encoded, analysis_id],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!("analysis {analysis_id}")));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Judge-scored analyses in a window, newest first, bounded.
    pub async fn evaluated_analyses_since(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<Analysis>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, occasion, setting, vibe, ai_score, feedback, judge_scores, \
                     judge_evaluated, created_at FROM analyses \
                     WHERE judge_evaluated = 1 AND created_at >= ?1 \
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![since, limit as i64])?;
                let mut analyses = Vec::new();
                while let Some(row) = rows.next()? {
                    analyses.push(row_to_analysis(row)?);
                }
                Ok(analyses)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn insert_follow_up(
        &self,
        question: &str,
        answer: &str,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let question = question.to_string();
        let answer = answer.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO follow_ups (question, answer, created_at) VALUES (?1, ?2, ?3)",
                    params![question, answer, now_epoch()],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn recent_follow_ups(
        &self,
        since: i64,
        limit: usize,
    ) -> Result<Vec<FollowUp>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, question, answer, created_at FROM follow_ups \
                     WHERE created_at >= ?1 ORDER BY created_at DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(params![since, limit as i64])?;
                let mut follow_ups = Vec::new();
                while let Some(row) = rows.next()? {
                    follow_ups.push(FollowUp {
                        id: row.get(0)?,
                        question: row.get(1)?,
                        answer: row.get(2)?,
                        created_at: row.get(3)?,
                    });
                }
                Ok(follow_ups)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Intelligence bus
    // -------------------------------------------------------------------------

    pub async fn insert_bus_entry(
        &self,
        agent: &str,
        entry_type: &str,
        payload: &str,
        expires_at: i64,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let agent = agent.to_string();
        let entry_type = entry_type.to_string();
        let payload = payload.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO bus_entries (agent, entry_type, payload, created_at, \
                     expires_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![agent, entry_type, payload, now_epoch(), expires_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Unexpired entries, newest first. `entry_type` of None reads all types.
    pub async fn recent_bus_entries(
        &self,
        entry_type: Option<&str>,
        since: i64,
        limit: usize,
    ) -> Result<Vec<BusEntry>, StoreError> {
        let store = self.clone();
        let entry_type = entry_type.map(String::from);
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let now = now_epoch();
                let mut entries = Vec::new();
                match entry_type {
                    Some(t) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, agent, entry_type, payload, created_at, expires_at \
                             FROM bus_entries WHERE entry_type = ?1 AND created_at >= ?2 \
                             AND expires_at > ?3 ORDER BY created_at DESC, id DESC LIMIT ?4",
                        )?;
                        let mut rows = stmt.query(params![t, since, now, limit as i64])?;
                        while let Some(row) = rows.next()? {
                            entries.push(row_to_bus_entry(row)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, agent, entry_type, payload, created_at, expires_at \
                             FROM bus_entries WHERE created_at >= ?1 AND expires_at > ?2 \
                             ORDER BY created_at DESC, id DESC LIMIT ?3",
                        )?;
                        let mut rows = stmt.query(params![since, now, limit as i64])?;
                        while let Some(row) = rows.next()? {
                            entries.push(row_to_bus_entry(row)?);
                        }
                    }
                }
                Ok(entries)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired_bus_entries(&self) -> Result<usize, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "DELETE FROM bus_entries WHERE expires_at <= ?1",
                    params![now_epoch()],
                )?;
                Ok(rows)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Daily token usage
    // -------------------------------------------------------------------------

    pub async fn upsert_daily_usage(
        &self,
        date: &str,
        budget: i64,
        spent: i64,
        breakdown: &str,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let date = date.to_string();
        let breakdown = breakdown.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO daily_token_usage (date, budget, spent, breakdown) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(date) DO UPDATE SET budget = ?2, spent = ?3, breakdown = ?4",
                    params![date, budget, spent, breakdown],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Returns (spent, breakdown JSON) for a day, if recorded.
    pub async fn get_daily_usage(
        &self,
        date: &str,
    ) -> Result<Option<(i64, String)>, StoreError> {
        let store = self.clone();
        let date = date.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT spent, breakdown FROM daily_token_usage WHERE date = ?1",
                )?;
                let mut rows = stmt.query(params![date])?;
                match rows.next()? {
                    Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
                    None => Ok(None),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

// =============================================================================
// Row converters
// =============================================================================

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn json_column<T: serde::de::DeserializeOwned>(
    idx: usize,
    raw: &str,
) -> Result<T, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_section(row: &rusqlite::Row) -> Result<PromptSection, rusqlite::Error> {
    let created_by: String = row.get(5)?;
    let attempts_raw: String = row.get(10)?;
    Ok(PromptSection {
        id: row.get(0)?,
        section_key: row.get(1)?,
        version: row.get(2)?,
        content: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_by: SectionOrigin::from_str(&created_by),
        changelog: row.get(6)?,
        parent_version: row.get(7)?,
        order_index: row.get(8)?,
        arena_win_rate: row.get(9)?,
        failed_attempts: json_column(10, &attempts_raw)?,
        created_at: row.get(11)?,
    })
}

fn row_to_critique(row: &rusqlite::Row) -> Result<CritiqueReport, rusqlite::Error> {
    let weaknesses_raw: String = row.get(1)?;
    let mappings_raw: String = row.get(2)?;
    let severity_raw: String = row.get(3)?;
    Ok(CritiqueReport {
        id: row.get(0)?,
        weaknesses: json_column(1, &weaknesses_raw)?,
        section_mappings: json_column(2, &mappings_raw)?,
        severity_scores: json_column(3, &severity_raw)?,
        period_start: row.get(4)?,
        period_end: row.get(5)?,
        addressed: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

fn row_to_session(row: &rusqlite::Row) -> Result<ArenaSession, rusqlite::Error> {
    let status: String = row.get(5)?;
    Ok(ArenaSession {
        id: row.get(0)?,
        section_key: row.get(1)?,
        challenger_version: row.get(2)?,
        baseline_version: row.get(3)?,
        trigger: row.get(4)?,
        status: SessionStatus::from_str(&status),
        win_rate: row.get(6)?,
        match_count: row.get(7)?,
        regression_passed: row.get::<_, Option<i64>>(8)?.map(|v| v != 0),
        deployed: row.get::<_, i64>(9)? != 0,
        summary: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn row_to_match(row: &rusqlite::Row) -> Result<ArenaMatch, rusqlite::Error> {
    let winner: String = row.get(9)?;
    Ok(ArenaMatch {
        id: row.get(0)?,
        session_id: row.get(1)?,
        scenario_name: row.get(2)?,
        scenario_source: row.get(3)?,
        occasion: row.get(4)?,
        setting: row.get(5)?,
        vibe: row.get(6)?,
        baseline_response: row.get(7)?,
        challenger_response: row.get(8)?,
        winner: MatchWinner::from_str(&winner),
        rationale: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn row_to_regression_case(row: &rusqlite::Row) -> Result<RegressionCase, rusqlite::Error> {
    let baseline_raw: String = row.get(6)?;
    Ok(RegressionCase {
        id: row.get(0)?,
        name: row.get(1)?,
        occasion: row.get(2)?,
        setting: row.get(3)?,
        vibe: row.get(4)?,
        context_snapshot: row.get(5)?,
        baseline_scores: json_column(6, &baseline_raw)?,
        is_active: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

fn row_to_analysis(row: &rusqlite::Row) -> Result<Analysis, rusqlite::Error> {
    let scores_raw: Option<String> = row.get(6)?;
    let judge_scores = match scores_raw {
        Some(raw) => Some(json_column(6, &raw)?),
        None => None,
    };
    Ok(Analysis {
        id: row.get(0)?,
        occasion: row.get(1)?,
        setting: row.get(2)?,
        vibe: row.get(3)?,
        ai_score: row.get(4)?,
        feedback: row.get(5)?,
        judge_scores,
        judge_evaluated: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

fn row_to_bus_entry(row: &rusqlite::Row) -> Result<BusEntry, rusqlite::Error> {
    Ok(BusEntry {
        id: row.get(0)?,
        agent: row.get(1)?,
        entry_type: row.get(2)?,
        payload: row.get(3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (LoopStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LoopStore::new(dir.path().join("loop.sqlite")).unwrap();
        (store, dir)
    }

    fn scores(v: f64) -> JudgeScores {
        JudgeScores {
            specificity: v,
            voice_consistency: v,
            actionability: v,
            style_alignment: v,
            occasion_fit: v,
            overall: v,
        }
    }

    #[tokio::test]
    async fn section_versions_increment_per_key() {
        let (store, _dir) = temp_store();
        let v1 = store
            .create_section_version("voice_persona", "content a", SectionOrigin::Manual, "seed", None, 0)
            .await
            .unwrap();
        let v2 = store
            .create_section_version("voice_persona", "content b", SectionOrigin::ReactiveFix, "fix", Some(1), 0)
            .await
            .unwrap();
        let other = store
            .create_section_version("examples", "content c", SectionOrigin::Manual, "seed", None, 11)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(other.version, 1);
        assert!(!v2.is_active);
    }

    #[tokio::test]
    async fn activate_section_is_exclusive() {
        let (store, _dir) = temp_store();
        store
            .create_section_version("voice_persona", "a", SectionOrigin::Manual, "seed", None, 0)
            .await
            .unwrap();
        store
            .create_section_version("voice_persona", "b", SectionOrigin::ProactiveMutation, "mut", Some(1), 0)
            .await
            .unwrap();

        store.activate_section("voice_persona", 1, None).await.unwrap();
        store
            .activate_section("voice_persona", 2, Some(0.62))
            .await
            .unwrap();

        let active = store.get_active_section("voice_persona").await.unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.arena_win_rate, Some(0.62));

        let v1 = store.get_section("voice_persona", 1).await.unwrap().unwrap();
        assert!(!v1.is_active);
    }

    #[tokio::test]
    async fn activate_missing_version_keeps_previous_active() {
        let (store, _dir) = temp_store();
        store
            .create_section_version("voice_persona", "a", SectionOrigin::Manual, "seed", None, 0)
            .await
            .unwrap();
        store.activate_section("voice_persona", 1, None).await.unwrap();

        let err = store.activate_section("voice_persona", 9, None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let active = store.get_active_section("voice_persona").await.unwrap().unwrap();
        assert_eq!(active.version, 1);
    }

    #[tokio::test]
    async fn failed_attempts_accumulate() {
        let (store, _dir) = temp_store();
        store
            .create_section_version("examples", "a", SectionOrigin::Manual, "seed", None, 11)
            .await
            .unwrap();
        store
            .record_failed_attempt("examples", 1, "tighter examples", "Lost arena (win rate 40% < 55%)")
            .await
            .unwrap();
        store
            .record_failed_attempt("examples", 1, "different framing", "Failed regression")
            .await
            .unwrap();

        let section = store.get_section("examples", 1).await.unwrap().unwrap();
        assert_eq!(section.failed_attempts.len(), 2);
        assert_eq!(section.failed_attempts[0].changelog, "tighter examples");
        assert_eq!(section.failed_attempts[1].fail_reason, "Failed regression");
    }

    #[tokio::test]
    async fn critique_lifecycle() {
        let (store, _dir) = temp_store();
        assert!(store.latest_unaddressed_critique().await.unwrap().is_none());

        let weaknesses = vec![Weakness {
            dimension: "specificity".into(),
            avg_score: 6.1,
            affected_sections: vec!["styling_moves".into()],
            pattern: "generic suggestions".into(),
            severity: 3,
        }];
        let mut mappings = BTreeMap::new();
        mappings.insert("styling_moves".to_string(), vec!["specificity".to_string()]);
        let mut severities = BTreeMap::new();
        severities.insert("styling_moves".to_string(), 3u8);

        let id = store
            .insert_critique(&weaknesses, &mappings, &severities, 100, 200)
            .await
            .unwrap();

        let report = store.latest_unaddressed_critique().await.unwrap().unwrap();
        assert_eq!(report.id, id);
        assert_eq!(report.weaknesses[0].dimension, "specificity");
        assert_eq!(report.severity_scores["styling_moves"], 3);

        assert!(store.mark_critique_addressed(id).await.unwrap());
        assert!(!store.mark_critique_addressed(id).await.unwrap());
        assert!(store.latest_unaddressed_critique().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn arena_session_lifecycle() {
        let (store, _dir) = temp_store();
        let id = store
            .create_arena_session("styling_moves", 3, 2, "critique")
            .await
            .unwrap();

        store
            .insert_arena_match(
                id,
                "job interview",
                "synthetic",
                "job interview",
                "office",
                "professional",
                "baseline text",
                "challenger text",
                MatchWinner::Challenger,
                "more specific",
            )
            .await
            .unwrap();

        store
            .complete_arena_session(id, 0.58, 12, true, true, "deployed v3")
            .await
            .unwrap();

        let session = store.get_arena_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.win_rate, Some(0.58));
        assert!(session.deployed);

        let matches = store.matches_for_session(id).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].winner, MatchWinner::Challenger);
    }

    #[tokio::test]
    async fn analyses_judge_flow() {
        let (store, _dir) = temp_store();
        store
            .insert_analysis("a-1", "brunch", "outdoor cafe", "casual", 7.4, "Nice layering.")
            .await
            .unwrap();
        store
            .insert_analysis("a-2", "gym", "indoor", "athletic", 6.0, "Solid basics.")
            .await
            .unwrap();

        let pending = store.unevaluated_analyses(0, 30).await.unwrap();
        assert_eq!(pending.len(), 2);

        store.set_judge_scores("a-1", &scores(8.0)).await.unwrap();

        let pending = store.unevaluated_analyses(0, 30).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "a-2");

        let evaluated = store.evaluated_analyses_since(0, 30).await.unwrap();
        assert_eq!(evaluated.len(), 1);
        let s = evaluated[0].judge_scores.as_ref().unwrap();
        assert!((s.overall - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn bus_entries_expire() {
        let (store, _dir) = temp_store();
        let now = now_epoch();
        store
            .insert_bus_entry("judge", "piggyback_scores", "{}", now + 3600)
            .await
            .unwrap();
        store
            .insert_bus_entry("judge", "piggyback_scores", "{}", now - 10)
            .await
            .unwrap();

        let live = store
            .recent_bus_entries(Some("piggyback_scores"), 0, 10)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);

        let purged = store.purge_expired_bus_entries().await.unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn daily_usage_upsert() {
        let (store, _dir) = temp_store();
        assert!(store.get_daily_usage("2026-08-30").await.unwrap().is_none());

        store
            .upsert_daily_usage("2026-08-30", 500_000, 12_000, r#"{"piggyback-judge":12000}"#)
            .await
            .unwrap();
        store
            .upsert_daily_usage("2026-08-30", 500_000, 19_500, r#"{"piggyback-judge":19500}"#)
            .await
            .unwrap();

        let (spent, breakdown) = store.get_daily_usage("2026-08-30").await.unwrap().unwrap();
        assert_eq!(spent, 19_500);
        assert!(breakdown.contains("piggyback-judge"));
    }

    #[tokio::test]
    async fn regression_baseline_update() {
        let (store, _dir) = temp_store();
        let id = store
            .insert_regression_case("first date", "first date", "wine bar", "date night", "navy blazer, white tee", &scores(7.5))
            .await
            .unwrap();

        store.update_regression_baseline(id, &scores(8.2)).await.unwrap();

        let cases = store.active_regression_cases(20).await.unwrap();
        assert_eq!(cases.len(), 1);
        assert!((cases[0].baseline_scores.overall - 8.2).abs() < 1e-9);
    }
}
