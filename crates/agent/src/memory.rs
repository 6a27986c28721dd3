use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use proto::{Conversation, DatabaseError, MemoryStats, NewConversation, SearchFilter, SessionId, UsageBucket};
use sqlx::{
    QueryBuilder, Row, Sqlite,
    sqlite::{SqlitePool, SqliteRow},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::embedding::{decode_embedding, encode_embedding};

const COLUMNS: &str = "id, prompt, response, agent, model, provider, total_tokens, cost_usd, timestamp, session_id";

/// SQLite-backed conversation memory
pub struct SqliteMemory {
    pool: SqlitePool,
    enabled: AtomicBool,
    /// Serializes writers so ids stay monotonic and stats consistent
    write_lock: Mutex<()>,
}

impl SqliteMemory {
    /// Open (or create) the SQLite database and run migrations
    pub async fn open(db_url: &str) -> Result<Self, DatabaseError> {
        // Expand ~ in path
        let url = if db_url.starts_with("~") {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            db_url.replacen("~", &home, 1)
        } else {
            db_url.to_string()
        };

        // Ensure parent directory exists
        if let Some(parent) = std::path::Path::new(&url).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{url}?mode=rwc"))
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        let migrations_dir =
            std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
        let migrator = sqlx::migrate::Migrator::new(migrations_dir.as_path())
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        migrator
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("SQLite memory opened: {url}");
        Ok(Self {
            pool,
            enabled: AtomicBool::new(true),
            write_lock: Mutex::new(()),
        })
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Turns every operation into a no-op with empty results
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Store a conversation. Returns its id, or `None` while disabled
    pub async fn store(&self, conv: &NewConversation) -> Result<Option<i64>, DatabaseError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let timestamp = conv.timestamp.unwrap_or_else(Utc::now);
        let embedding = conv.embedding.as_deref().map(encode_embedding);

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT INTO conversations (prompt, response, agent, model, provider, total_tokens, cost_usd, timestamp, session_id, embedding) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&conv.prompt)
        .bind(&conv.response)
        .bind(&conv.agent)
        .bind(&conv.model)
        .bind(&conv.provider)
        .bind(conv.total_tokens)
        .bind(conv.cost_usd)
        .bind(format_timestamp(&timestamp))
        .bind(conv.session_id.as_ref().map(SessionId::as_str))
        .bind(embedding)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        let id = result.last_insert_rowid();
        debug!(conversation_id = id, agent = %conv.agent, "Stored conversation");
        Ok(Some(id))
    }

    /// Fetch one conversation, including its embedding
    pub async fn get(&self, id: i64) -> Result<Option<Conversation>, DatabaseError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS}, embedding FROM conversations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        Ok(row.map(|row| conversation_from_row(&row, true)))
    }

    /// Most recent conversations first, optionally for one agent
    pub async fn recent(
        &self,
        limit: usize,
        agent: Option<&str>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let filter = SearchFilter {
            agent: agent.map(str::to_string),
            limit,
            ..SearchFilter::default()
        };
        self.search(&filter).await
    }

    /// Conjunctive search, newest first.
    ///
    /// `query` matches case-insensitively against prompt or response.
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<Conversation>, DatabaseError> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM conversations WHERE 1 = 1"));

        // SQLite's LOWER() folds ASCII only, so the text query is matched here
        // after the column filters.
        let needle = filter
            .query
            .as_deref()
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        if let Some(agent) = &filter.agent {
            qb.push(" AND agent = ").push_bind(agent.clone());
        }
        if let Some(model) = &filter.model {
            qb.push(" AND model = ").push_bind(model.clone());
        }
        if let Some(from) = &filter.from {
            qb.push(" AND timestamp >= ").push_bind(format_timestamp(from));
        }
        if let Some(to) = &filter.to {
            qb.push(" AND timestamp <= ").push_bind(format_timestamp(to));
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ")
                .push_bind(session_id.as_str().to_string());
        }
        qb.push(" ORDER BY timestamp DESC, id DESC");
        if needle.is_none() {
            qb.push(" LIMIT ")
                .push_bind(i64::try_from(filter.limit).unwrap_or(i64::MAX));
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| conversation_from_row(row, false))
            .filter(|conv| {
                needle.as_deref().is_none_or(|needle| {
                    conv.prompt.to_lowercase().contains(needle)
                        || conv.response.to_lowercase().contains(needle)
                })
            })
            .take(filter.limit)
            .collect())
    }

    /// Most recent `pool` conversations with their stored embeddings, for
    /// similarity ranking
    pub async fn semantic_candidates(
        &self,
        agent: Option<&str>,
        pool: usize,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {COLUMNS}, embedding FROM conversations WHERE 1 = 1"
        ));
        if let Some(agent) = agent {
            qb.push(" AND agent = ").push_bind(agent.to_string());
        }
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(i64::try_from(pool).unwrap_or(i64::MAX));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| conversation_from_row(row, true))
            .collect())
    }

    /// Attach a deferred embedding. Returns whether a row was updated
    pub async fn update_embedding(&self, id: i64, vector: &[f32]) -> Result<bool, DatabaseError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE conversations SET embedding = ? WHERE id = ?")
            .bind(encode_embedding(vector))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: i64) -> Result<bool, DatabaseError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete conversations older than `days` days. Returns the number removed
    pub async fn cleanup(&self, days: i64) -> Result<u64, DatabaseError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        if days < 0 {
            return Err(DatabaseError::InvalidArgument(format!(
                "cleanup days must not be negative, got {days}"
            )));
        }
        // A cutoff before the earliest representable date matches nothing.
        let Some(cutoff) = Duration::try_days(days).and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(days, "Cleanup cutoff out of range, nothing to remove");
            return Ok(0);
        };
        let cutoff = format_timestamp(&cutoff);
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM conversations WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        let removed = result.rows_affected();
        info!(days, removed, "Cleaned up old conversations");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<MemoryStats, DatabaseError> {
        if !self.is_enabled() {
            return Ok(MemoryStats::default());
        }
        let totals = sqlx::query(
            "SELECT COUNT(*) AS conversations, CAST(COALESCE(SUM(total_tokens), 0) AS INTEGER) AS tokens, CAST(COALESCE(SUM(cost_usd), 0.0) AS REAL) AS cost_usd FROM conversations",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        let totals = bucket_from_row(&totals);

        Ok(MemoryStats {
            total_conversations: totals.conversations,
            total_tokens: totals.tokens,
            total_cost_usd: totals.cost_usd,
            by_agent: self.grouped_usage("agent").await?,
            by_model: self.grouped_usage("model").await?,
        })
    }

    /// Usage grouped by a fixed column name
    async fn grouped_usage(
        &self,
        column: &'static str,
    ) -> Result<BTreeMap<String, UsageBucket>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT {column} AS name, COUNT(*) AS conversations, CAST(COALESCE(SUM(total_tokens), 0) AS INTEGER) AS tokens, CAST(COALESCE(SUM(cost_usd), 0.0) AS REAL) AS cost_usd FROM conversations GROUP BY {column}"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<String, _>("name"), bucket_from_row(row)))
            .collect())
    }
}

/// Fixed-width RFC 3339 so lexical order matches chronological order
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn bucket_from_row(row: &SqliteRow) -> UsageBucket {
    UsageBucket {
        conversations: row.get("conversations"),
        tokens: row.get("tokens"),
        cost_usd: row.get("cost_usd"),
    }
}

fn conversation_from_row(row: &SqliteRow, with_embedding: bool) -> Conversation {
    let id: i64 = row.get("id");
    let timestamp_str: String = row.get("timestamp");
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let embedding = if with_embedding {
        row.get::<Option<Vec<u8>>, _>("embedding")
            .and_then(|blob| match decode_embedding(&blob) {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(conversation_id = id, error = %e, "Ignoring malformed embedding");
                    None
                }
            })
    } else {
        None
    };

    Conversation {
        id,
        prompt: row.get("prompt"),
        response: row.get("response"),
        agent: row.get("agent"),
        model: row.get("model"),
        provider: row.get("provider"),
        total_tokens: row.get("total_tokens"),
        cost_usd: row.get("cost_usd"),
        timestamp,
        session_id: row
            .get::<Option<String>, _>("session_id")
            .map(SessionId::from),
        embedding,
    }
}
