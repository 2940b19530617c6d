use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use crate::db::init_db;
use crate::error::MemoryError;
use crate::types::{Memory, MemoryCategory, MemorySource, MemoryStats};

/// External-collaborator boundary for long-term memory (spec §1 names
/// this out of scope beyond `add`/`search`/stats — fact extraction,
/// embeddings, and vector retrieval live behind whatever implements this).
#[async_trait]
pub trait MemoryManager: Send + Sync {
    async fn add(
        &self,
        user_id: &str,
        category: MemoryCategory,
        key: &str,
        value: &str,
        confidence: f64,
        source: MemorySource,
    ) -> Result<(), MemoryError>;

    async fn forget(&self, user_id: &str, category: MemoryCategory, key: &str) -> Result<(), MemoryError>;

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Memory>, MemoryError>;

    async fn stats(&self, user_id: &str) -> Result<MemoryStats, MemoryError>;
}

/// Reference `MemoryManager` backed by a local SQLite file. One connection
/// guarded by a mutex; fact-extraction and prompt-rendering are handled by
/// collaborators outside this crate.
pub struct SqliteMemoryManager {
    db: Mutex<Connection>,
}

impl SqliteMemoryManager {
    pub fn new(conn: Connection) -> Result<Self, MemoryError> {
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn) })
    }
}

#[async_trait]
impl MemoryManager for SqliteMemoryManager {
    async fn add(
        &self,
        user_id: &str,
        category: MemoryCategory,
        key: &str,
        value: &str,
        confidence: f64,
        source: MemorySource,
    ) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        let cat = category.to_string();
        let src = source.to_string();

        let existing: Option<(i64, f64)> = db
            .query_row(
                "SELECT id, confidence FROM user_memory WHERE user_id = ?1 AND category = ?2 AND key = ?3",
                rusqlite::params![user_id, cat, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        match existing {
            Some((_, old_conf)) if confidence < old_conf => {
                debug!(user_id, key, old_conf, new_conf = confidence, "skipping add: existing confidence is higher");
            }
            Some((id, _)) => {
                db.execute(
                    "UPDATE user_memory SET value = ?1, confidence = ?2, source = ?3, updated_at = ?4 WHERE id = ?5",
                    rusqlite::params![value, confidence, src, now, id],
                )?;
            }
            None => {
                db.execute(
                    "INSERT INTO user_memory (user_id, category, key, value, confidence, source, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    rusqlite::params![user_id, cat, key, value, confidence, src, now],
                )?;
            }
        }
        Ok(())
    }

    async fn forget(&self, user_id: &str, category: MemoryCategory, key: &str) -> Result<(), MemoryError> {
        let db = self.db.lock().unwrap();
        let cat = category.to_string();
        let affected = db.execute(
            "DELETE FROM user_memory WHERE user_id = ?1 AND category = ?2 AND key = ?3",
            rusqlite::params![user_id, cat, key],
        )?;
        if affected == 0 {
            return Err(MemoryError::NotFound { category: cat, key: key.to_string() });
        }
        Ok(())
    }

    async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Memory>, MemoryError> {
        let db = self.db.lock().unwrap();
        let like = format!("%{query}%");
        let mut stmt = db.prepare(
            "SELECT id, user_id, category, key, value, confidence, source, expires_at, created_at, updated_at
             FROM user_memory
             WHERE user_id = ?1 AND (key LIKE ?2 OR value LIKE ?2)
             ORDER BY confidence DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![user_id, like, limit], row_to_memory)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    async fn stats(&self, user_id: &str) -> Result<MemoryStats, MemoryError> {
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT category, COUNT(*) FROM user_memory WHERE user_id = ?1 GROUP BY category")?;
        let rows = stmt.query_map(rusqlite::params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        let by_category: HashMap<String, usize> = rows.filter_map(|r| r.ok()).collect();
        let total_memories = by_category.values().sum();
        Ok(MemoryStats { user_id: user_id.to_string(), total_memories, by_category })
    }
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let cat_str: String = row.get(2)?;
    let src_str: String = row.get(6)?;
    Ok(Memory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        category: cat_str.parse().unwrap_or(MemoryCategory::Context),
        key: row.get(3)?,
        value: row.get(4)?,
        confidence: row.get(5)?,
        source: src_str.parse().unwrap_or(MemorySource::Inferred),
        expires_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SqliteMemoryManager {
        SqliteMemoryManager::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn add_then_search_finds_the_memory() {
        let mgr = manager();
        mgr.add("u1", MemoryCategory::Preference, "diet", "vegetarian", 0.9, MemorySource::UserSaid)
            .await
            .unwrap();
        let found = mgr.search("u1", "vege", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "vegetarian");
    }

    #[tokio::test]
    async fn lower_confidence_update_is_ignored() {
        let mgr = manager();
        mgr.add("u1", MemoryCategory::Fact, "city", "Beijing", 0.9, MemorySource::UserSaid).await.unwrap();
        mgr.add("u1", MemoryCategory::Fact, "city", "Shanghai", 0.5, MemorySource::Inferred).await.unwrap();
        let found = mgr.search("u1", "city", 10).await.unwrap();
        assert_eq!(found[0].value, "Beijing");
    }

    #[tokio::test]
    async fn forget_removes_the_entry() {
        let mgr = manager();
        mgr.add("u1", MemoryCategory::Fact, "city", "Beijing", 0.9, MemorySource::UserSaid).await.unwrap();
        mgr.forget("u1", MemoryCategory::Fact, "city").await.unwrap();
        assert!(mgr.search("u1", "city", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_counts_by_category() {
        let mgr = manager();
        mgr.add("u1", MemoryCategory::Fact, "a", "1", 0.9, MemorySource::UserSaid).await.unwrap();
        mgr.add("u1", MemoryCategory::Preference, "b", "2", 0.9, MemorySource::UserSaid).await.unwrap();
        let stats = mgr.stats("u1").await.unwrap();
        assert_eq!(stats.total_memories, 2);
        assert_eq!(stats.by_category.get("fact"), Some(&1));
    }
}
