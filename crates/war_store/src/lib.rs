use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use core_types::{
    new_id, BulkWriteReport, ClanDirectory, FinalizedWar, MemberTimer, TargetId, WarIdentity, WarRecord,
    WarStore, WriteFailure,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("blocking task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// One row of `clan_wars` as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredWar {
    pub war_id: WarIdentity,
    pub clans: [TargetId; 2],
    pub end_time: i64,
    pub war_type: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub custom_id: Option<String>,
}

/// SQLite-backed war store. Every call runs on the blocking pool and is
/// serialized by the connection mutex.
#[derive(Clone)]
pub struct SqliteWarStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWarStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }

    /// Adds a clan to the registered (always tracked) set.
    pub async fn register_target(&self, tag: &str) -> Result<(), StoreError> {
        let tag = tag.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO tracked_clans (tag, added_ms) VALUES (?1, ?2)",
                params![tag, chrono::Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_global_clan(&self, tag: &str, open_war_log: bool) -> Result<(), StoreError> {
        let tag = tag.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO global_clans (tag, open_war_log) VALUES (?1, ?2)
                 ON CONFLICT(tag) DO UPDATE SET open_war_log = excluded.open_war_log",
                params![tag, open_war_log],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn war(&self, war_id: &WarIdentity) -> Result<Option<StoredWar>, StoreError> {
        let war_id = war_id.as_str().to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT war_id, clan_a, clan_b, end_time, type, data, custom_id
                     FROM clan_wars WHERE war_id = ?1",
                    params![war_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, a, b, end_time, war_type, data, custom_id)) = row else {
                return Ok(None);
            };
            let payload = data.map(|raw| serde_json::from_str(&raw)).transpose()?;
            Ok(Some(StoredWar {
                war_id: WarIdentity::from_raw(id),
                clans: [a, b],
                end_time,
                war_type,
                payload,
                custom_id,
            }))
        })
        .await
    }

    pub async fn member_timer(&self, member_tag: &str) -> Result<Option<MemberTimer>, StoreError> {
        let member_tag = member_tag.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT clan_a, clan_b, end_time FROM war_timer WHERE member_tag = ?1",
                    params![member_tag],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row.and_then(|(a, b, end_ms)| {
                chrono::DateTime::from_timestamp_millis(end_ms).map(|end_time| MemberTimer {
                    member_tag,
                    clans: [a, b],
                    end_time,
                })
            }))
        })
        .await
    }

    pub async fn is_deleted(&self, tag: &str) -> Result<bool, StoreError> {
        let tag = tag.to_string();
        self.blocking(move |conn| {
            let found = conn
                .query_row("SELECT 1 FROM deleted_clans WHERE tag = ?1", params![tag], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS clan_wars (
            war_id TEXT PRIMARY KEY,
            clan_a TEXT NOT NULL,
            clan_b TEXT NOT NULL,
            end_time INTEGER NOT NULL,
            type TEXT NULL,
            data TEXT NULL,
            custom_id TEXT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_clan_wars_end ON clan_wars(end_time);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_clan_wars_custom ON clan_wars(custom_id);

        CREATE TABLE IF NOT EXISTS war_timer (
            member_tag TEXT PRIMARY KEY,
            clan_a TEXT NOT NULL,
            clan_b TEXT NOT NULL,
            end_time INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tracked_clans (
            tag TEXT PRIMARY KEY,
            added_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS global_clans (
            tag TEXT PRIMARY KEY,
            open_war_log INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS deleted_clans (
            tag TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            deleted_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn check_tags(tags: &[TargetId; 2]) -> Result<(), String> {
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err("empty participant tag".to_string());
    }
    Ok(())
}

fn log_failures(table: &str, report: &BulkWriteReport) {
    if report.is_clean() {
        return;
    }
    metrics::counter!("store.write_failure").increment(report.failures.len() as u64);
    tracing::warn!(
        table,
        applied = report.applied,
        failed = report.failures.len(),
        first = %report.failures[0].reason,
        "bulk write had failures"
    );
}

#[async_trait]
impl WarStore for SqliteWarStore {
    async fn insert_wars(&self, records: Vec<WarRecord>) -> anyhow::Result<BulkWriteReport> {
        let report = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let mut report = BulkWriteReport::default();
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO clan_wars (war_id, clan_a, clan_b, end_time)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (index, record) in records.iter().enumerate() {
                        let outcome = check_tags(&record.clans).and_then(|()| {
                            stmt.execute(params![
                                record.war_id.as_str(),
                                record.clans[0],
                                record.clans[1],
                                record.end_time
                            ])
                            .map_err(|err| err.to_string())
                        });
                        match outcome {
                            Ok(_) => report.applied += 1,
                            Err(reason) => report.failures.push(WriteFailure { index, reason }),
                        }
                    }
                }
                tx.commit()?;
                Ok(report)
            })
            .await?;
        log_failures("clan_wars", &report);
        Ok(report)
    }

    async fn upsert_member_timers(&self, timers: Vec<MemberTimer>) -> anyhow::Result<BulkWriteReport> {
        let report = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let mut report = BulkWriteReport::default();
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO war_timer (member_tag, clan_a, clan_b, end_time)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(member_tag) DO UPDATE SET
                             clan_a = excluded.clan_a,
                             clan_b = excluded.clan_b,
                             end_time = excluded.end_time",
                    )?;
                    for (index, timer) in timers.iter().enumerate() {
                        let outcome = if timer.member_tag.trim().is_empty() {
                            Err("empty member tag".to_string())
                        } else {
                            check_tags(&timer.clans).and_then(|()| {
                                stmt.execute(params![
                                    timer.member_tag,
                                    timer.clans[0],
                                    timer.clans[1],
                                    timer.end_time.timestamp_millis()
                                ])
                                .map_err(|err| err.to_string())
                            })
                        };
                        match outcome {
                            Ok(_) => report.applied += 1,
                            Err(reason) => report.failures.push(WriteFailure { index, reason }),
                        }
                    }
                }
                tx.commit()?;
                Ok(report)
            })
            .await?;
        log_failures("war_timer", &report);
        Ok(report)
    }

    async fn finalize_war(&self, war: FinalizedWar) -> anyhow::Result<()> {
        self.blocking(move |conn| {
            let data = serde_json::to_string(&war.payload)?;
            conn.execute(
                "INSERT INTO clan_wars (war_id, clan_a, clan_b, end_time, type, data, custom_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(war_id) DO UPDATE SET
                     end_time = excluded.end_time,
                     type = excluded.type,
                     data = excluded.data,
                     custom_id = COALESCE(clan_wars.custom_id, excluded.custom_id)",
                params![
                    war.war_id.as_str(),
                    war.clans[0],
                    war.clans[1],
                    war.end_time,
                    war.war_type.map(|t| t.as_str()),
                    data,
                    new_id()
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn pending_war_ids(&self, ending_after: i64) -> anyhow::Result<HashSet<WarIdentity>> {
        let ids = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT war_id FROM clan_wars WHERE end_time >= ?1 AND data IS NULL",
                )?;
                let ids = stmt
                    .query_map(params![ending_after], |row| row.get::<_, String>(0))?
                    .map(|id| id.map(WarIdentity::from_raw))
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    async fn recent_war_participants(&self, ended_after: i64) -> anyhow::Result<Vec<TargetId>> {
        let tags = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT clan_a, clan_b FROM clan_wars
                     WHERE end_time >= ?1 AND (type IS NULL OR type != 'cwl')",
                )?;
                let mut tags = BTreeSet::new();
                let rows = stmt.query_map(params![ended_after], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (a, b) = row?;
                    tags.insert(a);
                    tags.insert(b);
                }
                Ok(tags.into_iter().collect())
            })
            .await?;
        Ok(tags)
    }

    async fn registered_targets(&self) -> anyhow::Result<Vec<TargetId>> {
        let tags = self
            .blocking(|conn| {
                let mut stmt = conn.prepare("SELECT tag FROM tracked_clans ORDER BY tag")?;
                let tags = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tags)
            })
            .await?;
        Ok(tags)
    }

    async fn open_war_log_targets(&self) -> anyhow::Result<Vec<TargetId>> {
        let tags = self
            .blocking(|conn| {
                let mut stmt = conn
                    .prepare("SELECT tag FROM global_clans WHERE open_war_log = 1 ORDER BY tag")?;
                let tags = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(tags)
            })
            .await?;
        Ok(tags)
    }
}

#[async_trait]
impl ClanDirectory for SqliteWarStore {
    async fn record_clan(&self, tag: &str, open_war_log: bool) -> anyhow::Result<()> {
        self.upsert_global_clan(tag, open_war_log).await?;
        Ok(())
    }

    async fn record_deleted(&self, tag: &str, profile: serde_json::Value) -> anyhow::Result<()> {
        let tag = tag.to_string();
        let data = serde_json::to_string(&profile)?;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO deleted_clans (tag, data, deleted_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tag) DO UPDATE SET data = excluded.data, deleted_ms = excluded.deleted_ms",
                params![tag, data, chrono::Utc::now().timestamp_millis()],
            )?;
            tx.execute("DELETE FROM global_clans WHERE tag = ?1", params![tag])?;
            tx.commit()?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}
