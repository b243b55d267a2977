//! SQLite implementation of the `ItemStore` port.
//!
//! All domain values are mapped by hand to keep the schema stable and
//! self-describing:
//!
//! | Domain value | SQL | Strategy |
//! |---|---|---|
//! | `ItemKind` | TEXT + pointer columns | `kind.tag()`; `remote_*` columns carry the pointer target |
//! | `DateTime<Utc>` | TEXT | RFC 3339 |
//! | hashes, etags | TEXT | verbatim |
//! | `in_sync` | INTEGER | 0/1 |
//!
//! Path computation walks parent chains in Rust rather than SQL so a
//! cycle or dangling parent can be reported as the fatal consistency
//! error the engine expects, instead of hanging a recursive query.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use odmirror_core::domain::errors::StoreError;
use odmirror_core::domain::item::{Item, ItemKind, RemotePointer};
use odmirror_core::ports::store::ItemStore;

use crate::pool::DatabasePool;

/// Upper bound on parent-chain length; beyond this the tree is considered
/// corrupt even without a provable cycle.
const MAX_TREE_DEPTH: usize = 512;

pub struct SqliteItemStore {
    pool: sqlx::SqlitePool,
}

impl SqliteItemStore {
    pub fn new(db: &DatabasePool) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

fn sql_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn parse_mtime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Storage(format!("bad mtime '{s}': {e}")))
}

fn item_from_row(row: &SqliteRow) -> Result<Item, StoreError> {
    let kind_tag: String = row.get("kind");
    let kind = match kind_tag.as_str() {
        "file" => ItemKind::File,
        "dir" => ItemKind::Dir,
        "root" => ItemKind::Root,
        "remote" => {
            let drive_id: Option<String> = row.get("remote_drive_id");
            let id: Option<String> = row.get("remote_item_id");
            match (drive_id, id) {
                (Some(drive_id), Some(id)) => ItemKind::Remote(RemotePointer {
                    drive_id,
                    id,
                    parent_id: row.get("remote_parent_id"),
                    is_directory: row.get::<Option<i64>, _>("remote_is_dir").unwrap_or(0) != 0,
                }),
                _ => {
                    return Err(StoreError::Consistency(
                        "remote item row is missing its pointer target".to_string(),
                    ))
                }
            }
        }
        "unknown" => ItemKind::Unknown,
        other => {
            return Err(StoreError::Storage(format!("unknown item kind '{other}'")));
        }
    };

    let mtime_str: String = row.get("mtime");

    Ok(Item {
        drive_id: row.get("drive_id"),
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        name: row.get("name"),
        remote_name: row.get("remote_name"),
        kind,
        etag: row.get("etag"),
        ctag: row.get("ctag"),
        mtime: parse_mtime(&mtime_str)?,
        size: row.get("size"),
        quick_xor_hash: row.get("quick_xor_hash"),
        sha256_hash: row.get("sha256_hash"),
        reloc_drive_id: row.get("reloc_drive_id"),
        reloc_parent_id: row.get("reloc_parent_id"),
        in_sync: row.get::<i64, _>("in_sync") != 0,
    })
}

#[async_trait::async_trait]
impl ItemStore for SqliteItemStore {
    async fn upsert(&self, item: &Item) -> Result<(), StoreError> {
        let (remote_drive_id, remote_item_id, remote_parent_id, remote_is_dir) = match &item.kind {
            ItemKind::Remote(ptr) => (
                Some(ptr.drive_id.as_str()),
                Some(ptr.id.as_str()),
                ptr.parent_id.as_deref(),
                Some(ptr.is_directory as i64),
            ),
            _ => (None, None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO items (
                drive_id, id, parent_id, name, remote_name, kind,
                remote_drive_id, remote_item_id, remote_parent_id, remote_is_dir,
                etag, ctag, mtime, size, quick_xor_hash, sha256_hash,
                reloc_drive_id, reloc_parent_id, in_sync
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT (drive_id, id) DO UPDATE SET
                parent_id = excluded.parent_id,
                name = excluded.name,
                remote_name = excluded.remote_name,
                kind = excluded.kind,
                remote_drive_id = excluded.remote_drive_id,
                remote_item_id = excluded.remote_item_id,
                remote_parent_id = excluded.remote_parent_id,
                remote_is_dir = excluded.remote_is_dir,
                etag = excluded.etag,
                ctag = excluded.ctag,
                mtime = excluded.mtime,
                size = excluded.size,
                quick_xor_hash = excluded.quick_xor_hash,
                sha256_hash = excluded.sha256_hash,
                reloc_drive_id = excluded.reloc_drive_id,
                reloc_parent_id = excluded.reloc_parent_id,
                in_sync = excluded.in_sync
            "#,
        )
        .bind(&item.drive_id)
        .bind(&item.id)
        .bind(&item.parent_id)
        .bind(&item.name)
        .bind(&item.remote_name)
        .bind(item.kind.tag())
        .bind(remote_drive_id)
        .bind(remote_item_id)
        .bind(remote_parent_id)
        .bind(remote_is_dir)
        .bind(&item.etag)
        .bind(&item.ctag)
        .bind(item.mtime.to_rfc3339())
        .bind(item.size)
        .bind(&item.quick_xor_hash)
        .bind(&item.sha256_hash)
        .bind(&item.reloc_drive_id)
        .bind(&item.reloc_parent_id)
        .bind(item.in_sync as i64)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(())
    }

    async fn get(&self, drive_id: &str, id: &str) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query("SELECT * FROM items WHERE drive_id = ?1 AND id = ?2")
            .bind(drive_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

        row.as_ref().map(item_from_row).transpose()
    }

    async fn delete_by_id(&self, drive_id: &str, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM items WHERE drive_id = ?1 AND id = ?2")
            .bind(drive_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn get_by_path(&self, drive_id: &str, path: &str) -> Result<Option<Item>, StoreError> {
        let root = sqlx::query(
            "SELECT * FROM items WHERE drive_id = ?1 AND kind = 'root' AND parent_id IS NULL",
        )
        .bind(drive_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        let Some(root_row) = root else {
            return Ok(None);
        };
        let mut current = item_from_row(&root_row)?;

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let row = sqlx::query(
                "SELECT * FROM items WHERE drive_id = ?1 AND parent_id = ?2 AND name = ?3",
            )
            .bind(drive_id)
            .bind(&current.id)
            .bind(segment)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;

            match row {
                Some(r) => current = item_from_row(&r)?,
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    async fn compute_path(&self, drive_id: &str, id: &str) -> Result<String, StoreError> {
        let mut segments: Vec<String> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor = id.to_string();

        loop {
            if !visited.insert(cursor.clone()) {
                return Err(StoreError::Consistency(format!(
                    "cycle in parent chain at ({drive_id}, {cursor})"
                )));
            }
            if visited.len() > MAX_TREE_DEPTH {
                return Err(StoreError::Consistency(format!(
                    "parent chain deeper than {MAX_TREE_DEPTH} at ({drive_id}, {id})"
                )));
            }

            let item = self.get(drive_id, &cursor).await?.ok_or_else(|| {
                StoreError::Consistency(format!(
                    "broken parent chain: ({drive_id}, {cursor}) is referenced but absent"
                ))
            })?;

            if item.is_root() {
                break;
            }
            segments.push(item.name.clone());

            match item.parent_id {
                Some(parent) => cursor = parent,
                // A non-root item without a parent is a tie-shaped row;
                // treat it as the top of this drive's namespace.
                None => break,
            }
        }

        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    async fn children(&self, drive_id: &str, id: &str) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE drive_id = ?1 AND parent_id = ?2 ORDER BY name",
        )
        .bind(drive_id)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn items_in_drive(&self, drive_id: &str) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query("SELECT * FROM items WHERE drive_id = ?1 ORDER BY id")
            .bind(drive_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn subtree(&self, drive_id: &str, id: &str) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE walk(wid) AS (
                SELECT id FROM items WHERE drive_id = ?1 AND id = ?2
                UNION
                SELECT i.id FROM items i JOIN walk w ON i.parent_id = w.wid
                WHERE i.drive_id = ?1
            )
            SELECT * FROM items WHERE drive_id = ?1 AND id IN (SELECT wid FROM walk)
            "#,
        )
        .bind(drive_id)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn find_ties(
        &self,
        remote_drive_id: &str,
        remote_id: &str,
    ) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM items WHERE kind = 'remote' AND remote_drive_id = ?1 AND remote_item_id = ?2",
        )
        .bind(remote_drive_id)
        .bind(remote_id)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn distinct_drive_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT drive_id FROM items ORDER BY drive_id")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        Ok(rows.iter().map(|r| r.get::<String, _>("drive_id")).collect())
    }

    async fn out_of_sync_items(&self, drive_id: &str) -> Result<Vec<Item>, StoreError> {
        let rows = sqlx::query("SELECT * FROM items WHERE drive_id = ?1 AND in_sync = 0")
            .bind(drive_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.iter().map(item_from_row).collect()
    }

    async fn downgrade_sync_status(
        &self,
        drive_id: &str,
        root_id: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            WITH RECURSIVE walk(wid) AS (
                SELECT id FROM items WHERE drive_id = ?1 AND id = ?2
                UNION
                SELECT i.id FROM items i JOIN walk w ON i.parent_id = w.wid
                WHERE i.drive_id = ?1
            )
            UPDATE items SET in_sync = 0
            WHERE drive_id = ?1 AND id IN (SELECT wid FROM walk)
            "#,
        )
        .bind(drive_id)
        .bind(root_id)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(result.rows_affected())
    }

    async fn mark_in_sync(&self, drive_id: &str, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE items SET in_sync = 1 WHERE drive_id = ?1 AND id = ?2")
            .bind(drive_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn set_delta_link(
        &self,
        drive_id: &str,
        root_id: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO delta_tokens (drive_id, root_id, token, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (drive_id, root_id) DO UPDATE SET
                token = excluded.token,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(drive_id)
        .bind(root_id)
        .bind(token)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_delta_link(
        &self,
        drive_id: &str,
        root_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT token FROM delta_tokens WHERE drive_id = ?1 AND root_id = ?2",
        )
        .bind(drive_id)
        .bind(root_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(row.map(|r| r.get::<String, _>("token")))
    }

    async fn clear_delta_link(&self, drive_id: &str, root_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM delta_tokens WHERE drive_id = ?1 AND root_id = ?2")
            .bind(drive_id)
            .bind(root_id)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn checkpoint(&self) -> Result<(), StoreError> {
        sqlx::raw_sql("PRAGMA wal_checkpoint(PASSIVE);")
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    async fn wipe(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query("DELETE FROM items")
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        sqlx::query("DELETE FROM delta_tokens")
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        tx.commit().await.map_err(sql_err)?;
        tracing::warn!("state database wiped; a full enumeration will follow");
        Ok(())
    }
}
