//! SQLite persistence layer for harvested comments.
//!
//! All structs in this module mirror how comment data is stored on disk and
//! exposed to readers: one row per video, one row per comment keyed by
//! `bvid_rpid`, an edge table for parent/child relations, and a per-video
//! count table maintained by the write path.

use std::path::Path;

use anyhow::{Context, Result, bail};
use libsql::{Builder, Connection, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Comments per transaction on the batched write path.
const CHUNK_SIZE: usize = 1000;
/// Rows per multi-value insert statement inside a transaction.
const BATCH_INSERT_SIZE: usize = 100;

/// Rows stored in the `video_info` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoRecord {
    pub bvid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub comment_count: i64,
}

/// Rows stored in the `bilibili_comments` table.
///
/// `parent` is either the literal `"0"` (top-level) or the `unique_id` of the
/// parent comment. `replies` carries the child unique ids collected during a
/// harvest; it never becomes a column, it only feeds the edge table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentRecord {
    #[serde(default)]
    pub unique_id: String,
    pub bvid: String,
    pub rpid: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub pictures: Vec<String>,
    #[serde(default)]
    pub oid: i64,
    #[serde(default)]
    pub mid: i64,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub fans_grade: i64,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub upname: String,
    #[serde(default)]
    pub sex: String,
    #[serde(default)]
    pub following: bool,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing)]
    pub replies: Vec<String>,
}

impl CommentRecord {
    pub fn compute_unique_id(bvid: &str, rpid: i64) -> String {
        format!("{bvid}_{rpid}")
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // Ingest throughput over crash durability; the harvester is idempotent
    // against its source, so a torn write costs one re-crawl at worst.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=OFF;
        PRAGMA temp_store=MEMORY;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS video_info (
            bvid TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            cover TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS bilibili_comments (
            unique_id TEXT PRIMARY KEY,
            bvid TEXT NOT NULL,
            rpid INTEGER NOT NULL,
            content TEXT,
            pictures TEXT,
            oid INTEGER,
            mid INTEGER,
            parent TEXT,
            fans_grade INTEGER,
            ctime INTEGER,
            like_count INTEGER,
            upname TEXT,
            sex TEXT,
            following BOOLEAN,
            level INTEGER,
            location TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_bvid ON bilibili_comments(bvid);
        CREATE INDEX IF NOT EXISTS idx_rpid ON bilibili_comments(rpid);
        CREATE INDEX IF NOT EXISTS idx_mid ON bilibili_comments(mid);
        CREATE INDEX IF NOT EXISTS idx_bvid_ctime ON bilibili_comments(bvid, ctime);

        CREATE TABLE IF NOT EXISTS comment_relations (
            parent_id TEXT NOT NULL,
            child_id TEXT NOT NULL,
            PRIMARY KEY (parent_id, child_id),
            FOREIGN KEY (parent_id) REFERENCES bilibili_comments(unique_id),
            FOREIGN KEY (child_id) REFERENCES bilibili_comments(unique_id)
        );

        CREATE INDEX IF NOT EXISTS idx_parent_child ON comment_relations(parent_id, child_id);

        CREATE TABLE IF NOT EXISTS comment_stats (
            bvid TEXT PRIMARY KEY,
            comment_count INTEGER NOT NULL DEFAULT 0,
            last_updated TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (bvid) REFERENCES video_info(bvid)
        );
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite connection that owns every read and write the
/// rest of the crate performs against the comment store.
pub struct CommentStore {
    conn: Connection,
}

impl std::fmt::Debug for CommentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentStore").finish_non_exhaustive()
    }
}

impl CommentStore {
    /// Opens (and if necessary creates) the database and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening comment DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        info!(path = %path.display(), "comment store ready");
        Ok(Self { conn })
    }

    /// Shared handle for the consistency engine, which issues its own SQL.
    pub(crate) fn connection(&self) -> Connection {
        self.conn.clone()
    }

    /// Inserts or replaces the video row.
    pub async fn upsert_video(&self, video: &VideoRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO video_info (bvid, title, cover)
                VALUES (?1, ?2, ?3)
                "#,
                params![
                    video.bvid.as_str(),
                    video.title.as_str(),
                    video.cover.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    /// Transactional batched upsert. Each comment's `unique_id` is filled in
    /// as a side effect. A failing inner batch is logged and counted but does
    /// not stop the surrounding transaction; the aggregate failure surfaces
    /// as one error after everything committed.
    pub async fn batch_save_comments(&self, comments: &mut [CommentRecord]) -> Result<()> {
        if comments.is_empty() {
            warn!("asked to save an empty comment batch");
            return Ok(());
        }

        let total = comments.len();
        let mut success_count = 0usize;
        let mut error_count = 0usize;
        info!(total, "batch saving comments");

        for chunk in comments.chunks_mut(CHUNK_SIZE) {
            let tx = self.conn.transaction().await?;
            for batch in chunk.chunks_mut(BATCH_INSERT_SIZE) {
                let mut placeholders = Vec::with_capacity(batch.len());
                let mut values: Vec<libsql::Value> = Vec::with_capacity(batch.len() * 16);
                for comment in batch.iter_mut() {
                    comment.unique_id =
                        CommentRecord::compute_unique_id(&comment.bvid, comment.rpid);
                    placeholders.push("(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
                    values.push(comment.unique_id.clone().into());
                    values.push(comment.bvid.clone().into());
                    values.push(comment.rpid.into());
                    values.push(comment.content.clone().into());
                    values.push(comment.pictures.join(";").into());
                    values.push(comment.oid.into());
                    values.push(comment.mid.into());
                    values.push(comment.parent.clone().into());
                    values.push(comment.fans_grade.into());
                    values.push(comment.ctime.into());
                    values.push(comment.like_count.into());
                    values.push(comment.upname.clone().into());
                    values.push(comment.sex.clone().into());
                    values.push((comment.following as i64).into());
                    values.push(comment.level.into());
                    values.push(comment.location.clone().into());
                }

                let sql = format!(
                    "INSERT OR REPLACE INTO bilibili_comments \
                     (unique_id, bvid, rpid, content, pictures, oid, mid, parent, fans_grade, \
                      ctime, like_count, upname, sex, following, level, location) VALUES {}",
                    placeholders.join(",")
                );
                match tx.execute(&sql, params_from_iter(values)).await {
                    Ok(_) => success_count += batch.len(),
                    Err(err) => {
                        error_count += batch.len();
                        error!(error = %err, batch = batch.len(), "batch insert failed");
                    }
                }
            }
            tx.commit().await?;
            debug!(success_count, error_count, total, "comment chunk committed");
        }

        info!(total, success_count, error_count, "batch save finished");
        if error_count > 0 {
            bail!("failed to save {error_count}/{total} comments");
        }
        Ok(())
    }

    /// Records parent→child edges, ignoring ones that already exist.
    pub async fn save_relations(&self, parent_id: &str, child_ids: &[String]) -> Result<()> {
        if child_ids.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction().await?;
        for child_id in child_ids {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO comment_relations (parent_id, child_id)
                VALUES (?1, ?2)
                "#,
                params![parent_id, child_id.as_str()],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recomputes the stored count for `bvid`. Only top-level comments count;
    /// replies are reachable through the edge table.
    pub async fn update_comment_stats(&self, bvid: &str) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO comment_stats (bvid, comment_count, last_updated)
                SELECT ?1, COUNT(*), CURRENT_TIMESTAMP
                FROM bilibili_comments
                WHERE bvid = ?1 AND parent = '0'
                "#,
                params![bvid],
            )
            .await?;
        Ok(())
    }

    /// Drops every edge touching a comment of `bvid` and re-derives the edge
    /// table from the comments' `parent` fields, all in one transaction.
    pub async fn rebuild_relations(&self, bvid: &str) -> Result<()> {
        let tx = self.conn.transaction().await?;
        tx.execute(
            r#"
            DELETE FROM comment_relations
            WHERE parent_id IN (SELECT unique_id FROM bilibili_comments WHERE bvid = ?1)
               OR child_id IN (SELECT unique_id FROM bilibili_comments WHERE bvid = ?1)
            "#,
            params![bvid],
        )
        .await?;
        tx.execute(
            r#"
            INSERT OR IGNORE INTO comment_relations (parent_id, child_id)
            SELECT parent, unique_id FROM bilibili_comments
            WHERE bvid = ?1 AND parent != '0'
            "#,
            params![bvid],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Paginated video listing with optional title search. Returns the page
    /// plus the total match count.
    pub async fn list_videos(
        &self,
        page: u32,
        per_page: u32,
        search: &str,
    ) -> Result<(Vec<VideoRecord>, i64)> {
        let offset = (page.max(1) - 1) as i64 * per_page as i64;
        let pattern = format!("%{search}%");

        let total = if search.is_empty() {
            self.query_count("SELECT COUNT(*) FROM video_info", params![])
                .await?
        } else {
            self.query_count(
                "SELECT COUNT(*) FROM video_info WHERE title LIKE ?1",
                params![pattern.as_str()],
            )
            .await?
        };

        let sql_base = r#"
            SELECT v.bvid, v.title, IFNULL(v.cover, ''), IFNULL(s.comment_count, 0)
            FROM video_info v
            LEFT JOIN comment_stats s ON v.bvid = s.bvid
        "#;
        let mut videos = Vec::new();
        let mut rows = if search.is_empty() {
            let sql = format!("{sql_base} ORDER BY v.created_at DESC LIMIT ?1 OFFSET ?2");
            self.conn
                .query(&sql, params![per_page as i64, offset])
                .await?
        } else {
            let sql = format!(
                "{sql_base} WHERE v.title LIKE ?1 ORDER BY v.created_at DESC LIMIT ?2 OFFSET ?3"
            );
            self.conn
                .query(&sql, params![pattern.as_str(), per_page as i64, offset])
                .await?
        };
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok((videos, total))
    }

    pub async fn get_video(&self, bvid: &str) -> Result<Option<VideoRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT v.bvid, v.title, IFNULL(v.cover, ''), IFNULL(s.comment_count, 0)
                FROM video_info v
                LEFT JOIN comment_stats s ON v.bvid = s.bvid
                WHERE v.bvid = ?1
                "#,
                params![bvid],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row_to_video(&row)?))
    }

    /// Top-level comments of one video, most-liked first. The total comes
    /// from the counts table with a live count as fallback.
    pub async fn list_top_level_comments(
        &self,
        bvid: &str,
        page: u32,
        per_page: u32,
        keyword: &str,
    ) -> Result<(Vec<CommentRecord>, i64)> {
        let offset = (page.max(1) - 1) as i64 * per_page as i64;

        let total = {
            let mut rows = self
                .conn
                .query(
                    "SELECT comment_count FROM comment_stats WHERE bvid = ?1",
                    params![bvid],
                )
                .await?;
            match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => {
                    self.query_count(
                        "SELECT COUNT(*) FROM bilibili_comments WHERE bvid = ?1",
                        params![bvid],
                    )
                    .await?
                }
            }
        };

        let sql_base = format!(
            "SELECT {COMMENT_COLUMNS} FROM bilibili_comments WHERE bvid = ?1 AND parent = '0'"
        );
        let mut comments = Vec::new();
        let mut rows = if keyword.is_empty() {
            let sql =
                format!("{sql_base} ORDER BY like_count DESC, ctime DESC LIMIT ?2 OFFSET ?3");
            self.conn
                .query(&sql, params![bvid, per_page as i64, offset])
                .await?
        } else {
            let sql = format!(
                "{sql_base} AND content LIKE ?2 ORDER BY like_count DESC, ctime DESC LIMIT ?3 OFFSET ?4"
            );
            let pattern = format!("%{keyword}%");
            self.conn
                .query(
                    &sql,
                    params![bvid, pattern.as_str(), per_page as i64, offset],
                )
                .await?
        };
        while let Some(row) = rows.next().await? {
            comments.push(row_to_comment(&row)?);
        }
        Ok((comments, total))
    }

    /// Replies of one comment via the edge table, paginated.
    pub async fn list_replies(
        &self,
        parent_id: &str,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<CommentRecord>, i64)> {
        let offset = (page.max(1) - 1) as i64 * per_page as i64;

        let total = self
            .query_count(
                "SELECT COUNT(*) FROM comment_relations WHERE parent_id = ?1",
                params![parent_id],
            )
            .await?;
        if total == 0 {
            return Ok((Vec::new(), 0));
        }

        let sql = format!(
            r#"
            SELECT {}
            FROM bilibili_comments c
            JOIN comment_relations r ON c.unique_id = r.child_id
            WHERE r.parent_id = ?1
            ORDER BY c.like_count DESC, c.ctime DESC
            LIMIT ?2 OFFSET ?3
            "#,
            comment_columns_qualified("c")
        );
        let mut rows = self
            .conn
            .query(&sql, params![parent_id, per_page as i64, offset])
            .await?;
        let mut replies = Vec::new();
        while let Some(row) = rows.next().await? {
            replies.push(row_to_comment(&row)?);
        }
        Ok((replies, total))
    }

    async fn query_count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<i64> {
        let mut rows = self.conn.query(sql, params).await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }
}

const COMMENT_COLUMNS: &str = "unique_id, bvid, rpid, content, pictures, oid, mid, parent, \
                               fans_grade, ctime, like_count, upname, sex, following, level, location";

fn comment_columns_qualified(alias: &str) -> String {
    COMMENT_COLUMNS
        .split(", ")
        .map(|col| format!("{alias}.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_video(row: &Row) -> Result<VideoRecord> {
    Ok(VideoRecord {
        bvid: row.get(0)?,
        title: row.get(1)?,
        cover: row.get(2)?,
        comment_count: row.get(3)?,
    })
}

/// Converts a SQL row into a `CommentRecord`, splitting the `;`-joined
/// picture list and normalizing the boolean stored as an INTEGER.
fn row_to_comment(row: &Row) -> Result<CommentRecord> {
    let pictures: String = row.get(4)?;
    let pictures = pictures
        .split(';')
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
        .collect();

    Ok(CommentRecord {
        unique_id: row.get(0)?,
        bvid: row.get(1)?,
        rpid: row.get(2)?,
        content: row.get(3)?,
        pictures,
        oid: row.get(5)?,
        mid: row.get(6)?,
        parent: row.get(7)?,
        fans_grade: row.get(8)?,
        ctime: row.get(9)?,
        like_count: row.get(10)?,
        upname: row.get(11)?,
        sex: row.get(12)?,
        following: row.get::<i64>(13).map(|value| value != 0)?,
        level: row.get(14)?,
        location: row.get(15)?,
        replies: Vec::new(),
    })
}
