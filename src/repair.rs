//! Consistency engine over the comment store.
//!
//! Validation runs a fixed catalogue of checks, each producing at most one
//! [`Issue`] with a count and up to ten example video ids. Repair re-runs
//! validation and then applies the matching fix per issue; a failing fix is
//! logged and leaves the issue unfixed, it never aborts the pass.

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use libsql::{Connection, params};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crawler::Crawler;
use crate::database::CommentStore;

pub const SEVERITY_CRITICAL: &str = "critical";
pub const SEVERITY_HIGH: &str = "high";
pub const SEVERITY_MEDIUM: &str = "medium";
pub const SEVERITY_LOW: &str = "low";

pub const CATEGORY_INTEGRITY: &str = "data_integrity";
pub const CATEGORY_CONSISTENCY: &str = "data_consistency";
pub const CATEGORY_VALIDATION: &str = "data_validation";
pub const CATEGORY_RELATIONSHIP: &str = "data_relationship";

pub const ISSUE_VIDEO_NOT_FOUND: &str = "video_not_found";
pub const ISSUE_EMPTY_VIDEO_TITLE: &str = "empty_video_title";
pub const ISSUE_DUPLICATE_BVID: &str = "duplicate_bvid";
pub const ISSUE_VIDEO_MISSING_COMMENTS: &str = "video_missing_comments";
pub const ISSUE_ORPHAN_COMMENTS: &str = "orphan_comments";
pub const ISSUE_DUPLICATE_COMMENTS: &str = "duplicate_comments";
pub const ISSUE_EMPTY_COMMENT_CONTENT: &str = "empty_comment_content";
pub const ISSUE_INVALID_TIMESTAMP: &str = "invalid_timestamp";
pub const ISSUE_INVALID_PARENT_REF: &str = "invalid_parent_reference";
pub const ISSUE_INVALID_CHILD_REF: &str = "invalid_child_reference";
pub const ISSUE_SELF_REFERENCE: &str = "self_reference";
pub const ISSUE_PARENT_NOT_EXIST: &str = "parent_not_exist";
pub const ISSUE_MISSING_RELATIONS: &str = "missing_comment_relations";
pub const ISSUE_INCONSISTENT_STATS: &str = "inconsistent_stats";
pub const ISSUE_MISSING_STATS: &str = "missing_stats";

pub const PLACEHOLDER_TITLE: &str = "未知标题";
pub const PLACEHOLDER_CONTENT: &str = "[内容已删除]";
pub const PLACEHOLDER_MISSING_PARENT: &str = "[该评论内容缺失]";

/// At most this many example ids travel with an issue.
const EXAMPLE_LIMIT: i64 = 10;

/// Timestamps further in the future than this are considered corrupt.
const TIMESTAMP_SLACK_SECS: i64 = 86_400;

/// One class of defect found in the store.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: &'static str,
    pub severity: &'static str,
    pub category: &'static str,
    pub description: String,
    pub count: i64,
    pub fixable: bool,
    pub fixed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub affected_bvids: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Summary {
    pub total_videos: i64,
    pub total_comments: i64,
    pub issues_found: i64,
    pub issues_fixed: i64,
    pub issues_unfixable: i64,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
    pub summary: Summary,
}

#[derive(Debug, Serialize)]
pub struct VideoValidationReport {
    pub video_id: String,
    pub issues: Vec<Issue>,
    pub summary: Summary,
}

/// Validation and repair over one open store.
pub struct RepairService<'a> {
    store: &'a CommentStore,
    conn: Connection,
}

impl<'a> RepairService<'a> {
    pub fn new(store: &'a CommentStore) -> Self {
        let conn = store.connection();
        Self { store, conn }
    }

    /// Runs the whole-database check catalogue.
    pub async fn validate_database(&self) -> Result<ValidationReport> {
        info!("validating database consistency");
        let mut issues = Vec::new();

        self.check_video_table(&mut issues).await?;
        self.check_comment_table(&mut issues).await?;
        self.check_relations(&mut issues).await?;
        self.check_stats(&mut issues).await?;

        let mut summary = self.base_summary().await?;
        summary.issues_found = issues.len() as i64;
        summary.issues_unfixable = issues.iter().filter(|issue| !issue.fixable).count() as i64;

        info!(issues = issues.len(), "database validation finished");
        Ok(ValidationReport { issues, summary })
    }

    /// Validates then repairs everything fixable, one pass.
    pub async fn repair_database(&self) -> Result<ValidationReport> {
        let mut report = self.validate_database().await?;
        let mut fixed = 0;
        for issue in report.issues.iter_mut() {
            if !issue.fixable || issue.fixed {
                continue;
            }
            match self.fix_issue(issue.issue_type).await {
                Ok(()) => {
                    issue.fixed = true;
                    fixed += 1;
                    info!(issue = issue.issue_type, "issue repaired");
                }
                Err(err) => {
                    error!(issue = issue.issue_type, error = %err, "repair failed");
                }
            }
        }
        report.summary.issues_fixed = fixed;
        info!(fixed, "database repair finished");
        Ok(report)
    }

    /// Per-video validation: existence, comment presence, stats agreement.
    pub async fn validate_video(&self, bvid: &str) -> Result<VideoValidationReport> {
        info!(bvid, "validating video data");
        let mut issues = Vec::new();

        let exists = self
            .count(
                "SELECT COUNT(*) FROM video_info WHERE bvid = ?1",
                params![bvid],
            )
            .await?
            > 0;
        if !exists {
            // Nothing else is checkable for a video the store does not know.
            issues.push(Issue {
                issue_type: ISSUE_VIDEO_NOT_FOUND,
                severity: SEVERITY_CRITICAL,
                category: CATEGORY_INTEGRITY,
                description: format!("video {bvid} does not exist in the store"),
                count: 1,
                fixable: false,
                fixed: false,
                affected_bvids: vec![bvid.to_owned()],
                details: String::new(),
            });
            let summary = Summary {
                total_videos: 1,
                issues_found: 1,
                issues_unfixable: 1,
                ..Summary::default()
            };
            return Ok(VideoValidationReport {
                video_id: bvid.to_owned(),
                issues,
                summary,
            });
        }

        let comment_count = self
            .count(
                "SELECT COUNT(*) FROM bilibili_comments WHERE bvid = ?1",
                params![bvid],
            )
            .await?;
        if comment_count == 0 {
            issues.push(Issue {
                issue_type: ISSUE_VIDEO_MISSING_COMMENTS,
                severity: SEVERITY_HIGH,
                category: CATEGORY_CONSISTENCY,
                description: format!("video {bvid} has no comment data"),
                count: 1,
                fixable: true,
                fixed: false,
                affected_bvids: vec![bvid.to_owned()],
                details: String::new(),
            });
        }

        let top_level = self
            .count(
                "SELECT COUNT(*) FROM bilibili_comments WHERE bvid = ?1 AND parent = '0'",
                params![bvid],
            )
            .await?;
        let stats = {
            let mut rows = self
                .conn
                .query(
                    "SELECT comment_count FROM comment_stats WHERE bvid = ?1",
                    params![bvid],
                )
                .await?;
            match rows.next().await? {
                Some(row) => Some(row.get::<i64>(0)?),
                None => None,
            }
        };
        match stats {
            None => issues.push(Issue {
                issue_type: ISSUE_MISSING_STATS,
                severity: SEVERITY_MEDIUM,
                category: CATEGORY_CONSISTENCY,
                description: format!("video {bvid} has no stats row"),
                count: 1,
                fixable: true,
                fixed: false,
                affected_bvids: vec![bvid.to_owned()],
                details: String::new(),
            }),
            Some(stored) if stored != top_level => issues.push(Issue {
                issue_type: ISSUE_INCONSISTENT_STATS,
                severity: SEVERITY_MEDIUM,
                category: CATEGORY_CONSISTENCY,
                description: format!(
                    "video {bvid} stats disagree (actual: {top_level}, stored: {stored})"
                ),
                count: 1,
                fixable: true,
                fixed: false,
                affected_bvids: vec![bvid.to_owned()],
                details: String::new(),
            }),
            Some(_) => {}
        }

        let summary = Summary {
            total_videos: 1,
            total_comments: comment_count,
            issues_found: issues.len() as i64,
            issues_unfixable: issues.iter().filter(|issue| !issue.fixable).count() as i64,
            ..Summary::default()
        };
        info!(bvid, issues = issues.len(), "video validation finished");
        Ok(VideoValidationReport {
            video_id: bvid.to_owned(),
            issues,
            summary,
        })
    }

    /// Per-video repair. The missing-comments repair re-invokes the crawler;
    /// when that fails the video row is removed so it stops flagging forever.
    pub async fn repair_video(
        &self,
        token: &CancellationToken,
        bvid: &str,
        crawler: &Crawler,
    ) -> Result<VideoValidationReport> {
        let mut report = self.validate_video(bvid).await?;
        let mut fixed = 0;
        for issue in report.issues.iter_mut() {
            if !issue.fixable || issue.fixed {
                continue;
            }
            let result = match issue.issue_type {
                ISSUE_VIDEO_MISSING_COMMENTS => {
                    self.fix_video_missing_comments(token, bvid, crawler).await
                }
                ISSUE_MISSING_STATS | ISSUE_INCONSISTENT_STATS => {
                    self.store.update_comment_stats(bvid).await
                }
                other => Err(anyhow!("unknown per-video issue type: {other}")),
            };
            match result {
                Ok(()) => {
                    issue.fixed = true;
                    fixed += 1;
                    info!(bvid, issue = issue.issue_type, "video issue repaired");
                }
                Err(err) => {
                    error!(bvid, issue = issue.issue_type, error = %err, "video repair failed");
                }
            }
        }
        report.summary.issues_fixed = fixed;
        Ok(report)
    }

    // ---- whole-DB checks ----

    async fn check_video_table(&self, issues: &mut Vec<Issue>) -> Result<()> {
        if let Some(issue) = self
            .detect(
                ISSUE_EMPTY_VIDEO_TITLE,
                SEVERITY_MEDIUM,
                CATEGORY_VALIDATION,
                "SELECT COUNT(*) FROM video_info WHERE title IS NULL OR title = ''",
                Some("SELECT bvid FROM video_info WHERE title IS NULL OR title = ''"),
                |count| format!("{count} videos have an empty title"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_DUPLICATE_BVID,
                SEVERITY_HIGH,
                CATEGORY_INTEGRITY,
                "SELECT COUNT(*) FROM (SELECT bvid FROM video_info GROUP BY bvid HAVING COUNT(*) > 1)",
                Some("SELECT bvid FROM video_info GROUP BY bvid HAVING COUNT(*) > 1"),
                |count| format!("{count} bvids appear more than once"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_VIDEO_MISSING_COMMENTS,
                SEVERITY_HIGH,
                CATEGORY_CONSISTENCY,
                "SELECT COUNT(*) FROM video_info v LEFT JOIN bilibili_comments c ON v.bvid = c.bvid WHERE c.bvid IS NULL",
                Some("SELECT v.bvid FROM video_info v LEFT JOIN bilibili_comments c ON v.bvid = c.bvid WHERE c.bvid IS NULL"),
                |count| format!("{count} videos have no comment data"),
            )
            .await?
        {
            issues.push(issue);
        }
        Ok(())
    }

    async fn check_comment_table(&self, issues: &mut Vec<Issue>) -> Result<()> {
        if let Some(issue) = self
            .detect(
                ISSUE_ORPHAN_COMMENTS,
                SEVERITY_HIGH,
                CATEGORY_INTEGRITY,
                "SELECT COUNT(*) FROM bilibili_comments c LEFT JOIN video_info v ON c.bvid = v.bvid WHERE v.bvid IS NULL",
                Some("SELECT DISTINCT c.bvid FROM bilibili_comments c LEFT JOIN video_info v ON c.bvid = v.bvid WHERE v.bvid IS NULL"),
                |count| format!("{count} comments reference a video the store does not have"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_DUPLICATE_COMMENTS,
                SEVERITY_MEDIUM,
                CATEGORY_INTEGRITY,
                "SELECT COUNT(*) FROM (SELECT unique_id FROM bilibili_comments GROUP BY unique_id HAVING COUNT(*) > 1)",
                None,
                |count| format!("{count} comment ids appear more than once"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_EMPTY_COMMENT_CONTENT,
                SEVERITY_LOW,
                CATEGORY_VALIDATION,
                "SELECT COUNT(*) FROM bilibili_comments WHERE content IS NULL OR content = ''",
                None,
                |count| format!("{count} comments have empty content"),
            )
            .await?
        {
            issues.push(issue);
        }

        let horizon = Utc::now().timestamp() + TIMESTAMP_SLACK_SECS;
        let count = self
            .count(
                "SELECT COUNT(*) FROM bilibili_comments WHERE ctime < 0 OR ctime > ?1",
                params![horizon],
            )
            .await?;
        if count > 0 {
            issues.push(Issue {
                issue_type: ISSUE_INVALID_TIMESTAMP,
                severity: SEVERITY_MEDIUM,
                category: CATEGORY_VALIDATION,
                description: format!("{count} comments carry an impossible timestamp"),
                count,
                fixable: true,
                fixed: false,
                affected_bvids: Vec::new(),
                details: String::new(),
            });
        }
        Ok(())
    }

    async fn check_relations(&self, issues: &mut Vec<Issue>) -> Result<()> {
        if let Some(issue) = self
            .detect(
                ISSUE_INVALID_PARENT_REF,
                SEVERITY_HIGH,
                CATEGORY_RELATIONSHIP,
                "SELECT COUNT(*) FROM comment_relations r LEFT JOIN bilibili_comments c ON r.parent_id = c.unique_id WHERE c.unique_id IS NULL",
                None,
                |count| format!("{count} edges point at a parent that is not a comment"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_INVALID_CHILD_REF,
                SEVERITY_HIGH,
                CATEGORY_RELATIONSHIP,
                "SELECT COUNT(*) FROM comment_relations r LEFT JOIN bilibili_comments c ON r.child_id = c.unique_id WHERE c.unique_id IS NULL",
                None,
                |count| format!("{count} edges point at a child that is not a comment"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_SELF_REFERENCE,
                SEVERITY_MEDIUM,
                CATEGORY_RELATIONSHIP,
                "SELECT COUNT(*) FROM comment_relations WHERE parent_id = child_id",
                None,
                |count| format!("{count} edges connect a comment to itself"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_PARENT_NOT_EXIST,
                SEVERITY_HIGH,
                CATEGORY_RELATIONSHIP,
                "SELECT COUNT(*) FROM bilibili_comments c \
                 WHERE c.parent != '0' AND c.parent NOT IN (SELECT unique_id FROM bilibili_comments)",
                Some(
                    "SELECT DISTINCT c.bvid FROM bilibili_comments c \
                     WHERE c.parent != '0' AND c.parent NOT IN (SELECT unique_id FROM bilibili_comments)",
                ),
                |count| format!("{count} comments point at a parent that does not exist"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_MISSING_RELATIONS,
                SEVERITY_HIGH,
                CATEGORY_RELATIONSHIP,
                "SELECT COUNT(*) FROM bilibili_comments c \
                 WHERE c.parent != '0' AND c.parent IN (SELECT unique_id FROM bilibili_comments) \
                 AND NOT EXISTS (SELECT 1 FROM comment_relations r \
                                 WHERE r.child_id = c.unique_id AND r.parent_id = c.parent)",
                None,
                |count| format!("{count} reply comments lack their parent edge"),
            )
            .await?
        {
            issues.push(issue);
        }
        Ok(())
    }

    async fn check_stats(&self, issues: &mut Vec<Issue>) -> Result<()> {
        // Stats track the top-level count, so the validator compares against
        // the same policy.
        if let Some(issue) = self
            .detect(
                ISSUE_INCONSISTENT_STATS,
                SEVERITY_MEDIUM,
                CATEGORY_CONSISTENCY,
                "SELECT COUNT(*) FROM comment_stats s LEFT JOIN \
                 (SELECT bvid, COUNT(*) AS actual FROM bilibili_comments WHERE parent = '0' GROUP BY bvid) c \
                 ON s.bvid = c.bvid WHERE s.comment_count != IFNULL(c.actual, 0)",
                Some(
                    "SELECT s.bvid FROM comment_stats s LEFT JOIN \
                     (SELECT bvid, COUNT(*) AS actual FROM bilibili_comments WHERE parent = '0' GROUP BY bvid) c \
                     ON s.bvid = c.bvid WHERE s.comment_count != IFNULL(c.actual, 0)",
                ),
                |count| format!("{count} stats rows disagree with the stored comments"),
            )
            .await?
        {
            issues.push(issue);
        }

        if let Some(issue) = self
            .detect(
                ISSUE_MISSING_STATS,
                SEVERITY_LOW,
                CATEGORY_CONSISTENCY,
                "SELECT COUNT(*) FROM video_info v LEFT JOIN comment_stats s ON v.bvid = s.bvid WHERE s.bvid IS NULL",
                Some("SELECT v.bvid FROM video_info v LEFT JOIN comment_stats s ON v.bvid = s.bvid WHERE s.bvid IS NULL"),
                |count| format!("{count} videos have no stats row"),
            )
            .await?
        {
            issues.push(issue);
        }
        Ok(())
    }

    /// Shared shape of every catalogue entry: a count query, an optional
    /// example query, and a description.
    async fn detect(
        &self,
        issue_type: &'static str,
        severity: &'static str,
        category: &'static str,
        count_sql: &str,
        example_sql: Option<&str>,
        describe: impl Fn(i64) -> String,
    ) -> Result<Option<Issue>> {
        let count = self.count(count_sql, params![]).await?;
        if count == 0 {
            return Ok(None);
        }

        let mut affected_bvids = Vec::new();
        if let Some(sql) = example_sql {
            let limited = format!("{sql} LIMIT {EXAMPLE_LIMIT}");
            let mut rows = self.conn.query(&limited, params![]).await?;
            while let Some(row) = rows.next().await? {
                affected_bvids.push(row.get::<String>(0)?);
            }
        }

        let details = if affected_bvids.is_empty() {
            String::new()
        } else {
            format!("examples: {}", affected_bvids.join(", "))
        };
        Ok(Some(Issue {
            issue_type,
            severity,
            category,
            description: describe(count),
            count,
            fixable: true,
            fixed: false,
            affected_bvids,
            details,
        }))
    }

    // ---- whole-DB repairs ----

    async fn fix_issue(&self, issue_type: &str) -> Result<()> {
        match issue_type {
            ISSUE_EMPTY_VIDEO_TITLE => {
                self.exec(
                    "UPDATE video_info SET title = ?1 WHERE title IS NULL OR title = ''",
                    params![PLACEHOLDER_TITLE],
                )
                .await
            }
            ISSUE_DUPLICATE_BVID => {
                self.exec(
                    "DELETE FROM video_info WHERE rowid NOT IN \
                     (SELECT MIN(rowid) FROM video_info GROUP BY bvid)",
                    params![],
                )
                .await
            }
            // A stats row shields a video here; only rows with neither
            // comments nor stats are dropped.
            ISSUE_VIDEO_MISSING_COMMENTS => {
                self.exec(
                    "DELETE FROM video_info WHERE bvid NOT IN \
                     (SELECT DISTINCT bvid FROM bilibili_comments) \
                     AND bvid NOT IN (SELECT DISTINCT bvid FROM comment_stats)",
                    params![],
                )
                .await
            }
            ISSUE_ORPHAN_COMMENTS => {
                self.exec(
                    "DELETE FROM bilibili_comments WHERE bvid NOT IN (SELECT bvid FROM video_info)",
                    params![],
                )
                .await
            }
            ISSUE_DUPLICATE_COMMENTS => {
                self.exec(
                    "DELETE FROM bilibili_comments WHERE rowid NOT IN \
                     (SELECT MIN(rowid) FROM bilibili_comments GROUP BY unique_id)",
                    params![],
                )
                .await
            }
            ISSUE_EMPTY_COMMENT_CONTENT => {
                self.exec(
                    "UPDATE bilibili_comments SET content = ?1 WHERE content IS NULL OR content = ''",
                    params![PLACEHOLDER_CONTENT],
                )
                .await
            }
            ISSUE_INVALID_TIMESTAMP => {
                let now = Utc::now().timestamp();
                self.exec(
                    "UPDATE bilibili_comments SET ctime = ?1 WHERE ctime < 0 OR ctime > ?2",
                    params![now, now + TIMESTAMP_SLACK_SECS],
                )
                .await
            }
            ISSUE_INVALID_PARENT_REF => {
                self.exec(
                    "DELETE FROM comment_relations WHERE parent_id NOT IN \
                     (SELECT unique_id FROM bilibili_comments)",
                    params![],
                )
                .await
            }
            ISSUE_INVALID_CHILD_REF => {
                self.exec(
                    "DELETE FROM comment_relations WHERE child_id NOT IN \
                     (SELECT unique_id FROM bilibili_comments)",
                    params![],
                )
                .await
            }
            ISSUE_SELF_REFERENCE => {
                self.exec(
                    "DELETE FROM comment_relations WHERE parent_id = child_id",
                    params![],
                )
                .await
            }
            ISSUE_PARENT_NOT_EXIST => self.fix_parent_not_exist().await,
            ISSUE_MISSING_RELATIONS => self.fix_missing_relations().await,
            ISSUE_INCONSISTENT_STATS => {
                self.exec(
                    "UPDATE comment_stats SET comment_count = \
                     (SELECT COUNT(*) FROM bilibili_comments \
                      WHERE bilibili_comments.bvid = comment_stats.bvid AND parent = '0'), \
                     last_updated = CURRENT_TIMESTAMP",
                    params![],
                )
                .await
            }
            ISSUE_MISSING_STATS => {
                self.exec(
                    "INSERT INTO comment_stats (bvid, comment_count) \
                     SELECT v.bvid, IFNULL(c.actual, 0) FROM video_info v \
                     LEFT JOIN (SELECT bvid, COUNT(*) AS actual FROM bilibili_comments \
                                WHERE parent = '0' GROUP BY bvid) c ON v.bvid = c.bvid \
                     WHERE NOT EXISTS (SELECT 1 FROM comment_stats s WHERE s.bvid = v.bvid)",
                    params![],
                )
                .await
            }
            other => bail!("no repair registered for issue type {other}"),
        }
    }

    /// Inserts a placeholder comment for every dangling `parent` reference so
    /// reply threads stay navigable. The placeholder reuses the missing
    /// parent's id verbatim.
    async fn fix_parent_not_exist(&self) -> Result<()> {
        let mut rows = self
            .conn
            .query(
                "SELECT DISTINCT c.parent, c.bvid FROM bilibili_comments c \
                 WHERE c.parent != '0' AND c.parent NOT IN (SELECT unique_id FROM bilibili_comments)",
                params![],
            )
            .await?;

        let mut missing = Vec::new();
        while let Some(row) = rows.next().await? {
            let parent_id: String = row.get(0)?;
            let bvid: String = row.get(1)?;
            missing.push((parent_id, bvid));
        }

        let now = Utc::now().timestamp();
        for (parent_id, bvid) in missing {
            // Recover the rpid from the id suffix where possible so the
            // placeholder row stays well formed.
            let rpid = parent_id
                .rsplit('_')
                .next()
                .and_then(|suffix| suffix.parse::<i64>().ok())
                .unwrap_or_default();
            self.exec(
                "INSERT INTO bilibili_comments (\
                     unique_id, bvid, rpid, content, pictures, oid, mid, parent, fans_grade, \
                     ctime, like_count, upname, sex, following, level, location\
                 ) VALUES (?1, ?2, ?3, ?4, '', 0, 0, '0', 0, ?5, 0, '', '', 0, 0, '') \
                 ON CONFLICT(unique_id) DO NOTHING",
                params![
                    parent_id.as_str(),
                    bvid.as_str(),
                    rpid,
                    PLACEHOLDER_MISSING_PARENT,
                    now
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Rebuilds relations for every video. Coarse on purpose; the rebuild is
    /// idempotent and a full pass keeps the repair rule simple.
    async fn fix_missing_relations(&self) -> Result<()> {
        let mut rows = self
            .conn
            .query("SELECT bvid FROM video_info", params![])
            .await?;
        let mut bvids = Vec::new();
        while let Some(row) = rows.next().await? {
            bvids.push(row.get::<String>(0)?);
        }
        for bvid in bvids {
            self.store.rebuild_relations(&bvid).await?;
        }
        Ok(())
    }

    async fn fix_video_missing_comments(
        &self,
        token: &CancellationToken,
        bvid: &str,
        crawler: &Crawler,
    ) -> Result<()> {
        info!(bvid, "re-running crawl to repair missing comments");
        if let Err(err) = crawler.crawl_and_import(token, bvid).await {
            warn!(bvid, error = %err, "repair crawl failed, removing video row");
            self.exec("DELETE FROM video_info WHERE bvid = ?1", params![bvid])
                .await
                .context("deleting video row after failed repair crawl")?;
            bail!("repair crawl failed, video row removed: {err}");
        }
        Ok(())
    }

    // ---- plumbing ----

    async fn base_summary(&self) -> Result<Summary> {
        Ok(Summary {
            total_videos: self.count("SELECT COUNT(*) FROM video_info", params![]).await?,
            total_comments: self
                .count("SELECT COUNT(*) FROM bilibili_comments", params![])
                .await?,
            ..Summary::default()
        })
    }

    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<i64> {
        let mut rows = self.conn.query(sql, params).await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }

    async fn exec(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<()> {
        self.conn.execute(sql, params).await?;
        Ok(())
    }
}
