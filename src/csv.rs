//! CSV mirror of the comment store.
//!
//! Every harvested video can be written to `<output>/<bvid>/<bvid>.csv`, and
//! existing mirrors can be imported back into the database. The column set
//! matches the comment table minus the derived `unique_id`.

use std::path::{Path, PathBuf};

use ::csv::{ReaderBuilder, WriterBuilder};
use anyhow::{Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::database::{CommentRecord, CommentStore};

pub const CSV_HEADER: [&str; 15] = [
    "bvid",
    "upname",
    "sex",
    "content",
    "pictures",
    "rpid",
    "oid",
    "mid",
    "parent",
    "fans_grade",
    "ctime",
    "like_count",
    "following",
    "level",
    "location",
];

/// `<output>/<bvid>/<bvid>.csv`.
pub fn comments_csv_path(output_dir: &Path, bvid: &str) -> PathBuf {
    output_dir.join(bvid).join(format!("{bvid}.csv"))
}

/// Writes the full comment set for one video, replacing any previous mirror.
pub fn write_comments(path: &Path, comments: &[CommentRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating CSV directory {}", parent.display()))?;
    }

    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("creating CSV mirror {}", path.display()))?;
    writer.write_record(CSV_HEADER)?;
    for comment in comments {
        writer.write_record([
            comment.bvid.clone(),
            comment.upname.clone(),
            comment.sex.clone(),
            comment.content.clone(),
            comment.pictures.join(";"),
            comment.rpid.to_string(),
            comment.oid.to_string(),
            comment.mid.to_string(),
            comment.parent.clone(),
            comment.fans_grade.to_string(),
            comment.ctime.to_string(),
            comment.like_count.to_string(),
            comment.following.to_string(),
            comment.level.to_string(),
            comment.location.clone(),
        ])?;
    }
    writer.flush()?;
    info!(path = %path.display(), count = comments.len(), "CSV mirror written");
    Ok(())
}

/// Reads a mirror back into records. Rows without a usable id are skipped
/// with a warning, mirroring the harvest-side data-quality policy.
pub fn read_comments(path: &Path) -> Result<Vec<CommentRecord>> {
    let mut reader = ReaderBuilder::new()
        .from_path(path)
        .with_context(|| format!("opening CSV mirror {}", path.display()))?;

    let mut comments = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading CSV row {} of {}", index + 1, path.display()))?;
        let field = |i: usize| row.get(i).unwrap_or_default().to_owned();
        let number = |i: usize| field(i).parse::<i64>().unwrap_or_default();

        let bvid = field(0);
        let rpid = number(5);
        if bvid.is_empty() || rpid <= 0 {
            warn!(row = index + 1, path = %path.display(), "skipping CSV row without a usable id");
            continue;
        }

        let parent = {
            let value = field(8);
            if value.is_empty() { "0".to_owned() } else { value }
        };
        comments.push(CommentRecord {
            unique_id: CommentRecord::compute_unique_id(&bvid, rpid),
            upname: field(1),
            sex: field(2),
            content: field(3),
            pictures: field(4)
                .split(';')
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect(),
            rpid,
            oid: number(6),
            mid: number(7),
            parent,
            fans_grade: number(9),
            ctime: number(10),
            like_count: number(11),
            following: matches!(field(12).as_str(), "true" | "1"),
            level: number(13),
            location: field(14),
            replies: Vec::new(),
            bvid,
        });
    }
    Ok(comments)
}

/// Imports one mirror file into the store: batched upsert, relation rebuild,
/// count refresh.
pub async fn import_comments(store: &CommentStore, bvid: &str, path: &Path) -> Result<()> {
    let mut comments = read_comments(path)?;
    if comments.is_empty() {
        warn!(bvid, path = %path.display(), "CSV mirror contains no importable comments");
        return Ok(());
    }
    store.batch_save_comments(&mut comments).await?;
    store.rebuild_relations(bvid).await?;
    store.update_comment_stats(bvid).await?;
    info!(bvid, count = comments.len(), "CSV mirror imported");
    Ok(())
}

/// Imports every `<output>/<bvid>/<bvid>.csv` found under `output_dir`.
pub async fn import_all(store: &CommentStore, output_dir: &Path) -> Result<usize> {
    let mut imported = 0;
    for entry in WalkDir::new(output_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("csv") {
            continue;
        }
        let Some(bvid) = entry
            .path()
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|name| name.to_str())
            .map(str::to_owned)
        else {
            continue;
        };

        info!(bvid, path = %entry.path().display(), "importing CSV mirror");
        if let Err(err) = import_comments(store, &bvid, entry.path()).await {
            warn!(bvid, error = %err, "CSV import failed");
        } else {
            imported += 1;
        }
    }
    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::CommentStore;
    use tempfile::tempdir;

    fn sample(bvid: &str, rpid: i64, parent: &str) -> CommentRecord {
        CommentRecord {
            unique_id: CommentRecord::compute_unique_id(bvid, rpid),
            bvid: bvid.to_owned(),
            rpid,
            content: format!("comment {rpid}, with a comma"),
            pictures: vec!["http://i0/a.jpg".to_owned(), "http://i0/b.jpg".to_owned()],
            oid: 2,
            mid: 42,
            parent: parent.to_owned(),
            fans_grade: 1,
            ctime: 1_700_000_100,
            like_count: 9,
            upname: "author".to_owned(),
            sex: "女".to_owned(),
            following: true,
            level: 6,
            location: "浙江".to_owned(),
            replies: Vec::new(),
        }
    }

    /// Mirrors must survive a write/read cycle unchanged, including joined
    /// picture lists and fields containing commas.
    #[test]
    fn round_trips_through_disk() -> Result<()> {
        let dir = tempdir()?;
        let path = comments_csv_path(dir.path(), "BV1xx411c7mD");
        let comments = vec![
            sample("BV1xx411c7mD", 10, "0"),
            sample("BV1xx411c7mD", 11, "BV1xx411c7mD_10"),
        ];
        write_comments(&path, &comments)?;

        let restored = read_comments(&path)?;
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].unique_id, "BV1xx411c7mD_10");
        assert_eq!(restored[0].pictures, comments[0].pictures);
        assert_eq!(restored[0].content, comments[0].content);
        assert!(restored[0].following);
        assert_eq!(restored[1].parent, "BV1xx411c7mD_10");
        Ok(())
    }

    #[test]
    fn skips_rows_without_usable_ids() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.csv");
        std::fs::write(
            &path,
            "bvid,upname,sex,content,pictures,rpid,oid,mid,parent,fans_grade,ctime,like_count,following,level,location\n\
             BV1xx411c7mD,u,,ok,,10,2,1,0,0,1700000000,0,false,1,\n\
             ,u,,missing bvid,,11,2,1,0,0,1700000000,0,false,1,\n\
             BV1xx411c7mD,u,,zero rpid,,0,2,1,0,0,1700000000,0,false,1,\n",
        )?;
        let comments = read_comments(&path)?;
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].rpid, 10);
        Ok(())
    }

    /// Importing a mirror populates comments, edges and counts.
    #[tokio::test]
    async fn import_populates_store() -> Result<()> {
        let dir = tempdir()?;
        let store = CommentStore::open(&dir.path().join("comments.db")).await?;
        let path = comments_csv_path(dir.path(), "BV1xx411c7mD");
        write_comments(
            &path,
            &[
                sample("BV1xx411c7mD", 10, "0"),
                sample("BV1xx411c7mD", 11, "BV1xx411c7mD_10"),
            ],
        )?;

        import_comments(&store, "BV1xx411c7mD", &path).await?;

        let (top, total) = store.list_top_level_comments("BV1xx411c7mD", 1, 10, "").await?;
        assert_eq!(total, 1, "stats count top-level comments only");
        assert_eq!(top.len(), 1);
        let (replies, reply_total) = store.list_replies("BV1xx411c7mD_10", 1, 10).await?;
        assert_eq!(reply_total, 1);
        assert_eq!(replies[0].unique_id, "BV1xx411c7mD_11");
        Ok(())
    }

    #[tokio::test]
    async fn import_all_scans_mirror_layout() -> Result<()> {
        let dir = tempdir()?;
        let store = CommentStore::open(&dir.path().join("db/comments.db")).await?;
        let output = dir.path().join("output");
        write_comments(
            &comments_csv_path(&output, "BV1xx411c7mD"),
            &[sample("BV1xx411c7mD", 10, "0")],
        )?;
        // A stray non-CSV file must not break the scan.
        std::fs::write(output.join("BV1xx411c7mD").join("progress.json"), b"{}")?;

        let imported = import_all(&store, &output).await?;
        assert_eq!(imported, 1);
        let (_, total) = store.list_top_level_comments("BV1xx411c7mD", 1, 10, "").await?;
        assert_eq!(total, 1);
        Ok(())
    }
}
