//! Mirrors comment-attached pictures into `<image_dir>/<bvid>/<filename>`.
//!
//! Failures are logged and skipped; a missing picture never fails a harvest.

use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::database::CommentRecord;

/// Downloads every attached picture of `comments`, skipping files that are
/// already mirrored. Returns how many files were newly written.
pub async fn download_comment_images(
    client: &reqwest::Client,
    image_dir: &Path,
    comments: &[CommentRecord],
) -> usize {
    let mut downloaded = 0;
    for comment in comments {
        if comment.pictures.is_empty() || comment.bvid.is_empty() {
            continue;
        }
        for url in &comment.pictures {
            match download_one(client, image_dir, &comment.bvid, url).await {
                Ok(true) => downloaded += 1,
                Ok(false) => {}
                Err(err) => warn!(url, error = %err, "picture download failed"),
            }
        }
    }
    downloaded
}

async fn download_one(
    client: &reqwest::Client,
    image_dir: &Path,
    bvid: &str,
    url: &str,
) -> Result<bool> {
    let Some(filename) = filename_from_url(url) else {
        bail!("no usable filename in {url}");
    };

    let dir = image_dir.join(bvid);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating image directory {}", dir.display()))?;
    let path = dir.join(&filename);
    if path.exists() {
        debug!(path = %path.display(), "picture already mirrored");
        return Ok(false);
    }

    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("writing picture {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "picture mirrored");
    Ok(true)
}

/// Last path segment of the URL, without query or fragment.
fn filename_from_url(url: &str) -> Option<String> {
    let without_fragment = url.split('#').next().unwrap_or(url);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let name = without_query.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        None
    } else {
        Some(name.to_owned())
    }
}
