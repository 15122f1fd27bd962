//! The harvester: walks a video's two-level comment forest with bounded
//! concurrency, deduplicates by `rpid`, converts API items into store
//! records, and checkpoints progress so an interrupted run can resume.
//!
//! Parallel page workers deliberately race ahead of the server's opaque
//! cursor; the server answers overlapping windows when the cursor lags and
//! the shared `seen` set absorbs the duplicates. `workers = 1` degrades to
//! the strictly cursor-ordered walk.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{CommentApi, CommentOrder, ReplyItem};
use crate::config::CrawlerConfig;
use crate::database::CommentRecord;
use crate::ids;

pub const PROGRESS_FILE: &str = "progress.json";

/// Buffer between page workers and the collecting caller.
const RESULT_CHANNEL_CAPACITY: usize = 1000;

/// Per-harvest knobs, lifted from the crawler configuration plus the target
/// video.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub bvid: String,
    pub workers: usize,
    pub max_try_count: usize,
    pub delay_base_ms: u64,
    pub delay_jitter_ms: u64,
    pub order: CommentOrder,
    pub output_dir: PathBuf,
}

impl HarvestOptions {
    pub fn from_config(config: &CrawlerConfig, bvid: &str) -> Self {
        Self {
            bvid: bvid.to_owned(),
            workers: config.workers,
            max_try_count: config.max_try_count,
            delay_base_ms: config.delay_base_ms,
            delay_jitter_ms: config.delay_jitter_ms,
            order: config.order,
            output_dir: config.output_dir.clone(),
        }
    }

    /// `<output>/<bvid>`, where the checkpoint and the CSV mirror live.
    pub fn save_dir(&self) -> PathBuf {
        self.output_dir.join(&self.bvid)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.save_dir().join(PROGRESS_FILE)
    }

    async fn page_delay(&self) {
        let jitter = if self.delay_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.delay_jitter_ms)
        } else {
            0
        };
        let delay = Duration::from_millis(self.delay_base_ms + jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Resumable per-video checkpoint: the next page to fetch and how many
/// unique comments were already emitted. The dedup set is deliberately not
/// persisted; the store's primary-key conflict policy absorbs re-downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub page: i64,
    pub downloaded_count: usize,
}

pub fn save_progress(path: &Path, progress: &Progress) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
    }
    let payload = serde_json::to_vec(progress)?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("writing checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("finalizing checkpoint {}", path.display()))?;
    Ok(())
}

pub fn load_progress(path: &Path) -> Result<Progress> {
    let payload = fs::read(path)?;
    Ok(serde_json::from_slice(&payload)?)
}

pub fn remove_progress(path: &Path) -> std::io::Result<()> {
    fs::remove_file(path)
}

/// Shared harvest counters. The mutex is only ever held across arithmetic
/// and set operations, never across I/O.
struct HarvestState {
    downloaded: usize,
    seen: HashSet<i64>,
    consecutive_empty_pages: usize,
    next_offset: String,
    page: i64,
}

/// Harvests every comment of `opt.bvid` and returns the deduplicated,
/// converted records.
pub async fn crawl_video(
    token: &CancellationToken,
    api: Arc<dyn CommentApi>,
    opt: &HarvestOptions,
) -> Result<Vec<CommentRecord>> {
    let avid = ids::bvid_to_avid(&opt.bvid);
    if avid == 0 {
        bail!("cannot harvest {}: not a valid bvid", opt.bvid);
    }

    info!(bvid = %opt.bvid, avid, "starting comment harvest");
    let semaphore = Arc::new(Semaphore::new(opt.workers.max(1)));
    let (tx, mut rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

    let finder = {
        let token = token.clone();
        let api = api.clone();
        let opt = opt.clone();
        tokio::spawn(async move { find_comments(token, api, semaphore, avid, opt, tx).await })
    };

    let mut comments = Vec::new();
    while let Some(comment) = rx.recv().await {
        comments.push(comment);
    }
    finder.await.context("harvest task panicked")??;

    info!(bvid = %opt.bvid, count = comments.len(), "comment harvest finished");
    Ok(comments)
}

/// Drives the paginated walk, emitting converted records into `tx` as pages
/// complete.
pub(crate) async fn find_comments(
    token: CancellationToken,
    api: Arc<dyn CommentApi>,
    semaphore: Arc<Semaphore>,
    avid: i64,
    opt: HarvestOptions,
    tx: mpsc::Sender<CommentRecord>,
) -> Result<()> {
    let total = match api.fetch_count(&token, avid).await {
        Ok(total) => total,
        Err(err) => {
            warn!(avid, error = %err, "failed to fetch comment count, skipping video");
            return Ok(());
        }
    };
    if total == 0 {
        info!(avid, "video has no comments, nothing to harvest");
        return Ok(());
    }
    info!(avid, total, "video comment count fetched");

    let progress_path = opt.progress_path();
    let state = Arc::new(Mutex::new(HarvestState {
        downloaded: 0,
        seen: HashSet::new(),
        consecutive_empty_pages: 0,
        next_offset: String::new(),
        page: 1,
    }));

    if let Ok(progress) = load_progress(&progress_path) {
        let mut state = state.lock();
        state.page = progress.page.max(1);
        state.downloaded = progress.downloaded_count;
        info!(
            page = state.page,
            downloaded = state.downloaded,
            "resuming harvest from checkpoint"
        );
    }

    let opt = Arc::new(opt);
    let mut workers = JoinSet::new();
    let mut cancelled = false;

    loop {
        if token.is_cancelled() {
            let state = state.lock();
            let checkpoint = Progress {
                page: state.page,
                downloaded_count: state.downloaded,
            };
            drop(state);
            if let Err(err) = save_progress(&progress_path, &checkpoint) {
                warn!(error = %err, "failed to save checkpoint on cancellation");
            }
            info!(avid, "harvest cancelled, checkpoint saved");
            cancelled = true;
            break;
        }

        {
            let state = state.lock();
            if state.downloaded >= total as usize {
                info!(avid, downloaded = state.downloaded, total, "harvest reached reported total");
                break;
            }
            if state.consecutive_empty_pages >= opt.max_try_count {
                info!(
                    avid,
                    empty_pages = state.consecutive_empty_pages,
                    "stopping after consecutive pages without new comments"
                );
                break;
            }
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.context("harvest semaphore closed")?
            }
            _ = token.cancelled() => continue,
        };

        let (page, offset) = {
            let mut state = state.lock();
            let page = state.page;
            state.page += 1;
            (page, state.next_offset.clone())
        };

        let worker_token = token.clone();
        let worker_api = api.clone();
        let worker_state = state.clone();
        let worker_opt = opt.clone();
        let worker_tx = tx.clone();
        let worker_progress = progress_path.clone();
        workers.spawn(async move {
            let _permit = permit;
            run_page_worker(
                worker_token,
                worker_api,
                worker_state,
                worker_opt,
                avid,
                page,
                offset,
                total,
                worker_tx,
                worker_progress,
            )
            .await;
        });
    }

    while workers.join_next().await.is_some() {}

    if !cancelled {
        let downloaded = state.lock().downloaded;
        info!(avid, downloaded, "harvest drained cleanly, removing checkpoint");
        if let Err(err) = remove_progress(&progress_path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(error = %err, "failed to remove checkpoint file");
        }
    }
    Ok(())
}

/// Fetches and processes one top-level page: assemble the flat reply list,
/// dedupe, emit, checkpoint, then publish the server's next cursor.
#[allow(clippy::too_many_arguments)]
async fn run_page_worker(
    token: CancellationToken,
    api: Arc<dyn CommentApi>,
    state: Arc<Mutex<HarvestState>>,
    opt: Arc<HarvestOptions>,
    avid: i64,
    page: i64,
    offset: String,
    total: i64,
    tx: mpsc::Sender<CommentRecord>,
    progress_path: PathBuf,
) {
    if token.is_cancelled() {
        debug!(page, "worker exiting before fetch, cancelled");
        return;
    }

    opt.page_delay().await;
    debug!(avid, page, offset = offset.as_str(), "fetching top-level page");

    let data = match api.fetch_page(&token, avid, page, opt.order, &offset).await {
        Ok(data) => data,
        Err(err) => {
            warn!(avid, page, error = %err, "top-level page failed");
            state.lock().consecutive_empty_pages += 1;
            return;
        }
    };

    // Flatten the page: top-level replies, their inline children, recursively
    // fetched children where the inline list is short, pinned replies last.
    let mut collection: Vec<ReplyItem> = Vec::new();
    collection.extend(data.replies.iter().cloned());
    for reply in &data.replies {
        if reply.rcount == 0 {
            continue;
        }
        if !reply.replies.is_empty() && reply.replies.len() as i64 == reply.rcount {
            collection.extend(reply.replies.iter().cloned());
        } else {
            collection.extend(fetch_all_replies(&token, &api, avid, reply, &opt).await);
        }
    }
    if !data.top_replies.is_empty() {
        collection.extend(data.top_replies.iter().cloned());
        for top in &data.top_replies {
            collection.extend(top.replies.iter().cloned());
        }
    }

    let (fresh, downloaded) = {
        let mut state = state.lock();
        let mut fresh = Vec::new();
        for item in &collection {
            if state.seen.contains(&item.rpid) {
                continue;
            }
            let Some(record) = convert_reply(item) else {
                continue;
            };
            state.seen.insert(item.rpid);
            fresh.push(record);
        }
        if fresh.is_empty() {
            state.consecutive_empty_pages += 1;
            debug!(page, empty_pages = state.consecutive_empty_pages, "page contributed nothing new");
        } else {
            state.consecutive_empty_pages = 0;
        }
        state.downloaded += fresh.len();
        (fresh, state.downloaded)
    };

    let new_count = fresh.len();
    for record in fresh {
        if tx.send(record).await.is_err() {
            debug!(page, "result channel closed, dropping remainder");
            return;
        }
    }

    let remaining = (total as usize).saturating_sub(downloaded);
    info!(avid, page, new_count, downloaded, remaining, "page processed");

    if let Err(err) = save_progress(
        &progress_path,
        &Progress {
            page: page + 1,
            downloaded_count: downloaded,
        },
    ) {
        warn!(page, error = %err, "failed to write checkpoint");
    }

    if data.cursor.is_end {
        // Natural end of the comment space; poison the empty-page counter so
        // the outer loop stops launching pages.
        state.lock().consecutive_empty_pages = opt.max_try_count;
        debug!(page, "cursor reports end of pagination");
    }

    let next_offset = data.cursor.pagination_reply.next_offset;
    if !next_offset.is_empty() {
        state.lock().next_offset = next_offset;
    }
}

/// Pages through the children of one top-level comment until the empty-page
/// tolerance is exhausted. Runs sequentially inside the calling worker.
async fn fetch_all_replies(
    token: &CancellationToken,
    api: &Arc<dyn CommentApi>,
    avid: i64,
    root: &ReplyItem,
    opt: &HarvestOptions,
) -> Vec<ReplyItem> {
    let mut collected = Vec::new();
    let mut consecutive_empty = 0;
    let mut round: i64 = 1;

    debug!(rpid = root.rpid, expected = root.rcount, "fetching reply pages");
    loop {
        if consecutive_empty >= opt.max_try_count || token.is_cancelled() {
            break;
        }
        opt.page_delay().await;

        let data = match api.fetch_replies(token, avid, root.rpid, round).await {
            Ok(data) => data,
            Err(err) => {
                warn!(rpid = root.rpid, round, error = %err, "reply page failed");
                consecutive_empty += 1;
                round += 1;
                continue;
            }
        };
        round += 1;

        if data.replies.is_empty() {
            consecutive_empty += 1;
            continue;
        }

        collected.extend(data.replies.iter().cloned());
        for item in &data.replies {
            collected.extend(item.replies.iter().cloned());
        }
        if !data.top_replies.is_empty() {
            collected.extend(data.top_replies.iter().cloned());
            for item in &data.top_replies {
                collected.extend(item.replies.iter().cloned());
            }
        }
        consecutive_empty = 0;
    }

    debug!(rpid = root.rpid, collected = collected.len(), "reply fetch finished");
    collected
}

/// Converts one API item into a store record. Items without a usable id are
/// rejected here so they never reach the write path.
pub fn convert_reply(item: &ReplyItem) -> Option<CommentRecord> {
    if item.rpid <= 0 {
        warn!(rpid = item.rpid, oid = item.oid, "rejecting comment with non-positive rpid");
        return None;
    }
    let bvid = if item.oid > 0 {
        ids::avid_to_bvid(item.oid)
    } else {
        String::new()
    };
    if !bvid.starts_with("BV") || bvid.len() != 12 {
        warn!(oid = item.oid, rpid = item.rpid, "rejecting comment without a valid bvid");
        return None;
    }

    let parent = if item.parent == 0 {
        "0".to_owned()
    } else {
        CommentRecord::compute_unique_id(&bvid, item.parent)
    };
    let replies = item
        .replies
        .iter()
        .filter(|child| child.rpid > 0)
        .map(|child| CommentRecord::compute_unique_id(&bvid, child.rpid))
        .collect();

    Some(CommentRecord {
        unique_id: CommentRecord::compute_unique_id(&bvid, item.rpid),
        rpid: item.rpid,
        content: item.content.message.clone(),
        pictures: item
            .content
            .pictures
            .iter()
            .map(|picture| picture.img_src.clone())
            .collect(),
        oid: item.oid,
        mid: item.mid,
        parent,
        fans_grade: item.fansgrade,
        ctime: item.ctime,
        like_count: item.like,
        upname: item.member.uname.clone(),
        sex: item.member.sex.clone(),
        following: item.reply_control.following,
        level: item.member.level_info.current_level,
        location: item.reply_control.location.replace("IP属地：", ""),
        replies,
        bvid,
    })
}
