//! The crawl-and-import composite: fetch a video's metadata, harvest its
//! comments, then run whichever persistence sinks the save mode selects.
//! Also hosts the uploader driver that feeds every video of one uploader
//! through the same pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{BiliApi, CommentApi, VideoItem};
use crate::config::{self, CrawlerConfig, SaveMode};
use crate::csv;
use crate::database::{CommentRecord, CommentStore, VideoRecord};
use crate::harvest::{self, HarvestOptions};
use crate::images;
use crate::net;
use crate::wbi::WbiSigner;

/// Upper bound for one whole-video crawl-and-import run.
const CRAWL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Bundles the configuration, API client and store behind the composite
/// operations. The repair service borrows this to re-run crawls as a repair.
#[derive(Debug)]
pub struct Crawler {
    config: CrawlerConfig,
    api: Arc<BiliApi>,
    store: CommentStore,
    client: reqwest::Client,
}

impl Crawler {
    /// Wires up the whole stack. Failing here (unreadable cookie, unopenable
    /// database) is a setup error the binaries turn into exit code 1.
    pub async fn new(config: CrawlerConfig) -> Result<Self> {
        let cookie = config::read_cookie(&config.cookie_file)
            .context("cannot read cookie file; harvesting requires a logged-in cookie")?;
        let client = net::build_client()?;
        let policy = config.retry_policy();
        let signer = Arc::new(WbiSigner::new(client.clone(), policy.clone()));
        let api = Arc::new(BiliApi::new(client.clone(), signer, policy, cookie));
        let store = CommentStore::open(&config.db_path).await?;
        Ok(Self {
            config,
            api,
            store,
            client,
        })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn store(&self) -> &CommentStore {
        &self.store
    }

    /// Harvests one video and persists the result, bounded by the crawl
    /// timeout.
    pub async fn crawl_and_import(&self, token: &CancellationToken, bvid: &str) -> Result<()> {
        match tokio::time::timeout(CRAWL_TIMEOUT, self.crawl_and_import_inner(token, bvid)).await {
            Ok(result) => result,
            Err(_) => bail!(
                "crawl of {bvid} exceeded the {} minute limit",
                CRAWL_TIMEOUT.as_secs() / 60
            ),
        }
    }

    async fn crawl_and_import_inner(&self, token: &CancellationToken, bvid: &str) -> Result<()> {
        info!(bvid, save_mode = ?self.config.save_mode, "processing video");

        // The video row must exist before its comments; fall back to a bare
        // shell when the metadata endpoint misbehaves.
        match self.api.fetch_video_info(token, bvid).await {
            Ok(video_info) => {
                let record = VideoRecord {
                    bvid: if video_info.bvid.is_empty() {
                        bvid.to_owned()
                    } else {
                        video_info.bvid
                    },
                    title: video_info.title,
                    cover: video_info.cover,
                    comment_count: 0,
                };
                if let Err(err) = self.store.upsert_video(&record).await {
                    error!(bvid, error = %err, "saving video metadata failed");
                }
            }
            Err(err) => {
                warn!(bvid, error = %err, "video metadata fetch failed, storing shell row");
                self.store
                    .upsert_video(&VideoRecord {
                        bvid: bvid.to_owned(),
                        ..VideoRecord::default()
                    })
                    .await?;
            }
        }

        let opt = HarvestOptions::from_config(&self.config, bvid);
        let api: Arc<dyn CommentApi> = self.api.clone();
        let comments = harvest::crawl_video(token, api, &opt).await?;
        if comments.is_empty() {
            warn!(bvid, "no comments harvested, skipping persistence");
            return Ok(());
        }

        self.persist(bvid, comments).await
    }

    async fn persist(&self, bvid: &str, mut comments: Vec<CommentRecord>) -> Result<()> {
        match self.config.save_mode {
            SaveMode::CsvOnly => {
                let path = csv::comments_csv_path(&self.config.output_dir, bvid);
                csv::write_comments(&path, &comments)?;
            }
            SaveMode::DbOnly => {
                import_comments_to_db(&self.store, bvid, &mut comments).await?;
            }
            SaveMode::CsvAndDb => {
                let path = csv::comments_csv_path(&self.config.output_dir, bvid);
                csv::write_comments(&path, &comments)?;
                csv::import_comments(&self.store, bvid, &path).await?;
            }
        }

        if self.config.img_download {
            let mirrored =
                images::download_comment_images(&self.client, &self.config.image_dir, &comments)
                    .await;
            info!(bvid, mirrored, "comment pictures mirrored");
        }

        info!(bvid, count = comments.len(), "video fully processed");
        Ok(())
    }

    /// Walks an uploader's video list and feeds every video through
    /// [`Crawler::crawl_and_import`], at most `workers` videos in flight.
    pub async fn crawl_up(self: &Arc<Self>, token: &CancellationToken, mid: i64) -> Result<()> {
        let videos = self.fetch_uploader_videos(token, mid).await?;
        if videos.is_empty() {
            warn!(mid, "uploader has no harvestable videos");
            return Ok(());
        }
        info!(mid, count = videos.len(), "uploader video list collected");

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        for video in videos {
            if token.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("uploader semaphore closed")?;
            let crawler = Arc::clone(self);
            let task_token = token.clone();
            info!(bvid = %video.bvid, aid = video.aid, "queueing uploader video");
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = crawler.crawl_and_import(&task_token, &video.bvid).await {
                    error!(bvid = %video.bvid, error = %err, "uploader video crawl failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        info!(mid, "uploader crawl finished");
        Ok(())
    }

    async fn fetch_uploader_videos(
        &self,
        token: &CancellationToken,
        mid: i64,
    ) -> Result<Vec<VideoItem>> {
        let mut collected = Vec::new();
        for page in 1..=self.config.up_pages {
            if token.is_cancelled() {
                break;
            }
            self.page_delay().await;
            match self
                .api
                .fetch_video_list(token, mid, page, self.config.up_order.as_str())
                .await
            {
                Ok(videos) if videos.is_empty() => break,
                Ok(videos) => collected.extend(videos),
                Err(err) => {
                    warn!(mid, page, error = %err, "uploader video list page failed");
                }
            }
        }
        Ok(collected)
    }

    async fn page_delay(&self) {
        let jitter = if self.config.delay_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.delay_jitter_ms)
        } else {
            0
        };
        let delay = Duration::from_millis(self.config.delay_base_ms + jitter);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Database sink of the pipeline: batched upsert, inline-child edges, count
/// refresh, then a full relation rebuild from the `parent` fields.
pub async fn import_comments_to_db(
    store: &CommentStore,
    bvid: &str,
    comments: &mut [CommentRecord],
) -> Result<()> {
    if comments.is_empty() {
        warn!(bvid, "asked to import an empty comment set");
        return Ok(());
    }

    store.batch_save_comments(comments).await?;

    for comment in comments.iter() {
        if comment.replies.is_empty() {
            continue;
        }
        if let Err(err) = store
            .save_relations(&comment.unique_id, &comment.replies)
            .await
        {
            error!(unique_id = %comment.unique_id, error = %err, "saving comment relations failed");
        }
    }

    if let Err(err) = store.update_comment_stats(bvid).await {
        error!(bvid, error = %err, "updating comment stats failed");
    }
    if let Err(err) = store.rebuild_relations(bvid).await {
        error!(bvid, error = %err, "rebuilding comment relations failed");
    }
    Ok(())
}
