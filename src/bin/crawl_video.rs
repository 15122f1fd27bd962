#![forbid(unsafe_code)]

//! Command-line driver that harvests the comment forest of one or more
//! videos and persists it according to the configured save mode.

use anyhow::{Context, Result, bail};
use biliview_tools::config::{ConfigOverrides, require_unprivileged, resolve_config};
use biliview_tools::crawler::Crawler;
use std::env;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
struct CrawlArgs {
    bvids: Vec<String>,
    overrides: ConfigOverrides,
}

impl CrawlArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut bvids = Vec::new();
        let mut overrides = ConfigOverrides::default();
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--env-file=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--db=") {
                overrides.db_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--output=") {
                overrides.output_dir = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--cookie-file=") {
                overrides.cookie_file = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--env-file requires a value"))?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                "--db" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--db requires a value"))?;
                    overrides.db_path = Some(PathBuf::from(value));
                }
                "--output" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--output requires a value"))?;
                    overrides.output_dir = Some(PathBuf::from(value));
                }
                "--cookie-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--cookie-file requires a value"))?;
                    overrides.cookie_file = Some(PathBuf::from(value));
                }
                _ if arg.starts_with('-') => {
                    bail!("unknown argument: {arg}");
                }
                _ => bvids.push(arg),
            }
        }

        if bvids.is_empty() {
            bail!(
                "Usage: crawl_video [--env-file <path>] [--db <path>] [--output <dir>] [--cookie-file <path>] <bvid>..."
            );
        }
        Ok(Self { bvids, overrides })
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    require_unprivileged("crawl_video")?;
    init_tracing();

    let args = CrawlArgs::parse()?;
    let config = resolve_config(args.overrides.clone())?;

    println!("===================================");
    println!("BiliView Comment Harvester");
    println!("===================================");
    println!("Videos: {}", args.bvids.join(", "));
    println!("Database: {}", config.db_path.display());
    println!("Output: {}", config.output_dir.display());
    println!();

    let crawler = Crawler::new(config)
        .await
        .context("initializing the crawler")?;

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupt received, finishing in-flight work...");
                token.cancel();
            }
        }
    });

    let mut failures = 0usize;
    for bvid in &args.bvids {
        if token.is_cancelled() {
            break;
        }
        println!("Harvesting {bvid}...");
        match crawler.crawl_and_import(&token, bvid).await {
            Ok(()) => println!("  Completed {bvid}"),
            Err(err) => {
                eprintln!("  Warning: {bvid} failed: {err:#}");
                failures += 1;
            }
        }
    }

    if failures == args.bvids.len() {
        bail!("every requested video failed");
    }
    println!();
    println!("Harvest complete ({} of {} videos).", args.bvids.len() - failures, args.bvids.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bvids_and_overrides() -> Result<()> {
        let args = CrawlArgs::from_slice(&[
            "--db",
            "/tmp/test.db",
            "--output=/tmp/out",
            "BV1xx411c7mD",
            "BV1yy4y1y7yy",
        ])?;
        assert_eq!(args.bvids, vec!["BV1xx411c7mD", "BV1yy4y1y7yy"]);
        assert_eq!(args.overrides.db_path, Some(PathBuf::from("/tmp/test.db")));
        assert_eq!(args.overrides.output_dir, Some(PathBuf::from("/tmp/out")));
        Ok(())
    }

    #[test]
    fn requires_at_least_one_bvid() {
        assert!(CrawlArgs::from_slice(&["--db", "/tmp/test.db"]).is_err());
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(CrawlArgs::from_slice(&["--frobnicate", "BV1xx411c7mD"]).is_err());
    }

    #[test]
    fn flag_values_can_use_equals_form() -> Result<()> {
        let args = CrawlArgs::from_slice(&["--cookie-file=/tmp/c.txt", "BV1xx411c7mD"])?;
        assert_eq!(
            args.overrides.cookie_file,
            Some(PathBuf::from("/tmp/c.txt"))
        );
        Ok(())
    }
}
