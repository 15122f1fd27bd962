#![forbid(unsafe_code)]

//! Command-line driver that walks an uploader's video list and harvests the
//! comments of every discovered video.

use anyhow::{Context, Result, bail};
use biliview_tools::config::{ConfigOverrides, require_unprivileged, resolve_config};
use biliview_tools::crawler::Crawler;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
struct UpArgs {
    mid: i64,
    overrides: ConfigOverrides,
}

impl UpArgs {
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
        let mut mid: Option<i64> = None;
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
            if let Some(value) = arg.strip_prefix("--pages=") {
                overrides.up_pages = Some(Self::parse_pages(value)?);
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
                "--pages" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--pages requires a value"))?;
                    overrides.up_pages = Some(Self::parse_pages(&value)?);
                }
                _ if arg.starts_with('-') => {
                    bail!("unknown argument: {arg}");
                }
                _ => {
                    if mid.is_some() {
                        bail!("uploader mid specified multiple times");
                    }
                    mid = Some(
                        arg.parse::<i64>()
                            .with_context(|| format!("invalid uploader mid: {arg}"))?,
                    );
                }
            }
        }

        let Some(mid) = mid else {
            bail!("Usage: crawl_up [--env-file <path>] [--db <path>] [--pages <n>] <mid>");
        };
        Ok(Self { mid, overrides })
    }

    fn parse_pages(value: &str) -> Result<i64> {
        let pages = value
            .parse::<i64>()
            .with_context(|| format!("invalid page count: {value}"))?;
        if pages <= 0 {
            bail!("--pages must be positive");
        }
        Ok(pages)
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
    require_unprivileged("crawl_up")?;
    init_tracing();

    let args = UpArgs::parse()?;
    let config = resolve_config(args.overrides.clone())?;

    println!("===================================");
    println!("BiliView Uploader Harvester");
    println!("===================================");
    println!("Uploader: {}", args.mid);
    println!(
        "Pages: {} (order: {})",
        config.up_pages,
        config.up_order.as_str()
    );
    println!("Database: {}", config.db_path.display());
    println!();

    let crawler = Arc::new(
        Crawler::new(config)
            .await
            .context("initializing the crawler")?,
    );

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

    crawler.crawl_up(&token, args.mid).await?;

    println!();
    println!("Uploader harvest complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mid_and_pages() -> Result<()> {
        let args = UpArgs::from_slice(&["--pages", "3", "12345"])?;
        assert_eq!(args.mid, 12345);
        assert_eq!(args.overrides.up_pages, Some(3));
        Ok(())
    }

    #[test]
    fn rejects_non_numeric_mid() {
        assert!(UpArgs::from_slice(&["not-a-mid"]).is_err());
    }

    #[test]
    fn rejects_duplicate_mid() {
        assert!(UpArgs::from_slice(&["123", "456"]).is_err());
    }

    #[test]
    fn rejects_non_positive_pages() {
        assert!(UpArgs::from_slice(&["--pages", "0", "123"]).is_err());
    }
}
