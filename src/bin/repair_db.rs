#![forbid(unsafe_code)]

//! Command-line driver for the consistency engine: validate the whole store
//! or a single video, and optionally apply the matching repairs.

use anyhow::{Context, Result, bail};
use biliview_tools::config::{ConfigOverrides, require_unprivileged, resolve_config};
use biliview_tools::crawler::Crawler;
use biliview_tools::database::CommentStore;
use biliview_tools::repair::{Issue, RepairService, Summary};
use std::env;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
struct RepairArgs {
    bvid: Option<String>,
    check_only: bool,
    overrides: ConfigOverrides,
}

impl RepairArgs {
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
        let mut bvid: Option<String> = None;
        let mut check_only = false;
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
            if let Some(value) = arg.strip_prefix("--bvid=") {
                Self::set_bvid(&mut bvid, value.to_string())?;
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
                "--bvid" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--bvid requires a value"))?;
                    Self::set_bvid(&mut bvid, value)?;
                }
                "--check-only" => check_only = true,
                _ => {
                    bail!(
                        "unknown argument: {arg}\nUsage: repair_db [--env-file <path>] [--db <path>] [--bvid <bvid>] [--check-only]"
                    );
                }
            }
        }

        Ok(Self {
            bvid,
            check_only,
            overrides,
        })
    }

    fn set_bvid(target: &mut Option<String>, value: String) -> Result<()> {
        if target.is_some() {
            bail!("--bvid specified multiple times");
        }
        *target = Some(value);
        Ok(())
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_issues(issues: &[Issue]) {
    if issues.is_empty() {
        println!("No issues found.");
        return;
    }
    for issue in issues {
        let status = if issue.fixed {
            "fixed"
        } else if issue.fixable {
            "fixable"
        } else {
            "unfixable"
        };
        println!(
            "[{}] {} ({}): {} [count {}, {}]",
            issue.severity, issue.issue_type, issue.category, issue.description, issue.count, status
        );
        if !issue.details.is_empty() {
            println!("    {}", issue.details);
        }
    }
}

fn print_summary(summary: &Summary) {
    println!();
    println!("Videos: {}", summary.total_videos);
    println!("Comments: {}", summary.total_comments);
    println!("Issues found: {}", summary.issues_found);
    println!("Issues fixed: {}", summary.issues_fixed);
    println!("Issues unfixable: {}", summary.issues_unfixable);
}

#[tokio::main]
async fn main() -> Result<()> {
    require_unprivileged("repair_db")?;
    init_tracing();

    let args = RepairArgs::parse()?;
    let config = resolve_config(args.overrides.clone())?;

    println!("===================================");
    println!("BiliView Store Doctor");
    println!("===================================");
    println!("Database: {}", config.db_path.display());
    println!(
        "Mode: {}{}",
        if args.check_only { "validate" } else { "repair" },
        args.bvid
            .as_deref()
            .map(|bvid| format!(" (video {bvid})"))
            .unwrap_or_default()
    );
    println!();

    match (&args.bvid, args.check_only) {
        (None, true) => {
            let store = CommentStore::open(&config.db_path)
                .await
                .context("opening the comment store")?;
            let report = RepairService::new(&store).validate_database().await?;
            print_issues(&report.issues);
            print_summary(&report.summary);
        }
        (None, false) => {
            let store = CommentStore::open(&config.db_path)
                .await
                .context("opening the comment store")?;
            let report = RepairService::new(&store).repair_database().await?;
            print_issues(&report.issues);
            print_summary(&report.summary);
        }
        (Some(bvid), true) => {
            let store = CommentStore::open(&config.db_path)
                .await
                .context("opening the comment store")?;
            let report = RepairService::new(&store).validate_video(bvid).await?;
            print_issues(&report.issues);
            print_summary(&report.summary);
        }
        (Some(bvid), false) => {
            // Per-video repair may re-run the crawler, so it needs the full
            // stack including the cookie.
            let crawler = Crawler::new(config)
                .await
                .context("initializing the crawler")?;
            let token = CancellationToken::new();
            let service = RepairService::new(crawler.store());
            let report = service.repair_video(&token, bvid, &crawler).await?;
            print_issues(&report.issues);
            print_summary(&report.summary);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_whole_db_repair() -> Result<()> {
        let args = RepairArgs::from_slice(&[])?;
        assert!(args.bvid.is_none());
        assert!(!args.check_only);
        Ok(())
    }

    #[test]
    fn parses_video_check() -> Result<()> {
        let args = RepairArgs::from_slice(&["--bvid", "BV1xx411c7mD", "--check-only"])?;
        assert_eq!(args.bvid.as_deref(), Some("BV1xx411c7mD"));
        assert!(args.check_only);
        Ok(())
    }

    #[test]
    fn rejects_duplicate_bvid_flags() {
        assert!(RepairArgs::from_slice(&["--bvid=BV1", "--bvid=BV2"]).is_err());
    }

    #[test]
    fn rejects_positional_arguments() {
        assert!(RepairArgs::from_slice(&["BV1xx411c7mD"]).is_err());
    }
}
