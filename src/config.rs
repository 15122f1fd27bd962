use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::api::CommentOrder;
use crate::net::RetryPolicy;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DB_PATH: &str = "data/bilibili_comments.db";
pub const DEFAULT_OUTPUT_DIR: &str = "output";
pub const DEFAULT_COOKIE_FILE: &str = "cookie.txt";
pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_MAX_TRY_COUNT: usize = 3;
pub const DEFAULT_DELAY_BASE_MS: u64 = 3000;
pub const DEFAULT_DELAY_JITTER_MS: u64 = 2000;
pub const DEFAULT_UP_PAGES: i64 = 10;

/// Which sinks run after a harvest completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveMode {
    CsvOnly,
    DbOnly,
    #[default]
    CsvAndDb,
}

impl SaveMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv_only" => Ok(Self::CsvOnly),
            "db_only" => Ok(Self::DbOnly),
            "csv_and_db" => Ok(Self::CsvAndDb),
            other => bail!("unknown save mode: {other}"),
        }
    }

    pub fn writes_csv(self) -> bool {
        matches!(self, Self::CsvOnly | Self::CsvAndDb)
    }

    pub fn writes_db(self) -> bool {
        matches!(self, Self::DbOnly | Self::CsvAndDb)
    }
}

/// Sort order for an uploader's video list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadOrder {
    #[default]
    Pubdate,
    Click,
    Stow,
}

impl UploadOrder {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pubdate" => Ok(Self::Pubdate),
            "click" => Ok(Self::Click),
            "stow" => Ok(Self::Stow),
            other => bail!("unknown uploader order: {other}"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pubdate => "pubdate",
            Self::Click => "click",
            Self::Stow => "stow",
        }
    }
}

/// Everything the crawler, store and repair binaries need to run.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub db_path: PathBuf,
    pub output_dir: PathBuf,
    pub image_dir: PathBuf,
    pub cookie_file: PathBuf,
    pub workers: usize,
    pub max_try_count: usize,
    pub delay_base_ms: u64,
    pub delay_jitter_ms: u64,
    pub save_mode: SaveMode,
    pub order: CommentOrder,
    pub up_pages: i64,
    pub up_order: UploadOrder,
    pub img_download: bool,
}

impl CrawlerConfig {
    /// Retry policy derived from the crawl settings: the try count doubles as
    /// the attempt limit and the configured jitter spreads the backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_try_count.max(1),
            jitter_ms: self.delay_jitter_ms,
            ..RetryPolicy::default()
        }
    }
}

/// Caller-supplied values that win over the environment and the env file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub env_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub cookie_file: Option<PathBuf>,
    pub up_pages: Option<i64>,
}

/// Startup guard shared by the binaries. The crawler's database, checkpoints
/// and CSV mirrors all land relative to the working directory, so a run as
/// uid 0 would leave root-owned files behind for every later run to trip
/// over.
pub fn require_unprivileged(binary: &str) -> Result<()> {
    if Uid::effective().is_root() {
        bail!(
            "refusing to start {binary} as root; run it as the user that owns the data directories"
        );
    }
    Ok(())
}

pub fn load_config() -> Result<CrawlerConfig> {
    resolve_config(ConfigOverrides::default())
}

pub fn resolve_config(overrides: ConfigOverrides) -> Result<CrawlerConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let settings = Settings {
        file_vars: load_env_file(&env_path)?,
        env_lookup: |key: &str| env::var(key).ok(),
    };
    build_config(&settings, overrides)
}

/// Layered key lookup backing the resolution flow: process environment over
/// env-file contents, with overrides and defaults applied by the caller.
struct Settings<F> {
    file_vars: HashMap<String, String>,
    env_lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Settings<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.env_lookup)(key)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .or_else(|| self.file_vars.get(key).cloned())
    }

    /// Typed variant of [`Settings::get`]; unparseable values fall through to
    /// the default, matching how the rest of the crate treats soft config.
    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }
}

fn build_config(
    settings: &Settings<impl Fn(&str) -> Option<String>>,
    overrides: ConfigOverrides,
) -> Result<CrawlerConfig> {
    let db_path = overrides
        .db_path
        .or_else(|| settings.get("DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let output_dir = overrides
        .output_dir
        .or_else(|| settings.get("OUTPUT_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let image_dir = settings
        .get("IMAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| output_dir.join("images"));
    let cookie_file = overrides
        .cookie_file
        .or_else(|| settings.get("COOKIE_FILE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_COOKIE_FILE));

    let workers = settings
        .parse::<usize>("WORKERS")
        .filter(|&workers| workers > 0)
        .unwrap_or(DEFAULT_WORKERS);
    let max_try_count = settings
        .parse::<usize>("MAX_TRY_COUNT")
        .filter(|&tries| tries > 0)
        .unwrap_or(DEFAULT_MAX_TRY_COUNT);
    let delay_base_ms = settings
        .parse::<u64>("DELAY_BASE_MS")
        .unwrap_or(DEFAULT_DELAY_BASE_MS);
    let delay_jitter_ms = settings
        .parse::<u64>("DELAY_JITTER_MS")
        .unwrap_or(DEFAULT_DELAY_JITTER_MS);

    let save_mode = match settings.get("SAVE_MODE") {
        Some(value) => SaveMode::parse(&value)?,
        None => SaveMode::default(),
    };
    let up_pages = overrides
        .up_pages
        .or_else(|| settings.parse::<i64>("UP_PAGES"))
        .filter(|&pages| pages > 0)
        .unwrap_or(DEFAULT_UP_PAGES);
    let up_order = match settings.get("UP_ORDER") {
        Some(value) => UploadOrder::parse(&value)?,
        None => UploadOrder::default(),
    };
    let img_download = settings
        .get("IMG_DOWNLOAD")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);

    Ok(CrawlerConfig {
        db_path,
        output_dir,
        image_dir,
        cookie_file,
        workers,
        max_try_count,
        delay_base_ms,
        delay_jitter_ms,
        save_mode,
        order: CommentOrder::default(),
        up_pages,
        up_order,
        img_download,
    })
}

/// Joins the non-comment lines of the cookie file with `"; "`. A missing
/// cookie file is a setup error; harvesting without one only yields the
/// logged-out comment subset.
pub fn read_cookie(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading cookie file {}", path.display()))?;
    let cookie = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join("; ");
    Ok(cookie)
}

/// A missing env file is fine; everything has a default or comes from the
/// process environment.
fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading env file {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

/// One `KEY=value` assignment, tolerating `export` prefixes, surrounding
/// quotes, comments and blank lines.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let assignment = line
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(line);
    let (key, value) = assignment.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_owned(), unquote(value.trim()).to_owned()))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    fn config_from(contents: &str) -> CrawlerConfig {
        let cfg = make_config(contents);
        let settings = Settings {
            file_vars: load_env_file(cfg.path()).unwrap(),
            env_lookup: no_env,
        };
        build_config(&settings, ConfigOverrides::default()).unwrap()
    }

    #[test]
    fn applies_defaults_for_missing_values() {
        let config = config_from("");
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(
            config.image_dir,
            PathBuf::from(DEFAULT_OUTPUT_DIR).join("images")
        );
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.max_try_count, DEFAULT_MAX_TRY_COUNT);
        assert_eq!(config.delay_base_ms, DEFAULT_DELAY_BASE_MS);
        assert_eq!(config.delay_jitter_ms, DEFAULT_DELAY_JITTER_MS);
        assert_eq!(config.save_mode, SaveMode::CsvAndDb);
        assert_eq!(config.up_pages, DEFAULT_UP_PAGES);
        assert_eq!(config.up_order, UploadOrder::Pubdate);
        assert!(!config.img_download);
    }

    #[test]
    fn reads_values_from_env_file() {
        let config = config_from(
            "DB_PATH=\"/data/comments.db\"\nWORKERS=\"8\"\nDELAY_BASE_MS=\"500\"\nSAVE_MODE=\"db_only\"\nIMG_DOWNLOAD=\"true\"\nUP_ORDER=\"click\"\n",
        );
        assert_eq!(config.db_path, PathBuf::from("/data/comments.db"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.delay_base_ms, 500);
        assert_eq!(config.save_mode, SaveMode::DbOnly);
        assert_eq!(config.up_order, UploadOrder::Click);
        assert!(config.img_download);
    }

    #[test]
    fn zero_workers_falls_back_to_default() {
        let config = config_from("WORKERS=\"0\"\nMAX_TRY_COUNT=\"0\"\n");
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.max_try_count, DEFAULT_MAX_TRY_COUNT);
    }

    #[test]
    fn overrides_beat_file_values() {
        let cfg = make_config("DB_PATH=\"/file.db\"\nOUTPUT_DIR=\"/file-out\"\n");
        let settings = Settings {
            file_vars: load_env_file(cfg.path()).unwrap(),
            env_lookup: no_env,
        };
        let config = build_config(
            &settings,
            ConfigOverrides {
                db_path: Some(PathBuf::from("/override.db")),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/override.db"));
        assert_eq!(config.output_dir, PathBuf::from("/file-out"));
    }

    #[test]
    fn env_beats_file_values() {
        let cfg = make_config("WORKERS=\"2\"\n");
        let settings = Settings {
            file_vars: load_env_file(cfg.path()).unwrap(),
            env_lookup: |key: &str| (key == "WORKERS").then(|| "9".to_string()),
        };
        let config = build_config(&settings, ConfigOverrides::default()).unwrap();
        assert_eq!(config.workers, 9);
    }

    /// Blank environment values do not shadow the env file.
    #[test]
    fn blank_env_values_fall_through_to_file() {
        let cfg = make_config("WORKERS=\"4\"\n");
        let settings = Settings {
            file_vars: load_env_file(cfg.path()).unwrap(),
            env_lookup: |key: &str| (key == "WORKERS").then(|| "  ".to_string()),
        };
        let config = build_config(&settings, ConfigOverrides::default()).unwrap();
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn rejects_unknown_save_mode() {
        let cfg = make_config("SAVE_MODE=\"both\"\n");
        let settings = Settings {
            file_vars: load_env_file(cfg.path()).unwrap(),
            env_lookup: no_env,
        };
        let err = build_config(&settings, ConfigOverrides::default())
            .expect_err("bad save mode must fail");
        assert!(err.to_string().contains("unknown save mode"));
    }

    #[test]
    fn parses_save_modes() {
        assert_eq!(SaveMode::parse("csv_only").unwrap(), SaveMode::CsvOnly);
        assert_eq!(SaveMode::parse("DB_ONLY").unwrap(), SaveMode::DbOnly);
        assert_eq!(SaveMode::parse(" csv_and_db ").unwrap(), SaveMode::CsvAndDb);
        assert!(SaveMode::CsvOnly.writes_csv());
        assert!(!SaveMode::CsvOnly.writes_db());
        assert!(SaveMode::CsvAndDb.writes_csv() && SaveMode::CsvAndDb.writes_db());
    }

    #[test]
    fn env_lines_tolerate_exports_quotes_and_comments() {
        assert_eq!(
            parse_env_line("export DB_PATH='/srv/comments.db'"),
            Some(("DB_PATH".to_owned(), "/srv/comments.db".to_owned()))
        );
        assert_eq!(
            parse_env_line("  WORKERS = \"7\"  "),
            Some(("WORKERS".to_owned(), "7".to_owned()))
        );
        assert_eq!(parse_env_line("# just a comment"), None);
        assert_eq!(parse_env_line("   "), None);
        assert_eq!(parse_env_line("no assignment here"), None);
        assert_eq!(parse_env_line("=value-without-key"), None);
    }

    #[test]
    fn unquote_only_strips_matching_pairs() {
        assert_eq!(unquote("\"quoted\""), "quoted");
        assert_eq!(unquote("'quoted'"), "quoted");
        assert_eq!(unquote("\"mismatched'"), "\"mismatched'");
        assert_eq!(unquote("plain"), "plain");
    }

    /// Cookie files keep comments and blank lines; everything else joins into
    /// one header value.
    #[test]
    fn joins_cookie_lines() {
        let cookie_file = make_config("# exported cookies\nSESSDATA=abc\n\nbili_jct=def\n");
        let cookie = read_cookie(cookie_file.path()).unwrap();
        assert_eq!(cookie, "SESSDATA=abc; bili_jct=def");
    }

    #[test]
    fn missing_cookie_file_is_an_error() {
        let err = read_cookie(Path::new("/nonexistent/cookie.txt")).expect_err("must fail");
        assert!(err.to_string().contains("cookie file"));
    }

    #[test]
    fn retry_policy_follows_crawl_settings() {
        let mut config = config_from("");
        config.max_try_count = 7;
        config.delay_jitter_ms = 123;
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.jitter_ms, 123);
    }
}
