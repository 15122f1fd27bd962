//! WBI request signing.
//!
//! Signed endpoints require a `w_rid` parameter: the MD5 of the canonical
//! query string concatenated with a 32-character mixin key. The mixin key is
//! derived from two rotating key fragments published by the navigation
//! endpoint, so the signer caches them for ten minutes and re-bootstraps
//! transparently when they expire.

use std::time::{Duration, Instant};

use chrono::Utc;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use url::form_urlencoded;

use crate::net::{RequestError, RetryPolicy, retry_request};

const NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";
const KEY_TTL: Duration = Duration::from_secs(600);

/// Fixed permutation used to derive the mixin key from `img_key + sub_key`.
const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22,
    25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

#[derive(Debug, Deserialize)]
struct NavResponse {
    data: NavData,
}

#[derive(Debug, Deserialize)]
struct NavData {
    wbi_img: WbiImg,
}

#[derive(Debug, Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

#[derive(Debug)]
struct CachedKeys {
    img_key: String,
    sub_key: String,
    fetched_at: Instant,
}

/// Handle owning the signing-key cache. Construct one per process and share
/// it (`Arc`) with every component that signs requests.
#[derive(Debug)]
pub struct WbiSigner {
    client: reqwest::Client,
    policy: RetryPolicy,
    cache: Mutex<Option<CachedKeys>>,
}

impl WbiSigner {
    pub fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            cache: Mutex::new(None),
        }
    }

    /// Signer with pre-seeded keys; skips the bootstrap fetch entirely.
    #[cfg(test)]
    pub fn with_keys(img_key: &str, sub_key: &str) -> Self {
        let signer = Self::new(reqwest::Client::new(), RetryPolicy::default());
        *signer.cache.lock() = Some(CachedKeys {
            img_key: img_key.to_owned(),
            sub_key: sub_key.to_owned(),
            fetched_at: Instant::now(),
        });
        signer
    }

    /// Adds `wts` and `w_rid` to `url_str`, returning the signed URL.
    pub async fn sign_url(
        &self,
        token: &CancellationToken,
        url_str: &str,
        cookie: &str,
    ) -> Result<String, RequestError> {
        let (img_key, sub_key) = self.keys(token, cookie).await?;
        let mut url = Url::parse(url_str)
            .map_err(|err| RequestError::Signing(format!("invalid url {url_str}: {err}")))?;

        let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let signed = enc_wbi(params, &img_key, &sub_key, Utc::now().timestamp());
        url.set_query(Some(&signed));
        Ok(url.into())
    }

    /// Returns the cached key pair, re-fetching it when the TTL has lapsed.
    async fn keys(
        &self,
        token: &CancellationToken,
        cookie: &str,
    ) -> Result<(String, String), RequestError> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref()
                && cached.fetched_at.elapsed() < KEY_TTL
            {
                return Ok((cached.img_key.clone(), cached.sub_key.clone()));
            }
        }

        let (img_key, sub_key) = self.fetch_keys(token, cookie).await?;
        debug!(img_key, sub_key, "refreshed wbi signing keys");
        *self.cache.lock() = Some(CachedKeys {
            img_key: img_key.clone(),
            sub_key: sub_key.clone(),
            fetched_at: Instant::now(),
        });
        Ok((img_key, sub_key))
    }

    async fn fetch_keys(
        &self,
        token: &CancellationToken,
        cookie: &str,
    ) -> Result<(String, String), RequestError> {
        let nav: NavResponse =
            retry_request(&self.policy, token, "signing key bootstrap", || async {
                let response = self
                    .client
                    .get(NAV_URL)
                    .header("Cookie", cookie)
                    .send()
                    .await?;
                if let Some(err) = RequestError::from_status(response.status()) {
                    return Err(err);
                }
                let body = response.text().await?;
                Ok(serde_json::from_str(&body)?)
            })
            .await?;

        let img_key = basename_stem(&nav.data.wbi_img.img_url);
        let sub_key = basename_stem(&nav.data.wbi_img.sub_url);
        if img_key.is_empty() || sub_key.is_empty() {
            return Err(RequestError::Signing(
                "navigation document did not contain usable key fragments".into(),
            ));
        }
        Ok((img_key, sub_key))
    }
}

/// `…/wbi/7cd0849….png` → `7cd0849…`.
fn basename_stem(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or_default()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_owned()
}

/// Selects characters of `img_key + sub_key` through the permutation table
/// and truncates to 32.
fn mixin_key(orig: &str) -> String {
    let bytes = orig.as_bytes();
    let mut key: String = MIXIN_KEY_ENC_TAB
        .iter()
        .filter_map(|&i| bytes.get(i).map(|&b| b as char))
        .collect();
    key.truncate(32);
    key
}

/// The upstream scheme drops these characters from every value before
/// hashing.
fn sanitize_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '!' | '\'' | '(' | ')' | '*'))
        .collect()
}

/// Core signing step, split out from [`WbiSigner::sign_url`] so the exact
/// query/hash computation is testable with a fixed `wts`.
fn enc_wbi(
    mut params: Vec<(String, String)>,
    img_key: &str,
    sub_key: &str,
    wts: i64,
) -> String {
    let mixin = mixin_key(&format!("{img_key}{sub_key}"));

    params.push(("wts".to_owned(), wts.to_string()));
    for (_, value) in params.iter_mut() {
        *value = sanitize_value(value);
    }
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish();

    let w_rid = hex::encode(Md5::digest(format!("{canonical}{mixin}")));

    // w_rid is plain hex, safe to append without further encoding.
    format!("{canonical}&w_rid={w_rid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vector for the upstream signing scheme.
    const IMG_KEY: &str = "7cd084941338484aae1ad9425b84077c";
    const SUB_KEY: &str = "4932caff0ff746eab6f01bf08b70ac45";

    #[test]
    fn derives_mixin_key_through_permutation() {
        let key = mixin_key(&format!("{IMG_KEY}{SUB_KEY}"));
        assert_eq!(key.len(), 32);
        assert_eq!(key, "ea1db124af3c7062474693fa704f4ff8");
    }

    #[test]
    fn strips_unwanted_characters_from_values() {
        assert_eq!(sanitize_value("a!b'c(d)e*f"), "abcdef");
        assert_eq!(sanitize_value("plain"), "plain");
    }

    /// Known-answer test for the full signing computation.
    #[test]
    fn signs_reference_parameter_set() {
        let params = vec![
            ("foo".to_owned(), "114".to_owned()),
            ("bar".to_owned(), "514".to_owned()),
            ("zab".to_owned(), "1919810".to_owned()),
        ];
        let signed = enc_wbi(params, IMG_KEY, SUB_KEY, 1702204169);
        assert_eq!(
            signed,
            "bar=514&foo=114&wts=1702204169&zab=1919810&w_rid=8f6f2b5b3d485fe794cd425da7089349"
        );
    }

    /// Distinct parameter sets must not collide on `w_rid`.
    #[test]
    fn distinct_parameters_produce_distinct_signatures() {
        let first = enc_wbi(
            vec![("oid".to_owned(), "2".to_owned())],
            IMG_KEY,
            SUB_KEY,
            1702204169,
        );
        let second = enc_wbi(
            vec![("oid".to_owned(), "3".to_owned())],
            IMG_KEY,
            SUB_KEY,
            1702204169,
        );
        let rid = |query: &str| {
            query
                .rsplit("w_rid=")
                .next()
                .map(str::to_owned)
                .unwrap_or_default()
        };
        assert_ne!(rid(&first), rid(&second));
    }

    #[test]
    fn extracts_key_stem_from_url() {
        assert_eq!(
            basename_stem("https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png"),
            "7cd084941338484aae1ad9425b84077c"
        );
        assert_eq!(basename_stem(""), "");
    }

    #[tokio::test]
    async fn sign_url_appends_wts_and_w_rid() {
        let signer = WbiSigner::with_keys(IMG_KEY, SUB_KEY);
        let token = CancellationToken::new();
        let signed = signer
            .sign_url(
                &token,
                "https://api.bilibili.com/x/v2/reply/wbi/main?oid=2&type=1",
                "",
            )
            .await
            .expect("signing with cached keys needs no network");
        let url = Url::parse(&signed).expect("signed url parses");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.iter().any(|(k, _)| k == "wts"));
        assert!(pairs.iter().any(|(k, v)| k == "w_rid" && v.len() == 32));
        assert!(pairs.iter().any(|(k, v)| k == "oid" && v == "2"));
    }
}
