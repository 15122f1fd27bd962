//! Typed wrappers around the comment-service endpoints: total count,
//! top-level pages, reply pages, the uploader video list, and the video view
//! document used for titles and covers.
//!
//! Every wrapper threads a cancellation token, signs the request where the
//! endpoint demands it, and normalises optional reply arrays to empty
//! sequences so downstream code never deals with `null`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::net::{RequestError, RetryPolicy, retry_request};
use crate::wbi::WbiSigner;

const COUNT_URL: &str = "https://api.bilibili.com/x/v2/reply/count";
const MAIN_URL: &str = "https://api.bilibili.com/x/v2/reply/wbi/main";
const REPLY_URL: &str = "https://api.bilibili.com/x/v2/reply/reply";
const SPACE_URL: &str = "https://api.bilibili.com/x/space/wbi/arc/search";
const VIEW_URL: &str = "https://api.bilibili.com/x/web-interface/view";

/// The API serialises empty collections as `null`; map those to `Default`.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Sort order for top-level comment pages, mapped onto the API `mode`
/// parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommentOrder {
    ByTime,
    #[default]
    ByLikes,
    ByReplyCount,
}

impl CommentOrder {
    pub fn mode(self) -> u8 {
        match self {
            CommentOrder::ByTime => 2,
            CommentOrder::ByLikes => 3,
            CommentOrder::ByReplyCount => 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Picture {
    pub img_src: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplyContent {
    pub message: String,
    #[serde(deserialize_with = "nullable")]
    pub pictures: Vec<Picture>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LevelInfo {
    pub current_level: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Member {
    pub uname: String,
    pub sex: String,
    pub level_info: LevelInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplyControl {
    pub following: bool,
    pub location: String,
}

/// One comment as the API reports it, including inline children.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplyItem {
    pub rpid: i64,
    pub oid: i64,
    pub mid: i64,
    pub parent: i64,
    pub ctime: i64,
    pub like: i64,
    pub rcount: i64,
    pub fansgrade: i64,
    #[serde(deserialize_with = "nullable")]
    pub replies: Vec<ReplyItem>,
    pub content: ReplyContent,
    pub member: Member,
    pub reply_control: ReplyControl,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaginationReply {
    #[serde(deserialize_with = "nullable")]
    pub next_offset: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Cursor {
    pub is_end: bool,
    pub pagination_reply: PaginationReply,
}

/// Payload of a top-level or reply page after normalisation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CommentData {
    #[serde(deserialize_with = "nullable")]
    pub replies: Vec<ReplyItem>,
    #[serde(deserialize_with = "nullable")]
    pub top_replies: Vec<ReplyItem>,
    pub cursor: Cursor,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommentResponse {
    code: i64,
    message: String,
    data: CommentData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CountResponse {
    code: i64,
    message: String,
    data: CountData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CountData {
    count: i64,
}

/// One row of an uploader's video list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoItem {
    pub aid: i64,
    pub bvid: String,
    pub title: String,
    pub pic: String,
    pub created: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoListResponse {
    code: i64,
    message: String,
    data: VideoListData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoListData {
    list: VideoList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VideoList {
    #[serde(deserialize_with = "nullable")]
    vlist: Vec<VideoItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ViewResponse {
    code: i64,
    message: String,
    data: ViewData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ViewData {
    bvid: String,
    title: String,
    pic: String,
}

/// Title and cover of a single video.
#[derive(Debug, Clone)]
pub struct VideoInfo {
    pub bvid: String,
    pub title: String,
    pub cover: String,
}

/// The harvester's view of the comment API. Production code uses
/// [`BiliApi`]; tests drive the harvester with scripted implementations.
#[async_trait]
pub trait CommentApi: Send + Sync {
    async fn fetch_count(&self, token: &CancellationToken, oid: i64) -> Result<i64, RequestError>;

    async fn fetch_page(
        &self,
        token: &CancellationToken,
        oid: i64,
        page: i64,
        order: CommentOrder,
        offset: &str,
    ) -> Result<CommentData, RequestError>;

    async fn fetch_replies(
        &self,
        token: &CancellationToken,
        oid: i64,
        root: i64,
        page: i64,
    ) -> Result<CommentData, RequestError>;
}

/// Concrete client for the live endpoints.
#[derive(Debug)]
pub struct BiliApi {
    client: reqwest::Client,
    signer: Arc<WbiSigner>,
    policy: RetryPolicy,
    cookie: String,
}

impl BiliApi {
    pub fn new(
        client: reqwest::Client,
        signer: Arc<WbiSigner>,
        policy: RetryPolicy,
        cookie: String,
    ) -> Self {
        Self {
            client,
            signer,
            policy,
            cookie,
        }
    }

    /// Uploader video list, newest page first according to `order`
    /// (`pubdate`, `click` or `stow`).
    pub async fn fetch_video_list(
        &self,
        token: &CancellationToken,
        mid: i64,
        page: i64,
        order: &str,
    ) -> Result<Vec<VideoItem>, RequestError> {
        let url = build_url(
            SPACE_URL,
            &[
                ("mid", mid.to_string()),
                ("order", order.to_owned()),
                ("platform", "web".to_owned()),
                ("pn", page.to_string()),
                ("ps", "30".to_owned()),
                ("tid", "0".to_owned()),
            ],
        )?;
        let signed = self.signer.sign_url(token, &url, &self.cookie).await?;
        let response: VideoListResponse = self.get_json(token, "video list request", &signed).await?;
        check_code(response.code, response.message)?;
        debug!(mid, page, videos = response.data.list.vlist.len(), "fetched video list page");
        Ok(response.data.list.vlist)
    }

    /// Title and cover for one video, used to fill the Video row before a
    /// harvest.
    pub async fn fetch_video_info(
        &self,
        token: &CancellationToken,
        bvid: &str,
    ) -> Result<VideoInfo, RequestError> {
        let url = build_url(VIEW_URL, &[("bvid", bvid.to_owned())])?;
        let response: ViewResponse = self.get_json(token, "video view request", &url).await?;
        check_code(response.code, response.message)?;
        Ok(VideoInfo {
            bvid: response.data.bvid,
            title: response.data.title,
            cover: response.data.pic,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        what: &str,
        url: &str,
    ) -> Result<T, RequestError> {
        retry_request(&self.policy, token, what, || async {
            let response = self
                .client
                .get(url)
                .header("Cookie", &self.cookie)
                .send()
                .await?;
            if let Some(err) = RequestError::from_status(response.status()) {
                return Err(err);
            }
            let body = response.text().await?;
            Ok(serde_json::from_str(&body)?)
        })
        .await
    }
}

#[async_trait]
impl CommentApi for BiliApi {
    async fn fetch_count(&self, token: &CancellationToken, oid: i64) -> Result<i64, RequestError> {
        let url = build_url(
            COUNT_URL,
            &[("type", "1".to_owned()), ("oid", oid.to_string())],
        )?;
        let response: CountResponse = self.get_json(token, "comment count request", &url).await?;
        check_code(response.code, response.message)?;
        Ok(response.data.count)
    }

    async fn fetch_page(
        &self,
        token: &CancellationToken,
        oid: i64,
        page: i64,
        order: CommentOrder,
        offset: &str,
    ) -> Result<CommentData, RequestError> {
        let url = build_url(
            MAIN_URL,
            &[
                ("oid", oid.to_string()),
                ("type", "1".to_owned()),
                ("mode", order.mode().to_string()),
                ("plat", "1".to_owned()),
                ("web_location", "1315875".to_owned()),
                ("pagination_str", pagination_str(offset)),
            ],
        )?;
        let signed = self.signer.sign_url(token, &url, &self.cookie).await?;
        let response: CommentResponse = self.get_json(token, "comment page request", &signed).await?;
        check_code(response.code, response.message)?;
        debug!(
            oid,
            page,
            replies = response.data.replies.len(),
            top_replies = response.data.top_replies.len(),
            is_end = response.data.cursor.is_end,
            "fetched top-level comment page"
        );
        Ok(response.data)
    }

    async fn fetch_replies(
        &self,
        token: &CancellationToken,
        oid: i64,
        root: i64,
        page: i64,
    ) -> Result<CommentData, RequestError> {
        let url = build_url(
            REPLY_URL,
            &[
                ("oid", oid.to_string()),
                ("type", "1".to_owned()),
                ("root", root.to_string()),
                ("ps", "20".to_owned()),
                ("pn", page.to_string()),
            ],
        )?;
        let signed = self.signer.sign_url(token, &url, &self.cookie).await?;
        let response: CommentResponse = self.get_json(token, "reply page request", &signed).await?;
        check_code(response.code, response.message)?;
        Ok(response.data)
    }
}

/// A response body with a non-zero `code` is a domain error, never retried.
fn check_code(code: i64, message: String) -> Result<(), RequestError> {
    if code != 0 {
        return Err(RequestError::Api { code, message });
    }
    Ok(())
}

/// First request sends an empty offset; later requests wrap the opaque cursor
/// the server handed back.
fn pagination_str(offset: &str) -> String {
    serde_json::json!({ "offset": offset }).to_string()
}

fn build_url(base: &str, params: &[(&str, String)]) -> Result<String, RequestError> {
    let mut url = Url::parse(base)
        .map_err(|err| RequestError::Signing(format!("invalid endpoint {base}: {err}")))?;
    url.query_pairs_mut()
        .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The API omits or nulls the reply arrays; both must decode to empty.
    #[test]
    fn normalises_null_reply_arrays() {
        let body = r#"{
            "code": 0,
            "message": "0",
            "data": {
                "replies": null,
                "top_replies": null,
                "cursor": {"is_end": true, "pagination_reply": {"next_offset": null}}
            }
        }"#;
        let response: CommentResponse = serde_json::from_str(body).expect("decodes");
        assert!(response.data.replies.is_empty());
        assert!(response.data.top_replies.is_empty());
        assert!(response.data.cursor.is_end);
        assert_eq!(response.data.cursor.pagination_reply.next_offset, "");
    }

    #[test]
    fn decodes_nested_reply_items() {
        let body = r#"{
            "code": 0,
            "data": {
                "replies": [{
                    "rpid": 10,
                    "oid": 2,
                    "mid": 77,
                    "parent": 0,
                    "ctime": 1700000000,
                    "like": 5,
                    "rcount": 1,
                    "content": {"message": "hello", "pictures": [{"img_src": "http://i0/x.jpg"}]},
                    "member": {"uname": "alice", "sex": "保密", "level_info": {"current_level": 6}},
                    "reply_control": {"following": true, "location": "IP属地：广东"},
                    "replies": [{"rpid": 11, "oid": 2, "parent": 10, "ctime": 1700000001}]
                }],
                "cursor": {"is_end": false, "pagination_reply": {"next_offset": "opaque"}}
            }
        }"#;
        let response: CommentResponse = serde_json::from_str(body).expect("decodes");
        let item = &response.data.replies[0];
        assert_eq!(item.rpid, 10);
        assert_eq!(item.content.message, "hello");
        assert_eq!(item.content.pictures[0].img_src, "http://i0/x.jpg");
        assert_eq!(item.member.level_info.current_level, 6);
        assert!(item.reply_control.following);
        assert_eq!(item.replies.len(), 1);
        assert_eq!(item.replies[0].parent, 10);
        assert_eq!(response.data.cursor.pagination_reply.next_offset, "opaque");
    }

    #[test]
    fn non_zero_code_is_a_domain_error() {
        let err = check_code(-404, "啥都木有".into()).expect_err("must fail");
        assert!(matches!(err, RequestError::Api { code: -404, .. }));
        assert!(!err.is_retryable());
        assert!(check_code(0, String::new()).is_ok());
    }

    #[test]
    fn wraps_pagination_offset_as_json() {
        assert_eq!(pagination_str(""), r#"{"offset":""}"#);
        assert_eq!(
            pagination_str(r#"{"type":1,"direction":1}"#),
            r#"{"offset":"{\"type\":1,\"direction\":1}"}"#
        );
    }

    #[test]
    fn order_maps_to_api_mode() {
        assert_eq!(CommentOrder::ByTime.mode(), 2);
        assert_eq!(CommentOrder::ByLikes.mode(), 3);
        assert_eq!(CommentOrder::ByReplyCount.mode(), 1);
        assert_eq!(CommentOrder::default(), CommentOrder::ByLikes);
    }

    #[test]
    fn builds_query_urls() {
        let url = build_url(COUNT_URL, &[("type", "1".into()), ("oid", "2".into())])
            .expect("valid url");
        assert_eq!(
            url,
            "https://api.bilibili.com/x/v2/reply/count?type=1&oid=2"
        );
    }

    #[test]
    fn decodes_uploader_video_list() {
        let body = r#"{
            "code": 0,
            "data": {"list": {"vlist": [
                {"aid": 2, "bvid": "BV1xx411c7mD", "title": "demo", "pic": "http://i0/p.jpg", "created": 1690000000}
            ]}}
        }"#;
        let response: VideoListResponse = serde_json::from_str(body).expect("decodes");
        assert_eq!(response.data.list.vlist.len(), 1);
        assert_eq!(response.data.list.vlist[0].bvid, "BV1xx411c7mD");
    }
}
