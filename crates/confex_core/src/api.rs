use std::io::Read;
use std::thread::sleep;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ApiError;

/// One page of results is assumed sufficient for every listing call.
const LISTING_LIMIT: usize = 500;

/// Binary downloads are served under this prefix on the instance origin,
/// regardless of the path the API base URL carries.
const DOWNLOAD_PREFIX: &str = "/wiki";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub key: String,
    pub homepage_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: String,
    pub title: String,
    /// Raw storage-format markup.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub title: String,
    /// Relative download path as reported by the service.
    pub download: String,
}

/// The content service the exporter runs against.
///
/// [`ConfluenceClient`] is the production implementation; tests drive the
/// exporter with an in-memory one.
pub trait ContentApi {
    fn get_space(&mut self, key: &str) -> Result<Space, ApiError>;
    fn get_all_spaces(&mut self) -> Result<Vec<Space>, ApiError>;
    fn get_page_by_id(&mut self, page_id: &str) -> Result<Page, ApiError>;
    /// Timestamp of the newest version recorded in the page's content
    /// properties, if the service reports one.
    fn get_page_last_modified(&mut self, page_id: &str) -> Result<Option<String>, ApiError>;
    fn get_child_id_list(&mut self, page_id: &str) -> Result<Vec<String>, ApiError>;
    fn get_attachments(&mut self, page_id: &str) -> Result<Vec<Attachment>, ApiError>;
    /// Open a streamed download for an attachment. `Ok(None)` means the
    /// attachment is gone on the remote side (HTTP 404).
    fn open_attachment(&mut self, download: &str) -> Result<Option<Box<dyn Read>>, ApiError>;
}

pub struct ConfluenceClient {
    client: Client,
    config: ClientConfig,
    base: Url,
}

impl ConfluenceClient {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.base_url)
            .map_err(|_| ApiError::InvalidUrl(config.base_url.clone()))?;
        // No whole-request timeout on the shared client: attachment bodies
        // can be arbitrarily large. JSON requests set one per request.
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config,
            base,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/rest/api/{}", self.config.base_url, path)
    }

    fn download_url(&self, download: &str) -> String {
        let origin = self.base.origin().ascii_serialization();
        format!(
            "{origin}{DOWNLOAD_PREFIX}/{}",
            download.trim_start_matches('/')
        )
    }

    /// Authenticated JSON GET with a bounded retry budget. Only used for
    /// idempotent read operations.
    fn request_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        for attempt in 0..=self.config.max_retries {
            let response = self
                .client
                .get(url)
                .basic_auth(&self.config.username, Some(&self.config.token))
                .timeout(Duration::from_millis(self.config.timeout_ms))
                .query(query)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Err(ApiError::NotFound(url.to_string()));
                    }
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        return Err(ApiError::Status {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    return response
                        .json()
                        .map_err(|error| ApiError::Decode(error.to_string()));
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(ApiError::Transport(error));
                }
            }
        }
        Err(ApiError::RetriesExhausted(url.to_string()))
    }

    fn wait_before_retry(&self, attempt: usize) {
        let delay = self
            .config
            .retry_delay_ms
            .saturating_mul(attempt as u64 + 1);
        sleep(Duration::from_millis(delay));
    }
}

impl ContentApi for ConfluenceClient {
    fn get_space(&mut self, key: &str) -> Result<Space, ApiError> {
        let url = self.api_url(&format!("space/{key}"));
        debug!("resolving space {key}");
        let payload = self.request_json(&url, &[("expand", "homepage".to_string())])?;
        parse_space(&payload)
            .ok_or_else(|| ApiError::Decode(format!("space response for {key} is missing its key")))
    }

    fn get_all_spaces(&mut self) -> Result<Vec<Space>, ApiError> {
        let url = self.api_url("space");
        let payload = self.request_json(
            &url,
            &[
                ("start", "0".to_string()),
                ("limit", LISTING_LIMIT.to_string()),
                ("expand", "homepage".to_string()),
            ],
        )?;
        let size = payload.get("size").and_then(Value::as_u64).unwrap_or(0);
        debug!("service reports {size} spaces");
        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().filter_map(parse_space).collect())
            .unwrap_or_default())
    }

    fn get_page_by_id(&mut self, page_id: &str) -> Result<Page, ApiError> {
        let url = self.api_url(&format!("content/{page_id}"));
        let payload = self.request_json(&url, &[("expand", "body.storage".to_string())])?;

        let id = payload
            .get("id")
            .and_then(id_string)
            .ok_or_else(|| ApiError::Decode(format!("page {page_id} response has no id")))?;
        let title = payload
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode(format!("page {page_id} response has no title")))?
            .to_string();
        let body = payload
            .get("body")
            .and_then(|body| body.get("storage"))
            .and_then(|storage| storage.get("value"))
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode(format!("page {page_id} response has no storage body")))?
            .to_string();

        Ok(Page { id, title, body })
    }

    fn get_page_last_modified(&mut self, page_id: &str) -> Result<Option<String>, ApiError> {
        let url = self.api_url(&format!("content/{page_id}/property"));
        let payload = self.request_json(&url, &[])?;
        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first())
            .and_then(|property| property.get("version"))
            .and_then(|version| version.get("when"))
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }

    fn get_child_id_list(&mut self, page_id: &str) -> Result<Vec<String>, ApiError> {
        let url = self.api_url(&format!("content/{page_id}/child/page"));
        let payload = self.request_json(&url, &[("limit", LISTING_LIMIT.to_string())])?;
        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|child| child.get("id").and_then(id_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_attachments(&mut self, page_id: &str) -> Result<Vec<Attachment>, ApiError> {
        let url = self.api_url(&format!("content/{page_id}/child/attachment"));
        let payload = self.request_json(
            &url,
            &[
                ("start", "0".to_string()),
                ("limit", LISTING_LIMIT.to_string()),
            ],
        )?;
        let parsed: AttachmentListResponse =
            serde_json::from_value(payload).map_err(|error| ApiError::Decode(error.to_string()))?;

        let mut attachments = Vec::new();
        for item in parsed.results {
            match (item.title, item.links.download) {
                (Some(title), Some(download)) => attachments.push(Attachment { title, download }),
                _ => debug!("attachment entry on page {page_id} has no title or download link"),
            }
        }
        Ok(attachments)
    }

    fn open_attachment(&mut self, download: &str) -> Result<Option<Box<dyn Read>>, ApiError> {
        let url = self.download_url(download);
        debug!("requesting attachment {url}");
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.config.username, Some(&self.config.token))
            .send()?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.as_u16() >= 400 {
            return Err(ApiError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(Some(Box::new(response)))
    }
}

#[derive(Debug, Deserialize, Default)]
struct AttachmentListResponse {
    #[serde(default)]
    results: Vec<AttachmentItem>,
}

#[derive(Debug, Deserialize)]
struct AttachmentItem {
    title: Option<String>,
    #[serde(default, rename = "_links")]
    links: AttachmentLinks,
}

#[derive(Debug, Deserialize, Default)]
struct AttachmentLinks {
    download: Option<String>,
}

/// Identifiers are opaque and arrive as either JSON strings or numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn parse_space(value: &Value) -> Option<Space> {
    let key = value.get("key").and_then(Value::as_str)?.to_string();
    let homepage_id = value
        .get("homepage")
        .and_then(|homepage| homepage.get("id"))
        .and_then(id_string);
    Some(Space { key, homepage_id })
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ConfluenceClient, id_string, is_retryable_status, parse_space};
    use crate::config::ClientConfig;

    fn client(base_url: &str) -> ConfluenceClient {
        ConfluenceClient::new(ClientConfig::new(base_url, "user", "token")).expect("client")
    }

    #[test]
    fn id_string_accepts_strings_and_numbers() {
        assert_eq!(id_string(&json!("12345")), Some("12345".to_string()));
        assert_eq!(id_string(&json!(12345)), Some("12345".to_string()));
        assert_eq!(id_string(&json!({"id": 1})), None);
    }

    #[test]
    fn parse_space_reads_optional_homepage() {
        let space = parse_space(&json!({
            "key": "DOCS",
            "homepage": {"id": 98765}
        }))
        .expect("space");
        assert_eq!(space.key, "DOCS");
        assert_eq!(space.homepage_id.as_deref(), Some("98765"));

        let orphan = parse_space(&json!({"key": "EMPTY"})).expect("space");
        assert_eq!(orphan.homepage_id, None);
    }

    #[test]
    fn api_urls_are_rooted_at_the_configured_base() {
        let client = client("https://example.atlassian.net/wiki");
        assert_eq!(
            client.api_url("space/DOCS"),
            "https://example.atlassian.net/wiki/rest/api/space/DOCS"
        );
    }

    #[test]
    fn download_urls_substitute_the_origin_and_keep_the_query() {
        let client = client("https://example.atlassian.net/wiki");
        assert_eq!(
            client.download_url("/download/attachments/1/diagram.png?version=2"),
            "https://example.atlassian.net/wiki/download/attachments/1/diagram.png?version=2"
        );
    }

    #[test]
    fn download_urls_force_the_service_prefix() {
        let client = client("https://confluence.example.org");
        assert_eq!(
            client.download_url("download/attachments/9/a.bin"),
            "https://confluence.example.org/wiki/download/attachments/9/a.bin"
        );
    }

    #[test]
    fn only_transient_statuses_are_retryable() {
        use reqwest::StatusCode;
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }
}
