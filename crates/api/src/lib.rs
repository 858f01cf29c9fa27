//! Image service HTTP client.
//!
//! [`HttpImageProvider`] implements the engine's
//! [`RemoteProvider`] contract against a JSON REST image service. It focuses on:
//!
//! - Constructing an HTTP client with sensible defaults
//! - Discovering credentials from `BAKERY_API_TOKEN` or `~/.netrc`
//! - Validating `BAKERY_API_BASE` for safety
//! - Mapping HTTP failures onto [`ProviderError`]
//!
//! Every image lives under `/regions/{region}/images` relative to the base URL:
//!
//! | operation  | request                                   |
//! |------------|-------------------------------------------|
//! | create     | `POST /regions/{region}/images`           |
//! | describe   | `GET /regions/{region}/images/{id}`       |
//! | deregister | `DELETE /regions/{region}/images/{id}`    |
//! | list       | `GET /regions/{region}/images?ids=a&ids=b` |
//!
//! # Example
//!
//! ```ignore
//! use bakery_api::HttpImageProvider;
//!
//! let provider = HttpImageProvider::new_from_env("eu-west-1")?;
//! ```

use std::{env, fs, time::Duration};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use serde::{Deserialize, de::DeserializeOwned};
use tracing::debug;

use bakery_engine::{ProviderError, RemoteProvider};
use bakery_types::{CreateImageRequest, ResourceHandle, ResourceId, ResourceMetadata, ResourceStatus};

/// Hostnames allowed for local development regardless of scheme.
const LOCALHOST_DOMAINS: &[&str] = &["localhost", "127.0.0.1"];

/// Characters left unescaped in path segments.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    status: ResourceStatus,
}

#[derive(Debug, Deserialize)]
struct DeregisterResponse {
    deregistered: bool,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    images: Vec<ResourceMetadata>,
}

/// Remote provider talking to the image service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpImageProvider {
    pub base_url: String,
    pub region: String,
    pub http: Client,
    pub user_agent: String,
}

impl HttpImageProvider {
    /// Construct a provider from environment variables and `~/.netrc`.
    ///
    /// `BAKERY_API_BASE` is required. The token comes from `BAKERY_API_TOKEN`
    /// or, failing that, the `~/.netrc` entry for the base URL's host.
    pub fn new_from_env(region: impl Into<String>) -> Result<Self> {
        let base_url = env::var("BAKERY_API_BASE").context("BAKERY_API_BASE is not set")?;
        let api_token = env::var("BAKERY_API_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| host_of(&base_url).and_then(|host| get_netrc_token(&host)));

        Self::new(&base_url, region, api_token)
    }

    pub fn new(base_url: &str, region: impl Into<String>, api_token: Option<String>) -> Result<Self> {
        validate_base_url(base_url)?;

        let mut default_headers = header::HeaderMap::new();
        if let Some(api_token) = api_token {
            let mut authorization = header::HeaderValue::from_str(&format!("Bearer {api_token}")).context("invalid api token")?;
            authorization.set_sensitive(true);
            default_headers.insert(header::AUTHORIZATION, authorization);
        }
        default_headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            region: region.into(),
            http,
            user_agent: format!("bakery/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS),
        })
    }

    /// Absolute URL of the region's image collection, or of one image in it.
    fn images_url(&self, id: Option<&ResourceId>) -> String {
        let region = utf8_percent_encode(&self.region, PATH_SEGMENT);
        match id {
            Some(id) => format!("{}/regions/{region}/images/{}", self.base_url, utf8_percent_encode(id.as_str(), PATH_SEGMENT)),
            None => format!("{}/regions/{region}/images", self.base_url),
        }
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        debug!(%method, %url, "building request");
        self.http.request(method, url).header(header::USER_AGENT, &self.user_agent)
    }
}

#[async_trait]
impl RemoteProvider for HttpImageProvider {
    fn region(&self) -> &str {
        &self.region
    }

    async fn create_resource(&self, request: &CreateImageRequest) -> Result<ResourceHandle, ProviderError> {
        let response = send(self.request(Method::POST, self.images_url(None)).json(request)).await?;
        decode(ensure_success(response).await?).await
    }

    async fn describe_resource(&self, id: &ResourceId) -> Result<Option<ResourceStatus>, ProviderError> {
        let response = send(self.request(Method::GET, self.images_url(Some(id)))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Freshly created images may not be visible yet.
            return Ok(None);
        }
        let body: DescribeResponse = decode(ensure_success(response).await?).await?;
        Ok(Some(body.status))
    }

    async fn deregister_resource(&self, id: &ResourceId) -> Result<bool, ProviderError> {
        let response = send(self.request(Method::DELETE, self.images_url(Some(id)))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(id.clone()));
        }
        let body: DeregisterResponse = decode(ensure_success(response).await?).await?;
        Ok(body.deregistered)
    }

    async fn list_resources(&self, ids: &[ResourceId]) -> Result<Vec<ResourceMetadata>, ProviderError> {
        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("ids", id.as_str())).collect();
        let response = send(self.request(Method::GET, self.images_url(None)).query(&query)).await?;
        let body: ListResponse = decode(ensure_success(response).await?).await?;
        Ok(body.images)
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ProviderError> {
    request.send().await.map_err(|error| ProviderError::Request(error.to_string()))
}

async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Rejected {
        status: status.as_u16(),
        message: message.trim().to_string(),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    response.json::<T>().await.map_err(|error| ProviderError::Decode(error.to_string()))
}

fn host_of(base: &str) -> Option<String> {
    Url::parse(base).ok()?.host_str().map(str::to_string)
}

/// Validate that a base URL is acceptable for use by the client.
///
/// Rules:
/// - `localhost` or `127.0.0.1`: any scheme is allowed
/// - otherwise: scheme must be HTTPS
fn validate_base_url(base: &str) -> Result<()> {
    let parsed_base_url = Url::parse(base).map_err(|e| anyhow!("Invalid BAKERY_API_BASE URL '{}': {}", base, e))?;

    let host_name = parsed_base_url
        .host_str()
        .ok_or_else(|| anyhow!("BAKERY_API_BASE must include a host"))?;

    if LOCALHOST_DOMAINS.iter().any(|&allowed| host_name.eq_ignore_ascii_case(allowed)) {
        return Ok(());
    }

    if parsed_base_url.scheme() != "https" {
        return Err(anyhow!(
            "BAKERY_API_BASE must use https for non-localhost hosts; got '{}://'",
            parsed_base_url.scheme()
        ));
    }

    Ok(())
}

/// Attempt to read an API token for `host` from the user's `~/.netrc` file.
fn get_netrc_token(host: &str) -> Option<String> {
    let home = dirs_next::home_dir()?;
    let content = fs::read_to_string(home.join(".netrc")).ok()?;
    parse_netrc_password(&content, host)
}

/// Minimal `.netrc` reader returning the password of the `machine <host>` stanza.
fn parse_netrc_password(content: &str, host: &str) -> Option<String> {
    let mut tokens = content.split_whitespace();
    let mut in_host = false;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => in_host = tokens.next().is_some_and(|machine| machine.eq_ignore_ascii_case(host)),
            "default" => in_host = false,
            "password" if in_host => return tokens.next().map(str::to_string),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use serde_json::json;

    use super::*;

    fn provider(server: &Server) -> HttpImageProvider {
        HttpImageProvider::new(&server.url(), "eu-west-1", Some("test-token".into())).unwrap()
    }

    #[test]
    fn validate_base_url_rules() {
        assert!(validate_base_url("https://images.example.com/v1").is_ok());
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("http://127.0.0.1:3000").is_ok());
        assert!(validate_base_url("http://images.example.com").is_err());
        assert!(validate_base_url("not a url").is_err());
    }

    #[test]
    fn ids_are_escaped_in_paths() {
        let provider = HttpImageProvider::new("https://images.example.com/v1/", "eu-west-1", None).unwrap();
        assert_eq!(provider.images_url(None), "https://images.example.com/v1/regions/eu-west-1/images");
        assert_eq!(
            provider.images_url(Some(&"img/../1".into())),
            "https://images.example.com/v1/regions/eu-west-1/images/img%2F..%2F1"
        );
    }

    #[test]
    fn netrc_password_is_read_for_the_matching_host() {
        let content = "machine other.example.com login a password nope\nmachine images.example.com\n  login api\n  password s3cr3t\n";
        assert_eq!(parse_netrc_password(content, "images.example.com"), Some("s3cr3t".into()));
        assert_eq!(parse_netrc_password(content, "missing.example.com"), None);
    }

    #[test]
    fn new_from_env_requires_a_base_url() {
        temp_env::with_vars([("BAKERY_API_BASE", None::<&str>), ("BAKERY_API_TOKEN", None)], || {
            assert!(HttpImageProvider::new_from_env("eu-west-1").is_err());
        });
        temp_env::with_vars(
            [("BAKERY_API_BASE", Some("http://localhost:9000")), ("BAKERY_API_TOKEN", Some("abc"))],
            || {
                let provider = HttpImageProvider::new_from_env("eu-west-1").unwrap();
                assert_eq!(provider.base_url, "http://localhost:9000");
            },
        );
    }

    #[tokio::test]
    async fn https_requests_reach_the_transport() {
        // Nothing listens on port 1, so the request must fail while connecting, not before.
        let provider = HttpImageProvider::new("https://127.0.0.1:1", "eu-west-1", None).unwrap();
        let error = provider.http.get("https://127.0.0.1:1/").send().await.unwrap_err();

        let mut chain = Vec::new();
        let mut source: Option<&dyn std::error::Error> = Some(&error);
        while let Some(current) = source {
            chain.push(current.to_string());
            source = current.source();
        }
        assert!(
            !chain.iter().any(|message| message.contains("scheme is not http")),
            "{chain:?}"
        );
    }

    #[tokio::test]
    async fn create_posts_the_request_and_returns_the_handle() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/regions/eu-west-1/images")
            .match_header("authorization", "Bearer test-token")
            .match_body(Matcher::PartialJson(json!({"instance_id": "i-1", "name": "web"})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"img-7","status":"pending"}"#)
            .create_async()
            .await;

        let request = CreateImageRequest {
            instance_id: "i-1".into(),
            name: "web".into(),
            block_devices: Vec::new(),
        };
        let handle = provider(&server).create_resource(&request).await.unwrap();

        assert_eq!(handle.id.as_str(), "img-7");
        assert_eq!(handle.status, ResourceStatus::Pending);
        assert_eq!(handle.virtualization_type, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn describe_maps_not_found_to_none() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/regions/eu-west-1/images/img-1")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/regions/eu-west-1/images/img-2")
            .with_status(200)
            .with_body(r#"{"status":"available"}"#)
            .create_async()
            .await;

        let provider = provider(&server);
        assert_eq!(provider.describe_resource(&"img-1".into()).await, Ok(None));
        assert_eq!(provider.describe_resource(&"img-2".into()).await, Ok(Some(ResourceStatus::Available)));
    }

    #[tokio::test]
    async fn server_errors_are_rejections() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/regions/eu-west-1/images")
            .with_status(503)
            .with_body("try again later\n")
            .create_async()
            .await;

        let request = CreateImageRequest {
            instance_id: "i-1".into(),
            name: "web".into(),
            block_devices: Vec::new(),
        };
        let error = provider(&server).create_resource(&request).await.unwrap_err();

        assert_eq!(
            error,
            ProviderError::Rejected {
                status: 503,
                message: "try again later".into()
            }
        );
    }

    #[tokio::test]
    async fn deregister_reports_the_service_answer() {
        let mut server = Server::new_async().await;
        server
            .mock("DELETE", "/regions/eu-west-1/images/img-1")
            .with_status(200)
            .with_body(r#"{"deregistered":false}"#)
            .create_async()
            .await;
        server
            .mock("DELETE", "/regions/eu-west-1/images/img-2")
            .with_status(404)
            .create_async()
            .await;

        let provider = provider(&server);
        assert_eq!(provider.deregister_resource(&"img-1".into()).await, Ok(false));
        assert_eq!(
            provider.deregister_resource(&"img-2".into()).await,
            Err(ProviderError::NotFound("img-2".into()))
        );
    }

    #[tokio::test]
    async fn list_sends_every_id_and_decodes_metadata() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/regions/eu-west-1/images")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ids".into(), "img-1".into()),
                Matcher::UrlEncoded("ids".into(), "img-2".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"images":[{"id":"img-1","name":"web","status":"available","virtualization_type":"hvm"}]}"#,
            )
            .create_async()
            .await;

        let images = provider(&server)
            .list_resources(&["img-1".into(), "img-2".into()])
            .await
            .unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].virtualization_type, "hvm");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn malformed_bodies_are_decode_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/regions/eu-west-1/images/img-1")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let result = provider(&server).describe_resource(&"img-1".into()).await;

        assert!(matches!(result, Err(ProviderError::Decode(_))), "{result:?}");
    }
}
