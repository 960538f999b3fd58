//! Generic JSON-over-HTTP provider adapter.
//!
//! Talks to a remote provisioning service:
//!
//! - `POST   {endpoint}/resources/{type}` creates an object
//! - `PUT    {endpoint}/resources/{type}/{id}` updates it
//! - `DELETE {endpoint}/resources/{type}/{id}` destroys it
//! - `POST   {endpoint}/images/search` lists candidate images
//!
//! Retries are left to the executor; this client maps statuses to errors
//! that say whether a retry makes sense.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, TerraceError};
use crate::model::ResourceId;

use super::adapter::{Image, ImageQuery, ProviderAdapter, ProviderResponse, ResolvedResource};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fallback delay when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    name: &'a str,
    attributes: &'a BTreeMap<String, JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changed: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    computed: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ImageSearchResponse {
    images: Vec<Image>,
}

impl HttpProvider {
    /// Creates a client for `endpoint` authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }

    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        missing: &str,
    ) -> Result<Response> {
        trace!("{method} {path}");

        let mut request = self
            .client
            .request(method, self.url(path))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ProviderError::unreachable(format!("Connection failed: {e}"))
                } else {
                    ProviderError::network(format!("Request failed: {e}"))
                }
            })?;

        check_status(response, missing).await
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        response.json().await.map_err(|e| {
            TerraceError::Provider(ProviderError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            })
        })
    }
}

/// Maps non-success statuses to provider errors.
async fn check_status(response: Response, missing: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            ProviderError::RateLimited {
                retry_after_secs: retry_after,
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthenticationFailed {
            message: String::from("Provider rejected the token"),
        },
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            provider_id: missing.to_string(),
        },
        s if s.is_server_error() => {
            let body = response.text().await.unwrap_or_default();
            ProviderError::network(format!("{s}: {body}"))
        }
        s => {
            let body = response.text().await.unwrap_or_default();
            ProviderError::api_error(s.as_u16(), body)
        }
    };

    Err(TerraceError::Provider(error))
}

#[async_trait]
impl ProviderAdapter for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(&self, resource: &ResolvedResource) -> Result<ProviderResponse> {
        debug!("HTTP create of {}", resource.id);
        let body = ResourceRequest {
            name: &resource.id.name,
            attributes: &resource.attributes,
            changed: None,
        };
        let response = self
            .send(
                Method::POST,
                &format!("resources/{}", resource.id.resource_type),
                Some(&body),
                &resource.id.to_string(),
            )
            .await?;
        Self::parse(response).await
    }

    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        changed: &[String],
    ) -> Result<BTreeMap<String, JsonValue>> {
        debug!("HTTP update of {} ({provider_id})", resource.id);
        let body = ResourceRequest {
            name: &resource.id.name,
            attributes: &resource.attributes,
            changed: Some(changed),
        };
        let response = self
            .send(
                Method::PUT,
                &format!("resources/{}/{provider_id}", resource.id.resource_type),
                Some(&body),
                provider_id,
            )
            .await?;
        Ok(Self::parse::<UpdateResponse>(response).await?.computed)
    }

    async fn destroy(&self, id: &ResourceId, provider_id: &str) -> Result<()> {
        debug!("HTTP destroy of {id} ({provider_id})");
        self.send::<()>(
            Method::DELETE,
            &format!("resources/{}/{provider_id}", id.resource_type),
            None,
            provider_id,
        )
        .await?;
        Ok(())
    }

    async fn lookup_image(&self, query: &ImageQuery) -> Result<Image> {
        let result = self
            .send(Method::POST, "images/search", Some(query), &query.describe())
            .await;
        let response = match result {
            Err(TerraceError::Provider(ProviderError::NotFound { .. })) => {
                return Err(TerraceError::Provider(ProviderError::NoMatchingImage {
                    pattern: query.describe(),
                }));
            }
            other => other?,
        };
        let found: ImageSearchResponse = Self::parse(response).await?;
        query.select(&found.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vpc() -> ResolvedResource {
        ResolvedResource::new(
            ResourceId::managed("aws_vpc", "main"),
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
        )
    }

    #[tokio::test]
    async fn test_create_sends_bearer_token_and_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/aws_vpc"))
            .and(header_is("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"name": "main", "attributes": {"cidr_block": "10.0.0.0/16"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "provider_id": "vpc-42",
                "computed": {"arn": "arn:vpc-42"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), "secret").unwrap();
        let response = provider.create(&vpc()).await.unwrap();
        assert_eq!(response.provider_id, "vpc-42");
        assert_eq!(response.computed["arn"], json!("arn:vpc-42"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/aws_vpc"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), "secret").unwrap();

        let throttled = provider.create(&vpc()).await.unwrap_err();
        assert_eq!(throttled.retry_delay_secs(), Some(3));

        let unavailable = provider.update("vpc-42", &vpc(), &[]).await.unwrap_err();
        assert!(unavailable.is_retryable());
        assert!(unavailable.outcome_unknown());

        let missing = provider
            .destroy(&ResourceId::managed("aws_vpc", "main"), "vpc-42")
            .await
            .unwrap_err();
        assert!(matches!(missing, TerraceError::Provider(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let provider = HttpProvider::new("http://127.0.0.1:1", "secret").unwrap();
        let err = provider.create(&vpc()).await.unwrap_err();
        assert!(matches!(err, TerraceError::Provider(ProviderError::Unreachable { .. })));
        assert!(err.is_retryable());
        assert!(!err.outcome_unknown());
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), "wrong").unwrap();
        let err = provider.create(&vpc()).await.unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Provider(ProviderError::AuthenticationFailed { .. })
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_image_search_selects_newest_locally() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": [
                    {"image_id": "ami-1", "name": "jammy-1", "owner_id": "1", "virtualization_type": "hvm", "creation_date": "2024-01-01T00:00:00Z"},
                    {"image_id": "ami-2", "name": "jammy-2", "owner_id": "1", "virtualization_type": "hvm", "creation_date": "2024-03-01T00:00:00Z"}
                ]
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), "secret").unwrap();
        let image = provider.lookup_image(&ImageQuery::newest("jammy-*")).await.unwrap();
        assert_eq!(image.image_id, "ami-2");
    }
}
