//! JSON-over-HTTP provider.
//!
//! Wire format, relative to the configured endpoint:
//!
//! | Operation | Request | Success body |
//! |---|---|---|
//! | create | `POST /resources/{kind}` `{"properties": {..}}` | `{"physical_id": "..", "outputs": {..}}` |
//! | update | `PUT /resources/{kind}/{id}` `{"properties": {..}}` | `{"outputs": {..}}` |
//! | delete | `DELETE /resources/{kind}/{id}` | any |
//!
//! 429, 408 and 5xx responses, timeouts and connection failures are
//! retryable. 404 is reported as not-found. Anything else is fatal.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{ConfigParser, ProviderConfig};
use crate::error::{ConfigError, ProviderError, Result, SkyforgeError};
use crate::graph::{Outputs, Properties};

use super::{CreatedResource, Provider};

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    properties: &'a Properties,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

impl HttpProvider {
    /// Creates a provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                ConfigError::invalid("provider.endpoint", format!("'{endpoint}' is not a base URL"))
            })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SkyforgeError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Creates a provider from the stack document's provider section. The
    /// bearer token is read from the variable named by `token_env`.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or it is invalid.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            ConfigError::invalid(
                "provider.endpoint",
                "an endpoint is required to apply changes (or set SKYFORGE_PROVIDER_ENDPOINT)",
            )
        })?;

        let token = ConfigParser::provider_token(&config.token_env);
        if token.is_none() {
            debug!(
                "{} is not set, calling provider without a bearer token",
                config.token_env
            );
        }

        Self::new(endpoint, token, Duration::from_secs(config.timeout_secs))
    }

    fn url(&self, segments: &[&str]) -> std::result::Result<Url, ProviderError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::fatal("endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push("resources")
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        physical_id: Option<&str>,
    ) -> std::result::Result<Response, ProviderError> {
        let response = self
            .authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        trace!("Provider responded with {status}");
        if status.is_success() {
            return Ok(response);
        }

        let retry_after_secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map_or_else(|_| format!("{status}: {body}"), |e| format!("{status}: {}", e.message));

        Err(classify_status(status, message, retry_after_secs, physical_id))
    }
}

fn classify_status(
    status: StatusCode,
    message: String,
    retry_after_secs: Option<u64>,
    physical_id: Option<&str>,
) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return ProviderError::Retryable {
            message,
            retry_after_secs,
        };
    }

    match (status, physical_id) {
        (StatusCode::NOT_FOUND, Some(id)) => ProviderError::NotFound {
            physical_id: id.to_string(),
        },
        _ => ProviderError::Fatal { message },
    }
}

fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::retryable(format!("request failed: {e}"))
    } else {
        ProviderError::fatal(format!("request failed: {e}"))
    }
}

fn invalid_body(e: &reqwest::Error) -> ProviderError {
    ProviderError::fatal(format!("invalid provider response: {e}"))
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create_resource(
        &self,
        kind: &str,
        properties: &Properties,
    ) -> std::result::Result<CreatedResource, ProviderError> {
        let url = self.url(&[kind])?;
        debug!("POST {url}");
        let response = self
            .send(
                self.client.post(url).json(&ResourceRequest { properties }),
                None,
            )
            .await?;
        response.json().await.map_err(|e| invalid_body(&e))
    }

    async fn update_resource(
        &self,
        kind: &str,
        physical_id: &str,
        properties: &Properties,
    ) -> std::result::Result<Outputs, ProviderError> {
        let url = self.url(&[kind, physical_id])?;
        debug!("PUT {url}");
        let response = self
            .send(
                self.client.put(url).json(&ResourceRequest { properties }),
                Some(physical_id),
            )
            .await?;
        let body: UpdateResponse = response.json().await.map_err(|e| invalid_body(&e))?;
        Ok(body.outputs)
    }

    async fn delete_resource(
        &self,
        kind: &str,
        physical_id: &str,
    ) -> std::result::Result<(), ProviderError> {
        let url = self.url(&[kind, physical_id])?;
        debug!("DELETE {url}");
        self.send(self.client.delete(url), Some(physical_id))
            .await
            .map(drop)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(
            &server.uri(),
            Some(String::from("secret")),
            Duration::from_secs(5),
        )
        .expect("valid endpoint")
    }

    fn bucket_props() -> Properties {
        let mut props = Properties::new();
        props.insert("bucket_name".into(), json!("uploads"));
        props
    }

    #[tokio::test]
    async fn test_create_sends_properties_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources/S3Bucket"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({ "properties": { "bucket_name": "uploads" } })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "physical_id": "bkt-42",
                "outputs": { "arn": "arn:aws:s3:::uploads" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server)
            .create_resource("S3Bucket", &bucket_props())
            .await
            .expect("create succeeds");
        assert_eq!(created.physical_id, "bkt-42");
        assert_eq!(created.outputs["arn"], json!("arn:aws:s3:::uploads"));
    }

    #[tokio::test]
    async fn test_update_encodes_physical_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/IamRole/app%2Frole-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "outputs": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let outputs = provider(&server)
            .update_resource("IamRole", "app/role-1", &Properties::new())
            .await
            .expect("update succeeds");
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create_resource("S3Bucket", &bucket_props())
            .await
            .expect_err("rate limited");
        assert!(matches!(
            err,
            ProviderError::Retryable {
                retry_after_secs: Some(7),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server)
            .delete_resource("S3Bucket", "bkt-1")
            .await
            .expect_err("unavailable");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/S3Bucket/bkt-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider(&server)
            .delete_resource("S3Bucket", "bkt-1")
            .await
            .expect_err("not found");
        assert_eq!(
            err,
            ProviderError::NotFound {
                physical_id: String::from("bkt-1")
            }
        );
    }

    #[tokio::test]
    async fn test_bad_request_is_fatal_with_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({ "message": "bucket name already taken" })),
            )
            .mount(&server)
            .await;

        let err = provider(&server)
            .create_resource("S3Bucket", &bucket_props())
            .await
            .expect_err("fatal");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("bucket name already taken"));
    }

    #[test]
    fn test_from_config_requires_endpoint() {
        let err = HttpProvider::from_config(&ProviderConfig::default()).expect_err("no endpoint");
        assert!(err.is_validation());
    }
}
