//! Instagram Graph API client over HTTP

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::time::Duration;

use crate::credentials::Credential;
use crate::error::{RemoteError, Result};
use crate::graph::{PublishClient, RefreshedToken, RemoteContainerStatus};

/// Graph error codes meaning the token is invalid or expired
const AUTH_ERROR_CODES: &[i64] = &[102, 190];

/// Graph error codes meaning an application or account rate limit was hit
const RATE_LIMIT_ERROR_CODES: &[i64] = &[4, 17, 32, 613];

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphErrorBody,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

/// Classify a failed Graph API response into a [`RemoteError`]
///
/// The JSON error envelope wins over the HTTP status when both are present,
/// because Instagram reports most failures as 400 with a specific code.
fn map_graph_error(status: StatusCode, body: &str, context: &str) -> RemoteError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);

    let (code, message) = match parsed {
        Some(err) if !err.message.is_empty() => (err.code, err.message),
        Some(err) => (err.code, format!("HTTP {}", status.as_u16())),
        None if body.trim().is_empty() => (0, format!("HTTP {}", status.as_u16())),
        None => (0, body.trim().to_string()),
    };

    if status == StatusCode::UNAUTHORIZED || AUTH_ERROR_CODES.contains(&code) {
        return RemoteError::Authentication(format!(
            "Instagram rejected the access token during {}: {}. Please refresh or re-authorize.",
            context, message
        ));
    }

    if status == StatusCode::TOO_MANY_REQUESTS || RATE_LIMIT_ERROR_CODES.contains(&code) {
        return RemoteError::RateLimit(format!(
            "Instagram rate limit hit during {}: {}",
            context, message
        ));
    }

    let code = if code == 0 { i64::from(status.as_u16()) } else { code };
    RemoteError::Api {
        code,
        message: format!("{} failed: {}", context, message),
    }
}

fn map_transport_error(error: reqwest::Error, context: &str) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Network(format!("{} timed out: {}", context, error))
    } else {
        RemoteError::Network(format!("{} failed: {}", context, error))
    }
}

/// [`PublishClient`] that talks to the real Graph API
#[derive(Clone)]
pub struct InstagramClient {
    base_url: String,
    http: Client,
}

impl InstagramClient {
    /// Create a client for `base_url` (normally `https://graph.instagram.com`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Send a request and decode a successful JSON body
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T> {
        let resp = request
            .send()
            .await
            .map_err(|e| map_transport_error(e, context))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| map_transport_error(e, context))?;

        if !status.is_success() {
            return Err(map_graph_error(status, &text, context).into());
        }

        serde_json::from_str(&text).map_err(|e| {
            RemoteError::Api {
                code: i64::from(status.as_u16()),
                message: format!("{} returned an unreadable response: {}", context, e),
            }
            .into()
        })
    }

    async fn post_for_id(
        &self,
        path: &str,
        params: &[(&str, &str)],
        context: &str,
    ) -> Result<String> {
        let resp: IdResponse = self
            .send(self.http.post(self.url(path)).form(params), context)
            .await?;

        resp.id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RemoteError::MissingField(format!("id in {} response", context)).into())
    }
}

#[async_trait]
impl PublishClient for InstagramClient {
    async fn create_item_container(
        &self,
        credential: &Credential,
        image_url: &str,
        is_carousel_item: bool,
        caption: Option<&str>,
    ) -> Result<String> {
        tracing::debug!(
            "Creating item container for {} (carousel item: {})",
            image_url,
            is_carousel_item
        );

        let token = credential.token.expose_secret();
        let mut params = vec![("image_url", image_url), ("access_token", token)];
        if is_carousel_item {
            params.push(("is_carousel_item", "true"));
        }
        if let Some(caption) = caption {
            params.push(("caption", caption));
        }

        self.post_for_id(
            &format!("{}/media", credential.account_id),
            &params,
            "item container creation",
        )
        .await
    }

    async fn container_status(
        &self,
        credential: &Credential,
        container_id: &str,
    ) -> Result<RemoteContainerStatus> {
        let request = self.http.get(self.url(container_id)).query(&[
            ("fields", "status_code"),
            ("access_token", credential.token.expose_secret()),
        ]);

        let resp: StatusResponse = self.send(request, "container status check").await?;
        let code = resp.status_code.unwrap_or_default();
        tracing::debug!("Container {} status: {}", container_id, code);

        Ok(RemoteContainerStatus::from_status_code(&code))
    }

    async fn create_carousel_container(
        &self,
        credential: &Credential,
        children: &[String],
        caption: &str,
    ) -> Result<String> {
        tracing::debug!("Creating carousel container with {} children", children.len());

        let children = children.join(",");
        let params = [
            ("media_type", "CAROUSEL"),
            ("children", children.as_str()),
            ("caption", caption),
            ("access_token", credential.token.expose_secret()),
        ];

        self.post_for_id(
            &format!("{}/media", credential.account_id),
            &params,
            "carousel container creation",
        )
        .await
    }

    async fn publish(&self, credential: &Credential, container_id: &str) -> Result<String> {
        tracing::debug!("Publishing container {}", container_id);

        let params = [
            ("creation_id", container_id),
            ("access_token", credential.token.expose_secret()),
        ];

        self.post_for_id(
            &format!("{}/media_publish", credential.account_id),
            &params,
            "media publish",
        )
        .await
    }

    async fn permalink(&self, credential: &Credential, media_id: &str) -> Result<Option<String>> {
        let request = self.http.get(self.url(media_id)).query(&[
            ("fields", "permalink"),
            ("access_token", credential.token.expose_secret()),
        ]);

        let resp: PermalinkResponse = self.send(request, "permalink lookup").await?;
        Ok(resp.permalink.filter(|link| !link.is_empty()))
    }

    async fn refresh_token(&self, credential: &Credential) -> Result<RefreshedToken> {
        let request = self.http.get(self.url("refresh_access_token")).query(&[
            ("grant_type", "ig_refresh_token"),
            ("access_token", credential.token.expose_secret()),
        ]);

        let resp: RefreshResponse = self.send(request, "token refresh").await?;
        let access_token = resp
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::MissingField("access_token in refresh response".to_string()))?;

        Ok(RefreshedToken {
            access_token,
            expires_in: resp.expires_in,
        })
    }
}
