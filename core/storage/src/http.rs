//! HTTP remote source for the meeting notes API.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::provider::{Item, Panel, RemoteSource, SecondaryKind, SecondaryResource, TranscriptEntry};
use minutesync_common::{Error, RemoteId, Result};

/// Page size requested from listing endpoints.
const PAGE_SIZE: &str = "100";

/// Response from listing items.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemPage {
    items: Vec<Item>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Remote source speaking the notes REST API.
///
/// Endpoints, relative to the base URL:
/// - `GET health`
/// - `GET items?since=&cursor=&limit=`
/// - `GET items/{id}/panels`, `GET items/{id}/transcript`
pub struct HttpRemoteSource {
    http: Client,
    base_url: Url,
    token: String,
}

impl HttpRemoteSource {
    /// Create a new client.
    ///
    /// # Errors
    /// - Base URL does not parse
    /// - HTTP client cannot be constructed
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        // A trailing slash makes `Url::join` append instead of replacing the last segment.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| Error::InvalidInput(format!("Invalid API base URL: {}", e)))?;

        let http = Client::builder()
            .user_agent(concat!("minutesync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// `items/{id}/{kind}`, with the id encoded as a single path segment.
    fn secondary_url(&self, id: &RemoteId, kind: SecondaryKind) -> Result<Url> {
        let mut url = self.endpoint("items")?;
        url.path_segments_mut()
            .map_err(|_| {
                Error::InvalidInput(format!("Base URL cannot hold a path: {}", self.base_url))
            })?
            .push(id.as_str())
            .push(kind.as_str());
        Ok(url)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn list_pages(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Item>> {
        let url = self.endpoint("items")?;
        let since = since.map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true));
        let mut all_items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(url.clone())
                .header(header::AUTHORIZATION, self.auth_header())
                .query(&[("limit", PAGE_SIZE)]);

            if let Some(since) = &since {
                request = request.query(&[("since", since.as_str())]);
            }
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list items: {}", e)))?;

            let page: ItemPage = self.handle_response(response).await?;
            debug!("Fetched page of {} items", page.items.len());
            all_items.extend(page.items);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(all_items)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Validation(format!("Failed to parse response: {}", e)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }
}

/// Map a non-success status to the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::Authentication("Invalid or expired token".to_string()),
        StatusCode::FORBIDDEN => Error::PermissionDenied("Access denied".to_string()),
        StatusCode::NOT_FOUND => Error::NotFound("Resource not found".to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::Validation(format!("{} - {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(format!("{} - {}", status, body)),
        _ => Error::Network(format!("API error: {} - {}", status, body)),
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn test_connection(&self) -> Result<bool> {
        let response = self
            .http
            .get(self.endpoint("health")?)
            .header(header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to reach API: {}", e)))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED => Err(classify_status(StatusCode::UNAUTHORIZED, "")),
            status => {
                debug!("Health check returned {}", status);
                Ok(false)
            }
        }
    }

    async fn list_items_since(&self, since: DateTime<Utc>) -> Result<Vec<Item>> {
        self.list_pages(Some(since)).await
    }

    async fn list_all_items(&self) -> Result<Vec<Item>> {
        self.list_pages(None).await
    }

    async fn fetch_secondary(
        &self,
        id: &RemoteId,
        kind: SecondaryKind,
    ) -> Result<SecondaryResource> {
        let url = self.secondary_url(id, kind)?;

        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to fetch {} for {}: {}", kind, id, e)))?;

        match kind {
            SecondaryKind::Panels => {
                let panels: Vec<Panel> = self.handle_response(response).await?;
                Ok(SecondaryResource::Panels(panels))
            }
            SecondaryKind::Transcript => {
                let entries: Vec<TranscriptEntry> = self.handle_response(response).await?;
                Ok(SecondaryResource::Transcript(entries))
            }
        }
    }
}
