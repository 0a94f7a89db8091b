// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client for the management API a connector exposes on each site.
//!
//! Joomla sites answer under `{url}/api/index.php/v1/panopticon/` and
//! authenticate with `X-Joomla-Token`; WordPress sites answer under
//! `{url}/wp-json/v1/panopticon/` with a bearer token. Both wrap results in
//! a JSON:API style envelope: `data.attributes` on success, `errors[]` on
//! failure.

use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use tracing::debug;
use vigil_core::persistence::SiteRecord;
use vigil_core::site::BasicAuth;
use vigil_core::{CmsType, SiteConfig};

use crate::error::RemoteError;

const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Derive (connect, total) timeouts from the invocation budget.
pub fn timeouts(max_execution: Duration) -> (Duration, Duration) {
    let total = max_execution.max(Duration::from_secs(1));
    let connect = (total / 4).max(MIN_CONNECT_TIMEOUT).min(total);
    (connect, total)
}

/// Build a reqwest client with timeouts derived from the invocation budget.
pub fn http_client(max_execution: Duration) -> Result<Client, RemoteError> {
    let (connect, total) = timeouts(max_execution);
    let client = Client::builder()
        .connect_timeout(connect)
        .timeout(total)
        .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// API client bound to one site.
#[derive(Clone)]
pub struct SiteClient {
    http: Client,
    site_id: i64,
    cms: CmsType,
    base_url: String,
    api_key: String,
    basic_auth: Option<BasicAuth>,
}

impl std::fmt::Debug for SiteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteClient")
            .field("site_id", &self.site_id)
            .field("cms", &self.cms)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SiteClient {
    /// Client for `site`, sharing `http`.
    pub fn new(http: Client, site: &SiteRecord) -> Result<Self, RemoteError> {
        let cms = site
            .cms()
            .map_err(|e| RemoteError::Site(e.to_string()))?;
        let config = site
            .site_config()
            .map_err(|e| RemoteError::Site(e.to_string()))?;
        Self::from_parts(http, site.id, cms, &site.url, &config)
    }

    /// Client from explicit parts.
    pub fn from_parts(
        http: Client,
        site_id: i64,
        cms: CmsType,
        url: &str,
        config: &SiteConfig,
    ) -> Result<Self, RemoteError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| RemoteError::Site(format!("site {site_id} has no API key")))?;
        let base_url = url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RemoteError::Site(format!("site {site_id} has no URL")));
        }

        Ok(Self {
            http,
            site_id,
            cms,
            base_url,
            api_key,
            basic_auth: config.basic_auth(),
        })
    }

    /// Site this client talks to.
    pub fn site_id(&self) -> i64 {
        self.site_id
    }

    /// CMS flavour.
    pub fn cms(&self) -> CmsType {
        self.cms
    }

    /// Site root URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Shared HTTP client, for requests outside the API (extraction scripts,
    /// favicons).
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Stored HTTP basic credentials.
    pub fn basic_auth(&self) -> Option<&BasicAuth> {
        self.basic_auth.as_ref()
    }

    /// Absolute URL of an API path such as `core/update`.
    pub fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match self.cms {
            CmsType::Joomla => format!("{}/api/index.php/v1/panopticon/{}", self.base_url, path),
            CmsType::WordPress => format!("{}/wp-json/v1/panopticon/{}", self.base_url, path),
        }
    }

    /// Absolute URL of a file under the site root.
    pub fn site_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Request builder with the API authentication applied.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.api+json, application/json"));

        let builder = self.http.request(method, self.endpoint(path));
        let builder = match self.cms {
            CmsType::Joomla => {
                if let Ok(token) = HeaderValue::from_str(&self.api_key) {
                    headers.insert("X-Joomla-Token", token);
                }
                let builder = builder.headers(headers);
                match &self.basic_auth {
                    Some(auth) => builder.basic_auth(&auth.username, Some(&auth.password)),
                    None => builder,
                }
            }
            CmsType::WordPress => {
                if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
                    headers.insert(AUTHORIZATION, bearer);
                }
                builder.headers(headers)
            }
        };
        builder
    }

    /// GET an API path and unwrap the envelope.
    pub async fn get(&self, path: &str) -> Result<Value, RemoteError> {
        let response = self.request(Method::GET, path).send().await?;
        self.read_envelope(response).await
    }

    /// POST a form to an API path and unwrap the envelope.
    pub async fn post(&self, path: &str, form: &[(&str, String)]) -> Result<Value, RemoteError> {
        let response = self.request(Method::POST, path).form(form).send().await?;
        self.read_envelope(response).await
    }

    async fn read_envelope(&self, response: reqwest::Response) -> Result<Value, RemoteError> {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await?;
        debug!(site_id = self.site_id, status, url = %url, bytes = body.len(), "Remote API response");
        parse_envelope(status, &url, &body)
    }
}

/// Unwrap a JSON:API envelope.
///
/// Returns the `data.attributes` object, or an array of attributes when
/// `data` is a list.
pub fn parse_envelope(status: u16, url: &str, body: &str) -> Result<Value, RemoteError> {
    let success = (200..300).contains(&status);

    let document: Value = match serde_json::from_str(body.trim()) {
        Ok(document) => document,
        Err(e) if success => return Err(RemoteError::Malformed(format!("{url}: {e}"))),
        Err(_) => {
            return Err(RemoteError::Status {
                status,
                url: url.to_string(),
            });
        }
    };

    if let Some(errors) = document.get("errors").and_then(Value::as_array)
        && let Some(first) = errors.first()
    {
        let message = ["title", "detail", "code"]
            .iter()
            .find_map(|key| match first.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(RemoteError::Api { status, message });
    }

    if !success {
        return Err(RemoteError::Status {
            status,
            url: url.to_string(),
        });
    }

    match document.get("data") {
        Some(Value::Object(data)) => data
            .get("attributes")
            .cloned()
            .ok_or_else(|| RemoteError::Malformed(format!("{url}: data has no attributes"))),
        Some(Value::Array(items)) => Ok(Value::Array(
            items
                .iter()
                .filter_map(|item| item.get("attributes").cloned())
                .collect(),
        )),
        _ => Err(RemoteError::Malformed(format!("{url}: no data member"))),
    }
}
