//! Lists endpoints from the remote HTTP API.

use crate::core::{EndpointSource, RemoteEndpoint};
use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

/// Endpoints are only bound into the cluster if they list this binding.
const KUBERNETES_BINDING: &str = "kubernetes";

const PAGE_LIMIT: usize = 100;

/// Guards against an API that keeps handing out the same page.
const MAX_PAGES: usize = 1000;

#[derive(Clone, Debug)]
pub struct HttpEndpointSource {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointList {
    #[serde(default)]
    endpoints: Vec<ApiEndpoint>,
    #[serde(default)]
    next_page_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEndpoint {
    id: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    proto: String,
    #[serde(default)]
    public_url: String,
    #[serde(default)]
    bindings: Vec<String>,
}

// === impl HttpEndpointSource ===

impl HttpEndpointSource {
    pub fn new(base: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        // A trailing slash makes relative joins keep the full base path.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };
        let base = Url::parse(&base).with_context(|| format!("invalid API URL {base:?}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base,
            api_key,
        })
    }

    async fn page(&self, url: Url) -> Result<EndpointList> {
        let mut req = self.client.get(url).header("Ngrok-Version", "2");
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let rsp = req.send().await?.error_for_status()?;
        Ok(rsp.json().await?)
    }
}

#[async_trait::async_trait]
impl EndpointSource for HttpEndpointSource {
    async fn list_endpoints(&self) -> Result<Vec<RemoteEndpoint>> {
        let mut url = self.base.join(&format!("endpoints?limit={PAGE_LIMIT}"))?;
        let mut endpoints = Vec::new();

        for _ in 0..MAX_PAGES {
            let page = self
                .page(url.clone())
                .await
                .with_context(|| format!("listing endpoints from {url}"))?;
            tracing::trace!(%url, endpoints = page.endpoints.len(), "Fetched page");

            endpoints.extend(
                page.endpoints
                    .into_iter()
                    .filter(|ep| ep.bindings.iter().any(|b| b == KUBERNETES_BINDING))
                    .map(RemoteEndpoint::from),
            );

            match page.next_page_uri.filter(|next| !next.is_empty()) {
                Some(next) => {
                    url = self
                        .base
                        .join(&next)
                        .with_context(|| format!("invalid next page URI {next:?}"))?;
                }
                None => {
                    tracing::debug!(endpoints = endpoints.len(), "Listed endpoints");
                    return Ok(endpoints);
                }
            }
        }

        bail!("endpoint listing did not finish after {MAX_PAGES} pages")
    }
}

impl From<ApiEndpoint> for RemoteEndpoint {
    fn from(ep: ApiEndpoint) -> Self {
        Self {
            id: ep.id,
            uri: ep.uri,
            proto: ep.proto,
            public_url: ep.public_url,
        }
    }
}
