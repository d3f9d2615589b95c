//! Shared HTTP plumbing for every collaborator.
//!
//! Network failures and non-2xx responses map to
//! [`PipelineError::Transient`]; a 2xx body that does not decode maps to
//! [`PipelineError::Validation`]. Call timeouts are applied by the caller,
//! not here.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use lienflow_shared::{PipelineError, Result};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("lienflow/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// Connection establishment bound. Whole-call deadlines come from `[timeouts]`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest body accepted from any collaborator (50 MB).
pub(crate) const MAX_RESPONSE_SIZE: u64 = 50 * 1024 * 1024;

/// A reqwest client bound to one service's base URL.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    client: Client,
    base: Url,
}

impl ServiceClient {
    pub fn new(base: Url) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(PipelineError::config(format!("{base} cannot be a base URL")));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Transient(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `base` with `segments` appended, each percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| PipelineError::config(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(%url, "GET");
        let response = self.client.get(url.clone()).send().await;
        decode(&url, check(&url, response)?).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T> {
        debug!(%url, "POST");
        let response = self.client.post(url.clone()).json(body).send().await;
        decode(&url, check(&url, response)?).await
    }

    /// Fetch a binary body, rejecting anything over [`MAX_RESPONSE_SIZE`].
    pub async fn get_bytes(&self, url: Url) -> Result<Vec<u8>> {
        debug!(%url, "GET bytes");
        let response = check(&url, self.client.get(url.clone()).send().await)?;
        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(PipelineError::validation(format!(
                    "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
                )));
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Transient(format!("{url}: body read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

fn check(url: &Url, response: reqwest::Result<Response>) -> Result<Response> {
    let response = response.map_err(|e| PipelineError::Transient(format!("{url}: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(PipelineError::Transient(format!("{url}: HTTP {status}")));
    }
    Ok(response)
}

async fn decode<T: DeserializeOwned>(url: &Url, response: Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| PipelineError::Transient(format!("{url}: body read failed: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| PipelineError::validation(format!("{url}: unexpected payload: {e}")))
}
