use reqwest::StatusCode;
use url::Url;

use crate::{BlobCache, CacheError};

/// Where a [`Fetched`] body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub status: u16,
    pub body: Vec<u8>,
    pub source: Source,
}

impl BlobCache {
    /// Cache-first fetch. On a miss the network response is returned as-is
    /// and stored only when the status is 200.
    pub async fn fetch_or_populate(
        &self,
        client: &reqwest::Client,
        url: &Url,
    ) -> Result<Fetched, CacheError> {
        if let Some(body) = self.get(url) {
            tracing::debug!(%url, "Cache hit");
            return Ok(Fetched {
                status: StatusCode::OK.as_u16(),
                body,
                source: Source::Cache,
            });
        }

        let response = client.get(url.clone()).send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();

        if status == StatusCode::OK {
            // A failed populate only costs a future refetch.
            if let Err(err) = self.put(url, &body) {
                tracing::warn!(%url, "Failed to populate cache: {err}");
            }
        } else {
            tracing::debug!(%url, %status, "Not caching non-200 response");
        }

        Ok(Fetched {
            status: status.as_u16(),
            body,
            source: Source::Network,
        })
    }
}
