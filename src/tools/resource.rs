//! Paged resource-link reader
//!
//! Tool results may point at audio by URL. The pager pulls the resource in
//! 100 KB ranges with a 30 s budget per page, retrying a timed-out page
//! once, and hands each page to the caller as it lands so decoding can
//! start before the tail arrives.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const PAGE_SIZE: usize = 100 * 1024;
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PagedFetcher {
    client: reqwest::Client,
    page_size: usize,
    page_timeout: Duration,
}

impl Default for PagedFetcher {
    fn default() -> Self {
        Self::new(PAGE_SIZE, PAGE_TIMEOUT)
    }
}

impl PagedFetcher {
    pub fn new(page_size: usize, page_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            page_size,
            page_timeout,
        }
    }

    /// Fetch `url` page by page, invoking `on_page` for each chunk in order.
    /// Stops early when `cancel` fires (returns Ok with what was read).
    pub async fn fetch<F>(
        &self,
        url: &str,
        cancel: &CancellationToken,
        mut on_page: F,
    ) -> Result<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut offset: usize = 0;
        loop {
            if cancel.is_cancelled() {
                debug!(url, offset, "resource fetch cancelled");
                return Ok(offset);
            }

            let page = match self.fetch_page(url, offset).await {
                Ok(page) => page,
                Err(e) if e.to_string().contains("timed out") => {
                    warn!(url, offset, "page timed out, retrying once");
                    self.fetch_page(url, offset).await?
                }
                Err(e) => return Err(e),
            };

            let Some(page) = page else {
                // Range not satisfiable: we are past the end.
                return Ok(offset);
            };
            let len = page.len();
            if len == 0 {
                return Ok(offset);
            }
            on_page(&page);
            offset += len;
            if len < self.page_size {
                return Ok(offset);
            }
        }
    }

    /// Fetch and buffer the whole resource.
    pub async fn fetch_all(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.fetch(url, cancel, |page| out.extend_from_slice(page))
            .await?;
        Ok(out)
    }

    /// One ranged request; `None` means the server reports end-of-resource.
    async fn fetch_page(&self, url: &str, offset: usize) -> Result<Option<Vec<u8>>> {
        let range = format!("bytes={}-{}", offset, offset + self.page_size - 1);
        let fut = self.client.get(url).header("Range", range).send();
        let response = tokio::time::timeout(self.page_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("page fetch timed out"))?
            .context("page fetch failed")?;

        match response.status().as_u16() {
            // Range not satisfiable: offset is past the end.
            416 => return Ok(None),
            s if s >= 400 => bail!("resource fetch failed with status {}", s),
            _ => {}
        }

        let whole = response.status().as_u16() == 200;
        let body = tokio::time::timeout(self.page_timeout, response.bytes())
            .await
            .map_err(|_| anyhow::anyhow!("page body timed out"))?
            .context("failed reading page body")?;

        if whole && offset > 0 {
            // Server ignored the range header; slice what we need.
            if offset >= body.len() {
                return Ok(None);
            }
            let end = (offset + self.page_size).min(body.len());
            return Ok(Some(body[offset..end].to_vec()));
        }
        Ok(Some(body.to_vec()))
    }
}
