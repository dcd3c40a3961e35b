use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use common::{
    knobs::{
        SEARCH_QUERY_TIMEOUT,
        SEARCH_WRITE_TIMEOUT,
    },
    types::{
        Uid,
        Xid,
    },
};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use url::Url;

use crate::{
    related_query,
    FlushOutcome,
    RelatedUids,
    SearchStore,
    WriteError,
};

/// Elasticsearch-protocol client over HTTP.
pub struct EsSearchStore {
    base: Url,
    client: reqwest::Client,
}

impl EsSearchStore {
    pub fn new(base: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(*SEARCH_QUERY_TIMEOUT)
            .build()?;
        Ok(Self { base, client })
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        self.base.join(path).context("bad search store path")
    }
}

fn classify(e: reqwest::Error) -> WriteError {
    // Connection and timeout failures retry; anything else (e.g. body
    // decoding) does not.
    if e.is_connect() || e.is_timeout() {
        WriteError::Transport(e.into())
    } else {
        WriteError::Other(e.into())
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

/// `hits.total` is a plain number on older stores and `{value, relation}` on
/// newer ones.
fn parse_total(hits: &JsonValue) -> anyhow::Result<u64> {
    let total = hits.get("total").context("search response missing total")?;
    if let Some(n) = total.as_u64() {
        return Ok(n);
    }
    total
        .get("value")
        .and_then(|v| v.as_u64())
        .context("unparseable hits.total")
}

#[async_trait]
impl SearchStore for EsSearchStore {
    async fn index_document(
        &self,
        index: &str,
        id: &Uid,
        version: Xid,
        body: &JsonValue,
    ) -> Result<(), WriteError> {
        let url = self
            .url(&format!(
                "{index}/_doc/{id}?version={version}&version_type=external_gte"
            ))
            .map_err(WriteError::Other)?;
        let response = self
            .client
            .put(url)
            .timeout(*SEARCH_WRITE_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::CONFLICT {
            return Err(WriteError::VersionConflict {
                id: id.to_string(),
                version,
            });
        }
        let detail = response.text().await.unwrap_or_default();
        let err = anyhow::anyhow!("search store returned {status} writing {id}: {detail}");
        if retryable_status(status) {
            Err(WriteError::Transport(err))
        } else {
            Err(WriteError::Other(err))
        }
    }

    async fn refresh(&self, index: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("{index}/_refresh"))?;
        self.client
            .post(url)
            .send()
            .await?
            .error_for_status()
            .context("refresh failed")?;
        Ok(())
    }

    async fn flush_synced(&self, index: &str) -> anyhow::Result<FlushOutcome> {
        let url = self.url(&format!("{index}/_flush/synced"))?;
        let response = self.client.post(url).send().await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(FlushOutcome::Conflict);
        }
        response.error_for_status().context("synced flush failed")?;
        Ok(FlushOutcome::Flushed)
    }

    async fn related_uids(
        &self,
        index: &str,
        updated: &BTreeSet<Uid>,
        renamed: &BTreeSet<Uid>,
        max: usize,
    ) -> anyhow::Result<RelatedUids> {
        let url = self.url(&format!("{index}/_search?size={max}"))?;
        let response = self
            .client
            .post(url)
            .json(&related_query(updated, renamed))
            .send()
            .await?
            .error_for_status()
            .context("invalidation query failed")?;
        let body: JsonValue = response.json().await?;
        let hits = body
            .get("hits")
            .context("search response missing hits")?;
        let total = parse_total(hits)?;
        let ids = hits
            .get("hits")
            .and_then(|h| h.as_array())
            .context("search response missing hit list")?
            .iter()
            .map(|hit| {
                hit.get("_id")
                    .and_then(|id| id.as_str())
                    .context("hit missing _id")?
                    .parse()
            })
            .collect::<anyhow::Result<BTreeSet<Uid>>>()?;
        Ok(RelatedUids { hits: ids, total })
    }

    async fn get_meta(&self, index: &str, id: &str) -> anyhow::Result<Option<JsonValue>> {
        let url = self.url(&format!("{index}/_doc/{id}"))?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: JsonValue = response.error_for_status()?.json().await?;
        Ok(body.get("_source").cloned())
    }

    async fn put_meta(&self, index: &str, id: &str, body: &JsonValue) -> anyhow::Result<()> {
        let url = self.url(&format!("{index}/_doc/{id}"))?;
        self.client
            .put(url)
            .json(body)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to write meta doc {id}"))?;
        Ok(())
    }

    async fn delete_meta(&self, index: &str, id: &str) -> anyhow::Result<()> {
        let url = self.url(&format!("{index}/_doc/{id}"))?;
        let response = self.client.delete(url).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            response.error_for_status()?;
        }
        Ok(())
    }
}
