//! Client for the embed endpoint, which renders a primary-store object into
//! its indexable form. Rendering itself is an external collaborator; the
//! pipeline only consumes its output.

use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use common::types::Uid;
use serde_json::Value as JsonValue;
use url::Url;

/// A rendered document, ready to be written to the per-type index.
#[derive(Clone, Debug)]
pub struct IndexDocument {
    pub item_type: String,
    /// UIDs whose content is folded into this document. Always includes the
    /// document's own UID.
    pub embedded_uuids: BTreeSet<Uid>,
    /// UIDs referenced by identity only.
    pub linked_uuids: BTreeSet<Uid>,
    /// The full renderable body, `item_type` and UID sets included.
    pub body: JsonValue,
}

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// The primary-store session is poisoned; the worker's transaction must
    /// roll back before any further rendering.
    #[error("statement error rendering {uid}")]
    Statement {
        uid: Uid,
        #[source]
        source: anyhow::Error,
    },

    /// Recorded against the UID; the cycle continues.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, uid: &Uid) -> Result<IndexDocument, RenderError>;
}

fn parse_uid_set(body: &JsonValue, field: &str) -> anyhow::Result<BTreeSet<Uid>> {
    let Some(value) = body.get(field) else {
        return Ok(BTreeSet::new());
    };
    let items: Vec<String> = serde_json::from_value(value.clone())
        .with_context(|| format!("embed endpoint returned malformed {field}"))?;
    items.iter().map(|s| s.parse()).collect()
}

pub(crate) fn parse_index_document(uid: &Uid, body: JsonValue) -> anyhow::Result<IndexDocument> {
    let item_type = body
        .get("item_type")
        .and_then(|v| v.as_str())
        .context("embed endpoint response missing item_type")?
        .to_owned();
    let embedded_uuids = parse_uid_set(&body, "embedded_uuids")?;
    let linked_uuids = parse_uid_set(&body, "linked_uuids")?;
    anyhow::ensure!(
        embedded_uuids.contains(uid),
        "embed endpoint rendered {uid} without embedding it"
    );
    Ok(IndexDocument {
        item_type,
        embedded_uuids,
        linked_uuids,
        body,
    })
}

/// Renders through the local application's `/{uid}/@@index-data` view.
pub struct HttpRenderer {
    base: Url,
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(base: Url) -> anyhow::Result<Self> {
        Ok(Self {
            base,
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl DocumentRenderer for HttpRenderer {
    async fn render(&self, uid: &Uid) -> Result<IndexDocument, RenderError> {
        let url = self
            .base
            .join(&format!("{uid}/@@index-data"))
            .context("bad embed endpoint url")?;
        let body: JsonValue = self
            .client
            .get(url)
            .send()
            .await
            .context("embed endpoint unreachable")?
            .error_for_status()
            .context("embed endpoint failed")?
            .json()
            .await
            .context("embed endpoint returned non-json")?;
        Ok(parse_index_document(uid, body)?)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::{
        collections::{
            BTreeMap,
            VecDeque,
        },
        sync::Arc,
    };

    use async_trait::async_trait;
    use common::types::Uid;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::{
        parse_index_document,
        DocumentRenderer,
        IndexDocument,
        RenderError,
    };

    #[derive(Clone, Copy, Debug)]
    pub enum RenderFailure {
        Statement,
        Other,
    }

    #[derive(Default)]
    struct Inner {
        failures: BTreeMap<String, VecDeque<RenderFailure>>,
        renders: BTreeMap<String, u32>,
    }

    /// Renders a canned document per UID: its own UID embedded, plus any
    /// scripted embeds and links.
    #[derive(Clone, Default)]
    pub struct FakeRenderer {
        docs: Arc<Mutex<BTreeMap<Uid, IndexDocument>>>,
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeRenderer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a renderable object. `embeds`/`links` are the other
        /// UIDs the rendition folds in or references.
        pub fn add_object(
            &self,
            uid: &Uid,
            item_type: &str,
            embeds: impl IntoIterator<Item = Uid>,
            links: impl IntoIterator<Item = Uid>,
        ) {
            let mut embedded: Vec<String> = embeds.into_iter().map(|u| u.to_string()).collect();
            embedded.push(uid.to_string());
            let linked: Vec<String> = links.into_iter().map(|u| u.to_string()).collect();
            let body = json!({
                "uuid": uid.to_string(),
                "item_type": item_type,
                "embedded_uuids": embedded,
                "linked_uuids": linked,
            });
            let doc = parse_index_document(uid, body).expect("fake rendition must parse");
            self.docs.lock().insert(uid.clone(), doc);
        }

        pub fn inject_render_failures(
            &self,
            uid: &Uid,
            failures: impl IntoIterator<Item = RenderFailure>,
        ) {
            self.inner
                .lock()
                .failures
                .entry(uid.to_string())
                .or_default()
                .extend(failures);
        }

        pub fn render_count(&self, uid: &Uid) -> u32 {
            self.inner
                .lock()
                .renders
                .get(uid.as_str())
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl DocumentRenderer for FakeRenderer {
        async fn render(&self, uid: &Uid) -> Result<IndexDocument, RenderError> {
            {
                let mut inner = self.inner.lock();
                *inner.renders.entry(uid.to_string()).or_default() += 1;
                if let Some(queue) = inner.failures.get_mut(uid.as_str()) {
                    match queue.pop_front() {
                        Some(RenderFailure::Statement) => {
                            return Err(RenderError::Statement {
                                uid: uid.clone(),
                                source: anyhow::anyhow!("injected statement error"),
                            });
                        },
                        Some(RenderFailure::Other) => {
                            return Err(RenderError::Other(anyhow::anyhow!(
                                "injected render error for {uid}"
                            )));
                        },
                        None => {},
                    }
                }
            }
            self.docs
                .lock()
                .get(uid)
                .cloned()
                .ok_or_else(|| RenderError::Other(anyhow::anyhow!("no such object {uid}")))
        }
    }
}
