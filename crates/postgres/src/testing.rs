//! In-memory primary store for tests: a scripted transaction log, an object
//! table, and snapshot bookkeeping that mimics the coordinator contract.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    Utc,
};
use common::{
    knobs::{
        SNAPSHOT_BIND_POLL_INTERVAL,
        SNAPSHOT_BIND_TIMEOUT,
    },
    types::{
        SnapshotToken,
        TransactionRecord,
        Uid,
        Xid,
    },
};
use parking_lot::Mutex;

use crate::{
    PrimaryStore,
    SnapshotBinding,
};

#[derive(Default)]
struct Inner {
    xmin: Xid,
    /// What worker connections observe; lags `xmin` on a simulated standby.
    worker_xmin: Option<Xid>,
    txns: Vec<TransactionRecord>,
    objects: BTreeMap<Uid, String>,
    exports: u32,
    bindings_opened: u32,
    bindings_unreleased: u32,
}

#[derive(Clone, Default)]
pub struct FakePrimary {
    inner: Arc<Mutex<Inner>>,
}

impl FakePrimary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_xmin(&self, xmin: Xid) {
        self.inner.lock().xmin = xmin;
    }

    /// Make worker connections lag the coordinator, as on a standby.
    pub fn set_worker_xmin(&self, xmin: Xid) {
        self.inner.lock().worker_xmin = Some(xmin);
    }

    pub fn add_object(&self, uid: Uid, item_type: impl Into<String>) {
        self.inner.lock().objects.insert(uid, item_type.into());
    }

    pub fn add_transaction(
        &self,
        xid: Xid,
        timestamp: DateTime<Utc>,
        updated: impl IntoIterator<Item = Uid>,
        renamed: impl IntoIterator<Item = Uid>,
    ) {
        let mut inner = self.inner.lock();
        inner.txns.push(TransactionRecord {
            xid,
            timestamp,
            updated: updated.into_iter().collect(),
            renamed: renamed.into_iter().collect(),
        });
        if inner.xmin <= xid {
            inner.xmin = Xid(xid.0 + 1);
        }
    }

    pub fn snapshot_exports(&self) -> u32 {
        self.inner.lock().exports
    }

    pub fn bindings_opened(&self) -> u32 {
        self.inner.lock().bindings_opened
    }

    pub fn bindings_unreleased(&self) -> u32 {
        self.inner.lock().bindings_unreleased
    }
}

#[async_trait]
impl PrimaryStore for FakePrimary {
    async fn current_xmin(&self, _recovery: bool) -> anyhow::Result<Xid> {
        Ok(self.inner.lock().xmin)
    }

    async fn export_snapshot(&self) -> anyhow::Result<SnapshotToken> {
        let mut inner = self.inner.lock();
        inner.exports += 1;
        Ok(SnapshotToken(format!("fake-snapshot-{}", inner.exports)))
    }

    async fn release_snapshot(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn scan_transactions(&self, since: Xid) -> anyhow::Result<Vec<TransactionRecord>> {
        Ok(self
            .inner
            .lock()
            .txns
            .iter()
            .filter(|txn| txn.xid >= since)
            .cloned()
            .collect())
    }

    async fn all_uids(&self, types: Option<&BTreeSet<String>>) -> anyhow::Result<BTreeSet<Uid>> {
        Ok(self
            .inner
            .lock()
            .objects
            .iter()
            .filter(|(_, item_type)| types.is_none_or(|t| t.contains(*item_type)))
            .map(|(uid, _)| uid.clone())
            .collect())
    }

    async fn bind_snapshot(
        &self,
        _token: Option<&SnapshotToken>,
        xmin: Xid,
    ) -> anyhow::Result<Box<dyn SnapshotBinding>> {
        let wait_for_xmin = async {
            loop {
                let seen = {
                    let inner = self.inner.lock();
                    inner.worker_xmin.unwrap_or(inner.xmin)
                };
                if seen >= xmin {
                    return;
                }
                tokio::time::sleep(*SNAPSHOT_BIND_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(*SNAPSHOT_BIND_TIMEOUT, wait_for_xmin)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for worker connection to reach xmin {xmin}"))?;
        {
            let mut inner = self.inner.lock();
            inner.bindings_opened += 1;
            inner.bindings_unreleased += 1;
        }
        Ok(Box::new(FakeBinding {
            inner: self.inner.clone(),
        }))
    }
}

struct FakeBinding {
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl SnapshotBinding for FakeBinding {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        self.inner.lock().bindings_unreleased -= 1;
        Ok(())
    }
}
