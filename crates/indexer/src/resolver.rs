//! Translates committed transactions (plus priority requests) into the set
//! of documents that must be rebuilt, expanding transitively through the
//! index's back-reference fields.

use std::collections::BTreeSet;

use chrono::{
    DateTime,
    Utc,
};
use common::{
    knobs::{
        MAX_CLAUSES,
        SEARCH_MAX,
    },
    types::{
        Uid,
        Xid,
    },
};
use postgres::PrimaryStore;
use search::{
    SearchStore,
    RESOURCES_INDEX,
};

/// Ceilings for the invalidation query. Exceeding either widens to a full
/// reindex, which is always sound, never silently partial.
#[derive(Clone, Copy, Debug)]
pub struct ResolveLimits {
    /// The search backend's boolean-clause limit.
    pub max_clauses: usize,
    /// Size cap on the invalidation query result.
    pub search_max: usize,
}

impl ResolveLimits {
    pub fn from_knobs() -> Self {
        Self {
            max_clauses: *MAX_CLAUSES,
            search_max: *SEARCH_MAX,
        }
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub uids: BTreeSet<Uid>,
    pub full_reindex: bool,
    pub txn_count: u64,
    pub max_xid: Option<Xid>,
    pub updated: u64,
    pub renamed: u64,
    /// Documents pulled in only because they reference an updated or renamed
    /// UID.
    pub referencing: u64,
    pub first_txn_timestamp: Option<DateTime<Utc>>,
}

impl Resolution {
    fn full(uids: BTreeSet<Uid>) -> Self {
        Self {
            uids,
            full_reindex: true,
            ..Default::default()
        }
    }
}

/// Compute the invalidation set for one cycle.
///
/// `last_xmin == None` means the first ever cycle (or wiped state): every UID
/// of the matching types is stale by definition.
pub async fn resolve(
    primary: &dyn PrimaryStore,
    search: &dyn SearchStore,
    last_xmin: Option<Xid>,
    priority_uids: &BTreeSet<Uid>,
    types: Option<&BTreeSet<String>>,
    limits: ResolveLimits,
) -> anyhow::Result<Resolution> {
    let Some(last_xmin) = last_xmin else {
        return Ok(Resolution::full(primary.all_uids(types).await?));
    };

    let txns = primary.scan_transactions(last_xmin).await?;
    let mut updated: BTreeSet<Uid> = BTreeSet::new();
    let mut renamed: BTreeSet<Uid> = BTreeSet::new();
    let mut max_xid = None;
    let mut first_txn_timestamp: Option<DateTime<Utc>> = None;
    let txn_count = txns.len() as u64;
    for txn in txns {
        max_xid = max_xid.max(Some(txn.xid));
        first_txn_timestamp = match first_txn_timestamp {
            Some(first) => Some(first.min(txn.timestamp)),
            None => Some(txn.timestamp),
        };
        updated.extend(txn.updated);
        renamed.extend(txn.renamed);
    }

    // An explicit reindex request is treated like a content update.
    updated.extend(priority_uids.iter().cloned());

    let updated_count = updated.len() as u64;
    let renamed_count = renamed.len() as u64;
    let counts = |mut resolution: Resolution| {
        resolution.txn_count = txn_count;
        resolution.max_xid = max_xid;
        resolution.updated = updated_count;
        resolution.renamed = renamed_count;
        resolution.first_txn_timestamp = first_txn_timestamp;
        resolution
    };

    if updated.is_empty() && renamed.is_empty() {
        return Ok(counts(Resolution::default()));
    }

    if updated.len() + renamed.len() > limits.max_clauses {
        return Ok(counts(Resolution::full(primary.all_uids(None).await?)));
    }

    // Recently written documents must be visible before the query.
    search.refresh(RESOURCES_INDEX).await?;
    let related = search
        .related_uids(RESOURCES_INDEX, &updated, &renamed, limits.search_max)
        .await?;
    if related.total > limits.search_max as u64 {
        return Ok(counts(Resolution::full(primary.all_uids(None).await?)));
    }

    let referencing = related.hits.len() as u64;
    let mut uids = related.hits;
    uids.extend(updated);
    let mut resolution = counts(Resolution {
        uids,
        full_reindex: false,
        ..Default::default()
    });
    resolution.referencing = referencing;
    Ok(resolution)
}
