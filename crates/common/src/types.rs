use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
};

use anyhow::Context;
use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

/// Length of a primary-store object identifier, e.g.
/// `09d05b87-4d30-4dfb-b243-3327005095f2`.
pub const UID_LEN: usize = 36;

/// Opaque identifier of a primary-store object, in hyphenated UUID form.
/// Immutable for the lifetime of the object, including across renames.
///
/// Every construction path validates the grammar, the deserialization of
/// externally submitted documents included. Identifiers end up interpolated
/// into search-store URLs, so nothing beyond UUID characters may get through.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct Uid(String);

impl Uid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Uid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        // The length check pins the hyphenated form; `Uuid` alone also
        // accepts the 32-character simple form.
        anyhow::ensure!(
            s.len() == UID_LEN,
            "uid must be {UID_LEN} characters, got {} ({s:?})",
            s.len()
        );
        Uuid::try_parse(s).with_context(|| format!("uid is not a valid uuid ({s:?})"))?;
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Uid {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lowest still-in-progress transaction id at some instant. Doubles as the
/// monotonic cycle watermark and as the external version stamped on every
/// document written in that cycle.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Xid(pub u64);

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Xid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(Self(s.parse()?))
    }
}

/// Token minted by `pg_export_snapshot()`, transferable to worker connections
/// so they enter the same snapshot as the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotToken(pub String);

/// One committed primary-store transaction, as recorded in the transaction
/// log. Append-only from the pipeline's point of view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionRecord {
    pub xid: Xid,
    pub timestamp: DateTime<Utc>,
    /// Objects whose content changed.
    pub updated: BTreeSet<Uid>,
    /// Objects whose identifier-visible key changed.
    pub renamed: BTreeSet<Uid>,
}

/// A per-UID indexing failure, accumulated during the run and persisted with
/// the final cycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidError {
    pub uuid: Uid,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

impl UidError {
    pub fn new(uid: Uid, message: impl Into<String>) -> Self {
        Self {
            uuid: uid,
            error_message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
