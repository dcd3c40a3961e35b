//! Primary-store access for the reindex pipeline: the snapshot coordinator,
//! the transaction-log scan, and worker-side snapshot bindings.
//!
//! The coordinator pins one read-only transaction per cycle. In primary mode
//! it runs serializable+deferrable so the exported snapshot is stable; on a
//! standby that isolation level is unavailable, so recovery mode degrades to
//! read committed and workers accept weaker cross-worker consistency.

use std::collections::BTreeSet;

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
use tokio::task::JoinHandle;
use tokio_postgres::{
    Client,
    NoTls,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

const CURRENT_XMIN_SQL: &str = "SELECT txid_snapshot_xmin(txid_current_snapshot())";

/// The primary transactional store, as seen by the pipeline: monotonic
/// transaction ids, a scannable transaction log, and snapshot export.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Begin the cycle's read-only transaction and return the lowest
    /// still-in-progress transaction id. Rolls back any previous cycle
    /// transaction first.
    async fn current_xmin(&self, recovery: bool) -> anyhow::Result<Xid>;

    /// Mint a transferable snapshot token from the cycle transaction. Minting
    /// creates a new transaction id, so callers only do this when there is
    /// actual work. Unavailable in recovery mode.
    async fn export_snapshot(&self) -> anyhow::Result<SnapshotToken>;

    /// Roll back the cycle transaction, releasing the exported snapshot.
    async fn release_snapshot(&self) -> anyhow::Result<()>;

    /// All transaction records with `xid >= since`.
    async fn scan_transactions(&self, since: Xid) -> anyhow::Result<Vec<TransactionRecord>>;

    /// Every object UID, optionally restricted to the given item types.
    async fn all_uids(&self, types: Option<&BTreeSet<String>>) -> anyhow::Result<BTreeSet<Uid>>;

    /// Worker-side: open a private connection, enter the exported snapshot
    /// (or a plain read-committed transaction when `token` is `None`), and
    /// block until the connection's xmin has reached `xmin`. Lagging past the
    /// bind timeout is fatal to the cycle.
    async fn bind_snapshot(
        &self,
        token: Option<&SnapshotToken>,
        xmin: Xid,
    ) -> anyhow::Result<Box<dyn SnapshotBinding>>;
}

/// A worker's pinned, never-commit transaction. Dropped bindings roll back
/// when their connection task is aborted; `release` does so eagerly.
#[async_trait]
pub trait SnapshotBinding: Send {
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

struct Conn {
    client: Client,
    handle: JoinHandle<()>,
}

impl Conn {
    async fn open(config: &tokio_postgres::Config) -> anyhow::Result<Self> {
        let (client, connection) = config.connect(NoTls).await?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("postgres connection error: {e}");
            }
        });
        Ok(Self { client, handle })
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Coordinator {
    conn: Conn,
    in_txn: bool,
}

pub struct PostgresPrimary {
    config: tokio_postgres::Config,
    coordinator: tokio::sync::Mutex<Coordinator>,
}

impl PostgresPrimary {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let config: tokio_postgres::Config = url.parse()?;
        let conn = Conn::open(&config).await?;
        Ok(Self {
            config,
            coordinator: tokio::sync::Mutex::new(Coordinator {
                conn,
                in_txn: false,
            }),
        })
    }
}

async fn query_xmin(client: &Client) -> anyhow::Result<Xid> {
    let row = client.query_one(CURRENT_XMIN_SQL, &[]).await?;
    let xmin: i64 = row.try_get(0)?;
    Ok(Xid(xmin as u64))
}

fn parse_uid_array(value: Option<&serde_json::Value>) -> anyhow::Result<BTreeSet<Uid>> {
    let Some(value) = value else {
        return Ok(BTreeSet::new());
    };
    let items: Vec<String> = serde_json::from_value(value.clone())?;
    items.iter().map(|s| s.parse()).collect()
}

#[async_trait]
impl PrimaryStore for PostgresPrimary {
    async fn current_xmin(&self, recovery: bool) -> anyhow::Result<Xid> {
        let mut coordinator = self.coordinator.lock().await;
        if coordinator.in_txn {
            coordinator.conn.client.batch_execute("ROLLBACK").await?;
            coordinator.in_txn = false;
        }
        // DEFERRABLE prevents query cancellation due to conflicts but
        // requires SERIALIZABLE, which is unavailable in recovery.
        let begin = if recovery {
            "BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED, READ ONLY"
        } else {
            "BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE"
        };
        coordinator.conn.client.batch_execute(begin).await?;
        coordinator.in_txn = true;
        query_xmin(&coordinator.conn.client).await
    }

    async fn export_snapshot(&self) -> anyhow::Result<SnapshotToken> {
        let coordinator = self.coordinator.lock().await;
        anyhow::ensure!(
            coordinator.in_txn,
            "export_snapshot outside a cycle transaction"
        );
        let row = coordinator
            .conn
            .client
            .query_one("SELECT pg_export_snapshot()", &[])
            .await?;
        Ok(SnapshotToken(row.try_get(0)?))
    }

    async fn release_snapshot(&self) -> anyhow::Result<()> {
        let mut coordinator = self.coordinator.lock().await;
        if coordinator.in_txn {
            coordinator.conn.client.batch_execute("ROLLBACK").await?;
            coordinator.in_txn = false;
        }
        Ok(())
    }

    async fn scan_transactions(&self, since: Xid) -> anyhow::Result<Vec<TransactionRecord>> {
        let coordinator = self.coordinator.lock().await;
        let rows = coordinator
            .conn
            .client
            .query(
                "SELECT xid, \"timestamp\", data FROM transactions WHERE xid >= $1 ORDER BY xid",
                &[&(since.0 as i64)],
            )
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let xid: i64 = row.try_get(0)?;
            let timestamp: DateTime<Utc> = row.try_get(1)?;
            let data: serde_json::Value = row.try_get(2)?;
            records.push(TransactionRecord {
                xid: Xid(xid as u64),
                timestamp,
                updated: parse_uid_array(data.get("updated"))?,
                renamed: parse_uid_array(data.get("renamed"))?,
            });
        }
        Ok(records)
    }

    async fn all_uids(&self, types: Option<&BTreeSet<String>>) -> anyhow::Result<BTreeSet<Uid>> {
        let coordinator = self.coordinator.lock().await;
        let rows = match types {
            Some(types) => {
                let types: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
                coordinator
                    .conn
                    .client
                    .query(
                        "SELECT rid::text FROM resources WHERE item_type = ANY($1)",
                        &[&types],
                    )
                    .await?
            },
            None => {
                coordinator
                    .conn
                    .client
                    .query("SELECT rid::text FROM resources", &[])
                    .await?
            },
        };
        rows.iter()
            .map(|row| {
                let rid: String = row.try_get(0)?;
                rid.parse()
            })
            .collect()
    }

    async fn bind_snapshot(
        &self,
        token: Option<&SnapshotToken>,
        xmin: Xid,
    ) -> anyhow::Result<Box<dyn SnapshotBinding>> {
        let conn = Conn::open(&self.config).await?;
        match token {
            Some(token) => {
                conn.client
                    .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
                    .await?;
                // SET TRANSACTION SNAPSHOT takes no bind parameters. Tokens
                // from pg_export_snapshot never contain quotes; a corrupt one
                // must not escape the literal.
                let token = token.0.replace('\'', "");
                conn.client
                    .batch_execute(&format!("SET TRANSACTION SNAPSHOT '{token}'"))
                    .await?;
            },
            None => {
                conn.client
                    .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED, READ ONLY")
                    .await?;
            },
        }
        let wait_for_xmin = async {
            loop {
                let db_xmin = query_xmin(&conn.client).await?;
                if db_xmin >= xmin {
                    return anyhow::Ok(());
                }
                tracing::info!("Waiting for xmin {db_xmin} to reach {xmin}");
                // Read committed takes a fresh snapshot per statement, so a
                // lagging standby eventually catches up within this txn.
                tokio::time::sleep(*SNAPSHOT_BIND_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(*SNAPSHOT_BIND_TIMEOUT, wait_for_xmin)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for worker connection to reach xmin {xmin}"))??;
        Ok(Box::new(PgSnapshotBinding { conn }))
    }
}

struct PgSnapshotBinding {
    conn: Conn,
}

#[async_trait]
impl SnapshotBinding for PgSnapshotBinding {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        self.conn.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}
