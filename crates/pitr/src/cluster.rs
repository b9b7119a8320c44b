//! Privileged SQL access to one cluster node.
//!
//! All GTID set algebra is delegated to the server (`GTID_SUBTRACT`,
//! `GTID_SUBSET`) so the semantics stay bit-exact with MySQL. Binlog
//! introspection goes through the `binlog_utils_udf.so` helper functions,
//! which are created lazily before first use and dropped again before a
//! replay so the replayed DDL never collides with them.
//!
//! Connections use the admin port, which bypasses `max_connections` on a
//! cluster that is still warming up after a restore.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Pool, Row};
use tracing::{debug, warn};

use crate::error::{PitrError, Result};
use crate::gtid::GtidSet;
use crate::types::SensitiveString;

/// Percona's dedicated admin connection port
pub const ADMIN_PORT: u16 = 33062;

const BINLOG_UDF_LIBRARY: &str = "binlog_utils_udf.so";
const MISSING_BINLOG_MARKER: &str = "Binary log does not exist";

/// One binary log file as reported by `SHOW BINARY LOGS`
#[derive(Debug, Clone)]
pub struct Binlog {
    pub name: String,
    pub size: u64,
    pub encrypted: String,
}

/// Server-side GTID set arithmetic.
///
/// The planner only needs this narrow slice of the gateway, which keeps it
/// testable against an in-memory implementation.
#[async_trait]
pub trait GtidSetOps: Send + Sync {
    /// `GTID_SUBTRACT(set, sub)`: the transactions in `set` but not in `sub`
    async fn subtract(&self, set: &str, sub: &str) -> Result<String>;

    /// `GTID_SUBSET(sub, set)`: whether every transaction of `sub` is in `set`
    async fn subset(&self, sub: &str, set: &str) -> Result<bool>;

    /// The node's `@@GLOBAL.gtid_executed`
    async fn executed_set(&self) -> Result<String>;
}

/// Connection manager for one cluster node
pub struct ClusterGateway {
    pool: Pool,
    host: String,
}

impl ClusterGateway {
    /// Set up a lazy connection pool against `host` on the admin port.
    /// Errors surface on first use.
    pub fn connect(host: &str, user: &str, pass: &SensitiveString) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(ADMIN_PORT)
            .user(Some(user))
            .pass(Some(pass.expose_secret()));
        Self {
            pool: Pool::new(opts),
            host: host.to_string(),
        }
    }

    /// The node this gateway talks to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Close all pooled connections
    pub async fn close(self) -> Result<()> {
        self.pool
            .disconnect()
            .await
            .map_err(|e| PitrError::cluster("disconnect", e))
    }

    async fn conn(&self) -> Result<Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| PitrError::cluster("get connection", e))
    }

    /// Create `name` from the helper library unless `mysql.func` already has
    /// it. The pre-check makes repeated registration a no-op.
    async fn ensure_udf(&self, conn: &mut Conn, name: &str, returns: &str) -> Result<()> {
        let existing: Option<String> = conn
            .exec_first("SELECT name FROM mysql.func WHERE name = ?", (name,))
            .await
            .map_err(|e| PitrError::cluster("get udf name", e))?;
        if existing.is_none() {
            debug!(function = name, "installing binlog helper function");
            conn.query_drop(format!(
                "CREATE FUNCTION {name} RETURNS {returns} SONAME '{BINLOG_UDF_LIBRARY}'"
            ))
            .await
            .map_err(|e| PitrError::cluster("create function", e))?;
        }
        Ok(())
    }

    /// First record timestamp of `binlog`, in epoch seconds
    pub async fn first_timestamp(&self, binlog: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        self.ensure_udf(&mut conn, "get_first_record_timestamp_by_binlog", "INTEGER")
            .await?;
        let ts: Option<String> = conn
            .exec_first(
                "SELECT get_first_record_timestamp_by_binlog(?) DIV 1000000",
                (binlog,),
            )
            .await
            .map_err(|e| PitrError::cluster("scan binlog timestamp", e))?;
        Ok(ts.unwrap_or_default())
    }

    /// Last record timestamp of `binlog`, in epoch seconds
    pub async fn last_timestamp(&self, binlog: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        self.ensure_udf(&mut conn, "get_last_record_timestamp_by_binlog", "INTEGER")
            .await?;
        let ts: Option<String> = conn
            .exec_first(
                "SELECT get_last_record_timestamp_by_binlog(?) DIV 1000000",
                (binlog,),
            )
            .await
            .map_err(|e| PitrError::cluster("scan binlog timestamp", e))?;
        Ok(ts.unwrap_or_default())
    }

    /// GTID set contained in `binlog`. A binlog the server no longer has
    /// yields the empty set, not an error; purged logs are normal.
    pub async fn gtid_set_of_binlog(&self, binlog: &str) -> Result<GtidSet> {
        let mut conn = self.conn().await?;
        self.ensure_udf(&mut conn, "get_gtid_set_by_binlog", "STRING")
            .await?;
        match conn
            .exec_first::<String, _, _>("SELECT get_gtid_set_by_binlog(?)", (binlog,))
            .await
        {
            Ok(set) => Ok(GtidSet::new(set.unwrap_or_default())),
            Err(e) if e.to_string().contains(MISSING_BINLOG_MARKER) => Ok(GtidSet::default()),
            Err(e) => Err(PitrError::cluster("scan gtid set", e)),
        }
    }

    /// `SHOW BINARY LOGS`, then rotate with `FLUSH BINARY LOGS` so the
    /// archiver sees a closed final segment
    pub async fn binlogs(&self) -> Result<Vec<Binlog>> {
        let mut conn = self.conn().await?;
        let rows: Vec<Row> = conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| PitrError::cluster("show binary logs", e))?;
        let binlogs = rows
            .iter()
            .map(row_to_binlog)
            .collect::<Result<Vec<_>>>()?;
        conn.query_drop("FLUSH BINARY LOGS")
            .await
            .map_err(|e| PitrError::cluster("flush binary logs", e))?;
        Ok(binlogs)
    }

    /// Binary log names without rotating
    pub async fn binlog_names(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let rows: Vec<Row> = conn
            .query("SHOW BINARY LOGS")
            .await
            .map_err(|e| PitrError::cluster("show binary logs", e))?;
        Ok(rows
            .iter()
            .map(row_to_binlog)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|b| b.name)
            .collect())
    }

    /// Hosts of cluster members currently ONLINE
    pub async fn healthy_members(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.query(
            "SELECT MEMBER_HOST FROM performance_schema.replication_group_members \
             WHERE MEMBER_STATE = 'ONLINE'",
        )
        .await
        .map_err(|e| PitrError::cluster("select replication_group_members", e))
    }

    /// Drop the binlog helper functions so replayed DDL cannot collide with
    /// them. `IF EXISTS` keeps this safe whether or not they were installed.
    pub async fn drop_helpers(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        for function in [
            "get_first_record_timestamp_by_binlog",
            "get_binlog_by_gtid_set",
            "get_gtid_set_by_binlog",
        ] {
            conn.query_drop(format!("DROP FUNCTION IF EXISTS {function}"))
                .await
                .map_err(|e| PitrError::cluster("drop helper function", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl GtidSetOps for ClusterGateway {
    async fn subtract(&self, set: &str, sub: &str) -> Result<String> {
        let mut conn = self.conn().await?;
        let result: Option<String> = conn
            .exec_first("SELECT GTID_SUBTRACT(?, ?)", (set, sub))
            .await
            .map_err(|e| PitrError::cluster("scan gtid subtract result", e))?;
        Ok(result.unwrap_or_default())
    }

    async fn subset(&self, sub: &str, set: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let result: Option<i64> = conn
            .exec_first("SELECT GTID_SUBSET(?, ?)", (sub, set))
            .await
            .map_err(|e| PitrError::cluster("scan gtid subset result", e))?;
        Ok(result == Some(1))
    }

    async fn executed_set(&self) -> Result<String> {
        let mut conn = self.conn().await?;
        let result: Option<String> = conn
            .query_first("SELECT @@GLOBAL.gtid_executed")
            .await
            .map_err(|e| PitrError::cluster("scan current gtid_executed result", e))?;
        Ok(result.unwrap_or_default())
    }
}

fn row_to_binlog(row: &Row) -> Result<Binlog> {
    let (Some(name), Some(size)) = (row.get::<String, _>(0), row.get::<u64, _>(1)) else {
        return Err(PitrError::Cluster(
            "unexpected SHOW BINARY LOGS row shape".to_string(),
        ));
    };
    // The Encrypted column only exists on servers with binlog encryption
    // support; absent means plaintext.
    let encrypted = row.get::<String, _>(2).unwrap_or_else(|| "No".to_string());
    Ok(Binlog {
        name,
        size,
        encrypted,
    })
}

/// Keep only the hosts an ONLINE quorum member also considers ONLINE.
///
/// Probes the given hosts in order until one answers the membership query;
/// per-host failures are logged and skipped.
pub async fn filter_healthy_members(
    hosts: &[String],
    user: &str,
    pass: &SensitiveString,
) -> Result<Vec<String>> {
    let mut members = Vec::new();
    for host in hosts {
        let gateway = ClusterGateway::connect(host, user, pass);
        let result = gateway.healthy_members().await;
        if let Err(e) = gateway.close().await {
            warn!(%host, error = %e, "closing probe connection failed");
        }
        match result {
            Ok(found) if !found.is_empty() => {
                members = found;
                break;
            }
            Ok(_) => {}
            Err(e) => warn!(%host, error = %e, "cluster membership query failed"),
        }
    }
    if members.is_empty() {
        return Err(PitrError::Cluster(
            "no healthy cluster members detected".to_string(),
        ));
    }

    let healthy: Vec<String> = hosts
        .iter()
        .filter(|host| members.contains(host))
        .cloned()
        .collect();
    if healthy.is_empty() {
        return Err(PitrError::Cluster(
            "no healthy cluster members found in provided hosts".to_string(),
        ));
    }
    Ok(healthy)
}

/// The host whose oldest binlog has the earliest first-record timestamp;
/// the archiver collects from it to cover the longest history.
pub async fn oldest_binlog_host(
    hosts: &[String],
    user: &str,
    pass: &SensitiveString,
) -> Result<String> {
    let mut oldest: Option<(String, i64)> = None;
    for host in hosts {
        match host_first_binlog_time(host, user, pass).await {
            Ok(ts) => {
                if oldest.as_ref().is_none_or(|(_, best)| ts < *best) {
                    oldest = Some((host.clone(), ts));
                }
            }
            Err(e) => warn!(%host, error = %e, "binlog time probe failed"),
        }
    }
    oldest
        .map(|(host, _)| host)
        .ok_or_else(|| PitrError::Cluster("can't find host with readable binlogs".to_string()))
}

async fn host_first_binlog_time(
    host: &str,
    user: &str,
    pass: &SensitiveString,
) -> Result<i64> {
    let gateway = ClusterGateway::connect(host, user, pass);
    let result = first_binlog_time(&gateway).await;
    if let Err(e) = gateway.close().await {
        warn!(%host, error = %e, "closing probe connection failed");
    }
    result
}

async fn first_binlog_time(gateway: &ClusterGateway) -> Result<i64> {
    let names = gateway.binlog_names().await?;
    if names.is_empty() {
        return Err(PitrError::Cluster(format!(
            "no binlogs found on {}",
            gateway.host()
        )));
    }
    for name in names {
        match gateway.first_timestamp(&name).await {
            Ok(ts) => {
                if let Ok(ts) = ts.parse::<i64>() {
                    if ts > 0 {
                        return Ok(ts);
                    }
                }
            }
            Err(e) => warn!(binlog = %name, error = %e, "binlog timestamp query failed"),
        }
    }
    Err(PitrError::Cluster(format!(
        "no binlog timestamps found on {}",
        gateway.host()
    )))
}
