//! Binlog selection and stop-flag planning.
//!
//! The planner decides which archived segments must replay and how the
//! decoder is told to stop. Selection walks the archive newest-first: the
//! first segment whose sidecar set intersects the cluster's executed set is
//! the last one that can contain unapplied work, and every older segment is
//! already covered, so the walk stops there and the chosen list is reversed
//! back into replay order.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use chrono::NaiveDateTime;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::GtidSetOps;
use crate::error::{PitrError, Result};
use crate::gtid;
use crate::storage::BinlogStore;
use crate::types::SensitiveString;

/// Name prefix of archived binlog segment objects
pub const BINLOG_PREFIX: &str = "binlog_";
/// Suffix of the per-segment GTID set sidecar objects
pub const GTID_SET_SUFFIX: &str = "-gtid-set";

/// `PITR_DATE` layout. Naive: the server interprets the resulting
/// `--stop-datetime` in its session time zone.
const DATE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Where the replay stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverMode {
    /// Apply every archived segment
    Latest,
    /// Stop at a wall-clock time
    Date,
    /// Stop right before an exact transaction
    Transaction,
    /// Apply everything but one transaction
    Skip,
}

impl FromStr for RecoverMode {
    type Err = PitrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latest" => Ok(Self::Latest),
            "date" => Ok(Self::Date),
            "transaction" => Ok(Self::Transaction),
            "skip" => Ok(Self::Skip),
            other => Err(PitrError::config(format!(
                "unknown recovery type {other:?}, expected latest, date, transaction or skip"
            ))),
        }
    }
}

impl fmt::Display for RecoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Latest => "latest",
            Self::Date => "date",
            Self::Transaction => "transaction",
            Self::Skip => "skip",
        })
    }
}

/// What to recover and where
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub host: String,
    pub user: String,
    pub pass: SensitiveString,
    pub mode: RecoverMode,
    /// Required for [`RecoverMode::Date`], layout `YYYY-MM-DD HH:MM:SS`
    pub recover_time: Option<String>,
    /// Required for [`RecoverMode::Transaction`] and [`RecoverMode::Skip`],
    /// layout `uuid:N`
    pub gtid: Option<String>,
}

impl RecoveryRequest {
    /// Check mode-conditional requirements before touching the network
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            RecoverMode::Date if self.recover_time.is_none() => Err(PitrError::config(
                "PITR_DATE is required for date recovery",
            )),
            RecoverMode::Transaction | RecoverMode::Skip if self.gtid.is_none() => {
                Err(PitrError::config(format!(
                    "PITR_GTID is required for {} recovery",
                    self.mode
                )))
            }
            _ => Ok(()),
        }
    }
}

/// The planner's output: segments in replay order plus the decoder cut-off
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Segment object names, ascending archive order
    pub segments: Vec<String>,
    /// Literal flag fragment for the `mysqlbinlog` command line; empty for
    /// latest recovery
    pub stop_flag: String,
    /// Date-mode cut-off in epoch seconds; segments named after this moment
    /// are not streamed at all
    pub stop_unix: Option<i64>,
}

/// Combines archive listings, sidecar GTID sets and server-side subtract
/// queries into a [`Plan`]
pub struct BinlogPlanner<'a> {
    store: &'a dyn BinlogStore,
    cluster: &'a dyn GtidSetOps,
    cancel: CancellationToken,
}

impl<'a> BinlogPlanner<'a> {
    pub fn new(
        store: &'a dyn BinlogStore,
        cluster: &'a dyn GtidSetOps,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            cluster,
            cancel,
        }
    }

    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.cancel.run_until_cancelled(fut).await {
            Some(result) => result,
            None => Err(PitrError::Cancelled),
        }
    }

    /// Transaction-mode preflight: the target must be a single `uuid:N` and
    /// must not already be part of the cluster's executed set.
    pub async fn preflight(&self, target: &str, start_gtid: &str) -> Result<()> {
        gtid::parse_target(target)?;
        let sub = self
            .guarded(self.cluster.subtract(start_gtid, target))
            .await?;
        if sub != start_gtid {
            return Err(PitrError::TargetBeforeBackup(target.to_string()));
        }
        Ok(())
    }

    /// Produce the replay plan for `request`, starting from the cluster's
    /// current executed set.
    pub async fn plan(&self, request: &RecoveryRequest, start_gtid: &str) -> Result<Plan> {
        request.validate()?;
        let target = match request.mode {
            RecoverMode::Transaction | RecoverMode::Skip => request.gtid.as_deref(),
            _ => None,
        };

        let (segments, exclude_set) = self
            .select_segments(request.mode, target, start_gtid)
            .await?;

        let mut plan = Plan {
            segments,
            ..Plan::default()
        };
        match request.mode {
            RecoverMode::Latest => {}
            RecoverMode::Date => {
                // validate() guarantees presence
                let raw = request.recover_time.as_deref().unwrap_or_default();
                let end = NaiveDateTime::parse_from_str(raw, DATE_LAYOUT).map_err(|e| {
                    PitrError::config(format!("invalid recovery date {raw:?}: {e}"))
                })?;
                plan.stop_flag = format!("--stop-datetime=\"{raw}\"");
                plan.stop_unix = Some(end.and_utc().timestamp());
            }
            RecoverMode::Skip => {
                let target = target.unwrap_or_default();
                plan.stop_flag = format!("--exclude-gtids=\"{target}\"");
            }
            RecoverMode::Transaction => {
                // A non-empty selection in transaction mode always produced
                // an exclude set; its absence means the target was never in
                // the archive.
                let set = exclude_set.ok_or_else(|| PitrError::NoApplicableBinlogs {
                    prefix: BINLOG_PREFIX.to_string(),
                    gtid: start_gtid.to_string(),
                })?;
                plan.stop_flag = format!("--exclude-gtids=\"{set}\"");
            }
        }

        info!(
            segments = plan.segments.len(),
            stop_flag = %plan.stop_flag,
            "replay plan ready"
        );
        Ok(plan)
    }

    /// Walk the archive newest-first accumulating segments until one is
    /// already contained in the cluster's executed set, then reverse into
    /// replay order. Returns the segments and, in transaction mode, the
    /// exclude set computed from the segment holding the target.
    async fn select_segments(
        &self,
        mode: RecoverMode,
        target: Option<&str>,
        start_gtid: &str,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut list = self.guarded(self.store.list(BINLOG_PREFIX)).await?;
        // Newest first: the containment test below only terminates the walk
        // when moving backward through archive time.
        list.reverse();

        info!(%start_gtid, "selecting binlog segments");
        let mut chosen = Vec::new();
        let mut exclude_set: Option<String> = None;

        for name in &list {
            if name.contains(GTID_SET_SUFFIX) {
                continue;
            }

            let sidecar = format!("{name}{GTID_SET_SUFFIX}");
            let mut reader = match self.guarded(self.store.get(&sidecar)).await {
                Ok(reader) => reader,
                Err(PitrError::Cancelled) => return Err(PitrError::Cancelled),
                Err(e) => {
                    // The archive may be sparse; a segment without a
                    // readable sidecar cannot be placed, so skip it.
                    warn!(segment = %name, error = %e, "skipping segment, gtid-set sidecar unavailable");
                    continue;
                }
            };
            let mut segment_set = String::new();
            match self
                .cancel
                .run_until_cancelled(reader.read_to_string(&mut segment_set))
                .await
            {
                None => return Err(PitrError::Cancelled),
                Some(read) => {
                    read.map_err(|e| PitrError::Storage(format!("read {sidecar}: {e}")))?;
                }
            }
            let segment_set = segment_set.trim().to_string();
            debug!(segment = %name, gtid_set = %segment_set, "checking candidate");

            if mode == RecoverMode::Transaction {
                if let Some(target) = target {
                    let sub = self
                        .guarded(self.cluster.subtract(&segment_set, target))
                        .await?;
                    if sub != segment_set {
                        // This segment contains the target transaction.
                        exclude_set = Some(gtid::extend_exclude_set(&segment_set, target)?);
                    }
                    if exclude_set.is_none() {
                        // Still past the target; nothing from here replays.
                        continue;
                    }
                }
            }

            chosen.push(name.clone());

            let sub = self
                .guarded(self.cluster.subtract(start_gtid, &segment_set))
                .await?;
            debug!(segment = %name, sub_result = %sub, "containment check");
            if sub != start_gtid {
                // The segment covers transactions the cluster already
                // executed, so every older segment is covered too.
                break;
            }
        }

        if chosen.is_empty() {
            return Err(PitrError::NoApplicableBinlogs {
                prefix: BINLOG_PREFIX.to_string(),
                gtid: start_gtid.to_string(),
            });
        }
        chosen.reverse();
        Ok((chosen, exclude_set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [
            RecoverMode::Latest,
            RecoverMode::Date,
            RecoverMode::Transaction,
            RecoverMode::Skip,
        ] {
            assert_eq!(mode.to_string().parse::<RecoverMode>().unwrap(), mode);
        }
        assert!("everything".parse::<RecoverMode>().is_err());
    }

    fn request(mode: RecoverMode) -> RecoveryRequest {
        RecoveryRequest {
            host: "pxc-0".to_string(),
            user: "operator".to_string(),
            pass: SensitiveString::new("secret"),
            mode,
            recover_time: None,
            gtid: None,
        }
    }

    #[test]
    fn validate_enforces_mode_requirements() {
        assert!(request(RecoverMode::Latest).validate().is_ok());
        assert!(request(RecoverMode::Date).validate().is_err());
        assert!(request(RecoverMode::Transaction).validate().is_err());
        assert!(request(RecoverMode::Skip).validate().is_err());

        let mut date = request(RecoverMode::Date);
        date.recover_time = Some("2024-05-01 12:00:00".to_string());
        assert!(date.validate().is_ok());

        let mut skip = request(RecoverMode::Skip);
        skip.gtid = Some("u:77".to_string());
        assert!(skip.validate().is_ok());
    }
}
