//! Point-in-time recovery for Percona XtraDB Cluster binlog archives.
//!
//! Given a restored full backup and binlog segments archived to object
//! storage, this crate determines which segments the cluster still needs,
//! fetches them in order and replays them through `mysqlbinlog` into a
//! single `mysql` session, stopping at the latest archived transaction, a
//! wall-clock date, or an exact transaction.
//!
//! # Architecture
//!
//! ```text
//! archive (S3 / Azure)          cluster node :33062
//!        │                             │
//!   BinlogStore ──► BinlogPlanner ◄──► ClusterGateway
//!                        │  (GTID set algebra via SQL)
//!                        ▼
//!                  ReplayPipeline ──► mysqlbinlog │ mysql ──► cluster
//! ```
//!
//! GTID set algebra is delegated to the server to stay bit-exact with
//! MySQL's semantics; the archive is read-only; replay is strictly serial
//! because transaction ordering must be preserved.
//!
//! # Example
//!
//! ```rust,no_run
//! use pitr::{RecoverMode, Recoverer, RecoveryRequest, SensitiveString, StorageConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pitr::Result<()> {
//! let request = RecoveryRequest {
//!     host: "pxc-0".to_string(),
//!     user: "operator".to_string(),
//!     pass: SensitiveString::new("secret"),
//!     mode: RecoverMode::Latest,
//!     recover_time: None,
//!     gtid: None,
//! };
//! let storage = StorageConfig::Local { root: "/archive".into() };
//! let recoverer = Recoverer::new(request, &storage, true)?;
//! recoverer.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod cluster;
pub mod error;
pub mod gtid;
pub mod pipeline;
pub mod planner;
pub mod recover;
pub mod storage;
pub mod types;

pub use error::{PitrError, Result};
pub use planner::{Plan, RecoverMode, RecoveryRequest};
pub use recover::Recoverer;
pub use storage::{AzureConfig, S3Config, StorageConfig};
pub use types::SensitiveString;
