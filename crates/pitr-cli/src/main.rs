//! Point-in-time recovery CLI.
//!
//! Every option doubles as an environment variable, which is how the tool is
//! driven when it runs as a restore job:
//!
//! ```text
//! HOST=pxc-0 USER=operator PASS=... \
//! PITR_RECOVERY_TYPE=date PITR_DATE="2024-05-01 12:00:00" \
//! STORAGE_TYPE=s3 BINLOG_S3_BUCKET_URL=s3://bucket/cluster1 \
//! BINLOG_S3_ACCESS_KEY_ID=... BINLOG_S3_SECRET_ACCESS_KEY=... \
//! BINLOG_S3_REGION=us-east-1 pitr
//! ```

use clap::Parser;
use pitr::{
    AzureConfig, RecoverMode, Recoverer, RecoveryRequest, S3Config, SensitiveString,
    StorageConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Replay archived binlogs into a restored Percona XtraDB Cluster
#[derive(Parser, Debug)]
#[command(name = "pitr")]
#[command(author, version, about, long_about = None)]
struct Cli {
    // ============ Cluster ============
    /// Cluster node to recover through
    #[arg(long, env = "HOST")]
    host: String,

    /// Cluster user
    #[arg(long, env = "USER")]
    user: String,

    /// Cluster password; reaches child processes only as MYSQL_PWD
    #[arg(long, env = "PASS", hide_env_values = true)]
    pass: String,

    // ============ Recovery target ============
    /// Recovery type: latest, date, transaction or skip
    #[arg(long, env = "PITR_RECOVERY_TYPE")]
    recovery_type: RecoverMode,

    /// Point in time to stop at (YYYY-MM-DD HH:MM:SS, server time zone);
    /// date recovery only
    #[arg(long, env = "PITR_DATE")]
    date: Option<String>,

    /// Target transaction (uuid:N); transaction and skip recovery
    #[arg(long, env = "PITR_GTID")]
    gtid: Option<String>,

    // ============ Archive storage ============
    /// Archive backend: s3 or azure
    #[arg(long, env = "STORAGE_TYPE")]
    storage_type: String,

    /// Verify TLS certificates when talking to object storage
    #[arg(long, default_value = "true", env = "VERIFY_TLS")]
    verify_tls: bool,

    /// S3 endpoint host or URL; empty picks the AWS default
    #[arg(long, env = "BINLOG_S3_ENDPOINT", default_value = "")]
    s3_endpoint: String,

    /// s3://bucket/prefix, https://host/bucket/prefix or bucket/prefix
    #[arg(long, env = "BINLOG_S3_BUCKET_URL")]
    s3_bucket_url: Option<String>,

    #[arg(long, env = "BINLOG_S3_ACCESS_KEY_ID", hide_env_values = true)]
    s3_access_key_id: Option<String>,

    #[arg(long, env = "BINLOG_S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    s3_secret_access_key: Option<String>,

    #[arg(long, env = "BINLOG_S3_REGION")]
    s3_region: Option<String>,

    /// Azure Blob endpoint
    #[arg(long, env = "BINLOG_AZURE_ENDPOINT")]
    azure_endpoint: Option<String>,

    /// container/prefix inside the storage account
    #[arg(long, env = "BINLOG_AZURE_CONTAINER_PATH")]
    azure_container_path: Option<String>,

    #[arg(long, env = "BINLOG_AZURE_STORAGE_ACCOUNT")]
    azure_storage_account: Option<String>,

    #[arg(long, env = "BINLOG_AZURE_ACCESS_KEY", hide_env_values = true)]
    azure_access_key: Option<String>,
}

impl Cli {
    fn storage_config(&self) -> anyhow::Result<StorageConfig> {
        match self.storage_type.as_str() {
            "s3" => Ok(StorageConfig::S3(S3Config {
                endpoint: self.s3_endpoint.clone(),
                bucket_url: required(&self.s3_bucket_url, "BINLOG_S3_BUCKET_URL")?,
                access_key_id: required(&self.s3_access_key_id, "BINLOG_S3_ACCESS_KEY_ID")?,
                secret_access_key: SensitiveString::new(required(
                    &self.s3_secret_access_key,
                    "BINLOG_S3_SECRET_ACCESS_KEY",
                )?),
                region: required(&self.s3_region, "BINLOG_S3_REGION")?,
            })),
            "azure" => Ok(StorageConfig::Azure(AzureConfig {
                endpoint: required(&self.azure_endpoint, "BINLOG_AZURE_ENDPOINT")?,
                container_path: required(
                    &self.azure_container_path,
                    "BINLOG_AZURE_CONTAINER_PATH",
                )?,
                storage_account: required(
                    &self.azure_storage_account,
                    "BINLOG_AZURE_STORAGE_ACCOUNT",
                )?,
                access_key: SensitiveString::new(required(
                    &self.azure_access_key,
                    "BINLOG_AZURE_ACCESS_KEY",
                )?),
            })),
            other => anyhow::bail!("unknown STORAGE_TYPE {other:?}, expected s3 or azure"),
        }
    }

    fn recovery_request(&self) -> RecoveryRequest {
        RecoveryRequest {
            host: self.host.clone(),
            user: self.user.clone(),
            pass: SensitiveString::new(self.pass.clone()),
            mode: self.recovery_type,
            recover_time: self.date.clone(),
            gtid: self.gtid.clone(),
        }
    }
}

fn required(value: &Option<String>, name: &str) -> anyhow::Result<String> {
    value
        .clone()
        .ok_or_else(|| anyhow::anyhow!("{name} is required for this storage type"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let storage = cli.storage_config()?;
    let recoverer = Recoverer::new(cli.recovery_request(), &storage, cli.verify_tls)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling recovery");
        signal_cancel.cancel();
    });

    recoverer.run(cancel).await?;
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
