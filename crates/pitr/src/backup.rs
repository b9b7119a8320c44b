//! GTID extraction from full-backup metadata.
//!
//! A physical backup carries two xbstream-packed metadata files: `sst_info`
//! (the donor's galera GTID) and `xtrabackup_info` (the full GTID set at the
//! moment the backup finished). Together they name the last transaction the
//! restored data already contains, which is where binlog replay picks up.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::{PitrError, Result};

/// GTID of the last transaction covered by a full backup.
///
/// `sst_info` and `xtrabackup_info` are the raw xbstream blobs as stored
/// next to the backup.
pub async fn last_backup_gtid(
    sst_info: impl AsyncRead + Send + Unpin,
    xtrabackup_info: impl AsyncRead + Send + Unpin,
) -> Result<String> {
    let sst_content = decompressed_content(sst_info, "sst_info").await?;
    let xtrabackup_content = decompressed_content(xtrabackup_info, "xtrabackup_info").await?;

    let sst_set = gtid_from_sst_info(&sst_content)?;
    let source = match sst_set.split_once(':') {
        Some((source, _)) => source,
        None => sst_set.as_str(),
    };

    let interval = interval_for_source(source, &xtrabackup_content)?;
    Ok(format!("{source}:{interval}"))
}

/// The interval recorded for `source` in the xtrabackup GTID set
fn interval_for_source(source: &str, xtrabackup_info: &[u8]) -> Result<String> {
    let gtids = gtid_from_xtrabackup_info(xtrabackup_info)?;
    for fragment in gtids.split(',') {
        if let Some((fragment_source, interval)) = fragment.trim().split_once(':') {
            if fragment_source == source {
                return Ok(interval.to_string());
            }
        }
    }
    Err(PitrError::BackupInfo(format!(
        "no interval for source {source} in xtrabackup_info"
    )))
}

/// The `galera-gtid=<set>` line of a decompressed `sst_info`
fn gtid_from_sst_info(content: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(content);
    let rest = text
        .split_once("galera-gtid=")
        .ok_or_else(|| PitrError::BackupInfo("no gtid data in sst_info".to_string()))?
        .1;
    let set = rest
        .split_once('\n')
        .ok_or_else(|| PitrError::BackupInfo("can't find gtid data in sst_info".to_string()))?
        .0;
    Ok(set.trim().to_string())
}

/// The quoted set after `GTID of the last` in a decompressed
/// `xtrabackup_info`
fn gtid_from_xtrabackup_info(content: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(content);
    let rest = text
        .split_once("GTID of the last")
        .ok_or_else(|| PitrError::BackupInfo("no gtid data in xtrabackup_info".to_string()))?
        .1;
    let end = rest.find("'\n").ok_or_else(|| {
        PitrError::BackupInfo("can't find gtid data in xtrabackup_info".to_string())
    })?;
    let start = rest.find('\'').ok_or_else(|| {
        PitrError::BackupInfo("can't find gtid data in xtrabackup_info".to_string())
    })?;
    if start + 1 > end {
        return Err(PitrError::BackupInfo(
            "malformed gtid quoting in xtrabackup_info".to_string(),
        ));
    }
    Ok(rest[start + 1..end].to_string())
}

/// Unpack one file out of an xbstream blob into a scratch directory and
/// return its content. Any stderr output from `xbstream` is treated as
/// fatal.
async fn decompressed_content(
    mut blob: impl AsyncRead + Send + Unpin,
    filename: &str,
) -> Result<Vec<u8>> {
    let scratch = tempfile::tempdir()?;
    debug!(file = filename, dir = %scratch.path().display(), "unpacking xbstream blob");

    let mut child = Command::new("xbstream")
        .arg("-x")
        .arg("--decompress")
        .current_dir(scratch.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PitrError::BackupInfo(format!("start xbstream: {e}")))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| PitrError::BackupInfo("xbstream stdin not piped".to_string()))?;

    let feed = async {
        tokio::io::copy(&mut blob, &mut stdin).await?;
        stdin.shutdown().await?;
        drop(stdin);
        Ok::<_, std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    fed?;
    let output = output?;
    if !output.status.success() || !output.stderr.is_empty() {
        return Err(PitrError::BackupInfo(format!(
            "xbstream exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let content = tokio::fs::read(scratch.path().join(filename))
        .await
        .map_err(|e| PitrError::BackupInfo(format!("read {filename}: {e}")))?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "6c27ed6d-7ee1-11e3-be39-6c626d957cff";

    #[test]
    fn sst_info_gtid_is_extracted() {
        let content = format!("wsrep-version=3\ngalera-gtid={SOURCE}:1-100\nmore=stuff\n");
        assert_eq!(
            gtid_from_sst_info(content.as_bytes()).unwrap(),
            format!("{SOURCE}:1-100")
        );
    }

    #[test]
    fn sst_info_without_marker_fails() {
        assert!(gtid_from_sst_info(b"nothing here\n").is_err());
        assert!(gtid_from_sst_info(b"galera-gtid=u:1-5 no newline").is_err());
    }

    #[test]
    fn xtrabackup_info_set_is_extracted() {
        let content = format!(
            "tool_version = 8.0.35\nbinlog_pos = filename 'binlog.000004', \
             position '197', GTID of the last change '{SOURCE}:1-100,\nother:1-5'\nformat = xbstream\n"
        );
        assert_eq!(
            gtid_from_xtrabackup_info(content.as_bytes()).unwrap(),
            format!("{SOURCE}:1-100,\nother:1-5")
        );
    }

    #[test]
    fn interval_matches_the_sst_source() {
        let content =
            format!("GTID of the last change 'aaa:1-7,{SOURCE}:1-100'\n");
        assert_eq!(
            interval_for_source(SOURCE, content.as_bytes()).unwrap(),
            "1-100"
        );
        assert!(interval_for_source("missing", content.as_bytes()).is_err());
    }
}
