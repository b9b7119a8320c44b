//! Replay of planned segments into the cluster.
//!
//! A binlog segment boundary can cut a multi-statement transaction in half,
//! so every decoded segment must land in the same client session: one
//! long-lived `mysql` process consumes the concatenated output of short-lived
//! `mysqlbinlog` decoders through a single pipe. The decoder for segment N+1
//! only starts after the decoder for segment N has exited, and the pipe's
//! write end closes exactly once, after the last decoder.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::ADMIN_PORT;
use crate::error::{PitrError, Result};
use crate::planner::Plan;
use crate::storage::BinlogStore;
use crate::types::SensitiveString;

/// Expected on the decoder's stderr when the password comes from the
/// environment; noise, not a failure. Stderr is passed through unfiltered.
pub const PASSWORD_WARNING: &str =
    "mysqlbinlog: [Warning] Using a password on the command line interface can be insecure.";

/// Streams planned segments through `mysqlbinlog` into one `mysql` session
pub struct ReplayPipeline<'a> {
    store: &'a dyn BinlogStore,
    host: String,
    user: String,
    pass: SensitiveString,
}

impl<'a> ReplayPipeline<'a> {
    pub fn new(
        store: &'a dyn BinlogStore,
        host: impl Into<String>,
        user: impl Into<String>,
        pass: SensitiveString,
    ) -> Self {
        Self {
            store,
            host: host.into(),
            user: user.into(),
            pass,
        }
    }

    /// Apply the plan. Any decoder failure, a non-zero client exit or a
    /// cancellation aborts the whole replay; there is no partial retry.
    pub async fn run(&self, plan: &Plan, cancel: &CancellationToken) -> Result<()> {
        let mut client = self.spawn_client()?;
        let mut client_stdin = client
            .stdin
            .take()
            .ok_or_else(|| PitrError::Pipeline("mysql stdin not piped".to_string()))?;

        let total = plan.segments.len();
        for (i, segment) in plan.segments.iter().enumerate() {
            info!(segment = %segment, remaining = total - i, total, "replaying segment");

            if let Some(end) = plan.stop_unix {
                let ts = name_timestamp(segment)?;
                if ts > end {
                    info!(
                        segment = %segment,
                        timestamp = ts,
                        stop = end,
                        "stopping, segment is newer than the recovery time"
                    );
                    break;
                }
            }

            let reader = match cancel.run_until_cancelled(self.store.get(segment)).await {
                None => return Err(PitrError::Cancelled),
                Some(reader) => reader?,
            };
            self.run_decoder(reader, &plan.stop_flag, &mut client_stdin, cancel)
                .await?;
        }

        // EOF for the client session; from here it drains and exits.
        drop(client_stdin);

        info!("waiting for mysql client to finish");
        let status = match cancel.run_until_cancelled(client.wait()).await {
            None => return Err(PitrError::Cancelled),
            Some(status) => status?,
        };
        if !status.success() {
            return Err(PitrError::Process {
                tool: "mysql",
                status,
            });
        }
        info!("replay finished");
        Ok(())
    }

    fn spawn_client(&self) -> Result<Child> {
        info!(host = %self.host, user = %self.user, port = ADMIN_PORT, "starting mysql client session");
        Command::new("mysql")
            .arg("-h")
            .arg(&self.host)
            .arg("-P")
            .arg(ADMIN_PORT.to_string())
            .arg("-u")
            .arg(&self.user)
            .env("MYSQL_PWD", self.pass.expose_secret())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PitrError::Pipeline(format!("start mysql: {e}")))
    }

    /// Run one decoder to completion: feed it the segment stream, copy its
    /// output into the client session, then check its exit status.
    async fn run_decoder(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        stop_flag: &str,
        client_stdin: &mut ChildStdin,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let command_line = decoder_command(stop_flag);
        debug!(command = %command_line, "running decoder");
        let mut decoder = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .env("MYSQL_PWD", self.pass.expose_secret())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PitrError::Pipeline(format!("start mysqlbinlog: {e}")))?;
        let mut decoder_stdin = decoder
            .stdin
            .take()
            .ok_or_else(|| PitrError::Pipeline("decoder stdin not piped".to_string()))?;
        let mut decoder_stdout = decoder
            .stdout
            .take()
            .ok_or_else(|| PitrError::Pipeline("decoder stdout not piped".to_string()))?;

        let feed = async {
            tokio::io::copy(&mut reader, &mut decoder_stdin).await?;
            decoder_stdin.shutdown().await?;
            drop(decoder_stdin);
            Ok::<_, std::io::Error>(())
        };
        let pump = tokio::io::copy(&mut decoder_stdout, client_stdin);

        tokio::select! {
            _ = cancel.cancelled() => return Err(PitrError::Cancelled),
            result = async { tokio::try_join!(feed, pump) } => {
                result.map_err(|e| {
                    PitrError::Pipeline(format!("stream segment through mysqlbinlog: {e}"))
                })?;
            }
        }

        let status = match cancel.run_until_cancelled(decoder.wait()).await {
            None => return Err(PitrError::Cancelled),
            Some(status) => status?,
        };
        if !status.success() {
            return Err(PitrError::Process {
                tool: "mysqlbinlog",
                status,
            });
        }
        Ok(())
    }
}

fn decoder_command(stop_flag: &str) -> String {
    if stop_flag.is_empty() {
        "mysqlbinlog --disable-log-bin -".to_string()
    } else {
        format!("mysqlbinlog --disable-log-bin {stop_flag} -")
    }
}

/// Archive timestamp embedded in a `binlog_<unixTs>_<suffix>` name
pub(crate) fn name_timestamp(name: &str) -> Result<i64> {
    let ts = name
        .split('_')
        .nth(1)
        .filter(|part| !part.is_empty())
        .ok_or_else(|| {
            PitrError::Storage(format!("no timestamp in segment name {name:?}"))
        })?;
    ts.parse()
        .map_err(|_| PitrError::Storage(format!("bad timestamp in segment name {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_comes_from_the_second_field() {
        assert_eq!(name_timestamp("binlog_1000_aaa").unwrap(), 1000);
        assert_eq!(name_timestamp("binlog_2000_b_c").unwrap(), 2000);
        assert!(name_timestamp("binlog").is_err());
        assert!(name_timestamp("binlog_notanumber_x").is_err());
    }

    #[test]
    fn date_stop_skips_segments_past_the_cut_off() {
        // recover to unix 2000: the first two segments stream, the third
        // breaks the loop
        let names = ["binlog_1000_a", "binlog_2000_b", "binlog_3000_c"];
        let end = 2000;
        let streamed: Vec<_> = names
            .iter()
            .take_while(|name| name_timestamp(name).unwrap() <= end)
            .collect();
        assert_eq!(streamed, vec![&"binlog_1000_a", &"binlog_2000_b"]);
    }

    #[test]
    fn decoder_command_embeds_the_stop_flag() {
        assert_eq!(decoder_command(""), "mysqlbinlog --disable-log-bin -");
        assert_eq!(
            decoder_command("--stop-datetime=\"1970-01-01 00:33:20\""),
            "mysqlbinlog --disable-log-bin --stop-datetime=\"1970-01-01 00:33:20\" -"
        );
        assert_eq!(
            decoder_command("--exclude-gtids=\"u:60-120\""),
            "mysqlbinlog --disable-log-bin --exclude-gtids=\"u:60-120\" -"
        );
    }
}
