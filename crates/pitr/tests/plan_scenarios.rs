//! Planner scenarios over a filesystem-backed archive.
//!
//! The cluster side is an in-memory implementation of the GTID set
//! operations doing interval arithmetic over `uuid:lo-hi` fragments, which
//! matches what `GTID_SUBTRACT` returns for the set shapes the planner
//! feeds it.

use async_trait::async_trait;
use pitr::cluster::GtidSetOps;
use pitr::planner::{BinlogPlanner, RecoverMode, RecoveryRequest};
use pitr::storage::{ObjectBinlogStore, StorageConfig};
use pitr::{PitrError, SensitiveString};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "6c27ed6d-7ee1-11e3-be39-6c626d957cff";

fn set(interval: &str) -> String {
    format!("{SOURCE}:{interval}")
}

// ---------------------------------------------------------------------------
// In-memory GTID arithmetic
// ---------------------------------------------------------------------------

struct RangeOps {
    executed: String,
}

fn parse_fragment(fragment: &str) -> Option<(String, i64, i64)> {
    let (source, interval) = fragment.split_once(':')?;
    match interval.split_once('-') {
        Some((lo, hi)) => Some((source.to_string(), lo.parse().ok()?, hi.parse().ok()?)),
        None => {
            let n: i64 = interval.parse().ok()?;
            Some((source.to_string(), n, n))
        }
    }
}

fn parse_set(set: &str) -> Vec<(String, i64, i64)> {
    if set.is_empty() {
        return Vec::new();
    }
    set.split(',').filter_map(parse_fragment).collect()
}

fn render(fragments: &[(String, i64, i64)]) -> String {
    fragments
        .iter()
        .map(|(source, lo, hi)| {
            if lo == hi {
                format!("{source}:{lo}")
            } else {
                format!("{source}:{lo}-{hi}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn subtract_sets(set: &str, sub: &str) -> String {
    let subtrahend = parse_set(sub);
    let mut out = Vec::new();
    for (source, lo, hi) in parse_set(set) {
        let mut pieces = vec![(lo, hi)];
        for (sub_source, sub_lo, sub_hi) in &subtrahend {
            if *sub_source != source {
                continue;
            }
            let mut next = Vec::new();
            for (piece_lo, piece_hi) in pieces {
                if *sub_hi < piece_lo || *sub_lo > piece_hi {
                    next.push((piece_lo, piece_hi));
                    continue;
                }
                if *sub_lo > piece_lo {
                    next.push((piece_lo, sub_lo - 1));
                }
                if *sub_hi < piece_hi {
                    next.push((sub_hi + 1, piece_hi));
                }
            }
            pieces = next;
        }
        for (piece_lo, piece_hi) in pieces {
            out.push((source.clone(), piece_lo, piece_hi));
        }
    }
    render(&out)
}

#[async_trait]
impl GtidSetOps for RangeOps {
    async fn subtract(&self, set: &str, sub: &str) -> pitr::Result<String> {
        Ok(subtract_sets(set, sub))
    }

    async fn subset(&self, sub: &str, set: &str) -> pitr::Result<bool> {
        Ok(subtract_sets(sub, set).is_empty())
    }

    async fn executed_set(&self) -> pitr::Result<String> {
        Ok(self.executed.clone())
    }
}

#[test]
fn range_arithmetic_behaves_like_the_server() {
    assert_eq!(subtract_sets("u:1-100", "u:121-160"), "u:1-100");
    assert_eq!(subtract_sets("u:1-100", "u:81-120"), "u:1-80");
    assert_eq!(subtract_sets("u:1-100", "u:1-160"), "");
    assert_eq!(subtract_sets("u:81-120", "u:95"), "u:81-94,u:96-120");
    assert_eq!(subtract_sets("u:77", "u:77"), "");
    assert_eq!(subtract_sets("", "u:1-5"), "");
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn archive(entries: &[(&str, &str)]) -> (TempDir, ObjectBinlogStore) {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in entries {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    let store = ObjectBinlogStore::open(
        &StorageConfig::Local {
            root: dir.path().to_path_buf(),
        },
        true,
    )
    .unwrap();
    (dir, store)
}

/// Four segments, one transaction range each
fn standard_archive() -> (TempDir, ObjectBinlogStore) {
    let seg1 = set("1-50");
    let seg2 = set("51-80");
    let seg3 = set("81-120");
    let seg4 = set("121-160");
    archive(&[
        ("binlog_1000_aaa", "x"),
        ("binlog_1000_aaa-gtid-set", seg1.as_str()),
        ("binlog_2000_bbb", "x"),
        ("binlog_2000_bbb-gtid-set", seg2.as_str()),
        ("binlog_3000_ccc", "x"),
        ("binlog_3000_ccc-gtid-set", seg3.as_str()),
        ("binlog_4000_ddd", "x"),
        ("binlog_4000_ddd-gtid-set", seg4.as_str()),
    ])
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

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn latest_replays_everything_the_cluster_is_missing() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let plan = planner
        .plan(&request(RecoverMode::Latest), &set("1-100"))
        .await
        .unwrap();

    // The cluster already holds transaction 100 inside the third segment, so
    // replay starts there and runs to the end of the archive.
    assert_eq!(plan.segments, vec!["binlog_3000_ccc", "binlog_4000_ddd"]);
    assert_eq!(plan.stop_flag, "");
    assert_eq!(plan.stop_unix, None);
}

#[tokio::test]
async fn skip_mode_excludes_exactly_the_given_transaction() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let mut req = request(RecoverMode::Skip);
    req.gtid = Some(set("130"));
    let plan = planner.plan(&req, &set("1-100")).await.unwrap();

    assert_eq!(plan.segments, vec!["binlog_3000_ccc", "binlog_4000_ddd"]);
    assert_eq!(
        plan.stop_flag,
        format!("--exclude-gtids=\"{}\"", set("130"))
    );
}

#[tokio::test]
async fn transaction_mode_stops_inside_the_segment_holding_the_target() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let mut req = request(RecoverMode::Transaction);
    req.gtid = Some(set("95"));
    let plan = planner.plan(&req, &set("1-100")).await.unwrap();

    // Segments newer than the target are dropped entirely; the one holding
    // it replays with everything from the target onward excluded.
    assert_eq!(plan.segments, vec!["binlog_3000_ccc"]);
    assert_eq!(
        plan.stop_flag,
        format!("--exclude-gtids=\"{}\"", set("95-120"))
    );
}

#[tokio::test]
async fn transaction_preflight_rejects_already_executed_targets() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: set("1-200"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let err = planner
        .preflight(&set("150"), &set("1-200"))
        .await
        .unwrap_err();
    assert!(matches!(err, PitrError::TargetBeforeBackup(_)));

    // A target past the executed set passes.
    planner
        .preflight(&set("250"), &set("1-200"))
        .await
        .unwrap();
}

#[tokio::test]
async fn transaction_preflight_rejects_malformed_targets() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: set("1-200"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    for bad in [set("1-5"), "not-a-uuid:5".to_string(), SOURCE.to_string()] {
        let err = planner.preflight(&bad, &set("1-200")).await.unwrap_err();
        assert!(
            matches!(err, PitrError::InvalidGtid { .. }),
            "expected InvalidGtid for {bad:?}"
        );
    }
}

#[tokio::test]
async fn date_mode_carries_the_cut_off_into_the_plan() {
    let (_dir, store) = standard_archive();
    // Empty executed set: a cluster restored from a backup taken before the
    // archive started; every segment applies.
    let cluster = RangeOps {
        executed: String::new(),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let mut req = request(RecoverMode::Date);
    req.recover_time = Some("1970-01-01 00:33:20".to_string());
    let plan = planner.plan(&req, "").await.unwrap();

    assert_eq!(
        plan.segments,
        vec![
            "binlog_1000_aaa",
            "binlog_2000_bbb",
            "binlog_3000_ccc",
            "binlog_4000_ddd"
        ]
    );
    assert_eq!(
        plan.stop_flag,
        "--stop-datetime=\"1970-01-01 00:33:20\""
    );
    assert_eq!(plan.stop_unix, Some(2000));
}

#[tokio::test]
async fn date_mode_rejects_malformed_dates() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: String::new(),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let mut req = request(RecoverMode::Date);
    req.recover_time = Some("yesterday at noon".to_string());
    let err = planner.plan(&req, "").await.unwrap_err();
    assert!(matches!(err, PitrError::Config(_)));
}

#[tokio::test]
async fn empty_archive_yields_no_applicable_binlogs() {
    let (_dir, store) = archive(&[]);
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let err = planner
        .plan(&request(RecoverMode::Latest), &set("1-100"))
        .await
        .unwrap_err();
    assert!(matches!(err, PitrError::NoApplicableBinlogs { .. }));
}

#[tokio::test]
async fn archive_of_only_sidecars_yields_no_applicable_binlogs() {
    let seg = set("1-50");
    let (_dir, store) = archive(&[("binlog_1000_aaa-gtid-set", seg.as_str())]);
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let err = planner
        .plan(&request(RecoverMode::Latest), &set("1-100"))
        .await
        .unwrap_err();
    assert!(matches!(err, PitrError::NoApplicableBinlogs { .. }));
}

#[tokio::test]
async fn segment_with_missing_sidecar_is_skipped() {
    let seg1 = set("1-50");
    let seg2 = set("51-80");
    let seg4 = set("121-160");
    // binlog_3000_ccc has no sidecar and cannot be placed.
    let (_dir, store) = archive(&[
        ("binlog_1000_aaa", "x"),
        ("binlog_1000_aaa-gtid-set", seg1.as_str()),
        ("binlog_2000_bbb", "x"),
        ("binlog_2000_bbb-gtid-set", seg2.as_str()),
        ("binlog_3000_ccc", "x"),
        ("binlog_4000_ddd", "x"),
        ("binlog_4000_ddd-gtid-set", seg4.as_str()),
    ]);
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());

    let plan = planner
        .plan(&request(RecoverMode::Latest), &set("1-100"))
        .await
        .unwrap();
    assert_eq!(plan.segments, vec!["binlog_2000_bbb", "binlog_4000_ddd"]);
}

#[tokio::test]
async fn cancelled_token_aborts_planning() {
    let (_dir, store) = standard_archive();
    let cluster = RangeOps {
        executed: set("1-100"),
    };
    let cancel = CancellationToken::new();
    cancel.cancel();
    let planner = BinlogPlanner::new(&store, &cluster, cancel);

    let err = planner
        .plan(&request(RecoverMode::Latest), &set("1-100"))
        .await
        .unwrap_err();
    assert!(matches!(err, PitrError::Cancelled));
}

#[tokio::test]
async fn plans_are_contiguous_and_ascending() {
    let (_dir, store) = standard_archive();
    for executed in ["1-10", "1-60", "1-100", "1-130"] {
        let cluster = RangeOps {
            executed: set(executed),
        };
        let planner = BinlogPlanner::new(&store, &cluster, CancellationToken::new());
        let plan = planner
            .plan(&request(RecoverMode::Latest), &set(executed))
            .await
            .unwrap();

        let mut sorted = plan.segments.clone();
        sorted.sort();
        assert_eq!(plan.segments, sorted, "ascending for {executed}");
        assert!(!plan.segments.is_empty(), "non-empty for {executed}");
    }
}
