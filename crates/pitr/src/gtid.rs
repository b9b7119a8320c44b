//! GTID set helpers.
//!
//! Set algebra itself (subtract, subset) is delegated to the server so the
//! semantics stay bit-exact with MySQL; the only arithmetic done in-process
//! is the narrow range-endpoint manipulation needed to build the
//! `--exclude-gtids` expression for transaction recovery.

use std::fmt;

use uuid::Uuid;

use crate::error::{PitrError, Result};

/// A GTID set in server syntax: comma-separated `uuid:N[-M]` fragments.
/// The empty string denotes the empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet(String);

impl GtidSet {
    /// Wrap a raw server-syntax set
    pub fn new(set: impl Into<String>) -> Self {
        Self(set.into())
    }

    /// Whether this is the empty set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw server-syntax string
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// The individual `uuid:interval` fragments, sorted
    pub fn fragments(&self) -> Vec<String> {
        if self.0.is_empty() {
            return Vec::new();
        }
        let mut list: Vec<String> = self.0.split(',').map(|s| s.trim().to_string()).collect();
        list.sort();
        list
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for GtidSet {
    fn from(set: String) -> Self {
        Self(set)
    }
}

/// Parse a single-transaction target of the exact form `uuid:N`.
///
/// Ranges (`uuid:N-M`) and multi-fragment sets are rejected; transaction
/// recovery stops at one transaction, not at a span.
pub fn parse_target(gtid: &str) -> Result<(Uuid, u64)> {
    let (source, number) = gtid
        .split_once(':')
        .ok_or_else(|| PitrError::invalid_gtid(gtid, "expected uuid:N"))?;
    let source = Uuid::parse_str(source)
        .map_err(|e| PitrError::invalid_gtid(gtid, format!("bad source uuid: {e}")))?;
    if number.contains('-') || number.contains(',') {
        return Err(PitrError::invalid_gtid(
            gtid,
            "expected a single transaction number, not a range",
        ));
    }
    let number = number
        .parse::<u64>()
        .map_err(|e| PitrError::invalid_gtid(gtid, format!("bad transaction number: {e}")))?;
    Ok((source, number))
}

/// Build the exclude range for transaction recovery.
///
/// Given the sidecar set of the segment containing the target (`uuid:lo-hi`
/// or `uuid:n`) and the target `uuid:n`, returns `uuid:n-hi`: every
/// transaction from the target (inclusive) to the end of the segment. Passed
/// to `mysqlbinlog --exclude-gtids`, this leaves earlier transactions in the
/// segment to apply and blocks the rest.
///
/// Multi-fragment segment sets are rejected; there is no way to choose which
/// sub-range the exclusion should extend.
pub fn extend_exclude_set(segment_set: &str, target: &str) -> Result<String> {
    if segment_set == target {
        return Ok(target.to_string());
    }
    if segment_set.contains(',') {
        return Err(PitrError::invalid_gtid(
            segment_set,
            "cannot extend a multi-source gtid set",
        ));
    }

    let (_, interval) = segment_set
        .split_once(':')
        .ok_or_else(|| PitrError::invalid_gtid(segment_set, "incorrect source in gtid set"))?;
    // A bare `uuid:n` set is a one-element range: n is both lo and hi.
    let high = match interval.rsplit_once('-') {
        Some((_, high)) => high,
        None => interval,
    };

    let (source, target_interval) = target
        .split_once(':')
        .ok_or_else(|| PitrError::invalid_gtid(target, "incorrect source in gtid set"))?;
    let target_start = match target_interval.split_once('-') {
        Some((start, _)) => start,
        None => target_interval,
    };

    Ok(format!("{source}:{target_start}-{high}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_covers_target_to_segment_end() {
        let set = extend_exclude_set("u:1-120", "u:60").unwrap();
        assert_eq!(set, "u:60-120");
    }

    #[test]
    fn extend_identical_set_is_returned_unchanged() {
        let set = extend_exclude_set("u:77", "u:77").unwrap();
        assert_eq!(set, "u:77");
    }

    #[test]
    fn extend_single_number_segment() {
        // A one-transaction segment: lo == hi.
        let set = extend_exclude_set("u:42", "u:40").unwrap();
        assert_eq!(set, "u:40-42");
    }

    #[test]
    fn extend_rejects_multi_source_sets() {
        let err = extend_exclude_set("a:1-10,b:1-5", "a:3").unwrap_err();
        assert!(matches!(err, PitrError::InvalidGtid { .. }));
    }

    #[test]
    fn extend_rejects_missing_interval() {
        assert!(extend_exclude_set("not-a-set", "u:3").is_err());
        assert!(extend_exclude_set("u:1-10", "no-colon").is_err());
    }

    #[test]
    fn target_parses_uuid_and_number() {
        let (source, number) =
            parse_target("6c27ed6d-7ee1-11e3-be39-6c626d957cff:150").unwrap();
        assert_eq!(
            source.to_string(),
            "6c27ed6d-7ee1-11e3-be39-6c626d957cff"
        );
        assert_eq!(number, 150);
    }

    #[test]
    fn target_rejects_ranges_and_junk() {
        assert!(parse_target("6c27ed6d-7ee1-11e3-be39-6c626d957cff:1-5").is_err());
        assert!(parse_target("not-a-uuid:5").is_err());
        assert!(parse_target("6c27ed6d-7ee1-11e3-be39-6c626d957cff").is_err());
        assert!(parse_target("6c27ed6d-7ee1-11e3-be39-6c626d957cff:x").is_err());
    }

    #[test]
    fn fragments_are_sorted() {
        let set = GtidSet::new("b:1-5,a:1-10");
        assert_eq!(set.fragments(), vec!["a:1-10", "b:1-5"]);
        assert!(GtidSet::default().is_empty());
        assert!(GtidSet::default().fragments().is_empty());
    }
}
