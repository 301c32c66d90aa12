//! Discovery of year partitions from directory names alone.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

/// Parses a `<key>=<year>` directory name.
pub fn parse_partition_dir(name: &str, partition_key: &str) -> Option<i32> {
    let (key, value) = name.split_once('=')?;
    if key != partition_key {
        return None;
    }
    value.parse().ok()
}

/// Sorted, de-duplicated years found as `<key>=<year>` sub-directories of
/// `root`. A missing root yields no years; no fragment is ever opened.
pub fn scan_years(root: &Path, partition_key: &str) -> io::Result<Vec<i32>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut years = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some(year) = name.to_str().and_then(|n| parse_partition_dir(n, partition_key)) {
            years.insert(year);
        }
    }
    Ok(years.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partition_names_must_match_key_and_hold_an_integer() {
        assert_eq!(parse_partition_dir("ANNO=2022", "ANNO"), Some(2022));
        assert_eq!(parse_partition_dir("ANNO=0", "ANNO"), Some(0));
        assert_eq!(parse_partition_dir("ANNO=-1", "ANNO"), Some(-1));
        assert_eq!(parse_partition_dir("ANNO=abc", "ANNO"), None);
        assert_eq!(parse_partition_dir("ANNO=", "ANNO"), None);
        assert_eq!(parse_partition_dir("YEAR=2022", "ANNO"), None);
        assert_eq!(parse_partition_dir("2022", "ANNO"), None);
    }

    #[test]
    fn scan_returns_sorted_unique_years_and_skips_junk() {
        let dir = tempdir().unwrap();
        for name in ["ANNO=2023", "ANNO=2021", "ANNO=02021", "ANNO=__HIVE_DEFAULT__", "misc"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("ANNO=1999"), b"not a directory").unwrap();

        assert_eq!(scan_years(dir.path(), "ANNO").unwrap(), vec![2021, 2023]);
    }

    #[test]
    fn missing_root_has_no_years() {
        let dir = tempdir().unwrap();
        assert!(scan_years(&dir.path().join("nope"), "ANNO").unwrap().is_empty());
    }
}
