use std::collections::BTreeMap;

use crate::schema::EntityRow;

/// ─────────────────────────────────────────────────────────────
///  Partition rows by year (`ANNO`)
/// ─────────────────────────────────────────────────────────────
///
/// Each distinct year becomes one key; its value holds every row of that
/// year in input order. Each group is later written as one fragment under
/// `ANNO=<year>/`.
pub fn partition_by_year<R: EntityRow>(rows: &[R]) -> BTreeMap<i32, Vec<&R>> {
    let mut partitions: BTreeMap<i32, Vec<&R>> = BTreeMap::new();
    for row in rows {
        partitions.entry(row.anno()).or_default().push(row);
    }
    partitions
}
