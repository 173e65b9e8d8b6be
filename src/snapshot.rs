//! Serializable snapshots of the site table.
//!
//! A snapshot is dumped as YAML to `malloc_trace.<pid>/sites.yaml` when the
//! traced process exits, with every frame address resolved to a symbol while
//! the process image is still mapped.  `mt_print` later merges and prints
//! snapshots offline.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::{fs, io, process};

use serde::{Deserialize, Serialize};

use crate::report;
use crate::stack::CallStack;
use crate::table::{Site, SiteTable};

/// One dumped call site.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SiteRecord {
    pub frames: Vec<usize>,
    pub invocations: u64,
    pub invocations_delta: u64,
    pub min_size: usize,
    pub max_size: usize,
}

/// Point-in-time copy of the table plus resolved symbols.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Snapshot {
    pub sites: Vec<SiteRecord>,
    pub invocations: u64,
    pub lost: u64,
    pub collisions: u64,
    pub symbols: HashMap<usize, String>,
}

impl Snapshot {
    /// Copies the table and resolves every frame address to a symbol.
    /// Must run in the process that captured the stacks.
    pub fn from_table(table: &SiteTable) -> Self {
        let mut snapshot = Snapshot {
            sites: table
                .sites()
                .map(|site| SiteRecord {
                    frames: site.stack().frames().to_vec(),
                    invocations: site.invocations(),
                    invocations_delta: site.invocations_delta(),
                    min_size: site.min_size(),
                    max_size: site.max_size(),
                })
                .collect(),
            invocations: table.invocations(),
            lost: table.lost(),
            collisions: table.collisions(),
            symbols: HashMap::new(),
        };
        for record in snapshot.sites.iter() {
            for frame in record.frames.iter() {
                if let Entry::Vacant(ve) = snapshot.symbols.entry(*frame) {
                    ve.insert(report::resolve_symbol(*frame));
                }
            }
        }
        snapshot
    }

    /// Merges another snapshot into this one.  Site identity is the frame
    /// sequence; counters add up, size ranges widen, symbol maps union.
    pub fn merge(&mut self, other: &Snapshot) {
        let mut index: HashMap<Vec<usize>, usize> = self
            .sites
            .iter()
            .enumerate()
            .map(|(i, record)| (record.frames.clone(), i))
            .collect();
        for record in other.sites.iter() {
            match index.entry(record.frames.clone()) {
                Entry::Occupied(oe) => {
                    let mine = &mut self.sites[*oe.get()];
                    mine.invocations += record.invocations;
                    mine.invocations_delta += record.invocations_delta;
                    mine.min_size = mine.min_size.min(record.min_size);
                    mine.max_size = mine.max_size.max(record.max_size);
                }
                Entry::Vacant(ve) => {
                    ve.insert(self.sites.len());
                    self.sites.push(record.clone());
                }
            }
        }
        self.invocations += other.invocations;
        self.lost += other.lost;
        self.collisions += other.collisions;
        for (frame, symbol) in other.symbols.iter() {
            if let Entry::Vacant(ve) = self.symbols.entry(*frame) {
                ve.insert(symbol.clone());
            }
        }
    }

    /// Rebuilds printable [`Site`]s from the dumped records.
    pub fn to_sites(&self) -> Vec<Site> {
        self.sites
            .iter()
            .map(|record| {
                Site::from_parts(
                    CallStack::from_frames(&record.frames),
                    record.invocations,
                    record.invocations_delta,
                    record.min_size,
                    record.max_size,
                )
            })
            .collect()
    }

    /// Resolves a frame from the dumped symbol map, falling back to the raw
    /// address.
    pub fn resolve_symbol(&self, frame: usize) -> String {
        self.symbols
            .get(&frame)
            .cloned()
            .unwrap_or_else(|| format!("{:#x}", frame))
    }

    /// Writes the snapshot to `malloc_trace.<pid>/sites.yaml`.
    pub fn dump(&self) -> io::Result<()> {
        let dump_dir = format!("malloc_trace.{}", process::id());
        let dump_file = format!("{}/sites.yaml", dump_dir);
        let yaml = serde_yaml::to_string(self)
            .unwrap_or_else(|e| format!("failed to convert malloc profile to YAML: {}", e));
        let _ = fs::create_dir(&dump_dir);
        fs::write(dump_file, yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::SiteTable;

    fn sample_table() -> SiteTable {
        let mut table = SiteTable::new();
        let a = CallStack::from_frames(&[1, 2, 3]);
        let b = CallStack::from_frames(&[4, 5]);
        table.add_site(&a, 100);
        table.add_site(&a, 300);
        table.add_site(&b, 8);
        table
    }

    #[test]
    fn snapshot_copies_counters() {
        let table = sample_table();
        let snapshot = Snapshot::from_table(&table);
        assert_eq!(snapshot.sites.len(), 2);
        assert_eq!(snapshot.invocations, 3);
        assert_eq!(snapshot.lost, 0);
        let a = snapshot
            .sites
            .iter()
            .find(|record| record.frames == vec![1, 2, 3])
            .unwrap();
        assert_eq!(a.invocations, 2);
        assert_eq!((a.min_size, a.max_size), (100, 300));
    }

    #[test]
    fn merge_combines_matching_sites_and_unions_the_rest() {
        let mut left = Snapshot::from_table(&sample_table());
        let mut other_table = SiteTable::new();
        other_table.add_site(&CallStack::from_frames(&[1, 2, 3]), 50);
        other_table.add_site(&CallStack::from_frames(&[9, 9]), 16);
        let right = Snapshot::from_table(&other_table);

        left.merge(&right);
        assert_eq!(left.sites.len(), 3);
        assert_eq!(left.invocations, 5);
        let a = left
            .sites
            .iter()
            .find(|record| record.frames == vec![1, 2, 3])
            .unwrap();
        assert_eq!(a.invocations, 3);
        assert_eq!((a.min_size, a.max_size), (50, 300));
    }

    #[test]
    fn yaml_round_trip_preserves_sites() {
        let snapshot = Snapshot::from_table(&sample_table());
        let yaml = serde_yaml::to_string(&snapshot).unwrap();
        let restored: Snapshot = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored.sites.len(), snapshot.sites.len());
        assert_eq!(restored.invocations, snapshot.invocations);
    }
}
