//! TANDEM - Compaction Strategies
//! Chooses which SSTables to fold together and performs the merge.
//!
//! ## Selection
//! Every strategy picks a contiguous slice of the live list (oldest to
//! newest). Keeping the slice contiguous means the merged output can take
//! the inputs' place without reordering versions of any key.
//!
//! ## Tombstones
//! A tombstone can only be discarded when nothing older could still hold a
//! value for its key, i.e. when the slice starts at the oldest live table.

use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{CompactionPolicy, Config};
use crate::error::{Result, TandemError};

use super::merge::{MergeIterator, Source};
use super::sstable::{SSTable, SSTableWriter, TableOptions};

/// How many merged records are written between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Trait defining a compaction strategy.
pub trait CompactionStrategy: Send + Sync {
    /// Select a contiguous run of tables to merge, by position in the
    /// oldest-to-newest list. `None` when there is nothing worth doing.
    fn select_compaction(&self, tables: &[TableInfo]) -> Option<Range<usize>>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Shape of a live SSTable, as seen by a strategy.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: u64,
    pub size: u64,
    pub entries: usize,
}

impl From<&SSTable> for TableInfo {
    fn from(table: &SSTable) -> Self {
        Self {
            id: table.id(),
            size: table.file_size(),
            entries: table.entry_count(),
        }
    }
}

/// Merge the two oldest tables.
pub struct LeveledCompaction;

impl CompactionStrategy for LeveledCompaction {
    fn select_compaction(&self, tables: &[TableInfo]) -> Option<Range<usize>> {
        (tables.len() >= 2).then_some(0..2)
    }

    fn name(&self) -> &str {
        "LeveledCompaction"
    }
}

/// Merge every live table into one.
pub struct UniversalCompaction;

impl CompactionStrategy for UniversalCompaction {
    fn select_compaction(&self, tables: &[TableInfo]) -> Option<Range<usize>> {
        (tables.len() >= 2).then_some(0..tables.len())
    }

    fn name(&self) -> &str {
        "UniversalCompaction"
    }
}

/// Size-tiered compaction strategy.
///
/// ## Algorithm
/// - Tiers: T0 (0..=base), T1 (base..=base*ratio), T2, ...
/// - Scan the list oldest first for a run of adjacent tables in one tier
/// - The first run holding at least `threshold` tables is merged
///
/// ## Example
/// ```text
/// base 4MB, threshold 4
/// [30MB, 1MB, 2MB, 3MB, 1MB] => merge positions 1..5 into one T1 table
/// ```
pub struct SizeTieredCompaction {
    /// Number of adjacent same-tier tables needed to trigger a merge.
    threshold: usize,
    /// Size multiplier between tiers.
    size_ratio: u64,
    /// Upper bound of tier 0, in bytes.
    base_bytes: u64,
}

impl SizeTieredCompaction {
    pub fn new(threshold: usize, size_ratio: u64, base_bytes: u64) -> Self {
        Self {
            threshold: threshold.max(2),
            size_ratio: size_ratio.max(2),
            base_bytes: base_bytes.max(1),
        }
    }

    /// Get the tier level for a given SSTable size.
    fn tier_for_size(&self, size: u64) -> usize {
        let mut tier = 0;
        let mut upper_bound = self.base_bytes;

        while size > upper_bound {
            tier += 1;
            upper_bound = upper_bound.saturating_mul(self.size_ratio);
        }
        tier
    }
}

impl CompactionStrategy for SizeTieredCompaction {
    fn select_compaction(&self, tables: &[TableInfo]) -> Option<Range<usize>> {
        let mut run_start = 0;
        for end in 1..=tables.len() {
            let run_continues = end < tables.len()
                && self.tier_for_size(tables[end].size)
                    == self.tier_for_size(tables[run_start].size);
            if run_continues {
                continue;
            }
            if end - run_start >= self.threshold {
                return Some(run_start..end);
            }
            run_start = end;
        }
        None
    }

    fn name(&self) -> &str {
        "SizeTieredCompaction"
    }
}

/// Build the strategy selected by `config.compaction_policy`.
pub fn strategy_for(config: &Config) -> Box<dyn CompactionStrategy> {
    match config.compaction_policy {
        CompactionPolicy::Leveled => Box::new(LeveledCompaction),
        CompactionPolicy::SizeTiered => Box::new(SizeTieredCompaction::new(
            config.size_tiered_min_tables,
            config.size_tiered_ratio,
            config.size_tiered_base_bytes,
        )),
        CompactionPolicy::Universal => Box::new(UniversalCompaction),
    }
}

/// Merge `inputs` (oldest first) into a single table with `output_id`.
///
/// `output_id` may be the id of an input: the output is then renamed over
/// that input's file, which keeps reading through its open handle.
/// On a key collision the newer table wins. Tombstones are dropped when
/// `drop_tombstones` is set and written through otherwise. If `cancel` is
/// raised the partial output is removed and `Cancelled` is returned.
pub fn merge_tables(
    dir: &Path,
    output_id: u64,
    inputs: &[Arc<SSTable>],
    drop_tombstones: bool,
    options: &TableOptions,
    cancel: &AtomicBool,
) -> Result<SSTable> {
    // The merge iterator ranks its sources newest first.
    let mut sources: Vec<Source> = Vec::with_capacity(inputs.len());
    for table in inputs.iter().rev() {
        sources.push(Box::new(table.scan()?));
    }

    let mut writer = SSTableWriter::create(dir, output_id)?;
    if let Err(err) = write_merged(&mut writer, sources, drop_tombstones, cancel) {
        writer.abandon();
        return Err(err);
    }

    let written = writer.entry_count();
    let path = writer.finish()?;
    log::info!(
        "Compaction merged {} tables into SSTable {} ({} entries)",
        inputs.len(),
        output_id,
        written
    );
    SSTable::open(output_id, path, options)
}

fn write_merged(
    writer: &mut SSTableWriter,
    sources: Vec<Source>,
    drop_tombstones: bool,
    cancel: &AtomicBool,
) -> Result<()> {
    for (seen, entry) in MergeIterator::new(sources)?.enumerate() {
        if seen % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Acquire) {
            return Err(TandemError::Cancelled);
        }
        let entry = entry?;
        match &entry.value {
            Some(value) => writer.add(&entry.key, Some(value.as_slice()))?,
            None if drop_tombstones => {}
            None => writer.add(&entry.key, None)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u64, size: u64) -> TableInfo {
        TableInfo {
            id,
            size,
            entries: 0,
        }
    }

    fn build(dir: &Path, id: u64, entries: &[(&str, Option<&str>)]) -> Arc<SSTable> {
        let mut writer = SSTableWriter::create(dir, id).unwrap();
        for (key, value) in entries {
            writer.add(key.as_bytes(), value.map(str::as_bytes)).unwrap();
        }
        let path = writer.finish().unwrap();
        let options = TableOptions {
            index_interval: 2,
            ..TableOptions::default()
        };
        Arc::new(SSTable::open(id, path, &options).unwrap())
    }

    fn contents(table: &Arc<SSTable>) -> Vec<(String, Option<String>)> {
        table
            .scan()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    String::from_utf8(e.key).unwrap(),
                    e.value.map(|v| String::from_utf8(v).unwrap()),
                )
            })
            .collect()
    }

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_tier_calculation() {
        let strategy = SizeTieredCompaction::new(4, 10, 4 * MB);

        assert_eq!(strategy.tier_for_size(0), 0);
        assert_eq!(strategy.tier_for_size(MB), 0); // 1MB → T0
        assert_eq!(strategy.tier_for_size(4 * MB), 0); // 4MB → T0
        assert_eq!(strategy.tier_for_size(10 * MB), 1); // 10MB → T1
        assert_eq!(strategy.tier_for_size(40 * MB), 1); // 40MB → T1
        assert_eq!(strategy.tier_for_size(100 * MB), 2); // 100MB → T2
    }

    #[test]
    fn test_size_tiered_below_threshold() {
        let strategy = SizeTieredCompaction::new(4, 10, 4 * MB);
        let tables = vec![info(0, MB), info(1, 2 * MB)];

        // Only 2 tables, threshold is 4
        assert_eq!(strategy.select_compaction(&tables), None);
    }

    #[test]
    fn test_size_tiered_picks_contiguous_run() {
        let strategy = SizeTieredCompaction::new(4, 10, 4 * MB);
        let tables = vec![
            info(0, 30 * MB),
            info(1, MB),
            info(2, 2 * MB),
            info(3, 3 * MB),
            info(4, MB),
        ];
        assert_eq!(strategy.select_compaction(&tables), Some(1..5));
    }

    #[test]
    fn test_size_tiered_run_broken_by_other_tier() {
        let strategy = SizeTieredCompaction::new(3, 10, 4 * MB);
        // Four T0 tables, but never three adjacent ones.
        let tables = vec![
            info(0, MB),
            info(1, MB),
            info(2, 30 * MB),
            info(3, MB),
            info(4, MB),
        ];
        assert_eq!(strategy.select_compaction(&tables), None);
    }

    #[test]
    fn test_leveled_and_universal_selection() {
        let one = vec![info(0, 10)];
        let three = vec![info(0, 10), info(1, 10), info(2, 10)];

        assert_eq!(LeveledCompaction.select_compaction(&one), None);
        assert_eq!(LeveledCompaction.select_compaction(&three), Some(0..2));
        assert_eq!(UniversalCompaction.select_compaction(&one), None);
        assert_eq!(UniversalCompaction.select_compaction(&three), Some(0..3));
    }

    #[test]
    fn test_strategy_for_policy() {
        let config = Config::default().with_compaction_policy(CompactionPolicy::Universal);
        assert_eq!(strategy_for(&config).name(), "UniversalCompaction");
        let config = Config::default().with_compaction_policy(CompactionPolicy::SizeTiered);
        assert_eq!(strategy_for(&config).name(), "SizeTieredCompaction");
    }

    #[test]
    fn test_merge_newer_table_wins() {
        let dir = tempfile::tempdir().unwrap();
        let old = build(dir.path(), 1, &[("a", Some("value1")), ("b", Some("value2"))]);
        let new = build(dir.path(), 2, &[("a", Some("new_value1")), ("c", Some("value3"))]);

        let cancel = AtomicBool::new(false);
        let options = TableOptions::default();
        let merged =
            Arc::new(merge_tables(dir.path(), 3, &[old, new], true, &options, &cancel).unwrap());

        assert_eq!(
            contents(&merged),
            vec![
                ("a".to_string(), Some("new_value1".to_string())),
                ("b".to_string(), Some("value2".to_string())),
                ("c".to_string(), Some("value3".to_string())),
            ]
        );
    }

    #[test]
    fn test_merge_tombstone_removal() {
        let dir = tempfile::tempdir().unwrap();
        let old = build(dir.path(), 1, &[("a", Some("value1")), ("b", Some("value2"))]);
        let new = build(dir.path(), 2, &[("a", None), ("c", Some("value3"))]);

        let cancel = AtomicBool::new(false);
        let options = TableOptions::default();
        let merged = Arc::new(
            merge_tables(dir.path(), 3, &[old.clone(), new.clone()], true, &options, &cancel).unwrap(),
        );
        // 'a' should be filtered out (tombstone)
        assert_eq!(
            contents(&merged),
            vec![
                ("b".to_string(), Some("value2".to_string())),
                ("c".to_string(), Some("value3".to_string())),
            ]
        );

        let kept = Arc::new(merge_tables(dir.path(), 4, &[old, new], false, &options, &cancel).unwrap());
        assert_eq!(kept.get(b"a").unwrap(), Some(None));
    }

    #[test]
    fn test_cancelled_merge_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = build(dir.path(), 1, &[("a", Some("1"))]);
        let b = build(dir.path(), 2, &[("b", Some("2"))]);

        let cancel = AtomicBool::new(true);
        let options = TableOptions::default();
        let err = merge_tables(dir.path(), 3, &[a, b], true, &options, &cancel).unwrap_err();
        assert!(matches!(err, TandemError::Cancelled));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name.to_string_lossy().contains(&format!("{:020}", 3)))
            .collect();
        assert!(leftovers.is_empty());
    }
}
