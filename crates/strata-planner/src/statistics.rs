//! Table statistics for cost-based planning.
//!
//! A table is the set of keys under a prefix, and its rows are split into
//! columns by a [`RowDecoder`] the SQL layer supplies. Collection is a
//! single pass over the rows: a KMV sketch estimates distinct values and
//! the sorted column values give min/max, an equal-depth histogram and the
//! most common values. The collector never builds plans; it only answers
//! selectivity questions from the numbers it gathered.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use strata_common::{Result, StatisticsConfig, StrataError};
use tracing::info;

/// Selectivity assumed for a table without statistics.
pub const DEFAULT_SELECTIVITY: f64 = 0.5;

/// Equality selectivity assumed when a column has no statistics.
pub const DEFAULT_EQUALITY_SELECTIVITY: f64 = 0.1;

/// Range selectivity assumed when a column has no histogram.
pub const DEFAULT_RANGE_SELECTIVITY: f64 = 0.33;

/// Row count assumed for a table without statistics.
pub const DEFAULT_ROW_ESTIMATE: u64 = 100;

/// Splits stored rows into column values.
pub trait RowDecoder: Send + Sync {
    /// Column names, in the order `decode` returns values.
    fn columns(&self) -> Vec<String>;

    /// Decodes one row. `None` is a NULL.
    fn decode(&self, key: &[u8], value: &[u8]) -> Result<Vec<Option<Bytes>>>;
}

/// Decoder for values holding delimiter-separated fields, where an empty
/// field is NULL.
#[derive(Debug, Clone)]
pub struct DelimitedRowDecoder {
    columns: Vec<String>,
    delimiter: u8,
}

impl DelimitedRowDecoder {
    pub fn new(columns: &[&str], delimiter: u8) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            delimiter,
        }
    }
}

impl RowDecoder for DelimitedRowDecoder {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    fn decode(&self, _key: &[u8], value: &[u8]) -> Result<Vec<Option<Bytes>>> {
        let fields: Vec<Option<Bytes>> = value
            .split(|b| *b == self.delimiter)
            .map(|f| (!f.is_empty()).then(|| Bytes::copy_from_slice(f)))
            .collect();
        if fields.len() != self.columns.len() {
            return Err(StrataError::Internal(format!(
                "row has {} fields, table has {} columns",
                fields.len(),
                self.columns.len()
            )));
        }
        Ok(fields)
    }
}

/// A registered table.
#[derive(Clone)]
pub struct TableDef {
    pub name: String,
    /// Every key of the table starts with this prefix.
    pub key_prefix: Bytes,
    pub decoder: Arc<dyn RowDecoder>,
}

impl TableDef {
    pub fn new(name: &str, key_prefix: impl Into<Bytes>, decoder: Arc<dyn RowDecoder>) -> Self {
        Self {
            name: name.to_string(),
            key_prefix: key_prefix.into(),
            decoder,
        }
    }

    /// Key bounds covering exactly the table's rows.
    pub fn key_bounds(&self) -> (Bound<Bytes>, Bound<Bytes>) {
        if self.key_prefix.is_empty() {
            return (Bound::Unbounded, Bound::Unbounded);
        }
        let upper = match prefix_successor(&self.key_prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        (Bound::Included(self.key_prefix.clone()), upper)
    }
}

/// Smallest byte string greater than every string starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let end = prefix.iter().rposition(|b| *b != u8::MAX)?;
    let mut next = prefix[..=end].to_vec();
    next[end] += 1;
    Some(Bytes::from(next))
}

/// K-minimum-values sketch for distinct counts.
///
/// Exact while fewer than `k` distinct hashes were seen.
#[derive(Debug, Clone)]
pub struct DistinctSketch {
    k: usize,
    hashes: BTreeSet<u64>,
}

impl DistinctSketch {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(2),
            hashes: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, value: &[u8]) {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        let hash = hasher.finish();

        if self.hashes.len() < self.k {
            self.hashes.insert(hash);
        } else if self.hashes.last().is_some_and(|max| hash < *max) && self.hashes.insert(hash) {
            self.hashes.pop_last();
        }
    }

    pub fn estimate(&self) -> u64 {
        if self.hashes.len() < self.k {
            return self.hashes.len() as u64;
        }
        let Some(&kth) = self.hashes.last() else {
            return 0;
        };
        // The k-th smallest of n uniform hashes sits near k/n of the range.
        let fraction = (kth as f64 + 1.0) / (u64::MAX as f64 + 1.0);
        ((self.k - 1) as f64 / fraction).round() as u64
    }
}

/// One bucket of an equal-depth histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub lower: Vec<u8>,
    pub upper: Vec<u8>,
    /// Values in the bucket.
    pub count: u64,
    /// Distinct values in the bucket.
    pub distinct: u64,
}

/// Histogram whose buckets each hold about the same number of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<HistogramBucket>,
}

impl Histogram {
    /// Builds a histogram over sorted values.
    pub fn equal_depth(sorted: &[Bytes], bucket_count: usize) -> Self {
        let n = sorted.len();
        let bucket_count = bucket_count.min(n);
        let buckets = (0..bucket_count)
            .map(|i| {
                let slice = &sorted[i * n / bucket_count..(i + 1) * n / bucket_count];
                HistogramBucket {
                    lower: slice[0].to_vec(),
                    upper: slice[slice.len() - 1].to_vec(),
                    count: slice.len() as u64,
                    distinct: 1 + slice.windows(2).filter(|w| w[0] != w[1]).count() as u64,
                }
            })
            .collect();
        Self { buckets }
    }

    /// Estimated number of values within the bounds.
    ///
    /// Buckets wholly inside count fully; buckets the bounds cut through
    /// count half, since byte strings can't be interpolated.
    pub fn estimate_range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> f64 {
        let above_lower = |v: &[u8]| match lower {
            Bound::Included(lo) => v >= lo,
            Bound::Excluded(lo) => v > lo,
            Bound::Unbounded => true,
        };
        let below_upper = |v: &[u8]| match upper {
            Bound::Included(hi) => v <= hi,
            Bound::Excluded(hi) => v < hi,
            Bound::Unbounded => true,
        };

        self.buckets
            .iter()
            .map(|b| {
                let (lo, hi) = (b.lower.as_slice(), b.upper.as_slice());
                let lo_in = above_lower(lo) && below_upper(lo);
                let hi_in = above_lower(hi) && below_upper(hi);
                let disjoint = !below_upper(lo) || !above_lower(hi);
                if lo_in && hi_in {
                    b.count as f64
                } else if disjoint {
                    0.0
                } else {
                    b.count as f64 / 2.0
                }
            })
            .sum()
    }
}

/// Statistics of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub name: String,
    pub null_count: u64,
    pub distinct_count: u64,
    pub min_value: Option<Vec<u8>>,
    pub max_value: Option<Vec<u8>>,
    pub histogram: Option<Histogram>,
    /// Values seen more than once, most frequent first.
    pub most_common_values: Vec<(Vec<u8>, u64)>,
}

/// A column-independent condition on values.
#[derive(Debug, Clone, Copy)]
pub enum Predicate<'a> {
    Equals(&'a [u8]),
    Range(Bound<&'a [u8]>, Bound<&'a [u8]>),
}

/// Statistics of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableStatistics {
    pub table_name: String,
    pub row_count: u64,
    /// Mean key plus value length in bytes.
    pub avg_row_size: u64,
    pub columns: Vec<ColumnStatistics>,
    /// Seconds since the Unix epoch.
    pub last_updated: u64,
}

impl TableStatistics {
    pub fn column(&self, name: &str) -> Option<&ColumnStatistics> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Fraction of rows whose `column` equals `value`.
    pub fn estimate_equality_selectivity(&self, column: &str, value: &[u8]) -> f64 {
        if self.row_count == 0 {
            return 0.0;
        }
        let Some(col) = self.column(column) else {
            return DEFAULT_EQUALITY_SELECTIVITY;
        };
        let rows = self.row_count as f64;

        if let Some((_, count)) = col.most_common_values.iter().find(|(v, _)| v == value) {
            return *count as f64 / rows;
        }
        let outside = match (&col.min_value, &col.max_value) {
            (Some(min), Some(max)) => value < min.as_slice() || value > max.as_slice(),
            _ => true,
        };
        if outside {
            return 0.0;
        }

        // Spread what the common values leave over the remaining distincts.
        let non_null = self.row_count - col.null_count;
        let common_rows: u64 = col.most_common_values.iter().map(|(_, c)| c).sum();
        let rest_distinct = col
            .distinct_count
            .saturating_sub(col.most_common_values.len() as u64)
            .max(1);
        (non_null.saturating_sub(common_rows) as f64 / rest_distinct as f64 / rows).min(1.0)
    }

    /// Fraction of rows whose `column` lies within the bounds.
    pub fn estimate_range_selectivity(
        &self,
        column: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> f64 {
        if self.row_count == 0 {
            return 0.0;
        }
        match self.column(column).and_then(|c| c.histogram.as_ref()) {
            Some(histogram) => {
                (histogram.estimate_range(lower, upper) / self.row_count as f64).min(1.0)
            }
            None => DEFAULT_RANGE_SELECTIVITY,
        }
    }

    pub fn estimate_selectivity(&self, column: &str, predicate: Predicate<'_>) -> f64 {
        match predicate {
            Predicate::Equals(value) => self.estimate_equality_selectivity(column, value),
            Predicate::Range(lower, upper) => {
                self.estimate_range_selectivity(column, lower, upper)
            }
        }
    }

    /// Estimated number of rows matching `predicate`.
    pub fn estimate_result_size(&self, column: &str, predicate: Predicate<'_>) -> u64 {
        (self.row_count as f64 * self.estimate_selectivity(column, predicate)).round() as u64
    }
}

/// Per-column accumulator used during collection.
struct ColumnAccumulator {
    name: String,
    nulls: u64,
    values: Vec<Bytes>,
    sketch: DistinctSketch,
}

impl ColumnAccumulator {
    fn finish(mut self, config: &StatisticsConfig) -> ColumnStatistics {
        self.values.sort_unstable();
        let histogram =
            (!self.values.is_empty()).then(|| Histogram::equal_depth(&self.values, config.histogram_buckets));

        let mut runs: Vec<(Vec<u8>, u64)> = Vec::new();
        for chunk in self.values.chunk_by(|a, b| a == b) {
            if chunk.len() > 1 {
                runs.push((chunk[0].to_vec(), chunk.len() as u64));
            }
        }
        runs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        runs.truncate(config.most_common_values);

        ColumnStatistics {
            name: self.name,
            null_count: self.nulls,
            distinct_count: self.sketch.estimate(),
            min_value: self.values.first().map(|v| v.to_vec()),
            max_value: self.values.last().map(|v| v.to_vec()),
            histogram,
            most_common_values: runs,
        }
    }
}

/// Computes and keeps statistics for the tables of one database.
pub struct StatisticsCollector {
    config: StatisticsConfig,
    tables: RwLock<HashMap<String, TableDef>>,
    stats: RwLock<HashMap<String, Arc<TableStatistics>>>,
}

impl StatisticsCollector {
    pub fn new(config: StatisticsConfig) -> Self {
        Self {
            config,
            tables: RwLock::new(HashMap::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a table, replacing any table of the same name. Statistics
    /// gathered under the old definition are dropped.
    pub fn register_table(&self, table: TableDef) {
        self.stats.write().remove(&table.name);
        self.tables.write().insert(table.name.clone(), table);
    }

    pub fn table(&self, name: &str) -> Result<TableDef> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::Internal(format!("unknown table {}", name)))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Computes statistics of `table` from its rows and stores them.
    pub fn collect<I>(&self, table: &str, rows: I) -> Result<Arc<TableStatistics>>
    where
        I: IntoIterator<Item = Result<(Bytes, Bytes)>>,
    {
        let started = Instant::now();
        let def = self.table(table)?;
        let mut columns: Vec<ColumnAccumulator> = def
            .decoder
            .columns()
            .into_iter()
            .map(|name| ColumnAccumulator {
                name,
                nulls: 0,
                values: Vec::new(),
                sketch: DistinctSketch::new(self.config.distinct_sketch_size),
            })
            .collect();

        let mut row_count = 0u64;
        let mut total_bytes = 0u64;
        for row in rows {
            let (key, value) = row?;
            row_count += 1;
            total_bytes += (key.len() + value.len()) as u64;

            let fields = def.decoder.decode(&key, &value)?;
            for (column, field) in columns.iter_mut().zip(fields) {
                match field {
                    Some(v) => {
                        column.sketch.insert(&v);
                        column.values.push(v);
                    }
                    None => column.nulls += 1,
                }
            }
        }

        let stats = Arc::new(TableStatistics {
            table_name: def.name.clone(),
            row_count,
            avg_row_size: total_bytes.checked_div(row_count).unwrap_or(0),
            columns: columns.into_iter().map(|c| c.finish(&self.config)).collect(),
            last_updated: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        });
        self.stats.write().insert(def.name.clone(), stats.clone());

        info!(
            table = %def.name,
            rows = row_count,
            columns = stats.columns.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statistics collected"
        );
        Ok(stats)
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableStatistics>> {
        self.stats.read().get(table).cloned()
    }

    /// Forgets the statistics of `table`.
    pub fn invalidate(&self, table: &str) -> bool {
        self.stats.write().remove(table).is_some()
    }

    /// Selectivity of `predicate` on `table.column`, or a default when the
    /// table has no statistics.
    pub fn estimate_selectivity(&self, table: &str, column: &str, predicate: Predicate<'_>) -> f64 {
        self.get(table)
            .map(|s| s.estimate_selectivity(column, predicate))
            .unwrap_or(DEFAULT_SELECTIVITY)
    }

    pub fn estimate_result_size(&self, table: &str, column: &str, predicate: Predicate<'_>) -> u64 {
        self.get(table)
            .map(|s| s.estimate_result_size(column, predicate))
            .unwrap_or(DEFAULT_ROW_ESTIMATE)
    }
}
