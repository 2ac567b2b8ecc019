//! Compiled plan cache.
//!
//! Plans are keyed by a [`Fingerprint`] holding the normalized statement
//! text, so two statements share a plan only if they normalize to the same
//! text. Entries are evicted least recently used once the cache exceeds its
//! entry count or byte budget. Every entry records the tables its plan reads, so a
//! schema or statistics change on one table drops exactly the plans that
//! depend on it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::{PlanCacheConfig, Result};
use tracing::debug;

/// A plan the cache can hold.
pub trait CachedPlan: Clone + Send {
    /// Tables the plan reads or writes.
    fn referenced_tables(&self) -> Vec<String>;

    /// Rough memory footprint in bytes, charged against the byte budget.
    fn approximate_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Plan compiled by the SQL layer into an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPlan {
    pub tables: Vec<String>,
    pub body: Bytes,
}

impl CompiledPlan {
    pub fn new(tables: &[&str], body: impl Into<Bytes>) -> Self {
        Self {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            body: body.into(),
        }
    }
}

impl CachedPlan for CompiledPlan {
    fn referenced_tables(&self) -> Vec<String> {
        self.tables.clone()
    }

    fn approximate_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.body.len()
            + self.tables.iter().map(|t| t.len()).sum::<usize>()
    }
}

/// Normalized identifier of a statement.
///
/// Equality compares the full normalized text; the 64-bit digest is only
/// for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    text: Arc<str>,
}

impl Fingerprint {
    /// Fingerprints statement text. Runs of whitespace collapse to one
    /// space and ASCII letters fold to lower case, except inside
    /// single-quoted literals.
    pub fn of(sql: &str) -> Self {
        Fingerprint {
            text: normalize(sql).into(),
        }
    }

    /// The normalized statement.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Short digest of the normalized statement, for logs.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.text.hash(&mut hasher);
        hasher.finish()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.digest())
    }
}

fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut pending_space = false;
    for c in sql.trim().chars() {
        if in_literal {
            out.push(c);
            in_literal = c != '\'';
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c.to_ascii_lowercase());
        in_literal = c == '\'';
    }
    out
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanCacheStats {
    /// Number of cached plans.
    pub size: usize,
    /// Summed approximate size of the cached plans.
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0 before the first lookup.
    pub hit_rate: f64,
}

/// Metadata of one cached plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub cached_at: Instant,
    pub last_used: Instant,
    pub hit_count: u64,
    /// Schema version current when the plan was cached.
    pub schema_version: u64,
    pub size: usize,
}

struct CacheEntry<P> {
    plan: P,
    /// Referenced tables, lower-cased.
    tables: Vec<String>,
    info: EntryInfo,
    /// Position in the recency order.
    tick: u64,
}

struct CacheState<P> {
    entries: HashMap<Fingerprint, CacheEntry<P>>,
    /// tick -> fingerprint, oldest first.
    recency: BTreeMap<u64, Fingerprint>,
    clock: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    schema_version: u64,
    /// Bumped by every invalidation; compiles that straddle one aren't cached.
    generation: u64,
}

impl<P: CachedPlan> CacheState<P> {
    fn hit(&mut self, fingerprint: &Fingerprint) -> Option<P> {
        self.clock += 1;
        let tick = self.clock;
        let entry = self.entries.get_mut(fingerprint)?;
        self.recency.remove(&entry.tick);
        self.recency.insert(tick, fingerprint.clone());
        entry.tick = tick;
        entry.info.hit_count += 1;
        entry.info.last_used = Instant::now();
        self.hits += 1;
        Some(entry.plan.clone())
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry<P>> {
        let entry = self.entries.remove(fingerprint)?;
        self.recency.remove(&entry.tick);
        self.bytes -= entry.info.size;
        Some(entry)
    }

    fn remove_where(&mut self, mut doomed: impl FnMut(&CacheEntry<P>) -> bool) -> usize {
        let victims: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| doomed(e))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &victims {
            self.remove(fp);
        }
        victims.len()
    }

    fn over_budget(&self, config: &PlanCacheConfig) -> bool {
        self.entries.len() > config.max_entries
            || config.max_bytes.is_some_and(|max| self.bytes > max)
    }
}

/// LRU cache of compiled plans for one database.
pub struct PlanCache<P> {
    state: Mutex<CacheState<P>>,
    config: PlanCacheConfig,
}

impl<P: CachedPlan> PlanCache<P> {
    pub fn new(config: PlanCacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                clock: 0,
                bytes: 0,
                hits: 0,
                misses: 0,
                schema_version: 0,
                generation: 0,
            }),
            config,
        }
    }

    /// Looks up a plan, counting a hit or a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<P> {
        let mut state = self.state.lock();
        let plan = state.hit(fingerprint);
        if plan.is_none() {
            state.misses += 1;
        }
        plan
    }

    /// Caches `plan`, replacing any plan under the same fingerprint.
    pub fn insert(&self, fingerprint: Fingerprint, plan: P) {
        let mut state = self.state.lock();
        self.store(&mut state, fingerprint, plan);
    }

    /// Returns the cached plan, or compiles, caches and returns a new one.
    ///
    /// `compile` runs without the cache locked. If two callers compile the
    /// same statement at once, the first plan stored wins and both get it.
    /// A plan compiled across an invalidation is returned but not cached.
    pub fn get_or_compile<F>(&self, fingerprint: &Fingerprint, compile: F) -> Result<P>
    where
        F: FnOnce() -> Result<P>,
    {
        let generation = {
            let mut state = self.state.lock();
            if let Some(plan) = state.hit(fingerprint) {
                return Ok(plan);
            }
            state.misses += 1;
            state.generation
        };

        let plan = compile()?;

        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(fingerprint = %fingerprint, "Plan compiled across an invalidation, not cached");
            return Ok(plan);
        }
        if let Some(existing) = state.entries.get(fingerprint) {
            return Ok(existing.plan.clone());
        }
        self.store(&mut state, fingerprint.clone(), plan.clone());
        Ok(plan)
    }

    fn store(&self, state: &mut CacheState<P>, fingerprint: Fingerprint, plan: P) {
        state.remove(&fingerprint);

        let now = Instant::now();
        let size = plan.approximate_size();
        state.clock += 1;
        let tick = state.clock;
        let tables = plan
            .referenced_tables()
            .into_iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        let info = EntryInfo {
            cached_at: now,
            last_used: now,
            hit_count: 0,
            schema_version: state.schema_version,
            size,
        };
        state.recency.insert(tick, fingerprint.clone());
        state.entries.insert(
            fingerprint,
            CacheEntry {
                plan,
                tables,
                info,
                tick,
            },
        );
        state.bytes += size;

        // The newest plan stays even if it alone exceeds the byte budget.
        let mut evicted = 0;
        while state.entries.len() > 1 && state.over_budget(&self.config) {
            let Some((_, victim)) = state.recency.pop_first() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&victim) {
                state.bytes -= entry.info.size;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, size = state.entries.len(), bytes = state.bytes, "Evicted cached plans");
        }
    }

    /// Drops every plan that references `table`. Returns the number dropped.
    pub fn invalidate(&self, table: &str) -> usize {
        let table = table.to_ascii_lowercase();
        let mut state = self.state.lock();
        state.generation += 1;
        let removed = state.remove_where(|e| e.tables.contains(&table));
        debug!(table = %table, removed, "Invalidated cached plans");
        removed
    }

    /// Drops every plan and starts a new schema version.
    pub fn invalidate_all(&self) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        state.schema_version += 1;
        let removed = state.remove_where(|_| true);
        debug!(removed, schema_version = state.schema_version, "Invalidated all cached plans");
        removed
    }

    /// Drops plans not used within `max_age`.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let removed = state.remove_where(|e| e.info.last_used.elapsed() > max_age);
        if removed > 0 {
            debug!(removed, max_age_ms = max_age.as_millis() as u64, "Evicted stale plans");
        }
        removed
    }

    /// Drops every plan. Hit and miss counters are kept.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        state.generation += 1;
        state.remove_where(|_| true)
    }

    pub fn stats(&self) -> PlanCacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        PlanCacheStats {
            size: state.entries.len(),
            bytes: state.bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    pub fn entry_info(&self, fingerprint: &Fingerprint) -> Option<EntryInfo> {
        self.state.lock().entries.get(fingerprint).map(|e| e.info)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.state.lock().entries.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schema_version(&self) -> u64 {
        self.state.lock().schema_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;
    use strata_common::StrataError;

    fn cache(max_entries: usize) -> PlanCache<CompiledPlan> {
        PlanCache::new(PlanCacheConfig {
            max_entries,
            max_bytes: None,
        })
    }

    fn plan(table: &str) -> CompiledPlan {
        CompiledPlan::new(&[table], format!("scan {}", table))
    }

    fn fp(n: u32) -> Fingerprint {
        Fingerprint::of(&format!("SELECT {}", n))
    }

    #[test]
    fn test_fingerprint_normalization() {
        assert_eq!(
            Fingerprint::of("SELECT  *\n  FROM Users "),
            Fingerprint::of("select * from users")
        );
        assert_ne!(
            Fingerprint::of("SELECT * FROM users WHERE name = 'Bob'"),
            Fingerprint::of("select * from users where name = 'bob'")
        );
        assert_eq!(normalize("WHERE  x = 'A  B'"), "where x = 'A  B'");
        assert_eq!(normalize("SELECT 'it''s'  AS X"), "select 'it''s' as x");

        let stmt = Fingerprint::of("SELECT  1");
        assert_eq!(stmt.text(), "select 1");
        assert_eq!(stmt.to_string(), format!("{:016x}", stmt.digest()));
    }

    #[test]
    fn test_plans_are_keyed_by_full_text() {
        let cache = cache(10);
        let bob = Fingerprint::of("SELECT * FROM users WHERE name = 'Bob'");
        let lower = Fingerprint::of("SELECT * FROM users WHERE name = 'bob'");
        cache.insert(bob.clone(), CompiledPlan::new(&["users"], "bob"));
        cache.insert(lower.clone(), CompiledPlan::new(&["users"], "lower"));

        // Each statement gets its own plan back, never its neighbour's
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&bob).unwrap().body, Bytes::from_static(b"bob"));
        assert_eq!(cache.get(&lower).unwrap().body, Bytes::from_static(b"lower"));
        assert!(cache
            .get(&Fingerprint::of("SELECT * FROM users WHERE name = 'BOB'"))
            .is_none());
    }

    #[test]
    fn test_hit_rate_after_one_miss() {
        let cache = cache(10);
        let stmt = Fingerprint::of("SELECT * FROM users");
        let compiles = Cell::new(0);

        for _ in 0..8 {
            let plan = cache
                .get_or_compile(&stmt, || {
                    compiles.set(compiles.get() + 1);
                    Ok(plan("users"))
                })
                .unwrap();
            assert_eq!(plan.tables, vec!["users".to_string()]);
        }

        assert_eq!(compiles.get(), 1);
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 7);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 7.0 / 8.0).abs() < 1e-9);
        assert_eq!(cache.entry_info(&stmt).unwrap().hit_count, 7);
    }

    #[test]
    fn test_empty_stats() {
        let stats = cache(10).stats();
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_compile_failure_is_not_cached() {
        let cache = cache(10);
        let stmt = Fingerprint::of("SELECT nonsense");
        let result = cache.get_or_compile(&stmt, || Err(StrataError::Internal("parse error".into())));
        assert!(result.is_err());
        assert!(!cache.contains(&stmt));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2);
        let (a, b, c) = (fp(1), fp(2), fp(3));
        cache.insert(a.clone(), plan("a"));
        cache.insert(b.clone(), plan("b"));
        assert!(cache.get(&a).is_some());

        cache.insert(c.clone(), plan("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
    }

    #[test]
    fn test_byte_budget_eviction() {
        let one = plan("t").approximate_size();
        let cache = PlanCache::new(PlanCacheConfig {
            max_entries: 100,
            max_bytes: Some(one * 3),
        });
        for i in 0..5 {
            cache.insert(fp(i), plan("t"));
        }
        let stats = cache.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.bytes, one * 3);
        assert!(!cache.contains(&fp(0)));
        assert!(cache.contains(&fp(4)));
    }

    #[test]
    fn test_insert_replaces_entry() {
        let cache = cache(10);
        cache.insert(fp(7), plan("old"));
        cache.insert(fp(7), plan("new"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&fp(7)).unwrap(), plan("new"));
        assert_eq!(cache.stats().bytes, plan("new").approximate_size());
    }

    #[test]
    fn test_invalidate_table() {
        let cache = cache(10);
        cache.insert(fp(1), plan("users"));
        cache.insert(fp(2), CompiledPlan::new(&["orders", "Users"], "join"));
        cache.insert(fp(3), plan("orders"));

        assert_eq!(cache.invalidate("USERS"), 2);
        assert!(cache.contains(&fp(3)));
        assert_eq!(cache.invalidate("users"), 0);
    }

    #[test]
    fn test_invalidate_all_bumps_schema_version() {
        let cache = cache(10);
        cache.insert(fp(1), plan("users"));
        assert_eq!(cache.entry_info(&fp(1)).unwrap().schema_version, 0);

        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.schema_version(), 1);

        cache.insert(fp(1), plan("users"));
        assert_eq!(cache.entry_info(&fp(1)).unwrap().schema_version, 1);
    }

    #[test]
    fn test_compile_across_invalidation_is_not_cached() {
        let cache = cache(10);
        let stmt = Fingerprint::of("SELECT * FROM users");
        let plan = cache
            .get_or_compile(&stmt, || {
                cache.invalidate("users");
                Ok(plan("users"))
            })
            .unwrap();
        assert_eq!(plan.tables[0], "users");
        assert!(!cache.contains(&stmt));
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = cache(10);
        cache.insert(fp(1), plan("a"));
        cache.get(&fp(1));
        cache.get(&fp(2));

        assert_eq!(cache.clear(), 1);
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_evict_older_than() {
        let cache = cache(10);
        cache.insert(fp(1), plan("a"));
        cache.insert(fp(2), plan("b"));
        thread::sleep(Duration::from_millis(40));
        cache.get(&fp(2));

        assert_eq!(cache.evict_older_than(Duration::from_millis(20)), 1);
        assert!(cache.contains(&fp(2)));
    }
}
