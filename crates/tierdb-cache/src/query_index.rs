//! Cached query index.
//!
//! A named query's full, ordered id list is cached under a key derived from
//! the query name and its arguments, never the page. Pages are sliced from
//! the cached list. Writes drop the lists they may have changed; the next
//! read rebuilds them with a single storage query.

use std::collections::HashSet;

use asupersync::{Cx, Outcome};
use tierdb_core::{
    CachedQuery, Condition, Connection, Error, QueryMode, RemoteCache, SchemaError,
    SchemaErrorKind, SortKey, Statement, Value, try_outcome, try_result,
};

use crate::changes::{ChangeKind, RowChange};
use crate::coordinator::log_cache;
use crate::engine::{Engine, StatsCounters};
use crate::keys::{CacheEntry, index_key};
use crate::registry::EntityMeta;

/// A page request. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    pub page: usize,
    pub page_size: usize,
}

impl Default for Pager {
    fn default() -> Self {
        Self::all()
    }
}

impl Pager {
    pub const fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    /// A single page holding everything.
    pub const fn all() -> Self {
        Self {
            page: 1,
            page_size: usize::MAX,
        }
    }

    pub fn offset(&self) -> usize {
        self.page.max(1).saturating_sub(1).saturating_mul(self.page_size)
    }

    /// The part of `items` this page covers.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.offset().min(items.len());
        let end = start.saturating_add(self.page_size).min(items.len());
        &items[start..end]
    }
}

impl<S: Connection, R: RemoteCache> Engine<S, R> {
    /// Effective ceiling of a cached list.
    pub fn ceiling(&self, query: &CachedQuery) -> usize {
        query.max_rows.unwrap_or(self.config().default_max_rows)
    }

    /// Resolve the full ordered id list of a cached query.
    ///
    /// Fails with [`Error::IndexCapacityExceeded`] when the matching set
    /// is larger than the query's ceiling; nothing is cached in that case.
    pub async fn search_ids(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        index: &str,
        args: &[Value],
    ) -> Outcome<Vec<u64>, Error> {
        let query = try_result!(meta.cached_query(index));
        if args.len() != query.filters.len() {
            return Outcome::Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::Invalid,
                message: format!(
                    "cached query '{}' takes {} arguments, got {}",
                    query.name,
                    query.filters.len(),
                    args.len()
                ),
            }));
        }
        let key = index_key(&meta.fingerprint, query.name, args);

        if let Some(local) = self.local_tier(meta) {
            if let Some(CacheEntry::Ids(ids)) = local.get(&key) {
                log_cache("local", "get", &key, "hit");
                StatsCounters::bump(&self.counters().index_hits, 1);
                return Outcome::Ok(ids);
            }
            log_cache("local", "get", &key, "miss");
        }

        if let Some(pool) = self.remote_tier(meta) {
            let raw = {
                let conn = try_outcome!(pool.acquire(cx).await);
                try_outcome!(conn.get(cx, &key).await)
            };
            match raw.as_deref().map(CacheEntry::decode) {
                Some(Ok(CacheEntry::Ids(ids))) => {
                    log_cache("remote", "get", &key, "hit");
                    StatsCounters::bump(&self.counters().index_hits, 1);
                    if let Some(local) = self.local_tier(meta) {
                        local.set(key.clone(), CacheEntry::Ids(ids.clone()), meta.schema.cache_ttl);
                        log_cache("local", "set", &key, "set");
                    }
                    return Outcome::Ok(ids);
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        target: "tierdb::cache",
                        key = %key,
                        error = %e,
                        "undecodable cached list treated as miss"
                    );
                }
                Some(Ok(_)) | None => log_cache("remote", "get", &key, "miss"),
            }
        }

        let ceiling = self.ceiling(query);
        let stmt = rebuild_statement(meta, query, args, ceiling);
        let rows = try_outcome!(self.query(cx, meta, &stmt).await);
        StatsCounters::bump(&self.counters().index_rebuilds, 1);
        let pk = meta.schema.primary_key;
        let ids: Vec<u64> = rows
            .iter()
            .filter_map(|row| row.get_by_name(pk).and_then(Value::as_id))
            .collect();
        if ids.len() > ceiling {
            tracing::warn!(
                target: "tierdb::cache",
                entity = meta.name,
                index = query.name,
                ceiling,
                "cached query exceeds its ceiling"
            );
            return Outcome::Err(Error::IndexCapacityExceeded {
                index: query.name.to_string(),
                ceiling,
            });
        }

        if meta.schema.is_cached() {
            try_outcome!(
                self.write_entries(cx, meta, vec![(key, CacheEntry::Ids(ids.clone()))])
                    .await
            );
        }
        Outcome::Ok(ids)
    }

    /// Drop every cached list a batch of row changes may have affected.
    pub async fn invalidate_indexes(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        changes: &[RowChange],
    ) -> Outcome<usize, Error> {
        if !meta.schema.is_cached() || meta.schema.cached_queries.is_empty() {
            return Outcome::Ok(0);
        }
        let mut seen = HashSet::new();
        let keys: Vec<String> = changes
            .iter()
            .flat_map(|change| affected_index_keys(meta, change))
            .filter(|key| seen.insert(key.clone()))
            .collect();
        if !keys.is_empty() {
            tracing::debug!(
                target: "tierdb::cache",
                entity = meta.name,
                lists = keys.len(),
                "invalidating cached lists"
            );
        }
        self.remove_keys(cx, meta, keys).await
    }
}

/// Single query returning the whole matching id set, one row past the ceiling.
fn rebuild_statement(
    meta: &EntityMeta,
    query: &CachedQuery,
    args: &[Value],
    ceiling: usize,
) -> Statement {
    let pk = meta.schema.primary_key;
    let mut filter: Vec<Condition> = query
        .filters
        .iter()
        .zip(args)
        .map(|(column, value)| Condition::eq(*column, value.clone()))
        .collect();
    if let Some(flag) = meta.schema.fake_delete {
        filter.push(Condition::eq(flag, false));
    }
    let mut order = query.order.clone();
    if !order.iter().any(|k| k.column == pk) {
        order.push(SortKey {
            column: pk,
            descending: false,
        });
    }
    let limit = match query.mode {
        QueryMode::One => 1,
        QueryMode::Many => ceiling.saturating_add(1),
    };
    Statement::Select {
        table: meta.schema.table,
        columns: vec![pk],
        filter,
        order,
        limit: Some(limit),
    }
}

/// Keys of the cached lists one row change may have altered.
///
/// Inserts hit the list of the new argument combination and deletes the
/// list of the last known one. An update touches both combinations when a
/// template column changed or the fake-delete flag flipped. Unfiltered
/// queries have a single combination.
pub fn affected_index_keys(meta: &EntityMeta, change: &RowChange) -> Vec<String> {
    let mut keys = Vec::new();
    for query in &meta.schema.cached_queries {
        let key_for = |values: &[Value]| {
            let args: Vec<Value> = query
                .filters
                .iter()
                .map(|column| meta.value_in(change.id, values, column))
                .collect();
            index_key(&meta.fingerprint, query.name, &args)
        };
        let touched = match change.kind {
            ChangeKind::Insert | ChangeKind::Delete => true,
            ChangeKind::Update => {
                change.fake_delete_flipped(meta)
                    || query
                        .template_columns()
                        .any(|column| change.column_changed(meta, column))
            }
        };
        if !touched {
            continue;
        }
        for values in [&change.prior, &change.current].into_iter().flatten() {
            let key = key_for(values);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Hooks;
    use crate::test_support::Person;

    fn meta() -> EntityMeta {
        EntityMeta::for_type::<Person>(Hooks::default())
    }

    fn values(name: &str, age: i32) -> Vec<Value> {
        vec![Value::from(name), Value::Int(age), Value::Bool(false)]
    }

    #[test]
    fn pager_slices_second_page() {
        let ids = [1, 2, 3, 4, 5];
        assert_eq!(Pager::new(2, 4).slice(&ids), &[5]);
        assert_eq!(Pager::new(2, 4).slice(&ids), &ids[4..]);
        assert_eq!(Pager::new(3, 4).slice(&ids), &[] as &[i32]);
        assert_eq!(Pager::all().slice(&ids), &ids);
        assert_eq!(Pager::new(0, 2).slice(&ids), &[1, 2]);
    }

    #[test]
    fn age_change_drops_both_combinations() {
        let meta = meta();
        let change = RowChange::update(1, values("a", 10), values("a", 18));
        let keys = affected_index_keys(&meta, &change);
        assert!(keys.contains(&index_key(&meta.fingerprint, "IndexAge", &[Value::Int(10)])));
        assert!(keys.contains(&index_key(&meta.fingerprint, "IndexAge", &[Value::Int(18)])));
        assert!(keys.contains(&index_key(&meta.fingerprint, "All", &[])));
    }

    #[test]
    fn unrelated_update_keeps_lists() {
        let meta = meta();
        let change = RowChange::update(1, values("a", 10), values("b", 10));
        assert!(affected_index_keys(&meta, &change).is_empty());
    }

    #[test]
    fn fake_delete_flip_drops_last_combination() {
        let meta = meta();
        let mut deleted = values("a", 10);
        deleted[2] = Value::Bool(true);
        let change = RowChange::update(3, values("a", 10), deleted);
        let keys = affected_index_keys(&meta, &change);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&index_key(&meta.fingerprint, "IndexAge", &[Value::Int(10)])));
    }

    #[test]
    fn insert_and_delete_touch_one_combination_each() {
        let meta = meta();
        let insert = affected_index_keys(&meta, &RowChange::insert(9, values("z", 18)));
        assert_eq!(
            insert,
            vec![
                index_key(&meta.fingerprint, "IndexAge", &[Value::Int(18)]),
                index_key(&meta.fingerprint, "All", &[]),
            ]
        );
        let delete = affected_index_keys(&meta, &RowChange::delete(9, values("z", 18)));
        assert_eq!(insert, delete);
    }

    #[test]
    fn rebuild_adds_fake_delete_filter_and_key_order() {
        let meta = meta();
        let query = meta.cached_query("IndexAge").unwrap();
        let stmt = rebuild_statement(&meta, query, &[Value::Int(10)], 50_000);
        assert_eq!(
            stmt.to_sql(),
            "SELECT \"id\" FROM \"people\" WHERE \"age\" = $1 AND \"fake_delete\" = $2 ORDER BY \"id\" ASC LIMIT 50001"
        );
    }
}
