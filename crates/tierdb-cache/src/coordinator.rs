//! Read-through / write-through across the cache tiers.
//!
//! Lookups go local, then remote, then storage. Whatever a slower tier
//! answers is written into every faster tier before returning, and a
//! storage miss is remembered as a tombstone with the type's TTL.

use std::collections::{HashMap, HashSet};

use asupersync::{Cx, Outcome};
use tierdb_core::{
    Condition, Connection, Entity, Error, RemoteCache, Statement, Value, try_outcome, try_result,
};

use crate::engine::{Engine, StatsCounters};
use crate::keys::{CacheEntry, entity_key};
use crate::registry::EntityMeta;

impl<S: Connection, R: RemoteCache> Engine<S, R> {
    /// Resolve rows by primary key.
    ///
    /// Returns column values keyed by id; ids with no live row (missing or
    /// fake-deleted) are absent from the map.
    pub async fn get_rows(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        ids: &[u64],
    ) -> Outcome<HashMap<u64, Vec<Value>>, Error> {
        let mut found = HashMap::new();
        let mut seen = HashSet::new();
        let mut pending: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| *id != 0 && seen.insert(*id))
            .collect();
        if pending.is_empty() {
            return Outcome::Ok(found);
        }

        if let Some(local) = self.local_tier(meta) {
            pending.retain(|id| {
                let key = entity_key(&meta.fingerprint, *id);
                match local.get(&key) {
                    Some(CacheEntry::Row(values)) => {
                        log_cache("local", "get", &key, "hit");
                        StatsCounters::bump(&self.counters().local_hits, 1);
                        found.insert(*id, values);
                        false
                    }
                    Some(CacheEntry::Missing) => {
                        log_cache("local", "get", &key, "hit");
                        StatsCounters::bump(&self.counters().local_hits, 1);
                        false
                    }
                    Some(CacheEntry::Ids(_)) | None => {
                        log_cache("local", "get", &key, "miss");
                        true
                    }
                }
            });
        }

        if !pending.is_empty() {
            if let Some(pool) = self.remote_tier(meta) {
                let keys: Vec<String> = pending
                    .iter()
                    .map(|id| entity_key(&meta.fingerprint, *id))
                    .collect();
                let raw = {
                    let conn = try_outcome!(pool.acquire(cx).await);
                    try_outcome!(conn.mget(cx, &keys).await)
                };
                let mut still = Vec::new();
                for ((id, key), raw) in pending.iter().zip(keys).zip(raw) {
                    let entry = match raw.as_deref().map(CacheEntry::decode) {
                        Some(Ok(entry @ (CacheEntry::Row(_) | CacheEntry::Missing))) => entry,
                        Some(Err(e)) => {
                            tracing::warn!(
                                target: "tierdb::cache",
                                key = %key,
                                error = %e,
                                "undecodable remote entry treated as miss"
                            );
                            still.push(*id);
                            continue;
                        }
                        Some(Ok(CacheEntry::Ids(_))) | None => {
                            log_cache("remote", "get", &key, "miss");
                            still.push(*id);
                            continue;
                        }
                    };
                    log_cache("remote", "get", &key, "hit");
                    StatsCounters::bump(&self.counters().remote_hits, 1);
                    if let Some(local) = self.local_tier(meta) {
                        local.set(key.clone(), entry.clone(), meta.schema.cache_ttl);
                        log_cache("local", "set", &key, "set");
                    }
                    if let CacheEntry::Row(values) = entry {
                        found.insert(*id, values);
                    }
                }
                pending = still;
            }
        }

        if !pending.is_empty() {
            let loaded = try_outcome!(self.load_from_storage(cx, meta, &pending).await);
            if meta.schema.is_cached() {
                let mut entries = Vec::with_capacity(pending.len());
                for id in &pending {
                    let key = entity_key(&meta.fingerprint, *id);
                    match loaded.get(id) {
                        Some(values) => entries.push((key, CacheEntry::Row(values.clone()))),
                        None => entries.push((key, CacheEntry::Missing)),
                    }
                }
                try_outcome!(self.write_entries(cx, meta, entries).await);
            }
            found.extend(loaded);
        }

        found.retain(|_, values| !meta.is_fake_deleted(values));
        Outcome::Ok(found)
    }

    /// Load rows straight from storage, bypassing every tier.
    pub async fn load_from_storage(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        ids: &[u64],
    ) -> Outcome<HashMap<u64, Vec<Value>>, Error> {
        let stmt = Statement::Select {
            table: meta.schema.table,
            columns: Vec::new(),
            filter: vec![Condition::any_of(
                meta.schema.primary_key,
                ids.iter().map(|id| Value::from(*id)).collect(),
            )],
            order: Vec::new(),
            limit: None,
        };
        let rows = try_outcome!(self.query(cx, meta, &stmt).await);
        StatsCounters::bump(&self.counters().storage_loads, 1);
        let mut loaded = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(id) = row.get_by_name(meta.schema.primary_key).and_then(Value::as_id) else {
                continue;
            };
            loaded.insert(id, meta.values_from_row(&row));
        }
        Outcome::Ok(loaded)
    }

    /// Read one entry from the remote tier without promotion or a storage
    /// fallback.
    ///
    /// `None` means the tier holds nothing for the id, or the type has no
    /// remote tier. Undecodable entries count as absent.
    pub async fn remote_entry(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        id: u64,
    ) -> Outcome<Option<CacheEntry>, Error> {
        let Some(pool) = self.remote_tier(meta) else {
            return Outcome::Ok(None);
        };
        let key = entity_key(&meta.fingerprint, id);
        let raw = {
            let conn = try_outcome!(pool.acquire(cx).await);
            try_outcome!(conn.get(cx, &key).await)
        };
        let entry = match raw.as_deref().map(CacheEntry::decode) {
            Some(Ok(entry @ (CacheEntry::Row(_) | CacheEntry::Missing))) => Some(entry),
            Some(Err(e)) => {
                tracing::warn!(
                    target: "tierdb::cache",
                    key = %key,
                    error = %e,
                    "undecodable remote entry treated as miss"
                );
                None
            }
            Some(Ok(CacheEntry::Ids(_))) | None => None,
        };
        log_cache("remote", "get", &key, if entry.is_some() { "hit" } else { "miss" });
        Outcome::Ok(entry)
    }

    /// Write-through after a successful insert or update.
    pub async fn set_rows(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        rows: &[(u64, Vec<Value>)],
    ) -> Outcome<(), Error> {
        if !meta.schema.is_cached() || rows.is_empty() {
            return Outcome::Ok(());
        }
        let entries = rows
            .iter()
            .map(|(id, values)| {
                (
                    entity_key(&meta.fingerprint, *id),
                    CacheEntry::Row(values.clone()),
                )
            })
            .collect();
        self.write_entries(cx, meta, entries).await
    }

    /// Drop cached rows from every tier.
    pub async fn invalidate_rows(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        ids: &[u64],
    ) -> Outcome<usize, Error> {
        if !meta.schema.is_cached() || ids.is_empty() {
            return Outcome::Ok(0);
        }
        let keys = ids
            .iter()
            .map(|id| entity_key(&meta.fingerprint, *id))
            .collect();
        self.remove_keys(cx, meta, keys).await
    }

    /// Manually drop cached rows of `E`.
    pub async fn clear_by_ids<E: Entity>(&self, cx: &Cx, ids: &[u64]) -> Outcome<usize, Error> {
        let meta = try_result!(self.meta::<E>());
        self.invalidate_rows(cx, &meta, ids).await
    }

    /// Store entries in every tier configured for the type.
    pub(crate) async fn write_entries(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        entries: Vec<(String, CacheEntry)>,
    ) -> Outcome<(), Error> {
        if entries.is_empty() {
            return Outcome::Ok(());
        }
        let ttl = meta.schema.cache_ttl;
        if let Some(local) = self.local_tier(meta) {
            for (key, entry) in &entries {
                local.set(key.clone(), entry.clone(), ttl);
                log_cache("local", "set", key, "set");
            }
        }
        if let Some(pool) = self.remote_tier(meta) {
            let mut encoded = Vec::with_capacity(entries.len());
            for (key, entry) in entries {
                let payload = try_result!(entry.encode());
                log_cache("remote", "set", &key, "set");
                encoded.push((key, payload));
            }
            let conn = try_outcome!(pool.acquire(cx).await);
            try_outcome!(conn.mset(cx, encoded, ttl).await);
        }
        Outcome::Ok(())
    }

    /// Delete keys from every tier configured for the type.
    pub(crate) async fn remove_keys(
        &self,
        cx: &Cx,
        meta: &EntityMeta,
        keys: Vec<String>,
    ) -> Outcome<usize, Error> {
        if keys.is_empty() {
            return Outcome::Ok(0);
        }
        let mut removed = 0;
        if let Some(local) = self.local_tier(meta) {
            removed = local.remove(&keys);
        }
        if let Some(pool) = self.remote_tier(meta) {
            let conn = try_outcome!(pool.acquire(cx).await);
            let n = try_outcome!(conn.del(cx, &keys).await);
            removed = removed.max(usize::try_from(n).unwrap_or(usize::MAX));
        }
        for key in &keys {
            log_cache("all", "del", key, "del");
        }
        Outcome::Ok(removed)
    }
}

pub(crate) fn log_cache(tier: &str, op: &str, key: &str, outcome: &str) {
    tracing::trace!(target: "tierdb::cache", tier, op, key, outcome, "cache");
}
