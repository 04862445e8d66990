//! In-process relational storage.
//!
//! Tables are created from entity schemas. Statements are evaluated
//! directly against sorted row maps; unique indexes are enforced and
//! violations are reported the way a SQL server would (SQLSTATE `23505`,
//! constraint name in `detail`).

#![allow(clippy::result_large_err)] // Error type is defined in tierdb-core

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tierdb_core::{
    ColumnInfo, Condition, Connection, Cx, EntitySchema, Error, ExecResult, Outcome, QueryError,
    QueryErrorKind, Row, SchemaError, SchemaErrorKind, SortKey, Statement, Value,
};

#[derive(Debug)]
struct Table {
    primary_key: String,
    /// Primary key first, then schema columns.
    columns: Vec<String>,
    info: Arc<ColumnInfo>,
    unique: Vec<(String, Vec<usize>)>,
    rows: BTreeMap<u64, Vec<Value>>,
    next_id: u64,
}

impl Table {
    fn position(&self, column: &str) -> Result<usize, Error> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| query_error(QueryErrorKind::NotFound, format!("no such column: {}", column)))
    }

    fn matches(&self, row: &[Value], filter: &[Condition]) -> Result<bool, Error> {
        for condition in filter {
            let pos = self.position(condition.column())?;
            if !condition.matches(&row[pos]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matching_ids(&self, filter: &[Condition]) -> Result<Vec<u64>, Error> {
        let mut ids = Vec::new();
        for (id, row) in &self.rows {
            if self.matches(row, filter)? {
                ids.push(*id);
            }
        }
        Ok(ids)
    }

    /// Name of a unique index `row` would collide on, ignoring row `skip`.
    fn unique_conflict(&self, row: &[Value], skip: u64) -> Option<&str> {
        self.unique.iter().find_map(|(name, positions)| {
            if positions.iter().any(|p| row[*p].is_null()) {
                return None;
            }
            self.rows
                .iter()
                .filter(|(id, _)| **id != skip)
                .any(|(_, other)| positions.iter().all(|p| other[*p].loose_eq(&row[*p])))
                .then_some(name.as_str())
        })
    }
}

#[derive(Debug, Default)]
struct StorageInner {
    tables: HashMap<String, Table>,
    fail_next: HashSet<String>,
}

/// An in-memory storage backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<StorageInner>,
    statements: AtomicUsize,
    queries: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StorageInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the table described by `schema`.
    pub fn create_table(&self, schema: &EntitySchema) -> Result<(), Error> {
        let mut columns = vec![schema.primary_key.to_string()];
        columns.extend(schema.columns.iter().map(|c| c.name.to_string()));
        let mut unique = Vec::with_capacity(schema.unique.len());
        for index in &schema.unique {
            let positions = index
                .columns
                .iter()
                .map(|c| {
                    columns.iter().position(|name| name == c).ok_or_else(|| {
                        Error::Schema(SchemaError {
                            kind: SchemaErrorKind::ColumnNotFound,
                            message: format!("unique index {} names unknown column {}", index.name, c),
                        })
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            unique.push((index.name.to_string(), positions));
        }

        let mut inner = self.lock();
        if inner.tables.contains_key(schema.table) {
            return Err(Error::Schema(SchemaError {
                kind: SchemaErrorKind::Duplicate,
                message: format!("table {} already exists", schema.table),
            }));
        }
        inner.tables.insert(
            schema.table.to_string(),
            Table {
                primary_key: schema.primary_key.to_string(),
                info: Arc::new(ColumnInfo::new(columns.clone())),
                columns,
                unique,
                rows: BTreeMap::new(),
                next_id: 1,
            },
        );
        Ok(())
    }

    /// Number of rows currently in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Statements executed so far, reads and writes.
    pub fn statement_count(&self) -> usize {
        self.statements.load(Ordering::Relaxed)
    }

    /// Selects executed so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.statements.store(0, Ordering::Relaxed);
        self.queries.store(0, Ordering::Relaxed);
    }

    /// Make the next write to `table` fail with a database error.
    pub fn fail_next_write(&self, table: &str) {
        self.lock().fail_next.insert(table.to_string());
    }

    fn query_sync(&self, stmt: &Statement) -> Result<Vec<Row>, Error> {
        self.statements.fetch_add(1, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);
        let Statement::Select {
            table,
            columns,
            filter,
            order,
            limit,
        } = stmt
        else {
            return Err(query_error(
                QueryErrorKind::Syntax,
                format!("{} is not a query", stmt.kind()),
            ));
        };

        let inner = self.lock();
        let table = table_ref(&inner, table)?;
        let mut rows = Vec::new();
        for row in table.rows.values() {
            if table.matches(row, filter)? {
                rows.push(row);
            }
        }
        let sort: Vec<(usize, bool)> = order
            .iter()
            .map(|SortKey { column, descending }| Ok((table.position(column)?, *descending)))
            .collect::<Result<_, Error>>()?;
        rows.sort_by(|a, b| {
            for (pos, descending) in &sort {
                let ord = a[*pos].compare(&b[*pos]);
                let ord = if *descending { ord.reverse() } else { ord };
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            CmpOrdering::Equal
        });
        if let Some(limit) = limit {
            rows.truncate(*limit);
        }

        if columns.is_empty() {
            return Ok(rows
                .into_iter()
                .map(|row| Row::with_columns(Arc::clone(&table.info), row.clone()))
                .collect());
        }
        let positions: Vec<usize> = columns
            .iter()
            .map(|c| table.position(c))
            .collect::<Result<_, _>>()?;
        let info = Arc::new(ColumnInfo::new(
            columns.iter().map(|c| (*c).to_string()).collect(),
        ));
        Ok(rows
            .into_iter()
            .map(|row| {
                let values = positions.iter().map(|p| row[*p].clone()).collect();
                Row::with_columns(Arc::clone(&info), values)
            })
            .collect())
    }

    fn execute_sync(&self, stmt: &Statement) -> Result<ExecResult, Error> {
        self.statements.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        if inner.fail_next.remove(stmt.table()) {
            return Err(query_error(
                QueryErrorKind::Database,
                format!("injected failure on {}", stmt.table()),
            ));
        }
        let table = inner.tables.get_mut(stmt.table()).ok_or_else(|| {
            query_error(QueryErrorKind::NotFound, format!("no such table: {}", stmt.table()))
        })?;

        match stmt {
            Statement::Select { .. } => Err(query_error(
                QueryErrorKind::Syntax,
                "select is not a write".to_string(),
            )),
            Statement::Insert {
                columns, values, ..
            } => {
                let mut row = vec![Value::Null; table.columns.len()];
                for (column, value) in columns.iter().zip(values) {
                    let pos = table.position(column)?;
                    row[pos] = value.clone();
                }
                let id = match row[0].as_id() {
                    Some(id) => id,
                    None => table.next_id,
                };
                if table.rows.contains_key(&id) {
                    return Err(unique_violation(&format!("{}_pkey", table.primary_key)));
                }
                row[0] = Value::from(id);
                if let Some(index) = table.unique_conflict(&row, id) {
                    return Err(unique_violation(index));
                }
                table.rows.insert(id, row);
                table.next_id = table.next_id.max(id + 1);
                Ok(ExecResult {
                    rows_affected: 1,
                    last_insert_id: Some(id),
                })
            }
            Statement::Update { set, filter, .. } => {
                let ids = table.matching_ids(filter)?;
                let mut assignments = Vec::with_capacity(set.len());
                for (column, value) in set {
                    assignments.push((table.position(column)?, value.clone()));
                }
                let mut updated = Vec::with_capacity(ids.len());
                for id in &ids {
                    let Some(current) = table.rows.get(id) else {
                        continue;
                    };
                    let mut row = current.clone();
                    for (pos, value) in &assignments {
                        row[*pos] = value.clone();
                    }
                    if let Some(index) = table.unique_conflict(&row, *id) {
                        return Err(unique_violation(index));
                    }
                    updated.push((*id, row));
                }
                let rows_affected = updated.len() as u64;
                for (id, row) in updated {
                    table.rows.insert(id, row);
                }
                Ok(ExecResult {
                    rows_affected,
                    last_insert_id: None,
                })
            }
            Statement::Delete { filter, .. } => {
                let ids = table.matching_ids(filter)?;
                for id in &ids {
                    table.rows.remove(id);
                }
                Ok(ExecResult {
                    rows_affected: ids.len() as u64,
                    last_insert_id: None,
                })
            }
        }
    }
}

impl Connection for MemoryStorage {
    fn query(&self, cx: &Cx, stmt: &Statement) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = run(cx, || self.query_sync(stmt));
        async move { outcome }
    }

    fn execute(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let outcome = run(cx, || self.execute_sync(stmt));
        async move { outcome }
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = run(cx, || Ok(()));
        async move { outcome }
    }
}

/// Evaluate a backend call unless the context is already cancelled.
pub(crate) fn run<T>(cx: &Cx, f: impl FnOnce() -> Result<T, Error>) -> Outcome<T, Error> {
    if let Some(reason) = cx.cancel_reason() {
        return Outcome::Cancelled(reason);
    }
    f().map_or_else(Outcome::Err, Outcome::Ok)
}

fn table_ref<'a>(inner: &'a StorageInner, table: &str) -> Result<&'a Table, Error> {
    inner
        .tables
        .get(table)
        .ok_or_else(|| query_error(QueryErrorKind::NotFound, format!("no such table: {}", table)))
}

fn query_error(kind: QueryErrorKind, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: None,
        sqlstate: None,
        message,
        detail: None,
        source: None,
    })
}

fn unique_violation(constraint: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        sql: None,
        sqlstate: Some("23505".to_string()),
        message: format!("duplicate key value violates unique constraint \"{}\"", constraint),
        detail: Some(constraint.to_string()),
        source: None,
    })
}
