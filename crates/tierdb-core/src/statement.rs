//! Structured statements handed to storage backends.
//!
//! The engine never builds SQL text by string substitution. Backends
//! receive a [`Statement`] and evaluate or render it themselves;
//! [`Statement::to_sql`] exists for logging and for SQL-speaking drivers.

use std::fmt::Write as _;

use crate::identifiers::quote_ident;
use crate::schema::SortKey;
use crate::value::Value;

/// A `WHERE` term. Terms in one statement are joined with `AND`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq { column: &'static str, value: Value },
    In { column: &'static str, values: Vec<Value> },
}

impl Condition {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Condition::Eq {
            column,
            value: value.into(),
        }
    }

    pub fn any_of(column: &'static str, values: Vec<Value>) -> Self {
        Condition::In { column, values }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Condition::Eq { column, .. } | Condition::In { column, .. } => column,
        }
    }

    /// Does a row value satisfy this term?
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Condition::Eq { value: expected, .. } => value.loose_eq(expected),
            Condition::In { values, .. } => values.iter().any(|v| value.loose_eq(v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select {
        table: &'static str,
        /// Projected columns; empty selects every column.
        columns: Vec<&'static str>,
        filter: Vec<Condition>,
        order: Vec<SortKey>,
        limit: Option<usize>,
    },
    Insert {
        table: &'static str,
        columns: Vec<&'static str>,
        values: Vec<Value>,
    },
    Update {
        table: &'static str,
        set: Vec<(&'static str, Value)>,
        filter: Vec<Condition>,
    },
    Delete {
        table: &'static str,
        filter: Vec<Condition>,
    },
}

impl Statement {
    /// Short operation name for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Statement::Select { .. } => "select",
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
        }
    }

    pub const fn table(&self) -> &'static str {
        match self {
            Statement::Select { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Render as parameterized SQL with `$n` placeholders.
    pub fn to_sql(&self) -> String {
        let mut n = 0;
        let mut next = || {
            n += 1;
            format!("${}", n)
        };
        let mut sql = String::new();
        match self {
            Statement::Select {
                table,
                columns,
                filter,
                order,
                limit,
            } => {
                sql.push_str("SELECT ");
                if columns.is_empty() {
                    sql.push('*');
                } else {
                    sql.push_str(&join_idents(columns));
                }
                let _ = write!(sql, " FROM {}", quote_ident(table));
                push_where(&mut sql, filter, &mut next);
                if !order.is_empty() {
                    let terms: Vec<String> = order
                        .iter()
                        .map(|k| {
                            format!(
                                "{} {}",
                                quote_ident(k.column),
                                if k.descending { "DESC" } else { "ASC" }
                            )
                        })
                        .collect();
                    let _ = write!(sql, " ORDER BY {}", terms.join(", "));
                }
                if let Some(limit) = limit {
                    let _ = write!(sql, " LIMIT {}", limit);
                }
            }
            Statement::Insert { table, columns, .. } => {
                let placeholders: Vec<String> = columns.iter().map(|_| next()).collect();
                let _ = write!(
                    sql,
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote_ident(table),
                    join_idents(columns),
                    placeholders.join(", ")
                );
            }
            Statement::Update { table, set, filter } => {
                let assignments: Vec<String> = set
                    .iter()
                    .map(|(column, _)| format!("{} = {}", quote_ident(column), next()))
                    .collect();
                let _ = write!(
                    sql,
                    "UPDATE {} SET {}",
                    quote_ident(table),
                    assignments.join(", ")
                );
                push_where(&mut sql, filter, &mut next);
            }
            Statement::Delete { table, filter } => {
                let _ = write!(sql, "DELETE FROM {}", quote_ident(table));
                push_where(&mut sql, filter, &mut next);
            }
        }
        sql
    }

    /// Bound parameters in placeholder order.
    pub fn params(&self) -> Vec<Value> {
        let mut params = Vec::new();
        let push_filter = |params: &mut Vec<Value>, filter: &[Condition]| {
            for condition in filter {
                match condition {
                    Condition::Eq { value, .. } => params.push(value.clone()),
                    Condition::In { values, .. } => params.extend(values.iter().cloned()),
                }
            }
        };
        match self {
            Statement::Select { filter, .. } | Statement::Delete { filter, .. } => {
                push_filter(&mut params, filter);
            }
            Statement::Insert { values, .. } => params.extend(values.iter().cloned()),
            Statement::Update { set, filter, .. } => {
                params.extend(set.iter().map(|(_, v)| v.clone()));
                push_filter(&mut params, filter);
            }
        }
        params
    }
}

fn join_idents(columns: &[&'static str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_where(sql: &mut String, filter: &[Condition], next: &mut impl FnMut() -> String) {
    if filter.is_empty() {
        return;
    }
    let terms: Vec<String> = filter
        .iter()
        .map(|condition| match condition {
            Condition::Eq { column, .. } => format!("{} = {}", quote_ident(column), next()),
            Condition::In { column, values } => {
                let list: Vec<String> = values.iter().map(|_| next()).collect();
                format!("{} IN ({})", quote_ident(column), list.join(", "))
            }
        })
        .collect();
    let _ = write!(sql, " WHERE {}", terms.join(" AND "));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_renders_filters_order_and_limit() {
        let stmt = Statement::Select {
            table: "people",
            columns: vec!["id"],
            filter: vec![
                Condition::eq("age", 10),
                Condition::eq("fake_delete", false),
            ],
            order: vec![SortKey {
                column: "id",
                descending: false,
            }],
            limit: Some(50_001),
        };
        assert_eq!(
            stmt.to_sql(),
            "SELECT \"id\" FROM \"people\" WHERE \"age\" = $1 AND \"fake_delete\" = $2 ORDER BY \"id\" ASC LIMIT 50001"
        );
        assert_eq!(stmt.params(), vec![Value::Int(10), Value::Bool(false)]);
    }

    #[test]
    fn update_numbers_set_before_where() {
        let stmt = Statement::Update {
            table: "people",
            set: vec![("name", Value::from("a")), ("age", Value::from(3))],
            filter: vec![Condition::eq("id", 7_u64)],
        };
        assert_eq!(
            stmt.to_sql(),
            "UPDATE \"people\" SET \"name\" = $1, \"age\" = $2 WHERE \"id\" = $3"
        );
        assert_eq!(stmt.params().len(), 3);
    }

    #[test]
    fn in_condition_expands() {
        let stmt = Statement::Delete {
            table: "pets",
            filter: vec![Condition::any_of(
                "id",
                vec![Value::BigInt(1), Value::BigInt(2)],
            )],
        };
        assert_eq!(stmt.to_sql(), "DELETE FROM \"pets\" WHERE \"id\" IN ($1, $2)");
        assert!(
            Condition::any_of("id", vec![Value::BigInt(2)]).matches(&Value::Int(2))
        );
    }
}
