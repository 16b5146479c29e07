//! Query execution collaborator.
//!
//! The protocol layer never interprets query text. The server hands it to a
//! [`QueryExecutor`] and ships back whatever [`Table`] comes out, or the text of the
//! [`QueryError`] as an ERROR packet.
//!
//! [`MemoryExecutor`] is a small stand-in engine used by `rowlink_server` and the
//! tests. It understands just enough SQL to be useful:
//!
//! - `select <literal>[, <literal> ...]` with integer, decimal or `'quoted'` literals,
//!   answered with a single row.
//! - `select * from <table> [limit <n>]` against tables registered with
//!   [`MemoryExecutor::insert`] or [`MemoryExecutor::populate`].
//!
//! # Example
//! ```rust
//! use rowlink::executor::{MemoryExecutor, QueryExecutor};
//!
//! let executor = MemoryExecutor::new();
//! let table = executor.execute("select 1").unwrap();
//! assert_eq!(table.rows(), &[vec!["1".to_string()]]);
//! ```
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use thiserror::Error;

use crate::table::{Table, TableError};

/// Failure reported by the execution engine. Its text is sent to the client verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Turns a request string into a table.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, query: &str) -> Result<Table, QueryError>;
}

impl<F> QueryExecutor for F
where
    F: Fn(&str) -> Result<Table, QueryError> + Send + Sync,
{
    fn execute(&self, query: &str) -> Result<Table, QueryError> {
        self(query)
    }
}

/// Named in-memory tables plus literal selects.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `table` under `name`, replacing any previous table of that name.
    pub fn insert(&self, name: &str, table: Table) {
        self.tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase(), table);
    }

    /// Fills a `users` table with `records` rows of test data.
    pub fn populate(&self, records: usize) -> Result<(), TableError> {
        let mut users = Table::new(["id", "username", "email"]);
        for i in 1..=records {
            users.push_row([
                i.to_string(),
                format!("user{i}"),
                format!("user{i}@example.com"),
            ])?;
        }
        self.insert("users", users);
        Ok(())
    }

    fn select_from(&self, rest: &str) -> Result<Table, QueryError> {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        let (name, limit) = match parts.as_slice() {
            [name] => (*name, None),
            [name, limit_kw, n] if limit_kw.eq_ignore_ascii_case("limit") => {
                let n = n
                    .parse::<usize>()
                    .map_err(|_| QueryError::new(format!("invalid limit '{n}'")))?;
                (*name, Some(n))
            }
            _ => return Err(QueryError::new("syntax error")),
        };

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let table = tables
            .get(&name.to_lowercase())
            .ok_or_else(|| QueryError::new(format!("relation \"{name}\" does not exist")))?;

        match limit {
            Some(n) => Ok(table.head(n)),
            None => Ok(table.clone()),
        }
    }
}

impl QueryExecutor for MemoryExecutor {
    fn execute(&self, query: &str) -> Result<Table, QueryError> {
        let query = query.trim().trim_end_matches(';').trim();
        let Some(rest) = strip_keyword(query, "select") else {
            return Err(QueryError::new("syntax error"));
        };

        if let Some(from) = strip_keyword(rest.trim_start(), "*")
            .and_then(|after| strip_keyword(after.trim_start(), "from"))
        {
            return self.select_from(from);
        }

        select_literals(rest)
    }
}

/// Strips a leading case-insensitive keyword that is followed by whitespace or the end.
fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let head = input.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &input[keyword.len()..];
    if keyword == "*" || rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

fn select_literals(list: &str) -> Result<Table, QueryError> {
    let items: Vec<&str> = list.split(',').map(str::trim).collect();
    if items.iter().any(|item| item.is_empty()) {
        return Err(QueryError::new("syntax error"));
    }

    let row = items
        .iter()
        .map(|item| literal(item))
        .collect::<Result<Vec<_>, _>>()?;

    let mut table = Table::new(std::iter::repeat_n("?column?", row.len()));
    table
        .push_row(row)
        .map_err(|e| QueryError::new(e.to_string()))?;
    Ok(table)
}

fn literal(item: &str) -> Result<String, QueryError> {
    if let Some(text) = item.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(text.replace("''", "'"));
    }
    if item.parse::<i64>().is_ok() || item.parse::<f64>().is_ok() {
        return Ok(item.to_string());
    }
    Err(QueryError::new(format!(
        "syntax error at or near \"{item}\""
    )))
}
