//! Tabular query results.
//!
//! A [`Table`] is an ordered list of named columns plus an ordered list of rows, each row
//! holding exactly one string cell per column. It is what a
//! [`QueryExecutor`](crate::executor::QueryExecutor) produces on the server and what
//! [`Client::query`](crate::protocol::Client::query) hands back on the client.
//!
//! # Chunk Format
//!
//! On the wire a table travels as a run of DATA packets, each carrying a *chunk* of at most
//! `block_size` rows as text:
//!
//! ```text
//! <row count>\n
//! <column line>\n        (first chunk only)
//! <row line>\n           (repeated <row count> times)
//! ```
//!
//! Every cell in a line is terminated by `;`. A backslash, semicolon or newline inside a cell
//! is escaped as `\\`, `\;` or `\n`, so any cell value survives the trip unchanged.
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("row has {found} cells but the table has {expected} columns")]
    RowWidth { expected: usize, found: usize },

    #[error("malformed table chunk: {0}")]
    Malformed(String),
}

/// Ordered columns and rows of string cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row. The row must have one cell per column.
    pub fn push_row<I, S>(&mut self, row: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let row: Vec<String> = row.into_iter().map(Into::into).collect();
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Splits the table into chunk payloads of at most `block_size` rows each.
    ///
    /// The first payload carries the column schema. A table without rows still
    /// produces one payload so the receiver learns the schema. A `block_size` of
    /// zero is treated as one.
    pub(crate) fn encode_chunks(&self, block_size: usize) -> Vec<String> {
        let block_size = block_size.max(1);
        if self.rows.is_empty() {
            return vec![encode_chunk(Some(&self.columns), &[])];
        }

        self.rows
            .chunks(block_size)
            .enumerate()
            .map(|(i, rows)| {
                let schema = (i == 0).then_some(self.columns.as_slice());
                encode_chunk(schema, rows)
            })
            .collect()
    }

    /// Copy of the schema and the first `n` rows.
    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Rebuilds a table from the first chunk payload of a transfer.
    pub(crate) fn from_first_chunk(payload: &str) -> Result<Self, TableError> {
        let (columns, rows) = decode_chunk(payload, true)?;
        let mut table = Table::new(columns.unwrap_or_default());
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Appends the rows of a follow-up chunk payload.
    pub(crate) fn extend_from_chunk(&mut self, payload: &str) -> Result<(), TableError> {
        let (_, rows) = decode_chunk(payload, false)?;
        for row in rows {
            self.push_row(row)?;
        }
        Ok(())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let separator = widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+");

        write_row(f, &self.columns, &widths)?;
        writeln!(f, "+{separator}+")?;
        for row in &self.rows {
            write_row(f, row, &widths)?;
        }
        write!(f, "({} rows)", self.rows.len())
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, cells: &[String], widths: &[usize]) -> fmt::Result {
    write!(f, "|")?;
    for (cell, &width) in cells.iter().zip(widths) {
        write!(f, " {cell:<width$} |")?;
    }
    writeln!(f)
}

fn encode_chunk(columns: Option<&[String]>, rows: &[Vec<String>]) -> String {
    let mut out = format!("{}\n", rows.len());
    if let Some(columns) = columns {
        encode_line(&mut out, columns);
    }
    for row in rows {
        encode_line(&mut out, row);
    }
    out
}

fn encode_line(out: &mut String, cells: &[String]) {
    for cell in cells {
        for c in cell.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                ';' => out.push_str("\\;"),
                '\n' => out.push_str("\\n"),
                c => out.push(c),
            }
        }
        out.push(';');
    }
    out.push('\n');
}

type Chunk = (Option<Vec<String>>, Vec<Vec<String>>);

fn decode_chunk(payload: &str, with_schema: bool) -> Result<Chunk, TableError> {
    let mut lines = payload.split('\n');

    let count = lines
        .next()
        .and_then(|line| line.parse::<usize>().ok())
        .ok_or_else(|| TableError::Malformed("missing row count".to_string()))?;

    let columns = if with_schema {
        let line = lines
            .next()
            .ok_or_else(|| TableError::Malformed("missing column line".to_string()))?;
        Some(decode_line(line)?)
    } else {
        None
    };

    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let line = lines
            .next()
            .ok_or_else(|| TableError::Malformed(format!("expected {count} rows, found {i}")))?;
        rows.push(decode_line(line)?);
    }

    match (lines.next(), lines.next()) {
        (Some(""), None) => Ok((columns, rows)),
        _ => Err(TableError::Malformed("unexpected data after last row".to_string())),
    }
}

fn decode_line(line: &str) -> Result<Vec<String>, TableError> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('\\') => cell.push('\\'),
                Some(';') => cell.push(';'),
                Some('n') => cell.push('\n'),
                other => {
                    return Err(TableError::Malformed(format!(
                        "invalid escape sequence '\\{}'",
                        other.map(String::from).unwrap_or_default()
                    )));
                }
            },
            ';' => cells.push(std::mem::take(&mut cell)),
            c => cell.push(c),
        }
    }

    if !cell.is_empty() {
        return Err(TableError::Malformed(format!("unterminated cell '{cell}'")));
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rows: usize) -> Table {
        let mut table = Table::new(["id", "name"]);
        for i in 0..rows {
            table.push_row([i.to_string(), format!("user{i}")]).unwrap();
        }
        table
    }

    fn reassemble(chunks: &[String]) -> Table {
        let mut table = Table::from_first_chunk(&chunks[0]).unwrap();
        for chunk in &chunks[1..] {
            table.extend_from_chunk(chunk).unwrap();
        }
        table
    }

    #[test]
    fn push_row_rejects_wrong_width() {
        let mut table = Table::new(["a", "b"]);
        let err = table.push_row(["only one"]).unwrap_err();

        assert_eq!(
            err,
            TableError::RowWidth {
                expected: 2,
                found: 1
            }
        );
        assert!(table.is_empty());
    }

    #[test]
    fn head_keeps_schema_and_leading_rows() {
        let table = sample(10);

        let head = table.head(3);
        assert_eq!(head.columns(), table.columns());
        assert_eq!(head.rows(), &table.rows()[..3]);
        assert_eq!(table.head(50), table);
        assert!(table.head(0).is_empty());
    }

    #[test]
    fn chunk_count_follows_block_size() {
        let table = sample(10);

        assert_eq!(table.encode_chunks(3).len(), 4);
        assert_eq!(table.encode_chunks(10).len(), 1);
        assert_eq!(table.encode_chunks(1).len(), 10);
        assert_eq!(table.encode_chunks(0).len(), 10);
    }

    #[test]
    fn reassembles_in_order_for_any_block_size() {
        let table = sample(17);

        for block_size in [1, 2, 5, 16, 17, 100] {
            let chunks = table.encode_chunks(block_size);
            assert_eq!(reassemble(&chunks), table, "block size {block_size}");
        }
    }

    #[test]
    fn empty_table_keeps_schema() {
        let table = Table::new(["x", "y", "z"]);
        let chunks = table.encode_chunks(100);

        assert_eq!(chunks.len(), 1);
        let decoded = reassemble(&chunks);
        assert_eq!(decoded.columns(), &["x", "y", "z"]);
        assert!(decoded.is_empty());
    }

    #[test]
    fn cells_with_separators_survive() {
        let mut table = Table::new(["text;with;semis", ""]);
        table.push_row(["line\nbreak", "back\\slash;"]).unwrap();
        table.push_row(["", ""]).unwrap();

        let chunks = table.encode_chunks(1);
        assert_eq!(reassemble(&chunks), table);
    }

    #[test]
    fn first_chunk_layout() {
        let mut table = Table::new(["?column?"]);
        table.push_row(["1"]).unwrap();

        assert_eq!(table.encode_chunks(100), vec!["1\n?column?;\n1;\n".to_string()]);
    }

    #[test]
    fn rejects_truncated_chunk() {
        let err = Table::from_first_chunk("2\nid;\n1;\n").unwrap_err();
        assert!(matches!(err, TableError::Malformed(_)));
    }

    #[test]
    fn rejects_bad_escape() {
        let err = Table::from_first_chunk("0\nid\\x;\n").unwrap_err();
        assert!(matches!(err, TableError::Malformed(_)));
    }

    #[test]
    fn rejects_row_wider_than_schema() {
        let mut table = Table::from_first_chunk("0\nid;\n").unwrap();
        let err = table.extend_from_chunk("1\n1;2;\n").unwrap_err();

        assert_eq!(
            err,
            TableError::RowWidth {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn display_renders_grid() {
        let mut table = Table::new(["id", "name"]);
        table.push_row(["1", "alice"]).unwrap();

        let out = table.to_string();
        assert_eq!(
            out,
            "| id | name  |\n+----+-------+\n| 1  | alice |\n(1 rows)"
        );
    }
}
