//! Result rows and the per-statement result buffer.

use serde_json::{Map, Value as JsonValue};

/// One decoded result row.
///
/// Column order is preserved as the server sent it; values are converted to
/// JSON at decode time so callers never see driver-specific types.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<JsonValue>,
}

impl Row {
    /// Build a row from parallel column/value lists.
    ///
    /// Extra values without a matching column (or vice versa) are dropped.
    pub fn new(columns: Vec<String>, values: Vec<JsonValue>) -> Self {
        let mut row = Self { columns, values };
        let len = row.columns.len().min(row.values.len());
        row.columns.truncate(len);
        row.values.truncate(len);
        row
    }

    pub fn from_pairs(pairs: Vec<(String, JsonValue)>) -> Self {
        let (columns, values) = pairs.into_iter().unzip();
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value of the first column with this name.
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Value at this position in server column order.
    pub fn get_index(&self, idx: usize) -> Option<&JsonValue> {
        self.values.get(idx)
    }

    pub fn contains_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &JsonValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Convert to a JSON object. Duplicate column names keep the last value.
    pub fn to_json_map(&self) -> Map<String, JsonValue> {
        self.iter()
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect()
    }
}

/// Buffered rows from one statement, with a read cursor.
///
/// The whole result is held in memory; the cursor starts at the first row
/// and only moves through [`ResultSet::next_row`] or an explicit seek.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    rows: Vec<Row>,
    cursor: usize,
}

impl ResultSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Move the cursor to an absolute row position.
    ///
    /// Returns false (cursor unchanged) when the position is past the end.
    pub fn seek(&mut self, pos: usize) -> bool {
        if pos < self.rows.len() {
            self.cursor = pos;
            true
        } else {
            false
        }
    }

    /// Reset the cursor to the first row.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Return the row under the cursor and advance.
    pub fn next_row(&mut self) -> Option<&Row> {
        let row = self.rows.get(self.cursor)?;
        self.cursor += 1;
        Some(row)
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}
