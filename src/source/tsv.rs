//! File-backed tabular source: one tab-separated file per source.
//!
//! `{dir}/{source_id}.tsv` holds a header row followed by data rows. Row keys are
//! 1-based line numbers, so the first data row is row `2`, matching spreadsheet row
//! numbering. Tabs, newlines and backslashes inside values are backslash-escaped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RowFields, TabularSource};
use crate::domain::{Item, RowKey, SourceId};
use crate::error::{Result, VolleyError};

pub struct TsvSource {
    dir: PathBuf,
    trigger_field: String,
    /// Serializes read-modify-write cycles on the files.
    write_lock: Mutex<()>,
}

struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TsvSource {
    pub fn new(dir: impl Into<PathBuf>, trigger_field: &str) -> Self {
        Self {
            dir: dir.into(),
            trigger_field: trigger_field.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, source_id: &SourceId) -> PathBuf {
        self.dir.join(format!("{source_id}.tsv"))
    }

    async fn load(&self, source_id: &SourceId, path: &Path) -> Result<Table> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error(source_id, e))?;
        let mut lines = text.lines();
        let header: Vec<String> = lines
            .next()
            .map(split_row)
            .unwrap_or_default();
        let rows = lines.map(split_row).collect();
        Ok(Table { header, rows })
    }

    async fn store(&self, source_id: &SourceId, path: &Path, table: &Table) -> Result<()> {
        let mut text = join_row(&table.header);
        text.push('\n');
        for row in &table.rows {
            text.push_str(&join_row(row));
            text.push('\n');
        }
        let tmp = path.with_extension("tsv.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| io_error(source_id, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(source_id, e))
    }
}

fn io_error(source_id: &SourceId, e: std::io::Error) -> VolleyError {
    match e.kind() {
        ErrorKind::PermissionDenied => VolleyError::AccessDenied {
            source_id: source_id.clone(),
            message: e.to_string(),
        },
        _ => VolleyError::SourceUnavailable {
            source_id: source_id.clone(),
            message: e.to_string(),
        },
    }
}

fn split_row(line: &str) -> Vec<String> {
    line.split('\t').map(unescape).collect()
}

fn join_row(values: &[String]) -> String {
    values
        .iter()
        .map(|v| escape(v))
        .collect::<Vec<_>>()
        .join("\t")
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[async_trait]
impl TabularSource for TsvSource {
    #[tracing::instrument(skip(self), fields(source_id = %source_id))]
    async fn read_items(&self, source_id: &SourceId) -> Result<Vec<Item>> {
        let path = self.path_for(source_id);
        let table = self.load(source_id, &path).await?;
        let trigger_col = table.header.iter().position(|h| *h == self.trigger_field);

        let items = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|v| !v.trim().is_empty()))
            .map(|(index, row)| {
                let mut item = Item::pending(
                    source_id.clone(),
                    index + 2,
                    trigger_col.and_then(|col| row.get(col)).map(String::as_str),
                );
                for (col, name) in table.header.iter().enumerate() {
                    if Some(col) == trigger_col {
                        continue;
                    }
                    if let Some(value) = row.get(col) {
                        item.payload.insert(name.clone(), value.clone());
                    }
                }
                item
            })
            .collect();
        Ok(items)
    }

    #[tracing::instrument(skip(self, fields), fields(source_id = %source_id, row_key = %row_key))]
    async fn write_result(
        &self,
        source_id: &SourceId,
        row_key: &RowKey,
        fields: &RowFields,
    ) -> Result<bool> {
        let _lock = self.write_lock.lock().await;
        let path = self.path_for(source_id);
        let mut table = self.load(source_id, &path).await?;

        let Some(index) = row_key
            .0
            .parse::<usize>()
            .ok()
            .and_then(|line| line.checked_sub(2))
            .filter(|index| *index < table.rows.len())
        else {
            tracing::warn!("Row not found, result not written");
            return Ok(false);
        };

        for (name, value) in fields {
            let col = match table.header.iter().position(|h| h == name) {
                Some(col) => col,
                None => {
                    table.header.push(name.clone());
                    table.header.len() - 1
                }
            };
            let row = &mut table.rows[index];
            if row.len() <= col {
                row.resize(col + 1, String::new());
            }
            row[col] = value.clone();
        }

        self.store(source_id, &path, &table).await?;
        Ok(true)
    }
}
