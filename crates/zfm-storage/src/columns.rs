use crate::StorageError;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::collections::{BTreeMap, BTreeSet};
use zfm_core::{CellValue, Field};

pub(crate) const FIELD_COLUMN_PREFIX: &str = "field:";
pub(crate) const GENOTYPE_COLUMN_PREFIX: &str = "genotype_id_";
pub(crate) const DOB_COLUMN_PREFIX: &str = "DOB_";
pub(crate) const FIELD_LAYOUT_COLUMN: &str = "field_layout";

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn genotype_column(slot: usize) -> String {
    format!("{GENOTYPE_COLUMN_PREFIX}{slot}")
}

pub(crate) fn dob_column(slot: usize) -> String {
    format!("{DOB_COLUMN_PREFIX}{slot}")
}

/// Column name for a field label; `#` is doubled so the occurrence suffix
/// stays unambiguous.
pub(crate) fn field_column(label: &CellValue, occurrence: usize) -> String {
    let base = format!(
        "{FIELD_COLUMN_PREFIX}{}",
        label.to_string().replace('#', "##")
    );
    if occurrence > 1 {
        format!("{base}#{occurrence}")
    } else {
        base
    }
}

/// Lower-cased column names of `table`. SQLite compares identifiers
/// case-insensitively, so callers must as well.
pub(crate) fn table_columns(
    conn: &Connection,
    table: &str,
) -> Result<BTreeSet<String>, StorageError> {
    let mut statement = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = statement.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = BTreeSet::new();
    for row in rows {
        columns.insert(row?.to_lowercase());
    }
    Ok(columns)
}

/// Adds every column in `wanted` that `table` does not have yet.
pub(crate) fn ensure_columns<'a>(
    conn: &Connection,
    table: &str,
    wanted: impl IntoIterator<Item = &'a str>,
) -> Result<usize, StorageError> {
    let mut existing = table_columns(conn, table)?;
    let mut added = 0;
    for column in wanted {
        if !existing.insert(column.to_lowercase()) {
            continue;
        }
        conn.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            [],
        )?;
        tracing::debug!(table, column, "added column");
        added += 1;
    }
    Ok(added)
}

/// Record data ready for insertion: column names paired with values.
#[derive(Debug, Default)]
pub(crate) struct RowValues {
    pub(crate) values: Vec<(String, Value)>,
}

impl RowValues {
    pub(crate) fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.push((column.into(), value.into()));
    }

    /// Appends field columns plus the layout that restores their order and labels.
    pub(crate) fn push_fields(&mut self, fields: &[Field]) -> Result<(), StorageError> {
        let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();
        let mut layout: Vec<(String, CellValue)> = Vec::with_capacity(fields.len());
        let mut columns = Vec::with_capacity(fields.len());

        for field in fields {
            let key = field_column(&field.label, 1).to_lowercase();
            let occurrence = occurrences.entry(key).or_insert(0);
            *occurrence += 1;
            let column = field_column(&field.label, *occurrence);
            layout.push((column.clone(), field.label.clone()));
            columns.push((column, cell_to_value(&field.data)));
        }

        let layout = serde_json::to_string(&layout)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.push(FIELD_LAYOUT_COLUMN, layout);
        self.values.extend(columns);
        Ok(())
    }

    /// Provisions missing columns, then writes one row.
    pub(crate) fn insert(
        &self,
        conn: &Connection,
        table: &str,
        replace: bool,
    ) -> Result<(), StorageError> {
        ensure_columns(conn, table, self.values.iter().map(|(column, _)| column.as_str()))?;

        let columns = self
            .values
            .iter()
            .map(|(column, _)| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=self.values.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let verb = if replace {
            "INSERT OR REPLACE"
        } else {
            "INSERT"
        };
        conn.execute(
            &format!(
                "{verb} INTO {} ({columns}) VALUES ({placeholders})",
                quote_ident(table)
            ),
            params_from_iter(self.values.iter().map(|(_, value)| value)),
        )?;
        Ok(())
    }
}

/// A fetched row keyed by lower-cased column name.
#[derive(Debug, Default)]
pub(crate) struct StoredRow {
    values: BTreeMap<String, Value>,
}

impl StoredRow {
    pub(crate) fn from_row(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Self> {
        let mut values = BTreeMap::new();
        for (index, column) in columns.iter().enumerate() {
            values.insert(column.to_lowercase(), row.get::<_, Value>(index)?);
        }
        Ok(Self { values })
    }

    pub(crate) fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .get(&column.to_lowercase())
            .filter(|value| !matches!(value, Value::Null))
    }

    pub(crate) fn integer(&self, column: &str) -> Result<i64, StorageError> {
        match self.get(column) {
            Some(Value::Integer(value)) => Ok(*value),
            Some(Value::Real(value)) if value.fract() == 0.0 => Ok(*value as i64),
            other => Err(StorageError::Serialization(format!(
                "column {column} is not an integer: {other:?}"
            ))),
        }
    }

    pub(crate) fn text(&self, column: &str) -> Option<String> {
        self.get(column).map(value_to_text)
    }

    /// Values of `prefix<N>` columns in slot order, skipping empty slots.
    pub(crate) fn slotted(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_lowercase();
        let mut slots: Vec<(usize, String)> = self
            .values
            .iter()
            .filter(|(_, value)| !matches!(value, Value::Null))
            .filter_map(|(column, value)| {
                let slot = column.strip_prefix(&prefix)?.parse::<usize>().ok()?;
                Some((slot, value_to_text(value)))
            })
            .collect();
        slots.sort_by_key(|(slot, _)| *slot);
        slots.into_iter().map(|(_, value)| value).collect()
    }

    pub(crate) fn fields(&self) -> Result<Vec<Field>, StorageError> {
        let layout = self.text(FIELD_LAYOUT_COLUMN).unwrap_or_else(|| "[]".to_string());
        let layout: Vec<(String, CellValue)> = serde_json::from_str(&layout)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(layout
            .into_iter()
            .map(|(column, label)| Field {
                label,
                data: self
                    .get(&column)
                    .map(value_to_cell)
                    .unwrap_or_else(|| CellValue::text("")),
            })
            .collect())
    }
}

/// Runs `sql` and returns every row with its column names.
pub(crate) fn query_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<StoredRow>, StorageError> {
    let mut statement = conn.prepare(sql)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let rows = statement.query_map(params, |row| StoredRow::from_row(row, &columns))?;
    let mut stored = Vec::new();
    for row in rows {
        stored.push(row?);
    }
    Ok(stored)
}

pub(crate) fn cell_to_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Number(value) => Value::Real(*value),
        CellValue::Text(value) => Value::Text(value.clone()),
    }
}

pub(crate) fn value_to_cell(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::text(""),
        Value::Integer(value) => CellValue::Number(*value as f64),
        Value::Real(value) => CellValue::Number(*value),
        Value::Text(value) => CellValue::Text(value.clone()),
        Value::Blob(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn value_to_text(value: &Value) -> String {
    value_to_cell(value).to_string()
}
