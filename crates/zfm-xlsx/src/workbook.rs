use crate::ImportError;
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::path::Path;
use zfm_core::CellValue;

/// A worksheet as a grid of optional cells, anchored at A1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Option<CellValue>>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    /// Appends a row of cells; blank text becomes an empty cell.
    pub fn push_row<I, C>(&mut self, cells: I) -> &mut Self
    where
        I: IntoIterator<Item = Option<C>>,
        C: Into<CellValue>,
    {
        let row = cells
            .into_iter()
            .map(|cell| cell.map(Into::into).filter(|value: &CellValue| !value.is_blank()))
            .collect();
        self.rows.push(row);
        self
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&CellValue> {
        self.rows.get(row)?.get(col)?.as_ref()
    }

    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_blank_row(&self, row: usize) -> bool {
        self.rows
            .get(row)
            .map(|cells| cells.iter().all(Option::is_none))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    /// Reads every worksheet of an xlsx/xls/ods file into memory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let mut source = open_workbook_auto(path)
            .map_err(|err| ImportError::Workbook(format!("{}: {err}", path.display())))?;

        let mut sheets = Vec::new();
        for name in source.sheet_names() {
            let range = source
                .worksheet_range(&name)
                .map_err(|err| ImportError::Workbook(format!("sheet {name}: {err}")))?;
            let (start_row, start_col) = range.start().unwrap_or((0, 0));

            let mut sheet = Sheet::new(name);
            sheet.rows = vec![Vec::new(); start_row as usize];
            for row in range.rows() {
                let mut cells = vec![None; start_col as usize];
                cells.extend(row.iter().map(cell_from_data));
                sheet.rows.push(cells);
            }
            sheets.push(sheet);
        }

        tracing::debug!(path = %path.display(), sheets = sheets.len(), "opened workbook");
        Ok(Self { sheets })
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|sheet| sheet.name == name)
    }

    pub fn push_sheet(&mut self, sheet: Sheet) -> &mut Self {
        self.sheets.push(sheet);
        self
    }
}

fn cell_from_data(data: &Data) -> Option<CellValue> {
    match data {
        Data::Empty => None,
        Data::String(value) if value.trim().is_empty() => None,
        Data::String(value) => Some(CellValue::Text(value.clone())),
        Data::Float(value) => Some(CellValue::Number(*value)),
        Data::Int(value) => Some(CellValue::Number(*value as f64)),
        Data::Bool(value) => Some(CellValue::text(if *value { "TRUE" } else { "FALSE" })),
        Data::DateTime(value) => Some(render_excel_datetime(value.as_f64())),
        Data::DateTimeIso(value) | Data::DurationIso(value) => {
            Some(CellValue::Text(value.clone()))
        }
        Data::Error(err) => Some(CellValue::Text(err.to_string())),
    }
}

fn render_excel_datetime(serial: f64) -> CellValue {
    match excel_serial_to_datetime(serial) {
        Some(datetime) if serial.fract() == 0.0 => {
            CellValue::Text(datetime.date().format("%Y-%m-%d").to_string())
        }
        Some(datetime) => CellValue::Text(datetime.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => CellValue::Number(serial),
    }
}

/// Serial of 9999-12-31, the last date Excel can display.
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

/// Converts an Excel serial date (1900 system) to a calendar datetime.
pub fn excel_serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || !(1.0..MAX_EXCEL_SERIAL + 1.0).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let seconds = (serial * 86_400.0).round() as i64;
    epoch.checked_add_signed(Duration::seconds(seconds))
}
