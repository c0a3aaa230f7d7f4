//! Spreadsheet import: workbook parsing, the spreadsheet-backed store and a
//! loader that replays a parsed workbook into any [`TankStore`].
//!
//! [`TankStore`]: zfm_core::TankStore

mod load;
mod memory;
mod parse;
mod workbook;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zfm_core::{LocationError, RackSize, StoreError};

pub use load::load_into;
pub use memory::XlsxStore;
pub use parse::{parse_dob, parse_workbook, ParsedWorkbook, RowOrigin};
pub use workbook::{excel_serial_to_datetime, Sheet, Workbook};

pub const RACK_SHEET_PREFIX: &str = "rack_";
pub const ROW_LABEL: &str = "row";
pub const COLUMN_LABEL: &str = "column";
pub const UID_LABEL: &str = "sort";
pub const TANK_GENOTYPE_LABEL: &str = "ID-";
pub const ROOM_LABEL: &str = "room";
pub const DOB_LABEL: &str = "DOB";
pub const GENOTYPE_SHEET_NAMES: [&str; 2] = ["genotype_ID", "gene_ID"];
pub const GENOTYPE_ID_LABEL: &str = "genotypeID";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("workbook error: {0}")]
    Workbook(String),
    #[error("{sheet} row {row}: {reason}")]
    RejectedRow {
        sheet: String,
        row: usize,
        reason: SkipReason,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why an import row did not make it into the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("row or column cell is missing")]
    MissingLocation,
    #[error("{0}")]
    InvalidLocation(LocationError),
    #[error("column {0:?} is not a positive integer")]
    InvalidColumn(String),
    #[error("tank uid cell is missing")]
    MissingUid,
    #[error("tank uid {0:?} is not a positive integer")]
    InvalidUid(String),
    #[error("tank uid {0} appears more than once")]
    DuplicateUid(u32),
    #[error("slot already holds tank {occupant}")]
    SlotTaken { occupant: u32 },
    #[error("genotype id cell is missing")]
    MissingGenotypeId,
    #[error("genotype {0:?} appears more than once")]
    DuplicateGenotype(String),
    #[error("tank references unknown genotype {0:?}")]
    UnknownGenotype(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub sheet: String,
    /// 1-based, as shown by spreadsheet software; 0 when the tank did not
    /// come from a sheet row.
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub racks: usize,
    pub genotypes: usize,
    pub tanks: usize,
    pub skipped: Vec<SkippedRow>,
}

/// Header labels and sheet names the importer recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetLayout {
    pub rack_sheet_prefix: String,
    pub row_label: String,
    pub column_label: String,
    pub uid_label: String,
    pub genotype_label_prefix: String,
    pub room_label: String,
    pub dob_label_prefix: String,
    pub genotype_sheets: Vec<String>,
    pub genotype_id_label: String,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            rack_sheet_prefix: RACK_SHEET_PREFIX.to_string(),
            row_label: ROW_LABEL.to_string(),
            column_label: COLUMN_LABEL.to_string(),
            uid_label: UID_LABEL.to_string(),
            genotype_label_prefix: TANK_GENOTYPE_LABEL.to_string(),
            room_label: ROOM_LABEL.to_string(),
            dob_label_prefix: DOB_LABEL.to_string(),
            genotype_sheets: GENOTYPE_SHEET_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            genotype_id_label: GENOTYPE_ID_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Fail on the first malformed row instead of skipping it.
    pub strict: bool,
    /// Lower bound for inferred rack sizes.
    pub default_rack_size: RackSize,
    pub layout: SheetLayout,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            strict: false,
            default_rack_size: RackSize::default(),
            layout: SheetLayout::default(),
        }
    }
}

/// Collects skipped rows, or turns the first one into an error when strict.
#[derive(Debug, Default)]
pub(crate) struct SkipLog {
    strict: bool,
    pub(crate) skipped: Vec<SkippedRow>,
}

impl SkipLog {
    pub(crate) fn new(strict: bool) -> Self {
        Self {
            strict,
            skipped: Vec::new(),
        }
    }

    pub(crate) fn skip(
        &mut self,
        sheet: &str,
        row: usize,
        reason: SkipReason,
    ) -> Result<(), ImportError> {
        if self.strict {
            return Err(ImportError::RejectedRow {
                sheet: sheet.to_string(),
                row,
                reason,
            });
        }
        tracing::warn!(sheet, row, %reason, "skipping import row");
        self.skipped.push(SkippedRow {
            sheet: sheet.to_string(),
            row,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
