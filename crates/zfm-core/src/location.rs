use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("row label must be one or more ascii letters, got {0:?}")]
    InvalidRow(String),
    #[error("row label {0:?} is too long")]
    RowOverflow(String),
    #[error("column must be between 1 and {width}, got {col}")]
    ColumnOutOfRange { col: u32, width: u32 },
    #[error("row {row} is beyond rack height {height}")]
    RowOutOfRange { row: String, height: u32 },
}

/// A physical slot: room, rack number, letter row and 1-indexed column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub room: String,
    pub rack: u32,
    pub row: String,
    pub col: u32,
}

impl Location {
    pub fn new(room: impl Into<String>, rack: u32, row: impl Into<String>, col: u32) -> Self {
        Self {
            room: room.into(),
            rack,
            row: row.into(),
            col,
        }
    }

    /// The same address with its row spelled as uppercase letters.
    pub fn canonical(&self) -> Result<Location, LocationError> {
        let ordinal = row_ordinal(&self.row)?;
        let row = row_letter(ordinal).ok_or_else(|| LocationError::InvalidRow(self.row.clone()))?;
        Ok(Location {
            row,
            ..self.clone()
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.room.is_empty() {
            write!(f, "rack {} {}{}", self.rack, self.row, self.col)
        } else {
            write!(
                f,
                "{} rack {} {}{}",
                self.room, self.rack, self.row, self.col
            )
        }
    }
}

/// Maps row letters to their 1-based ordinal, case-insensitively.
///
/// Rows use bijective base-26, so `A`..`Z` are 1..26 and `AA` follows `Z`.
pub fn row_ordinal(row: &str) -> Result<u32, LocationError> {
    let trimmed = row.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_alphabetic()) {
        return Err(LocationError::InvalidRow(row.to_string()));
    }

    let mut ordinal: u32 = 0;
    for ch in trimmed.chars() {
        let digit = (ch.to_ascii_uppercase() as u32) - ('A' as u32) + 1;
        ordinal = ordinal
            .checked_mul(26)
            .and_then(|value| value.checked_add(digit))
            .ok_or_else(|| LocationError::RowOverflow(row.to_string()))?;
    }
    Ok(ordinal)
}

/// Inverse of [`row_ordinal`]; returns uppercase letters, `None` for 0.
pub fn row_letter(ordinal: u32) -> Option<String> {
    if ordinal == 0 {
        return None;
    }

    let mut remaining = ordinal;
    let mut letters = Vec::new();
    while remaining > 0 {
        let digit = (remaining - 1) % 26;
        letters.push(char::from(b'A' + digit as u8));
        remaining = (remaining - 1) / 26;
    }
    letters.reverse();
    Some(letters.into_iter().collect())
}

/// Dense zero-based, row-major slot index of `loc` in a rack of `width` columns.
pub fn slot_index(width: u32, loc: &Location) -> Result<usize, LocationError> {
    if loc.col == 0 || loc.col > width {
        return Err(LocationError::ColumnOutOfRange {
            col: loc.col,
            width,
        });
    }
    let row = row_ordinal(&loc.row)?;
    let index = u64::from(width) * u64::from(row - 1) + u64::from(loc.col) - 1;
    usize::try_from(index).map_err(|_| LocationError::RowOverflow(loc.row.clone()))
}

/// Recovers `(row letters, column)` from a slot index.
pub fn slot_position(width: u32, index: usize) -> Option<(String, u32)> {
    if width == 0 {
        return None;
    }
    let width = width as usize;
    let row = u32::try_from(index / width + 1).ok()?;
    let col = (index % width + 1) as u32;
    Some((row_letter(row)?, col))
}
