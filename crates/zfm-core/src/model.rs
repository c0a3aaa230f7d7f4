use crate::location::{slot_index, Location, LocationError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MOTHER_LABEL: &str = "mother_id";
pub const FATHER_LABEL: &str = "father_id";
pub const DEFAULT_RACK_WIDTH: u32 = 12;
pub const DEFAULT_RACK_HEIGHT: u32 = 2;

/// A spreadsheet-style cell: either text or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(value) => Some(*value),
            CellValue::Text(value) => value.trim().parse().ok(),
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, CellValue::Text(value) if value.trim().is_empty())
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Text(value) => f.write_str(value),
            CellValue::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                write!(f, "{}", *value as i64)
            }
            CellValue::Number(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// One labelled cell of free-form record data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub label: CellValue,
    pub data: CellValue,
}

impl Field {
    pub fn new(label: impl Into<CellValue>, data: impl Into<CellValue>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label.to_string() == label
    }
}

/// First field whose label renders as `label`.
pub fn find_field<'a>(fields: &'a [Field], label: &str) -> Option<&'a Field> {
    fields.iter().find(|field| field.has_label(label))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RackSize {
    pub width: u32,
    pub height: u32,
}

impl Default for RackSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_RACK_WIDTH,
            height: DEFAULT_RACK_HEIGHT,
        }
    }
}

impl RackSize {
    pub fn slots(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Checks the location fits inside this rack and returns its slot index.
    pub fn locate(&self, loc: &Location) -> Result<usize, LocationError> {
        let index = slot_index(self.width, loc)?;
        if index >= self.slots() {
            return Err(LocationError::RowOutOfRange {
                row: loc.row.clone(),
                height: self.height,
            });
        }
        Ok(index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rack {
    pub rack_num: u32,
    pub room: String,
    pub size: RackSize,
    /// Dense, indexed by slot index; `None` is an empty slot.
    pub tanks: Vec<Option<Tank>>,
}

impl Rack {
    pub fn new(rack_num: u32, room: impl Into<String>, size: RackSize) -> Self {
        Self {
            rack_num,
            room: room.into(),
            size,
            tanks: Vec::new(),
        }
    }

    pub fn occupied(&self) -> impl Iterator<Item = &Tank> {
        self.tanks.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tank {
    pub loc: Location,
    pub uid: u32,
    pub genotypes: Vec<String>,
    pub dobs: Vec<NaiveDate>,
    pub fields: Vec<Field>,
}

impl Tank {
    pub fn new(uid: u32, loc: Location) -> Self {
        Self {
            loc,
            uid,
            genotypes: Vec::new(),
            dobs: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, label: &str) -> Option<&Field> {
        find_field(&self.fields, label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genotype {
    pub uid: String,
    pub fields: Vec<Field>,
    /// Reverse index: uids of live tanks listing this genotype.
    pub tanks: Vec<u32>,
}

impl Genotype {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            fields: Vec::new(),
            tanks: Vec::new(),
        }
    }

    pub fn field(&self, label: &str) -> Option<&Field> {
        find_field(&self.fields, label)
    }

    pub fn mother(&self) -> Option<String> {
        self.field(MOTHER_LABEL).map(|field| field.data.to_string())
    }

    pub fn father(&self) -> Option<String> {
        self.field(FATHER_LABEL).map(|field| field.data.to_string())
    }

    pub fn is_child_of(&self, parent_id: &str) -> bool {
        self.mother().as_deref() == Some(parent_id) || self.father().as_deref() == Some(parent_id)
    }

    pub fn link_tank(&mut self, uid: u32) -> bool {
        if self.tanks.contains(&uid) {
            return false;
        }
        self.tanks.push(uid);
        true
    }

    pub fn unlink_tank(&mut self, uid: u32) -> bool {
        let before = self.tanks.len();
        self.tanks.retain(|tank| *tank != uid);
        before != self.tanks.len()
    }
}

/// Archive record left behind by a cull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CulledTank {
    pub tank: Tank,
    pub culled_at: DateTime<Utc>,
}
