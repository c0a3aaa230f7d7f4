use crate::location::{Location, LocationError};
use crate::model::{CulledTank, Genotype, Rack, Tank};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

/// Failures every backend reports the same way.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tank {tank_uid} references unknown genotype {genotype:?}")]
    UnknownGenotype { tank_uid: u32, genotype: String },
    #[error("rack {0} does not exist")]
    UnknownRack(u32),
    #[error("invalid location: {0}")]
    InvalidLocation(#[from] LocationError),
    #[error("{loc} is already occupied by tank {occupant}")]
    SlotOccupied { loc: Location, occupant: u32 },
    #[error("tank {0} not found")]
    TankNotFound(u32),
    #[error("tank uid {0} was retired by a cull or merge")]
    RetiredTank(u32),
    #[error("merge needs at least one tank")]
    EmptyMerge,
    #[error("tank {0} listed more than once in merge")]
    DuplicateMergeSource(u32),
    #[error("resizing rack {rack_num} would strand tank {tank_uid} at {loc}")]
    RackResize {
        rack_num: u32,
        tank_uid: u32,
        loc: Location,
    },
    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },
}

/// The canonical operations both backends implement.
///
/// Reads return owned snapshots; callers mutate state only by writing back.
pub trait TankStore {
    type Error: std::error::Error + From<StoreError> + Send + Sync + 'static;

    fn read_tank(&self, uid: u32) -> Result<Option<Tank>, Self::Error>;

    /// Upserts `tank` under `uid` and links `uid` into every listed genotype.
    fn write_tank(&mut self, uid: u32, tank: &Tank) -> Result<(), Self::Error>;

    fn find_tank(&self, loc: &Location) -> Result<Option<Tank>, Self::Error>;

    fn read_genotype(&self, uid: &str) -> Result<Option<Genotype>, Self::Error>;

    /// Upserts genotype fields. The stored reverse index is kept as-is.
    fn write_genotype(&mut self, genotype: &Genotype) -> Result<(), Self::Error>;

    fn write_rack(&mut self, rack: &Rack) -> Result<(), Self::Error>;

    fn get_racks(&self) -> Result<Vec<Rack>, Self::Error>;

    fn get_genotypes(&self) -> Result<BTreeMap<String, Genotype>, Self::Error>;

    fn get_children(&self, parent_id: &str) -> Result<Vec<Genotype>, Self::Error>;

    /// Combines `uids` into one tank numbered with the smallest free uid.
    fn merge_tanks(&mut self, uids: &[u32]) -> Result<Tank, Self::Error>;

    fn cull_tank(&mut self, uid: u32) -> Result<(), Self::Error>;

    fn get_graveyard(&self) -> Result<Vec<CulledTank>, Self::Error>;

    fn import_from_xlsx(&mut self, path: &Path) -> Result<(), Self::Error>;
}

/// Rejects empty merges and uids listed twice.
pub fn validate_merge_sources(uids: &[u32]) -> Result<(), StoreError> {
    if uids.is_empty() {
        return Err(StoreError::EmptyMerge);
    }
    let mut seen = BTreeSet::new();
    for uid in uids {
        if !seen.insert(*uid) {
            return Err(StoreError::DuplicateMergeSource(*uid));
        }
    }
    Ok(())
}

/// Concatenates source tanks in order; the result sits at the first source's slot.
pub fn combine_tanks(uid: u32, sources: &[Tank]) -> Result<Tank, StoreError> {
    let first = sources.first().ok_or(StoreError::EmptyMerge)?;
    let mut merged = Tank::new(uid, first.loc.clone());
    for source in sources {
        merged.genotypes.extend(source.genotypes.iter().cloned());
        merged.dobs.extend(source.dobs.iter().copied());
        merged.fields.extend(source.fields.iter().cloned());
    }
    Ok(merged)
}

/// Smallest positive uid absent from `taken`.
pub fn smallest_unused_uid(taken: &BTreeSet<u32>) -> u32 {
    let mut candidate = 1;
    for uid in taken.range(1..) {
        if *uid != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}
