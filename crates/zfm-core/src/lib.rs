//! Record model, location addressing and the storage contract shared by
//! the spreadsheet and relational backends.

pub mod location;
pub mod model;
pub mod store;

pub use location::{row_letter, row_ordinal, slot_index, slot_position, Location, LocationError};
pub use model::{
    find_field, CellValue, CulledTank, Field, Genotype, Rack, RackSize, Tank, FATHER_LABEL,
    MOTHER_LABEL,
};
pub use store::{StoreError, TankStore};
