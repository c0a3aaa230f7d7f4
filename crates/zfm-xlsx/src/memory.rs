use crate::{load_into, parse_workbook, ImportError, ImportOptions, ImportReport, Workbook};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use zfm_core::store::{combine_tanks, smallest_unused_uid, validate_merge_sources};
use zfm_core::{
    CulledTank, Genotype, Location, LocationError, Rack, RackSize, StoreError, Tank, TankStore,
};

const BACKEND: &str = "spreadsheet";

#[derive(Debug, Clone)]
struct RackSlots {
    room: String,
    size: RackSize,
    slots: Vec<Option<u32>>,
}

/// Inventory held in memory for the life of the process, loaded from a workbook.
#[derive(Debug, Default)]
pub struct XlsxStore {
    source: Option<PathBuf>,
    racks: BTreeMap<u32, RackSlots>,
    tanks: BTreeMap<u32, Tank>,
    genotypes: BTreeMap<String, Genotype>,
    graveyard: Vec<CulledTank>,
    retired: BTreeSet<u32>,
    report: ImportReport,
}

impl XlsxStore {
    pub fn open(path: impl AsRef<Path>, options: &ImportOptions) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let workbook = Workbook::open(path)?;
        let mut store = Self::from_workbook(&workbook, options)?;
        store.source = Some(path.to_path_buf());
        Ok(store)
    }

    pub fn from_workbook(workbook: &Workbook, options: &ImportOptions) -> Result<Self, ImportError> {
        let parsed = parse_workbook(workbook, options)?;
        let mut store = Self::default();
        store.report = load_into(&mut store, &parsed, options.strict)?;
        Ok(store)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn report(&self) -> &ImportReport {
        &self.report
    }

    fn slot_of(&self, loc: &Location) -> Result<Option<(u32, usize)>, StoreError> {
        let Some(rack) = self.racks.get(&loc.rack) else {
            return Ok(None);
        };
        match rack.size.locate(loc) {
            Ok(index) => Ok(Some((loc.rack, index))),
            Err(LocationError::ColumnOutOfRange { .. } | LocationError::RowOutOfRange { .. }) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn clear_slot(&mut self, tank: &Tank) {
        if let Some(rack) = self.racks.get_mut(&tank.loc.rack) {
            if let Ok(index) = rack.size.locate(&tank.loc) {
                if rack.slots.get(index).copied().flatten() == Some(tank.uid) {
                    rack.slots[index] = None;
                }
            }
        }
    }

    fn unlink_everywhere(&mut self, uid: u32) {
        for genotype in self.genotypes.values_mut() {
            genotype.unlink_tank(uid);
        }
    }

    /// Takes a live tank out of the population and retires its uid.
    fn retire(&mut self, uid: u32) -> Result<Tank, StoreError> {
        let tank = self.tanks.remove(&uid).ok_or(StoreError::TankNotFound(uid))?;
        self.clear_slot(&tank);
        self.unlink_everywhere(uid);
        self.retired.insert(uid);
        Ok(tank)
    }

    fn check_genotypes(&self, uid: u32, genotypes: &[String]) -> Result<(), StoreError> {
        match genotypes
            .iter()
            .find(|genotype| !self.genotypes.contains_key(*genotype))
        {
            Some(missing) => Err(StoreError::UnknownGenotype {
                tank_uid: uid,
                genotype: missing.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl TankStore for XlsxStore {
    type Error = ImportError;

    fn read_tank(&self, uid: u32) -> Result<Option<Tank>, Self::Error> {
        Ok(self.tanks.get(&uid).cloned())
    }

    fn write_tank(&mut self, uid: u32, tank: &Tank) -> Result<(), Self::Error> {
        if self.retired.contains(&uid) {
            return Err(StoreError::RetiredTank(uid).into());
        }
        let mut stored = tank.clone();
        stored.uid = uid;
        stored.loc = tank.loc.canonical().map_err(StoreError::from)?;

        let rack = self
            .racks
            .get(&stored.loc.rack)
            .ok_or(StoreError::UnknownRack(stored.loc.rack))?;
        let index = rack.size.locate(&stored.loc).map_err(StoreError::from)?;
        if let Some(occupant) = rack.slots.get(index).copied().flatten() {
            if occupant != uid {
                return Err(StoreError::SlotOccupied {
                    loc: stored.loc.clone(),
                    occupant,
                }
                .into());
            }
        }
        self.check_genotypes(uid, &stored.genotypes)?;

        if let Some(previous) = self.tanks.get(&uid).cloned() {
            self.clear_slot(&previous);
            for genotype_id in &previous.genotypes {
                if stored.genotypes.contains(genotype_id) {
                    continue;
                }
                if let Some(genotype) = self.genotypes.get_mut(genotype_id) {
                    genotype.unlink_tank(uid);
                }
            }
        }
        for genotype_id in &stored.genotypes {
            if let Some(genotype) = self.genotypes.get_mut(genotype_id) {
                genotype.link_tank(uid);
            }
        }

        if let Some(rack) = self.racks.get_mut(&stored.loc.rack) {
            if rack.slots.len() <= index {
                rack.slots.resize(index + 1, None);
            }
            rack.slots[index] = Some(uid);
        }
        self.tanks.insert(uid, stored);
        Ok(())
    }

    fn find_tank(&self, loc: &Location) -> Result<Option<Tank>, Self::Error> {
        let Some((rack_num, index)) = self.slot_of(loc)? else {
            return Ok(None);
        };
        let uid = self
            .racks
            .get(&rack_num)
            .and_then(|rack| rack.slots.get(index).copied().flatten());
        Ok(uid.and_then(|uid| self.tanks.get(&uid).cloned()))
    }

    fn read_genotype(&self, uid: &str) -> Result<Option<Genotype>, Self::Error> {
        Ok(self.genotypes.get(uid).cloned())
    }

    fn write_genotype(&mut self, genotype: &Genotype) -> Result<(), Self::Error> {
        let tanks = self
            .genotypes
            .get(&genotype.uid)
            .map(|existing| existing.tanks.clone())
            .unwrap_or_default();
        self.genotypes.insert(
            genotype.uid.clone(),
            Genotype {
                uid: genotype.uid.clone(),
                fields: genotype.fields.clone(),
                tanks,
            },
        );
        Ok(())
    }

    fn write_rack(&mut self, rack: &Rack) -> Result<(), Self::Error> {
        let placed: Vec<u32> = self
            .racks
            .get(&rack.rack_num)
            .map(|existing| existing.slots.iter().flatten().copied().collect())
            .unwrap_or_default();

        let mut slots = vec![None; rack.size.slots()];
        for uid in placed {
            let Some(tank) = self.tanks.get(&uid) else {
                continue;
            };
            let index = rack
                .size
                .locate(&tank.loc)
                .map_err(|_| StoreError::RackResize {
                    rack_num: rack.rack_num,
                    tank_uid: uid,
                    loc: tank.loc.clone(),
                })?;
            slots[index] = Some(uid);
        }

        self.racks.insert(
            rack.rack_num,
            RackSlots {
                room: rack.room.clone(),
                size: rack.size,
                slots,
            },
        );
        Ok(())
    }

    fn get_racks(&self) -> Result<Vec<Rack>, Self::Error> {
        Ok(self
            .racks
            .iter()
            .map(|(rack_num, rack)| Rack {
                rack_num: *rack_num,
                room: rack.room.clone(),
                size: rack.size,
                tanks: rack
                    .slots
                    .iter()
                    .map(|uid| uid.and_then(|uid| self.tanks.get(&uid).cloned()))
                    .collect(),
            })
            .collect())
    }

    fn get_genotypes(&self) -> Result<BTreeMap<String, Genotype>, Self::Error> {
        Ok(self.genotypes.clone())
    }

    fn get_children(&self, parent_id: &str) -> Result<Vec<Genotype>, Self::Error> {
        Ok(self
            .genotypes
            .values()
            .filter(|genotype| genotype.is_child_of(parent_id))
            .cloned()
            .collect())
    }

    fn merge_tanks(&mut self, uids: &[u32]) -> Result<Tank, Self::Error> {
        validate_merge_sources(uids)?;
        let sources = uids
            .iter()
            .map(|uid| {
                self.tanks
                    .get(uid)
                    .cloned()
                    .ok_or(StoreError::TankNotFound(*uid))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let preview = combine_tanks(0, &sources)?;
        self.check_genotypes(0, &preview.genotypes)?;

        for uid in uids {
            self.retire(*uid)?;
        }
        let taken: BTreeSet<u32> = self.tanks.keys().chain(self.retired.iter()).copied().collect();
        let uid = smallest_unused_uid(&taken);
        let merged = combine_tanks(uid, &sources)?;
        self.write_tank(uid, &merged)?;
        tracing::info!(?uids, uid, "merged tanks");
        Ok(merged)
    }

    fn cull_tank(&mut self, uid: u32) -> Result<(), Self::Error> {
        let tank = self.retire(uid)?;
        self.graveyard.push(CulledTank {
            tank,
            culled_at: Utc::now(),
        });
        tracing::info!(uid, "culled tank");
        Ok(())
    }

    fn get_graveyard(&self) -> Result<Vec<CulledTank>, Self::Error> {
        Ok(self.graveyard.clone())
    }

    fn import_from_xlsx(&mut self, _path: &Path) -> Result<(), Self::Error> {
        Err(StoreError::NotImplemented {
            backend: BACKEND,
            operation: "import_from_xlsx",
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sheet;
    use chrono::NaiveDate;
    use zfm_core::{CellValue, Field};

    fn text(value: &str) -> Option<CellValue> {
        Some(CellValue::text(value))
    }

    fn num(value: f64) -> Option<CellValue> {
        Some(CellValue::Number(value))
    }

    fn sample_store() -> XlsxStore {
        let mut genotypes = Sheet::new("genotype_ID");
        genotypes.push_row([text("genotypeID"), text("mother_id"), text("father_id")]);
        genotypes.push_row([text("G1"), None, None]);
        genotypes.push_row([text("G2"), None, None]);
        genotypes.push_row([text("G3"), text("G1"), text("G2")]);

        let mut rack = Sheet::new("rack_1");
        rack.push_row([text("row"), text("column"), text("sort"), text("ID-"), text("x")]);
        rack.push_row([text("A"), num(1.0), num(5.0), text("G1"), num(1.0)]);
        rack.push_row([text("A"), num(2.0), num(6.0), text("G2"), num(2.0)]);

        let mut workbook = Workbook::default();
        workbook.push_sheet(genotypes).push_sheet(rack);
        XlsxStore::from_workbook(&workbook, &ImportOptions::default()).expect("load store")
    }

    #[test]
    fn loads_tanks_and_reverse_index() {
        let store = sample_store();
        assert_eq!(store.read_tank(5).expect("read").map(|t| t.uid), Some(5));
        assert_eq!(
            store.read_genotype("G1").expect("read").expect("G1").tanks,
            vec![5]
        );
        let found = store
            .find_tank(&Location::new("", 1, "a", 2))
            .expect("find")
            .expect("tank at A2");
        assert_eq!(found.uid, 6);
        assert!(store
            .find_tank(&Location::new("", 1, "B", 1))
            .expect("find")
            .is_none());
        assert!(store
            .find_tank(&Location::new("", 9, "A", 1))
            .expect("find")
            .is_none());
        assert_eq!(store.report().tanks, 2);
    }

    #[test]
    fn write_tank_moves_slots_and_relinks_genotypes() {
        let mut store = sample_store();
        let mut tank = store.read_tank(5).expect("read").expect("tank 5");
        tank.loc = Location::new("", 1, "B", 3);
        tank.genotypes = vec!["G2".to_string()];
        store.write_tank(5, &tank).expect("write");
        store.write_tank(5, &tank).expect("idempotent write");

        assert!(store
            .find_tank(&Location::new("", 1, "A", 1))
            .expect("find")
            .is_none());
        assert_eq!(
            store
                .find_tank(&Location::new("", 1, "B", 3))
                .expect("find")
                .map(|t| t.uid),
            Some(5)
        );
        assert!(store.read_genotype("G1").expect("read").expect("G1").tanks.is_empty());
        assert_eq!(
            store.read_genotype("G2").expect("read").expect("G2").tanks,
            vec![6, 5]
        );
    }

    #[test]
    fn written_rows_read_back_uppercase() {
        let mut store = sample_store();
        let tank = Tank::new(3, Location::new("", 1, " b", 2));
        store.write_tank(3, &tank).expect("write");

        let stored = store.read_tank(3).expect("read").expect("tank 3");
        assert_eq!(stored.loc, Location::new("", 1, "B", 2));
        assert_eq!(
            store.find_tank(&Location::new("", 1, "b", 2)).expect("find"),
            Some(stored)
        );
    }

    #[test]
    fn unknown_genotype_skips_name_the_source_row() {
        let mut rack = Sheet::new("tanks_2");
        rack.push_row([text("row"), text("column"), text("sort"), text("ID-")]);
        rack.push_row([text("A"), num(1.0), num(5.0), text("G1")]);
        rack.push_row([None::<CellValue>, None, None, None]);
        rack.push_row([text("A"), num(2.0), num(6.0), text("ghost")]);
        let mut workbook = Workbook::default();
        workbook.push_sheet(rack);

        let mut options = ImportOptions::default();
        options.layout.rack_sheet_prefix = "tanks_".to_string();
        let mut genotypes = Sheet::new("genotype_ID");
        genotypes.push_row([text("genotypeID")]);
        genotypes.push_row([text("G1")]);
        workbook.push_sheet(genotypes);

        let store = XlsxStore::from_workbook(&workbook, &options).expect("load store");
        assert_eq!(store.report().tanks, 1);
        assert_eq!(store.report().skipped.len(), 1);
        let skipped = &store.report().skipped[0];
        assert_eq!(skipped.sheet, "tanks_2");
        assert_eq!(skipped.row, 4);
        assert!(skipped.reason.contains("ghost"));
    }

    #[test]
    fn write_tank_rejects_unknown_genotypes_and_taken_slots() {
        let mut store = sample_store();
        let mut tank = Tank::new(9, Location::new("", 1, "B", 1));
        tank.genotypes.push("nope".to_string());
        assert!(matches!(
            store.write_tank(9, &tank),
            Err(ImportError::Store(StoreError::UnknownGenotype { .. }))
        ));

        let squatter = Tank::new(9, Location::new("", 1, "A", 1));
        assert!(matches!(
            store.write_tank(9, &squatter),
            Err(ImportError::Store(StoreError::SlotOccupied { occupant: 5, .. }))
        ));

        let lost = Tank::new(9, Location::new("", 4, "A", 1));
        assert!(matches!(
            store.write_tank(9, &lost),
            Err(ImportError::Store(StoreError::UnknownRack(4)))
        ));
        assert!(store.read_tank(9).expect("read").is_none());
    }

    #[test]
    fn merge_concatenates_and_uses_smallest_free_uid() {
        let mut store = sample_store();
        let mut a = store.read_tank(5).expect("read").expect("tank 5");
        a.dobs.push(NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"));
        store.write_tank(5, &a).expect("write");

        let merged = store.merge_tanks(&[5, 6]).expect("merge");
        assert_eq!(merged.uid, 1);
        assert_eq!(merged.genotypes, vec!["G1".to_string(), "G2".to_string()]);
        assert_eq!(
            merged.fields,
            vec![Field::new("x", 1.0), Field::new("x", 2.0)]
        );
        assert_eq!(merged.loc, Location::new("", 1, "A", 1));
        assert!(store.read_tank(5).expect("read").is_none());
        assert!(store.read_tank(6).expect("read").is_none());
        assert_eq!(
            store.read_genotype("G1").expect("read").expect("G1").tanks,
            vec![1]
        );
        assert_eq!(
            store
                .find_tank(&Location::new("", 1, "A", 1))
                .expect("find")
                .map(|t| t.uid),
            Some(1)
        );
    }

    #[test]
    fn culled_uids_are_archived_and_never_reused() {
        let mut store = sample_store();
        let before = Utc::now();
        store.cull_tank(5).expect("cull");
        let after = Utc::now();

        assert!(store.read_tank(5).expect("read").is_none());
        let graveyard = store.get_graveyard().expect("graveyard");
        assert_eq!(graveyard.len(), 1);
        assert_eq!(graveyard[0].tank.uid, 5);
        assert!(graveyard[0].culled_at >= before && graveyard[0].culled_at <= after);

        let revived = Tank::new(5, Location::new("", 1, "B", 1));
        assert!(matches!(
            store.write_tank(5, &revived),
            Err(ImportError::Store(StoreError::RetiredTank(5)))
        ));
        assert!(matches!(
            store.cull_tank(5),
            Err(ImportError::Store(StoreError::TankNotFound(5)))
        ));
    }

    #[test]
    fn children_follow_mother_and_father_fields() {
        let store = sample_store();
        let children: Vec<String> = store
            .get_children("G2")
            .expect("children")
            .into_iter()
            .map(|g| g.uid)
            .collect();
        assert_eq!(children, vec!["G3".to_string()]);
        assert!(store.get_children("G3").expect("children").is_empty());
    }

    #[test]
    fn resize_reindexes_or_rejects() {
        let mut store = sample_store();
        let mut rack = store.get_racks().expect("racks").remove(0);
        rack.size = RackSize {
            width: 4,
            height: 3,
        };
        store.write_rack(&rack).expect("grow rack");
        let racks = store.get_racks().expect("racks");
        assert_eq!(racks[0].tanks.len(), 12);
        assert_eq!(racks[0].tanks[1].as_ref().map(|t| t.uid), Some(6));

        rack.size = RackSize {
            width: 1,
            height: 3,
        };
        assert!(matches!(
            store.write_rack(&rack),
            Err(ImportError::Store(StoreError::RackResize { tank_uid: 6, .. }))
        ));
    }

    #[test]
    fn spreadsheet_store_cannot_reimport() {
        let mut store = sample_store();
        assert!(matches!(
            store.import_from_xlsx(Path::new("other.xlsx")),
            Err(ImportError::Store(StoreError::NotImplemented { .. }))
        ));
    }
}
