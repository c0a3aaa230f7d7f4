mod columns;

use chrono::{DateTime, NaiveDate, Utc};
use columns::{
    dob_column, genotype_column, query_rows, quote_ident, table_columns, RowValues, StoredRow,
    DOB_COLUMN_PREFIX, GENOTYPE_COLUMN_PREFIX,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;
use zfm_core::store::{combine_tanks, smallest_unused_uid, validate_merge_sources};
use zfm_core::{
    row_letter, row_ordinal, CellValue, CulledTank, Genotype, Location, LocationError, Rack,
    RackSize, StoreError, Tank, TankStore, FATHER_LABEL, MOTHER_LABEL,
};
use zfm_xlsx::{load_into, parse_workbook, ImportError, ImportOptions, ImportReport, Workbook};

pub const INVENTORY_SCHEMA_VERSION: i64 = 1;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("import failed: {0}")]
    Import(#[from] ImportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inventory persisted in SQLite. Every contract operation runs in its own
/// transaction, including the genotype reverse-index updates a tank write
/// implies.
pub struct SqliteStore {
    conn: Connection,
    import_options: ImportOptions,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "opened inventory database");
        let store = Self {
            conn,
            import_options: ImportOptions::default(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            import_options: ImportOptions::default(),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn with_import_options(mut self, options: ImportOptions) -> Self {
        self.import_options = options;
        self
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > INVENTORY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: INVENTORY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_inventory_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Column names currently provisioned on `table`, lower-cased.
    pub fn columns(&self, table_name: &str) -> Result<BTreeSet<String>, StorageError> {
        table_columns(&self.conn, table_name)
    }

    /// Bulk-loads a workbook file and reports what was written and skipped.
    pub fn import_file(&mut self, path: impl AsRef<Path>) -> Result<ImportReport, StorageError> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "importing workbook");
        let workbook = Workbook::open(path)?;
        self.import_workbook(&workbook)
    }

    pub fn import_workbook(&mut self, workbook: &Workbook) -> Result<ImportReport, StorageError> {
        let parsed = parse_workbook(workbook, &self.import_options)?;
        let strict = self.import_options.strict;
        load_into(self, &parsed, strict)
    }

    fn read<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn write<T>(
        &mut self,
        op: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let tx = self.conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl TankStore for SqliteStore {
    type Error = StorageError;

    fn read_tank(&self, uid: u32) -> Result<Option<Tank>, Self::Error> {
        self.read(|conn| load_tank(conn, uid))
    }

    fn write_tank(&mut self, uid: u32, tank: &Tank) -> Result<(), Self::Error> {
        self.write(|conn| put_tank(conn, uid, tank))
    }

    fn find_tank(&self, loc: &Location) -> Result<Option<Tank>, Self::Error> {
        self.read(|conn| {
            let Some(size) = load_rack_size(conn, loc.rack)? else {
                return Ok(None);
            };
            match size.locate(loc) {
                Ok(_) => {}
                Err(LocationError::ColumnOutOfRange { .. } | LocationError::RowOutOfRange { .. }) => {
                    return Ok(None)
                }
                Err(err) => return Err(StoreError::from(err).into()),
            }
            let row_num = row_ordinal(&loc.row).map_err(StoreError::from)?;
            let rows = query_rows(
                conn,
                "SELECT * FROM tanks WHERE rack = ?1 AND row_num = ?2 AND col_num = ?3 LIMIT 1",
                params![loc.rack, row_num, loc.col],
            )?;
            rows.first().map(tank_from_row).transpose()
        })
    }

    fn read_genotype(&self, uid: &str) -> Result<Option<Genotype>, Self::Error> {
        self.read(|conn| load_genotype(conn, uid))
    }

    fn write_genotype(&mut self, genotype: &Genotype) -> Result<(), Self::Error> {
        self.write(|conn| {
            let tanks = load_genotype(conn, &genotype.uid)?
                .map(|existing| existing.tanks)
                .unwrap_or_default();
            save_genotype(
                conn,
                &Genotype {
                    uid: genotype.uid.clone(),
                    fields: genotype.fields.clone(),
                    tanks,
                },
            )
        })
    }

    fn write_rack(&mut self, rack: &Rack) -> Result<(), Self::Error> {
        self.write(|conn| {
            let placed = query_rows(
                conn,
                "SELECT * FROM tanks WHERE rack = ?1",
                params![rack.rack_num],
            )?;
            for row in &placed {
                let tank = tank_from_row(row)?;
                if rack.size.locate(&tank.loc).is_err() {
                    return Err(StoreError::RackResize {
                        rack_num: rack.rack_num,
                        tank_uid: tank.uid,
                        loc: tank.loc,
                    }
                    .into());
                }
            }
            conn.execute(
                "
                INSERT OR REPLACE INTO racks (rack_num, room, width, height)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![rack.rack_num, rack.room, rack.size.width, rack.size.height],
            )?;
            Ok(())
        })
    }

    fn get_racks(&self) -> Result<Vec<Rack>, Self::Error> {
        self.read(|conn| {
            let mut racks = BTreeMap::new();
            let mut statement =
                conn.prepare("SELECT rack_num, room, width, height FROM racks ORDER BY rack_num")?;
            let rows = statement.query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    RackSize {
                        width: row.get(2)?,
                        height: row.get(3)?,
                    },
                ))
            })?;
            for row in rows {
                let (rack_num, room, size) = row?;
                let mut rack = Rack::new(rack_num, room, size);
                rack.tanks = vec![None; size.slots()];
                racks.insert(rack_num, rack);
            }

            for row in query_rows(conn, "SELECT * FROM tanks ORDER BY tank_uid", [])? {
                let tank = tank_from_row(&row)?;
                let Some(rack) = racks.get_mut(&tank.loc.rack) else {
                    tracing::warn!(uid = tank.uid, rack = tank.loc.rack, "tank in unknown rack");
                    continue;
                };
                match rack.size.locate(&tank.loc) {
                    Ok(index) => rack.tanks[index] = Some(tank),
                    Err(err) => {
                        tracing::warn!(uid = tank.uid, %err, "tank outside its rack bounds")
                    }
                }
            }
            Ok(racks.into_values().collect())
        })
    }

    fn get_genotypes(&self) -> Result<BTreeMap<String, Genotype>, Self::Error> {
        self.read(|conn| {
            query_rows(conn, "SELECT * FROM genotypes ORDER BY genotype_id", [])?
                .iter()
                .map(|row| genotype_from_row(row).map(|genotype| (genotype.uid.clone(), genotype)))
                .collect()
        })
    }

    fn get_children(&self, parent_id: &str) -> Result<Vec<Genotype>, Self::Error> {
        self.read(|conn| {
            let available = table_columns(conn, "genotypes")?;
            let conditions: Vec<String> = [MOTHER_LABEL, FATHER_LABEL]
                .iter()
                .map(|label| columns::field_column(&CellValue::text(*label), 1))
                .filter(|column| available.contains(&column.to_lowercase()))
                .map(|column| {
                    let column = quote_ident(&column);
                    format!("{column} = ?1 OR {column} = ?2")
                })
                .collect();
            if conditions.is_empty() {
                return Ok(Vec::new());
            }

            let sql = format!(
                "SELECT * FROM genotypes WHERE {} ORDER BY genotype_id",
                conditions.join(" OR ")
            );
            let numeric_id = parent_id.trim().parse::<f64>().ok();
            let mut children = Vec::new();
            for row in query_rows(conn, &sql, params![parent_id, numeric_id])? {
                let genotype = genotype_from_row(&row)?;
                // Column names compare case-insensitively, field labels do not.
                if genotype.is_child_of(parent_id) {
                    children.push(genotype);
                }
            }
            Ok(children)
        })
    }

    fn merge_tanks(&mut self, uids: &[u32]) -> Result<Tank, Self::Error> {
        validate_merge_sources(uids)?;
        let merged = self.write(|conn| {
            let mut sources = Vec::with_capacity(uids.len());
            for uid in uids {
                if is_retired(conn, *uid)? {
                    return Err(StoreError::RetiredTank(*uid).into());
                }
                sources.push(load_tank(conn, *uid)?.ok_or(StoreError::TankNotFound(*uid))?);
            }

            let retired_at = Utc::now();
            for source in &sources {
                retire_tank(conn, source, "merged", retired_at)?;
            }

            let uid = smallest_unused_uid(&taken_uids(conn)?);
            let merged = combine_tanks(uid, &sources)?;
            put_tank(conn, uid, &merged)?;
            Ok(merged)
        })?;
        tracing::info!(?uids, uid = merged.uid, "merged tanks");
        Ok(merged)
    }

    fn cull_tank(&mut self, uid: u32) -> Result<(), Self::Error> {
        self.write(|conn| {
            let tank = load_tank(conn, uid)?.ok_or(StoreError::TankNotFound(uid))?;
            let culled_at = Utc::now();
            retire_tank(conn, &tank, "culled", culled_at)?;

            let mut values = tank_values(uid, &tank)?;
            values.push("culled_at", culled_at.to_rfc3339());
            values.insert(conn, "graveyard", false)
        })?;
        tracing::info!(uid, "culled tank");
        Ok(())
    }

    fn get_graveyard(&self) -> Result<Vec<CulledTank>, Self::Error> {
        self.read(|conn| {
            query_rows(conn, "SELECT * FROM graveyard ORDER BY grave_id", [])?
                .iter()
                .map(|row| -> Result<CulledTank, StorageError> {
                    let culled_at = row
                        .text("culled_at")
                        .ok_or_else(|| StorageError::Timestamp("missing culled_at".to_string()))?;
                    Ok(CulledTank {
                        tank: tank_from_row(row)?,
                        culled_at: parse_ts(&culled_at)?,
                    })
                })
                .collect()
        })
    }

    fn import_from_xlsx(&mut self, path: &Path) -> Result<(), Self::Error> {
        self.import_file(path).map(|_| ())
    }
}

/// Upserts a tank row and keeps every affected genotype's reverse index in step.
fn put_tank(conn: &Connection, uid: u32, tank: &Tank) -> Result<(), StorageError> {
    if is_retired(conn, uid)? {
        return Err(StoreError::RetiredTank(uid).into());
    }
    let loc = tank.loc.canonical().map_err(StoreError::from)?;
    let size = load_rack_size(conn, loc.rack)?.ok_or(StoreError::UnknownRack(loc.rack))?;
    size.locate(&loc).map_err(StoreError::from)?;
    let row_num = row_ordinal(&loc.row).map_err(StoreError::from)?;

    let occupant: Option<u32> = conn
        .query_row(
            "SELECT tank_uid FROM tanks WHERE rack = ?1 AND row_num = ?2 AND col_num = ?3 LIMIT 1",
            params![loc.rack, row_num, loc.col],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(occupant) = occupant.filter(|occupant| *occupant != uid) {
        return Err(StoreError::SlotOccupied { loc, occupant }.into());
    }

    let mut linked = Vec::with_capacity(tank.genotypes.len());
    for genotype_id in &tank.genotypes {
        let genotype = load_genotype(conn, genotype_id)?.ok_or_else(|| StoreError::UnknownGenotype {
            tank_uid: uid,
            genotype: genotype_id.clone(),
        })?;
        linked.push(genotype);
    }

    if let Some(previous) = load_tank(conn, uid)? {
        for genotype_id in &previous.genotypes {
            if tank.genotypes.contains(genotype_id) {
                continue;
            }
            if let Some(mut genotype) = load_genotype(conn, genotype_id)? {
                if genotype.unlink_tank(uid) {
                    save_genotype(conn, &genotype)?;
                }
            }
        }
    }
    for mut genotype in linked {
        if genotype.link_tank(uid) {
            save_genotype(conn, &genotype)?;
        }
    }

    tank_values(uid, tank)?.insert(conn, "tanks", true)?;
    tracing::debug!(uid, %loc, "wrote tank");
    Ok(())
}

/// Removes a live tank, prunes it from the reverse index and retires its uid.
fn retire_tank(
    conn: &Connection,
    tank: &Tank,
    reason: &str,
    retired_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    conn.execute("DELETE FROM tanks WHERE tank_uid = ?1", params![tank.uid])?;
    for genotype_id in &tank.genotypes {
        if let Some(mut genotype) = load_genotype(conn, genotype_id)? {
            if genotype.unlink_tank(tank.uid) {
                save_genotype(conn, &genotype)?;
            }
        }
    }
    conn.execute(
        "
        INSERT OR REPLACE INTO retired_tanks (tank_uid, reason, retired_at)
        VALUES (?1, ?2, ?3)
        ",
        params![tank.uid, reason, retired_at.to_rfc3339()],
    )?;
    Ok(())
}

fn is_retired(conn: &Connection, uid: u32) -> Result<bool, StorageError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM retired_tanks WHERE tank_uid = ?1 LIMIT 1",
            params![uid],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Live and retired uids; neither may be handed out again.
fn taken_uids(conn: &Connection) -> Result<BTreeSet<u32>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT tank_uid FROM tanks
        UNION
        SELECT tank_uid FROM retired_tanks
        ",
    )?;
    let rows = statement.query_map([], |row| row.get::<_, u32>(0))?;
    let mut taken = BTreeSet::new();
    for row in rows {
        taken.insert(row?);
    }
    Ok(taken)
}

fn load_rack_size(conn: &Connection, rack_num: u32) -> Result<Option<RackSize>, StorageError> {
    Ok(conn
        .query_row(
            "SELECT width, height FROM racks WHERE rack_num = ?1",
            params![rack_num],
            |row| {
                Ok(RackSize {
                    width: row.get(0)?,
                    height: row.get(1)?,
                })
            },
        )
        .optional()?)
}

fn load_tank(conn: &Connection, uid: u32) -> Result<Option<Tank>, StorageError> {
    query_rows(conn, "SELECT * FROM tanks WHERE tank_uid = ?1", params![uid])?
        .first()
        .map(tank_from_row)
        .transpose()
}

fn load_genotype(conn: &Connection, uid: &str) -> Result<Option<Genotype>, StorageError> {
    query_rows(
        conn,
        "SELECT * FROM genotypes WHERE genotype_id = ?1",
        params![uid],
    )?
    .first()
    .map(genotype_from_row)
    .transpose()
}

fn save_genotype(conn: &Connection, genotype: &Genotype) -> Result<(), StorageError> {
    let tanks_json = serde_json::to_string(&genotype.tanks)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let mut values = RowValues::default();
    values.push("genotype_id", genotype.uid.clone());
    values.push("tank_uids_json", tanks_json);
    values.push_fields(&genotype.fields)?;
    values.insert(conn, "genotypes", true)
}

fn tank_values(uid: u32, tank: &Tank) -> Result<RowValues, StorageError> {
    let row_num = row_ordinal(&tank.loc.row).map_err(StoreError::from)?;
    let mut values = RowValues::default();
    values.push("tank_uid", i64::from(uid));
    values.push("room", tank.loc.room.clone());
    values.push("rack", i64::from(tank.loc.rack));
    values.push("row_num", i64::from(row_num));
    values.push("col_num", i64::from(tank.loc.col));
    for (slot, genotype) in tank.genotypes.iter().enumerate() {
        values.push(genotype_column(slot + 1), genotype.clone());
    }
    for (slot, dob) in tank.dobs.iter().enumerate() {
        values.push(dob_column(slot + 1), dob.format(DATE_FORMAT).to_string());
    }
    values.push_fields(&tank.fields)?;
    Ok(values)
}

fn tank_from_row(row: &StoredRow) -> Result<Tank, StorageError> {
    let uid = as_u32(row, "tank_uid")?;
    let row_num = as_u32(row, "row_num")?;
    let letters = row_letter(row_num)
        .ok_or_else(|| StorageError::Serialization(format!("invalid row number {row_num}")))?;
    let loc = Location::new(
        row.text("room").unwrap_or_default(),
        as_u32(row, "rack")?,
        letters,
        as_u32(row, "col_num")?,
    );

    let dobs = row
        .slotted(DOB_COLUMN_PREFIX)
        .iter()
        .map(|value| {
            NaiveDate::parse_from_str(value, DATE_FORMAT)
                .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Tank {
        loc,
        uid,
        genotypes: row.slotted(GENOTYPE_COLUMN_PREFIX),
        dobs,
        fields: row.fields()?,
    })
}

fn genotype_from_row(row: &StoredRow) -> Result<Genotype, StorageError> {
    let uid = row
        .text("genotype_id")
        .ok_or_else(|| StorageError::Serialization("missing genotype_id".to_string()))?;
    let tanks_json = row
        .text("tank_uids_json")
        .unwrap_or_else(|| "[]".to_string());
    let tanks = serde_json::from_str(&tanks_json)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    Ok(Genotype {
        uid,
        fields: row.fields()?,
        tanks,
    })
}

fn as_u32(row: &StoredRow, column: &str) -> Result<u32, StorageError> {
    let value = row.integer(column)?;
    u32::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("column {column} out of range: {value}")))
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use zfm_core::Field;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn store_with_rack() -> SqliteStore {
        let mut store = SqliteStore::open_in_memory().expect("open db");
        store
            .write_rack(&Rack::new(1, "fish room", RackSize::default()))
            .expect("write rack");
        for id in ["G1", "G2"] {
            store
                .write_genotype(&Genotype::new(id))
                .expect("write genotype");
        }
        store
    }

    fn sample_tank(uid: u32, row: &str, col: u32) -> Tank {
        let mut tank = Tank::new(uid, Location::new("fish room", 1, row, col));
        tank.genotypes.push("G1".to_string());
        tank.dobs.push(date(2024, 3, 14));
        tank.fields.push(Field::new("notes", "healthy"));
        tank.fields.push(Field::new(7.0, 2.5));
        tank
    }

    #[test]
    fn migrate_sets_schema_version_and_tables() {
        let store = SqliteStore::open_in_memory().expect("open db");
        assert_eq!(
            store.schema_version().expect("schema version"),
            INVENTORY_SCHEMA_VERSION
        );
        for table in ["racks", "tanks", "genotypes", "graveyard", "retired_tanks"] {
            assert!(store.table_exists(table).expect("table lookup"), "{table}");
        }
    }

    #[test]
    fn newer_schema_versions_are_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let store = SqliteStore::open(file.path()).expect("open db");
            store
                .conn
                .execute("PRAGMA user_version = 99", [])
                .expect("bump version");
        }
        assert!(matches!(
            SqliteStore::open(file.path()),
            Err(StorageError::UnsupportedSchemaVersion {
                found: 99,
                supported: INVENTORY_SCHEMA_VERSION
            })
        ));
    }

    #[test]
    fn tank_round_trip_preserves_everything() {
        let mut store = store_with_rack();
        let mut tank = sample_tank(10, "B", 3);
        tank.genotypes.push("G2".to_string());
        tank.dobs.push(date(2024, 5, 1));
        tank.fields.push(Field::new("notes", "second note"));
        store.write_tank(10, &tank).expect("write tank");

        assert_eq!(store.read_tank(10).expect("read tank"), Some(tank.clone()));
        assert_eq!(
            store
                .find_tank(&Location::new("", 1, "b", 3))
                .expect("find tank"),
            Some(tank)
        );
        assert!(store.read_tank(11).expect("read tank").is_none());
        assert!(store
            .find_tank(&Location::new("", 1, "A", 1))
            .expect("find empty slot")
            .is_none());
        assert!(store
            .find_tank(&Location::new("", 1, "A", 40))
            .expect("find outside rack")
            .is_none());
    }

    #[test]
    fn written_rows_read_back_uppercase() {
        let mut store = store_with_rack();
        let tank = sample_tank(3, " b", 2);
        store.write_tank(3, &tank).expect("write tank");

        let stored = store.read_tank(3).expect("read tank").expect("tank 3");
        assert_eq!(stored.loc, Location::new("fish room", 1, "B", 2));
        assert_eq!(
            Tank {
                loc: stored.loc.clone(),
                ..tank
            },
            stored
        );
    }

    #[test]
    fn rewriting_with_fewer_slots_drops_stale_columns() {
        let mut store = store_with_rack();
        let mut tank = sample_tank(10, "A", 1);
        tank.genotypes.push("G2".to_string());
        store.write_tank(10, &tank).expect("first write");

        tank.genotypes = vec!["G2".to_string()];
        tank.dobs.clear();
        tank.fields.truncate(1);
        store.write_tank(10, &tank).expect("second write");

        assert_eq!(store.read_tank(10).expect("read tank"), Some(tank));
        assert!(store
            .read_genotype("G1")
            .expect("read genotype")
            .expect("G1")
            .tanks
            .is_empty());
    }

    #[test]
    fn write_tank_maintains_reverse_index_idempotently() {
        let mut store = store_with_rack();
        let tank = sample_tank(10, "A", 1);
        store.write_tank(10, &tank).expect("write tank");
        store.write_tank(10, &tank).expect("repeat write");
        store
            .write_tank(11, &sample_tank(11, "A", 2))
            .expect("write second tank");

        let g1 = store.read_genotype("G1").expect("read").expect("G1");
        assert_eq!(g1.tanks, vec![10, 11]);

        // The stored reverse index wins over whatever the caller passes.
        let mut rewritten = Genotype::new("G1");
        rewritten.fields.push(Field::new("mother_id", "G2"));
        store.write_genotype(&rewritten).expect("write genotype");
        let g1 = store.read_genotype("G1").expect("read").expect("G1");
        assert_eq!(g1.tanks, vec![10, 11]);
        assert_eq!(g1.mother().as_deref(), Some("G2"));
    }

    #[test]
    fn unknown_genotype_aborts_the_whole_write() {
        let mut store = store_with_rack();
        let mut tank = sample_tank(10, "A", 1);
        tank.genotypes.push("missing".to_string());

        assert!(matches!(
            store.write_tank(10, &tank),
            Err(StorageError::Store(StoreError::UnknownGenotype { tank_uid: 10, .. }))
        ));
        assert!(store.read_tank(10).expect("read").is_none());
        assert!(store
            .read_genotype("G1")
            .expect("read")
            .expect("G1")
            .tanks
            .is_empty());
    }

    #[test]
    fn placement_rules_are_enforced() {
        let mut store = store_with_rack();
        store
            .write_tank(10, &sample_tank(10, "A", 1))
            .expect("write tank");

        assert!(matches!(
            store.write_tank(11, &sample_tank(11, "A", 1)),
            Err(StorageError::Store(StoreError::SlotOccupied { occupant: 10, .. }))
        ));
        assert!(matches!(
            store.write_tank(11, &sample_tank(11, "A", 13)),
            Err(StorageError::Store(StoreError::InvalidLocation(
                LocationError::ColumnOutOfRange { col: 13, width: 12 }
            )))
        ));
        let mut elsewhere = sample_tank(11, "A", 1);
        elsewhere.loc.rack = 7;
        assert!(matches!(
            store.write_tank(11, &elsewhere),
            Err(StorageError::Store(StoreError::UnknownRack(7)))
        ));
    }

    #[test]
    fn new_field_labels_grow_the_schema_without_touching_old_rows() {
        let mut store = store_with_rack();
        let first = sample_tank(10, "A", 1);
        store.write_tank(10, &first).expect("write first");
        let before = store.columns("tanks").expect("columns");

        let mut second = sample_tank(11, "A", 2);
        second.fields.push(Field::new("water temp", 28.5));
        second.genotypes.push("G2".to_string());
        store.write_tank(11, &second).expect("write second");

        let after = store.columns("tanks").expect("columns");
        assert!(!before.contains("field:water temp"));
        assert!(after.contains("field:water temp"));
        assert!(after.contains("genotype_id_2"));
        assert!(before.is_subset(&after));

        assert_eq!(store.read_tank(10).expect("read"), Some(first));
        assert_eq!(store.read_tank(11).expect("read"), Some(second));
    }

    #[test]
    fn merge_assigns_smallest_free_uid_and_concatenates() {
        let mut store = store_with_rack();
        let mut a = Tank::new(5, Location::new("", 1, "A", 1));
        a.genotypes.push("G1".to_string());
        a.dobs.push(date(2024, 1, 1));
        a.fields.push(Field::new("x", 1.0));
        let mut b = Tank::new(6, Location::new("", 1, "A", 2));
        b.genotypes.push("G2".to_string());
        b.dobs.push(date(2024, 2, 1));
        b.fields.push(Field::new("y", 2.0));
        store.write_tank(5, &a).expect("write a");
        store.write_tank(6, &b).expect("write b");

        let merged = store.merge_tanks(&[5, 6]).expect("merge");
        assert_eq!(merged.uid, 1);
        assert_eq!(merged.loc, a.loc);
        assert_eq!(merged.genotypes, vec!["G1".to_string(), "G2".to_string()]);
        assert_eq!(merged.dobs, vec![date(2024, 1, 1), date(2024, 2, 1)]);
        assert_eq!(
            merged.fields,
            vec![Field::new("x", 1.0), Field::new("y", 2.0)]
        );
        assert_eq!(store.read_tank(1).expect("read"), Some(merged));
        assert!(store.read_tank(5).expect("read").is_none());
        assert!(store.read_tank(6).expect("read").is_none());
        assert_eq!(
            store.read_genotype("G2").expect("read").expect("G2").tanks,
            vec![1]
        );

        assert!(matches!(
            store.write_tank(5, &a),
            Err(StorageError::Store(StoreError::RetiredTank(5)))
        ));
        assert!(matches!(
            store.merge_tanks(&[1, 6]),
            Err(StorageError::Store(StoreError::RetiredTank(6)))
        ));
        assert!(store.read_tank(1).expect("read").is_some());
    }

    #[test]
    fn merge_skips_retired_uids() {
        let mut store = store_with_rack();
        store
            .write_tank(1, &sample_tank(1, "A", 1))
            .expect("write 1");
        store
            .write_tank(3, &sample_tank(3, "A", 3))
            .expect("write 3");
        store
            .write_tank(4, &sample_tank(4, "A", 4))
            .expect("write 4");
        store.cull_tank(1).expect("cull 1");

        let merged = store.merge_tanks(&[3, 4]).expect("merge");
        assert_eq!(merged.uid, 2);
    }

    #[test]
    fn cull_archives_tank_with_timestamp() {
        let mut store = store_with_rack();
        let tank = sample_tank(10, "B", 12);
        store.write_tank(10, &tank).expect("write tank");

        let before = Utc::now();
        store.cull_tank(10).expect("cull");
        let after = Utc::now();

        assert!(store.read_tank(10).expect("read").is_none());
        assert!(store
            .read_genotype("G1")
            .expect("read")
            .expect("G1")
            .tanks
            .is_empty());

        let graveyard = store.get_graveyard().expect("graveyard");
        assert_eq!(graveyard.len(), 1);
        assert_eq!(graveyard[0].tank, tank);
        assert!(graveyard[0].culled_at >= before && graveyard[0].culled_at <= after);
        assert!(store
            .columns("graveyard")
            .expect("columns")
            .contains("field:notes"));

        assert!(matches!(
            store.cull_tank(10),
            Err(StorageError::Store(StoreError::TankNotFound(10)))
        ));
        assert!(matches!(
            store.write_tank(10, &tank),
            Err(StorageError::Store(StoreError::RetiredTank(10)))
        ));
    }

    #[test]
    fn racks_are_rebuilt_from_flat_tables() {
        let mut store = store_with_rack();
        store
            .write_rack(&Rack::new(
                2,
                "",
                RackSize {
                    width: 3,
                    height: 2,
                },
            ))
            .expect("write rack 2");
        store
            .write_tank(10, &sample_tank(10, "B", 2))
            .expect("write tank");
        let mut other = sample_tank(11, "B", 3);
        other.loc.rack = 2;
        store.write_tank(11, &other).expect("write tank");

        let racks = store.get_racks().expect("racks");
        assert_eq!(racks.len(), 2);
        assert_eq!(racks[0].tanks.len(), 24);
        assert_eq!(racks[0].tanks[13].as_ref().map(|t| t.uid), Some(10));
        assert_eq!(racks[1].tanks.len(), 6);
        assert_eq!(racks[1].tanks[5].as_ref().map(|t| t.uid), Some(11));
        assert_eq!(racks.iter().flat_map(|rack| rack.occupied()).count(), 2);
    }

    #[test]
    fn shrinking_a_rack_under_a_tank_is_rejected() {
        let mut store = store_with_rack();
        store
            .write_tank(10, &sample_tank(10, "B", 6))
            .expect("write tank");

        let narrow = Rack::new(
            1,
            "fish room",
            RackSize {
                width: 5,
                height: 2,
            },
        );
        assert!(matches!(
            store.write_rack(&narrow),
            Err(StorageError::Store(StoreError::RackResize { tank_uid: 10, .. }))
        ));

        let wide = Rack::new(
            1,
            "fish room",
            RackSize {
                width: 6,
                height: 3,
            },
        );
        store.write_rack(&wide).expect("grow rack");
        let racks = store.get_racks().expect("racks");
        assert_eq!(racks[0].tanks[11].as_ref().map(|t| t.uid), Some(10));
    }

    #[test]
    fn children_follow_lineage_fields() {
        let mut store = store_with_rack();
        assert!(store.get_children("G1").expect("children").is_empty());

        let mut child = Genotype::new("G3");
        child.fields.push(Field::new("mother_id", "G1"));
        child.fields.push(Field::new("father_id", "G2"));
        store.write_genotype(&child).expect("write G3");
        let mut grandchild = Genotype::new("G4");
        grandchild.fields.push(Field::new("father_id", "G3"));
        store.write_genotype(&grandchild).expect("write G4");
        let mut numeric = Genotype::new("G5");
        numeric.fields.push(Field::new("mother_id", 42.0));
        store.write_genotype(&numeric).expect("write G5");

        let ids = |parent: &str| -> Vec<String> {
            store
                .get_children(parent)
                .expect("children")
                .into_iter()
                .map(|genotype| genotype.uid)
                .collect()
        };
        assert_eq!(ids("G1"), vec!["G3".to_string()]);
        assert_eq!(ids("G2"), vec!["G3".to_string()]);
        assert_eq!(ids("G3"), vec!["G4".to_string()]);
        assert_eq!(ids("42"), vec!["G5".to_string()]);
        assert!(ids("G4").is_empty());
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let file = NamedTempFile::new().expect("temp db");
        let tank = sample_tank(10, "A", 1);
        {
            let mut store = SqliteStore::open(file.path()).expect("open db");
            store
                .write_rack(&Rack::new(1, "fish room", RackSize::default()))
                .expect("write rack");
            store
                .write_genotype(&Genotype::new("G1"))
                .expect("write genotype");
            store.write_tank(10, &tank).expect("write tank");
        }
        let store = SqliteStore::open(file.path()).expect("reopen db");
        assert_eq!(store.read_tank(10).expect("read"), Some(tank));
        assert_eq!(store.get_genotypes().expect("genotypes").len(), 1);
    }
}
