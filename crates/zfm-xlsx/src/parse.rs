use crate::workbook::{excel_serial_to_datetime, Sheet, Workbook};
use crate::{ImportError, ImportOptions, ImportReport, SheetLayout, SkipLog, SkipReason};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use zfm_core::{row_ordinal, CellValue, Field, Genotype, Location, Rack, RackSize, Tank};

/// In-memory result of reading a workbook: dense racks plus uid maps.
#[derive(Debug, Clone, Default)]
pub struct ParsedWorkbook {
    pub racks: Vec<Rack>,
    pub tanks: BTreeMap<u32, Tank>,
    pub genotypes: BTreeMap<String, Genotype>,
    /// Where each accepted tank was read from, keyed by uid.
    pub origins: BTreeMap<u32, RowOrigin>,
    pub report: ImportReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowOrigin {
    pub sheet: String,
    /// 1-based.
    pub row: usize,
}

struct RowTank {
    sheet_row: usize,
    tank: Tank,
    row_ordinal: u32,
}

/// Parses genotypes, then racks and their tanks.
///
/// Tanks are linked into the reverse index of genotypes found in the same
/// workbook; references to other genotypes are kept and left to the loader.
pub fn parse_workbook(
    workbook: &Workbook,
    options: &ImportOptions,
) -> Result<ParsedWorkbook, ImportError> {
    let layout = &options.layout;
    let mut skips = SkipLog::new(options.strict);

    let mut genotypes = BTreeMap::new();
    match layout
        .genotype_sheets
        .iter()
        .find_map(|name| workbook.sheet(name))
    {
        Some(sheet) => parse_genotype_sheet(sheet, layout, &mut genotypes, &mut skips)?,
        None => tracing::warn!(
            expected = ?layout.genotype_sheets,
            "workbook has no genotype sheet"
        ),
    }

    let mut rack_sheets = BTreeMap::new();
    for sheet in &workbook.sheets {
        let Some(suffix) = sheet.name.strip_prefix(&layout.rack_sheet_prefix) else {
            continue;
        };
        match suffix.trim().parse::<u32>() {
            Ok(rack_num) if rack_num > 0 => {
                if rack_sheets.insert(rack_num, sheet).is_some() {
                    tracing::warn!(sheet = %sheet.name, rack_num, "duplicate rack sheet ignored");
                }
            }
            _ => tracing::warn!(sheet = %sheet.name, "rack sheet name has no rack number"),
        }
    }

    let mut racks = Vec::new();
    let mut tanks: BTreeMap<u32, Tank> = BTreeMap::new();
    let mut origins = BTreeMap::new();
    for (rack_num, sheet) in rack_sheets {
        let rows = parse_rack_rows(sheet, rack_num, layout, &mut skips)?;
        let size = infer_rack_size(&rows, options.default_rack_size);
        let room = rows
            .iter()
            .map(|row| row.tank.loc.room.clone())
            .find(|room| !room.is_empty())
            .unwrap_or_default();

        let mut rack = Rack::new(rack_num, room, size);
        rack.tanks = vec![None; size.slots()];
        for RowTank {
            sheet_row, tank, ..
        } in rows
        {
            if tanks.contains_key(&tank.uid) {
                skips.skip(&sheet.name, sheet_row, SkipReason::DuplicateUid(tank.uid))?;
                continue;
            }
            let index = match size.locate(&tank.loc) {
                Ok(index) => index,
                Err(err) => {
                    skips.skip(&sheet.name, sheet_row, SkipReason::InvalidLocation(err))?;
                    continue;
                }
            };
            if let Some(occupant) = rack.tanks[index].as_ref() {
                skips.skip(
                    &sheet.name,
                    sheet_row,
                    SkipReason::SlotTaken {
                        occupant: occupant.uid,
                    },
                )?;
                continue;
            }

            for genotype_id in &tank.genotypes {
                match genotypes.get_mut(genotype_id) {
                    Some(genotype) => {
                        genotype.link_tank(tank.uid);
                    }
                    None => tracing::warn!(
                        sheet = %sheet.name,
                        row = sheet_row,
                        genotype = %genotype_id,
                        "tank references a genotype missing from the workbook"
                    ),
                }
            }
            origins.insert(
                tank.uid,
                RowOrigin {
                    sheet: sheet.name.clone(),
                    row: sheet_row,
                },
            );
            tanks.insert(tank.uid, tank.clone());
            rack.tanks[index] = Some(tank);
        }
        racks.push(rack);
    }

    let report = ImportReport {
        racks: racks.len(),
        genotypes: genotypes.len(),
        tanks: tanks.len(),
        skipped: skips.skipped,
    };
    tracing::info!(
        racks = report.racks,
        genotypes = report.genotypes,
        tanks = report.tanks,
        skipped = report.skipped.len(),
        "parsed workbook"
    );

    Ok(ParsedWorkbook {
        racks,
        tanks,
        genotypes,
        origins,
        report,
    })
}

fn header_labels(sheet: &Sheet) -> Vec<Option<String>> {
    (0..sheet.width())
        .map(|col| sheet.cell(0, col).map(|label| label.to_string().trim().to_string()))
        .collect()
}

fn parse_genotype_sheet(
    sheet: &Sheet,
    layout: &SheetLayout,
    genotypes: &mut BTreeMap<String, Genotype>,
    skips: &mut SkipLog,
) -> Result<(), ImportError> {
    let labels = header_labels(sheet);

    for row in 1..sheet.rows.len() {
        if sheet.is_blank_row(row) {
            continue;
        }

        let mut uid = None;
        let mut fields = Vec::new();
        for (col, label) in labels.iter().enumerate() {
            let data = sheet.cell(row, col);
            match (label.as_deref(), data) {
                (Some(label), Some(data)) if label == layout.genotype_id_label => {
                    uid.get_or_insert_with(|| data.to_string().trim().to_string());
                }
                (Some(label), _) if label == layout.genotype_id_label => {}
                (None, None) => {}
                (label, data) => fields.push(Field {
                    label: CellValue::text(label.unwrap_or_default()),
                    data: data.cloned().unwrap_or_else(|| CellValue::text("")),
                }),
            }
        }

        let Some(uid) = uid.filter(|uid| !uid.is_empty()) else {
            skips.skip(&sheet.name, row + 1, SkipReason::MissingGenotypeId)?;
            continue;
        };
        if genotypes.contains_key(&uid) {
            skips.skip(&sheet.name, row + 1, SkipReason::DuplicateGenotype(uid))?;
            continue;
        }
        genotypes.insert(
            uid.clone(),
            Genotype {
                uid,
                fields,
                tanks: Vec::new(),
            },
        );
    }
    Ok(())
}

fn parse_rack_rows(
    sheet: &Sheet,
    rack_num: u32,
    layout: &SheetLayout,
    skips: &mut SkipLog,
) -> Result<Vec<RowTank>, ImportError> {
    let labels = header_labels(sheet);
    let mut parsed = Vec::new();

    for row in 1..sheet.rows.len() {
        if sheet.is_blank_row(row) {
            continue;
        }

        let mut row_letters: Option<String> = None;
        let mut col: Option<CellValue> = None;
        let mut uid: Option<CellValue> = None;
        let mut tank = Tank::new(0, Location::new("", rack_num, "", 0));

        for (index, label) in labels.iter().enumerate() {
            let data = sheet.cell(row, index);
            let Some(label) = label.as_deref() else {
                if let Some(data) = data {
                    tank.fields.push(Field::new("", data.clone()));
                }
                continue;
            };

            if label == layout.row_label {
                row_letters = data.map(|value| value.to_string().trim().to_string());
            } else if label == layout.column_label {
                col = data.cloned();
            } else if label == layout.uid_label {
                uid = data.cloned();
            } else if label.starts_with(&layout.genotype_label_prefix) {
                if let Some(data) = data {
                    tank.genotypes.push(data.to_string().trim().to_string());
                }
            } else if label == layout.room_label {
                if let Some(data) = data {
                    tank.loc.room = data.to_string().trim().to_string();
                }
            } else if starts_with_ignore_case(label, &layout.dob_label_prefix) {
                let Some(data) = data else {
                    continue;
                };
                match parse_dob(data) {
                    Some(dob) => tank.dobs.push(dob),
                    None => {
                        tracing::warn!(
                            sheet = %sheet.name,
                            row = row + 1,
                            value = %data,
                            "unparsable date of birth kept as a field"
                        );
                        tank.fields.push(Field::new(label, data.clone()));
                    }
                }
            } else {
                tank.fields.push(Field {
                    label: CellValue::text(label),
                    data: data.cloned().unwrap_or_else(|| CellValue::text("")),
                });
            }
        }

        let (Some(row_letters), Some(col)) = (row_letters, col) else {
            skips.skip(&sheet.name, row + 1, SkipReason::MissingLocation)?;
            continue;
        };
        let Some(col) = positive_integer(&col) else {
            skips.skip(
                &sheet.name,
                row + 1,
                SkipReason::InvalidColumn(col.to_string()),
            )?;
            continue;
        };
        let ordinal = match row_ordinal(&row_letters) {
            Ok(ordinal) => ordinal,
            Err(err) => {
                skips.skip(&sheet.name, row + 1, SkipReason::InvalidLocation(err))?;
                continue;
            }
        };
        let Some(uid) = uid else {
            skips.skip(&sheet.name, row + 1, SkipReason::MissingUid)?;
            continue;
        };
        let Some(uid) = positive_integer(&uid) else {
            skips.skip(&sheet.name, row + 1, SkipReason::InvalidUid(uid.to_string()))?;
            continue;
        };

        tank.uid = uid;
        tank.loc.row = row_letters.to_ascii_uppercase();
        tank.loc.col = col;
        parsed.push(RowTank {
            sheet_row: row + 1,
            tank,
            row_ordinal: ordinal,
        });
    }

    Ok(parsed)
}

fn infer_rack_size(rows: &[RowTank], minimum: RackSize) -> RackSize {
    let width = rows.iter().map(|row| row.tank.loc.col).max().unwrap_or(0);
    let height = rows.iter().map(|row| row.row_ordinal).max().unwrap_or(0);
    RackSize {
        width: width.max(minimum.width).max(1),
        height: height.max(minimum.height).max(1),
    }
}

fn positive_integer(value: &CellValue) -> Option<u32> {
    let number = value.as_number()?;
    if number < 1.0 || number.fract() != 0.0 || number > f64::from(u32::MAX) {
        return None;
    }
    Some(number as u32)
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Reads a date of birth from ISO, US or European text, or an Excel serial.
pub fn parse_dob(value: &CellValue) -> Option<NaiveDate> {
    match value {
        CellValue::Number(serial) => excel_serial_to_datetime(*serial).map(|dt| dt.date()),
        CellValue::Text(text) => {
            let text = text.trim();
            let date_part = text.split_whitespace().next().unwrap_or(text);
            ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y", "%d.%m.%Y"]
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
        }
    }
}
