use crate::{ImportReport, ParsedWorkbook, SkipReason, SkippedRow};
use zfm_core::{StoreError, TankStore};

/// Writes racks, then genotypes, then tanks into `store` through its normal
/// write operations, so tank writes can link into existing genotypes.
///
/// A tank naming a genotype that neither the workbook nor the store knows is
/// skipped, or fails the import with [`StoreError::UnknownGenotype`] when
/// `strict` is set.
pub fn load_into<S: TankStore>(
    store: &mut S,
    parsed: &ParsedWorkbook,
    strict: bool,
) -> Result<ImportReport, S::Error> {
    let mut report = ImportReport {
        skipped: parsed.report.skipped.clone(),
        ..ImportReport::default()
    };

    for rack in &parsed.racks {
        store.write_rack(rack)?;
        report.racks += 1;
    }

    for genotype in parsed.genotypes.values() {
        store.write_genotype(genotype)?;
        report.genotypes += 1;
    }

    for rack in &parsed.racks {
        for tank in rack.occupied() {
            if let Some(missing) = first_unknown_genotype(store, parsed, &tank.genotypes)? {
                if strict {
                    return Err(StoreError::UnknownGenotype {
                        tank_uid: tank.uid,
                        genotype: missing,
                    }
                    .into());
                }
                let reason = SkipReason::UnknownGenotype(missing);
                tracing::warn!(tank = tank.uid, %reason, "skipping tank during load");
                let origin = parsed.origins.get(&tank.uid).cloned().unwrap_or_default();
                report.skipped.push(SkippedRow {
                    sheet: origin.sheet,
                    row: origin.row,
                    reason: reason.to_string(),
                });
                continue;
            }
            store.write_tank(tank.uid, tank)?;
            report.tanks += 1;
        }
    }

    tracing::info!(
        racks = report.racks,
        genotypes = report.genotypes,
        tanks = report.tanks,
        skipped = report.skipped.len(),
        "loaded workbook into store"
    );
    Ok(report)
}

fn first_unknown_genotype<S: TankStore>(
    store: &S,
    parsed: &ParsedWorkbook,
    genotypes: &[String],
) -> Result<Option<String>, S::Error> {
    for genotype in genotypes {
        if parsed.genotypes.contains_key(genotype) {
            continue;
        }
        if store.read_genotype(genotype)?.is_none() {
            return Ok(Some(genotype.clone()));
        }
    }
    Ok(None)
}
