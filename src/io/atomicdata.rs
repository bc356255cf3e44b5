//! Reading of the atomic dataset files.

use super::model::TokenReader;
use crate::atomic::{
    AtomicModel, Element, Ion, Level, LineEntry, LineList, PhixsTarget, PhotoionTable,
};
use crate::constants::{fcn, EV_TO_ERG, HPLANCK, M_H};
use crate::nonthermal::{CollIonRow, MAX_Z_BINDING, N_SHELLS};
use log::warn;
use std::io;
use std::path::Path;

/// Megabarns to cm^2, the unit of the tabulated cross sections.
const MEGABARN_TO_CM2: fcn = 1e-18;

/// Default cross-section grid of the version-1 photoionisation file.
const PHIXS_V1_NPTS: usize = 100;
const PHIXS_V1_NU_INCREMENT: fcn = 0.1;

/// Reads `compositiondata.txt`, `adata.txt` and `transitiondata.txt` into
/// an atomic model with a sorted line list and rebuilt transition arenas.
pub fn read_atomic_model(dir: &Path) -> io::Result<AtomicModel> {
    let composition = read_composition(&dir.join("compositiondata.txt"))?;
    let mut atomic = read_levels(&dir.join("adata.txt"), composition)?;
    let lines = read_transitions(&dir.join("transitiondata.txt"), &atomic)?;
    atomic.lines = LineList::from_unsorted(lines);
    atomic.rebuild_transition_arenas();
    Ok(atomic)
}

struct CompositionEntry {
    z: u32,
    nions: usize,
    lowermost_ionstage: u32,
    mass: fcn,
    nlevels_max: usize,
}

/// `compositiondata.txt`: the element count, a preset-temperature flag and
/// a homogeneous-abundance flag (both kept for file compatibility), then
/// one row per element:
/// `Z nions lowermost_ionstage uppermost_ionstage nlevelsmax abundance mass_amu`.
fn read_composition(path: &Path) -> io::Result<Vec<CompositionEntry>> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let nelements: usize = tokens.next_value("number of elements")?;
    let _t_preset: i64 = tokens.next_value("preset temperature flag")?;
    let _homogeneous: i64 = tokens.next_value("homogeneous abundances flag")?;

    let mut entries = Vec::with_capacity(nelements);
    for _ in 0..nelements {
        let z: u32 = tokens.next_value("atomic number")?;
        let nions: usize = tokens.next_value("number of ions")?;
        let lowermost_ionstage: u32 = tokens.next_value("lowermost ion stage")?;
        let uppermost_ionstage: u32 = tokens.next_value("uppermost ion stage")?;
        let nlevels_max: usize = tokens.next_value("max levels")?;
        let _abundance: fcn = tokens.next_value("abundance")?;
        let mass_amu: fcn = tokens.next_value("mass [amu]")?;
        if uppermost_ionstage != lowermost_ionstage + nions as u32 - 1 {
            return Err(invalid(format!(
                "element Z={} ion stage range {}..{} inconsistent with {} ions",
                z, lowermost_ionstage, uppermost_ionstage, nions
            )));
        }
        entries.push(CompositionEntry {
            z,
            nions,
            lowermost_ionstage,
            mass: mass_amu * M_H,
            nlevels_max,
        });
    }
    Ok(entries)
}

/// `adata.txt`: per ion, a header `Z ionstage nlevels ionpot_ev` followed
/// by `nlevels` rows of `levelindex energy_ev stat_weight ntransitions`.
fn read_levels(path: &Path, composition: Vec<CompositionEntry>) -> io::Result<AtomicModel> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let mut atomic = AtomicModel::default();
    for entry in &composition {
        atomic.elements.push(Element {
            atomic_number: entry.z,
            mass: entry.mass,
            ions: Vec::with_capacity(entry.nions),
        });
    }

    // read ion blocks until the file runs out, keeping the ones inside
    // each element's configured ion stage range
    loop {
        let z_in: u32 = match tokens.next_value::<u32>("adata Z") {
            Ok(value) => value,
            Err(_) => break, // end of file
        };
        let ion_stage: u32 = tokens.next_value("adata ion stage")?;
        let nlevels_in: usize = tokens.next_value("adata level count")?;
        let ionpot_ev: fcn = tokens.next_value("adata ionisation potential")?;

        let target = composition
            .iter()
            .position(|entry| entry.z == z_in)
            .filter(|&elementindex| {
                let entry = &composition[elementindex];
                ion_stage >= entry.lowermost_ionstage
                    && ion_stage < entry.lowermost_ionstage + entry.nions as u32
            });
        let nlevels_keep = target
            .map(|elementindex| nlevels_in.min(composition[elementindex].nlevels_max))
            .unwrap_or(0);

        let mut levels = Vec::with_capacity(nlevels_keep);
        for levelindex in 0..nlevels_in {
            let index_in: usize = tokens.next_value("level index")?;
            let energy_ev: fcn = tokens.next_value("level energy")?;
            let stat_weight: fcn = tokens.next_value("statistical weight")?;
            let _ntransitions: usize = tokens.next_value("transition count")?;
            if index_in != levelindex {
                return Err(invalid(format!(
                    "level indices out of order for Z={} ion stage {}",
                    z_in, ion_stage
                )));
            }
            if levelindex < nlevels_keep {
                levels.push(Level {
                    energy: energy_ev * EV_TO_ERG,
                    stat_weight,
                    downtrans: 0..0,
                    uptrans: 0..0,
                });
            }
        }

        if let Some(elementindex) = target {
            atomic.elements[elementindex].ions.push(Ion {
                ion_stage,
                ionpot: ionpot_ev * EV_TO_ERG,
                levels,
            });
        }
    }

    for (entry, element) in composition.iter().zip(&atomic.elements) {
        if element.ions.len() != entry.nions {
            return Err(invalid(format!(
                "adata provided {} of {} configured ions for Z={}",
                element.ions.len(),
                entry.nions,
                entry.z
            )));
        }
    }
    Ok(atomic)
}

/// `transitiondata.txt`: per ion, a header `Z ionstage ntransitions`
/// followed by rows of `lower upper A coll_str forbidden`.
fn read_transitions(path: &Path, atomic: &AtomicModel) -> io::Result<Vec<LineEntry>> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let mut lines = Vec::new();
    loop {
        let z_in: u32 = match tokens.next_value::<u32>("transition Z") {
            Ok(value) => value,
            Err(_) => break, // end of file
        };
        let ion_stage: u32 = tokens.next_value("transition ion stage")?;
        let ntransitions: usize = tokens.next_value("transition count")?;

        let target = atomic.elements.iter().enumerate().find_map(|(ei, el)| {
            (el.atomic_number == z_in).then(|| {
                el.ions
                    .iter()
                    .position(|ion| ion.ion_stage == ion_stage)
                    .map(|ii| (ei, ii))
            })
        });

        for _ in 0..ntransitions {
            let lower: usize = tokens.next_value("lower level")?;
            let upper: usize = tokens.next_value("upper level")?;
            let einstein_a: fcn = tokens.next_value("Einstein A")?;
            let coll_str: fcn = tokens.next_value("collision strength")?;
            let forbidden: i64 = tokens.next_value("forbidden flag")?;

            let Some(Some((elementindex, ionindex))) = target else {
                continue;
            };
            let ion = &atomic.elements[elementindex].ions[ionindex];
            if upper >= ion.nlevels() || lower >= upper {
                // transitions into levels cut by the level cap are dropped
                continue;
            }
            let nu =
                (ion.levels[upper].energy - ion.levels[lower].energy) / HPLANCK;
            if nu <= 0.0 {
                warn!(
                    "dropping transition with non-positive frequency: Z={} ion stage {} {}->{}",
                    z_in, ion_stage, lower, upper
                );
                continue;
            }
            let g_upper = ion.levels[upper].stat_weight;
            let g_lower = ion.levels[lower].stat_weight;
            // absorption oscillator strength from the Einstein A
            let osc_strength = einstein_a * g_upper / g_lower
                * crate::constants::M_ELECTRON
                * crate::constants::CLIGHT
                * crate::constants::CLIGHT
                * crate::constants::CLIGHT
                / (8.0
                    * crate::constants::PI
                    * crate::constants::PI
                    * crate::constants::Q_ELECTRON
                    * crate::constants::Q_ELECTRON
                    * nu
                    * nu);
            lines.push(LineEntry {
                nu,
                element: elementindex,
                ion: ionindex,
                lower,
                upper,
                einstein_a,
                osc_strength,
                coll_str: (coll_str >= 0.0).then_some(coll_str),
                forbidden: forbidden != 0,
            });
        }
    }
    Ok(lines)
}

/// Reads the photoionisation tables, preferring `phixsdata_v2.txt`; the
/// two file versions are mutually exclusive, so finding both is reported
/// and v2 wins.
pub fn read_phixs_data(dir: &Path, atomic: &mut AtomicModel) -> io::Result<()> {
    let v1_path = dir.join("phixsdata.txt");
    let v2_path = dir.join("phixsdata_v2.txt");
    let (path, is_v2) = match (v1_path.exists(), v2_path.exists()) {
        (true, true) => {
            warn!("both phixsdata.txt and phixsdata_v2.txt present; using v2");
            (v2_path, true)
        }
        (_, true) => (v2_path, true),
        (true, _) => (v1_path, false),
        (false, false) => {
            // continuum-free runs are allowed
            atomic.phixs_nu_increment = PHIXS_V1_NU_INCREMENT;
            return Ok(());
        }
    };

    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let (npts, nu_increment) = if is_v2 {
        let npts: usize = tokens.next_value("NPHIXSPOINTS")?;
        let increment: fcn = tokens.next_value("NPHIXSNUINCREMENT")?;
        (npts, increment)
    } else {
        (PHIXS_V1_NPTS, PHIXS_V1_NU_INCREMENT)
    };
    atomic.phixs_nu_increment = nu_increment;

    loop {
        let z_in: u32 = match tokens.next_value::<u32>("phixs Z") {
            Ok(value) => value,
            Err(_) => break,
        };
        let upper_ionstage: u32 = tokens.next_value("phixs upper ion stage")?;
        let upper_level_in: i64 = tokens.next_value("phixs upper level")?;
        let lower_ionstage: u32 = tokens.next_value("phixs lower ion stage")?;
        let lower_level: usize = tokens.next_value("phixs lower level")?;

        // multi-target records list the target levels and probabilities
        let targets = if upper_level_in < 0 {
            let ntargets: usize = tokens.next_value("phixs target count")?;
            let mut targets = Vec::with_capacity(ntargets);
            for _ in 0..ntargets {
                let upper_level: usize = tokens.next_value("phixs target level")?;
                let probability: fcn = tokens.next_value("phixs target probability")?;
                targets.push(PhixsTarget {
                    upper_level,
                    probability,
                });
            }
            targets
        } else {
            vec![PhixsTarget {
                upper_level: upper_level_in as usize,
                probability: 1.0,
            }]
        };

        let mut sigma = Vec::with_capacity(npts);
        for _ in 0..npts {
            let value: fcn = tokens.next_value("phixs cross section")?;
            sigma.push(value * MEGABARN_TO_CM2);
        }

        let target_indices = atomic.elements.iter().enumerate().find_map(|(ei, el)| {
            (el.atomic_number == z_in).then(|| {
                let lower = el
                    .ions
                    .iter()
                    .position(|ion| ion.ion_stage == lower_ionstage);
                let upper = el
                    .ions
                    .iter()
                    .position(|ion| ion.ion_stage == upper_ionstage);
                lower.zip(upper).map(|(li, _)| (ei, li))
            })
        });
        let Some(Some((elementindex, ionindex))) = target_indices else {
            continue;
        };
        if lower_level >= atomic.elements[elementindex].ions[ionindex].nlevels() {
            continue;
        }
        let probability_sum: fcn = targets.iter().map(|target| target.probability).sum();
        if (probability_sum - 1.0).abs() > 1e-2 {
            warn!(
                "phixs target probabilities for Z={} ion stage {} level {} sum to {:.4}",
                z_in, lower_ionstage, lower_level, probability_sum
            );
        }

        let ion = &atomic.elements[elementindex].ions[ionindex];
        let nu_edge = (ion.ionpot
            - atomic.epsilon(elementindex, ionindex, lower_level))
            / HPLANCK;
        if nu_edge <= 0.0 {
            continue;
        }
        atomic.phixs_tables.push(PhotoionTable {
            element: elementindex,
            ion: ionindex,
            level: lower_level,
            nu_edge,
            targets,
            sigma,
        });
    }

    atomic.rebuild_bf_continua();
    Ok(())
}

/// Reads `collion-auger.txt` (preferred) or `collion.txt`: a row count and
/// then the Younger-fit shell rows, with Auger probabilities in the auger
/// variant.
pub fn read_collion_data(dir: &Path) -> io::Result<Vec<CollIonRow>> {
    let auger_path = dir.join("collion-auger.txt");
    let (path, has_auger) = if auger_path.exists() {
        (auger_path, true)
    } else {
        (dir.join("collion.txt"), false)
    };
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let count: usize = tokens.next_value("collion row count")?;
    let mut rows = Vec::with_capacity(count);
    for _ in 0..count {
        let z: u32 = tokens.next_value("collion Z")?;
        let nelec: u32 = tokens.next_value("collion electron count")?;
        let n: u32 = tokens.next_value("collion n")?;
        let l: u32 = tokens.next_value("collion l")?;
        let ionpot_ev: fcn = tokens.next_value("collion ionisation potential")?;
        let a: fcn = tokens.next_value("collion A")?;
        let b: fcn = tokens.next_value("collion B")?;
        let c: fcn = tokens.next_value("collion C")?;
        let d: fcn = tokens.next_value("collion D")?;
        let (prob_double, prob_triple) = if has_auger {
            (
                tokens.next_value("collion double-ionise probability")?,
                tokens.next_value("collion triple-ionise probability")?,
            )
        } else {
            (0.0, 0.0)
        };
        rows.push(CollIonRow {
            z,
            nelec,
            n,
            l,
            ionpot_ev,
            a,
            b,
            c,
            d,
            prob_doubleionize: prob_double,
            prob_tripleionize: prob_triple,
        });
    }
    Ok(rows)
}

/// Reads `binding_energies.txt`: the table dimensions followed by one row
/// of shell binding energies [eV] per element.
pub fn read_binding_energies(path: &Path) -> io::Result<Vec<[fcn; N_SHELLS]>> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let n_shells: usize = tokens.next_value("binding energy shell count")?;
    let n_elements: usize = tokens.next_value("binding energy element count")?;
    if n_shells != N_SHELLS || n_elements != MAX_Z_BINDING {
        return Err(invalid(format!(
            "wrong binding energy table size {} x {}, expected {} x {}",
            n_shells, n_elements, N_SHELLS, MAX_Z_BINDING
        )));
    }

    let mut table = Vec::with_capacity(n_elements);
    for _ in 0..n_elements {
        let mut row = [0.0; N_SHELLS];
        for value in row.iter_mut() {
            let energy_ev: fcn = tokens.next_value("binding energy")?;
            *value = energy_ev * EV_TO_ERG;
        }
        table.push(row);
    }
    Ok(table)
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal_dataset(dir: &Path) {
        let mut composition = std::fs::File::create(dir.join("compositiondata.txt")).unwrap();
        writeln!(composition, "1").unwrap();
        writeln!(composition, "0").unwrap();
        writeln!(composition, "0").unwrap();
        writeln!(composition, "8 2 1 2 10 1.0 15.9994").unwrap();

        let mut adata = std::fs::File::create(dir.join("adata.txt")).unwrap();
        writeln!(adata, "8 1 3 13.618").unwrap();
        writeln!(adata, "0 0.0 5.0 2").unwrap();
        writeln!(adata, "1 2.5 3.0 1").unwrap();
        writeln!(adata, "2 4.2 1.0 0").unwrap();
        writeln!(adata, "8 2 1 35.121").unwrap();
        writeln!(adata, "0 0.0 4.0 0").unwrap();

        let mut transitions = std::fs::File::create(dir.join("transitiondata.txt")).unwrap();
        writeln!(transitions, "8 1 3").unwrap();
        writeln!(transitions, "0 1 1.0e8 -1.0 0").unwrap();
        writeln!(transitions, "0 2 5.0e7 1.2 0").unwrap();
        writeln!(transitions, "1 2 2.0e7 -1.0 1").unwrap();
        writeln!(transitions, "8 2 0").unwrap();
    }

    #[test]
    fn minimal_dataset_produces_sorted_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_dataset(dir.path());
        let atomic = read_atomic_model(dir.path()).unwrap();

        assert_eq!(atomic.nelements(), 1);
        assert_eq!(atomic.elements[0].nions(), 2);
        assert_eq!(atomic.elements[0].ions[0].nlevels(), 3);
        assert_eq!(atomic.lines.len(), 3);
        for i in 1..atomic.lines.len() {
            assert!(atomic.lines.entry(i - 1).nu >= atomic.lines.entry(i).nu);
        }
        // highest frequency line is 0 -> 2 at 4.2 eV
        let bluest = atomic.lines.entry(0);
        assert_eq!((bluest.lower, bluest.upper), (0, 2));
        assert_eq!(bluest.coll_str, Some(1.2));
        // the forbidden 1 -> 2 line kept its flag
        let reddest = atomic.lines.entry(2);
        assert!(reddest.forbidden);
        // transition arenas point back at the lines
        let ground = atomic.level(0, 0, 0);
        assert_eq!(ground.uptrans.len(), 2);
        assert_eq!(ground.downtrans.len(), 0);
    }

    #[test]
    fn phixs_v2_reader_builds_continua() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_dataset(dir.path());
        let mut atomic = read_atomic_model(dir.path()).unwrap();

        let mut phixs = std::fs::File::create(dir.path().join("phixsdata_v2.txt")).unwrap();
        writeln!(phixs, "5").unwrap();
        writeln!(phixs, "0.2").unwrap();
        // ground level of O I with two targets into O II
        writeln!(phixs, "8 2 -1 1 0").unwrap();
        writeln!(phixs, "2").unwrap();
        writeln!(phixs, "0 0.9").unwrap();
        writeln!(phixs, "0 0.1").unwrap();
        for sigma in [2.0, 1.5, 1.1, 0.8, 0.6] {
            writeln!(phixs, "{}", sigma).unwrap();
        }

        read_phixs_data(dir.path(), &mut atomic).unwrap();
        assert_eq!(atomic.phixs_tables.len(), 1);
        assert_eq!(atomic.bf_continua.len(), 2);
        assert!((atomic.phixs_nu_increment - 0.2).abs() < 1e-12);
        let table = &atomic.phixs_tables[0];
        assert!((table.sigma[0] - 2.0e-18).abs() < 1e-30);
        // threshold at the full ionisation potential for the ground level
        let expected_edge = 13.618 * EV_TO_ERG / HPLANCK;
        assert!((table.nu_edge - expected_edge).abs() / expected_edge < 1e-12);
    }

    #[test]
    fn collion_reader_handles_plain_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("collion.txt")).unwrap();
        writeln!(file, "1").unwrap();
        writeln!(file, "8 8 2 1 13.6 2.0 -0.9 0.6 -0.4").unwrap();
        let rows = read_collion_data(dir.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].z, 8);
        assert_eq!(rows[0].prob_doubleionize, 0.0);
    }
}
