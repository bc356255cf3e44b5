//! Reading of the ejecta model files (`model.txt`, `abundances.txt`).

use crate::atomic::AtomicModel;
use crate::cells::ModelCell;
use crate::constants::{fcn, DAY_TO_S, MIN_DENSITY};
use crate::decay::DecayData;
use crate::grid::PropagationGrid;
use std::io::{self, BufRead};
use std::path::Path;

/// Number of elemental columns in `abundances.txt` (Z = 1 to 30).
const N_ABUNDANCE_COLUMNS: usize = 30;

/// The parsed ejecta model: the propagation grid at the simulation
/// reference time plus one model cell per non-empty region.
pub struct EjectaModel {
    pub grid: PropagationGrid,
    pub cells: Vec<ModelCell>,
    /// Time the model densities are defined at [s].
    pub t_model: fcn,
}

/// Reads a one-dimensional (spherical shell) model.
///
/// Format: a comment-or-blank tolerant header with the shell count and the
/// model time in days, then one row per shell:
/// `index v_outer_kms log10rho X_Fegroup X_Ni56 X_Co56 X_Fe52 X_Cr48`.
pub fn read_model_1d(
    path: &Path,
    t_min: fcn,
    atomic: &AtomicModel,
    decay_data: &DecayData,
) -> io::Result<EjectaModel> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let n_shells: usize = tokens.next_value("number of shells")?;
    let t_model_days: fcn = tokens.next_value("model time [days]")?;
    let t_model = t_model_days * DAY_TO_S;

    let mut shell_edges = vec![0.0];
    let mut cells = Vec::with_capacity(n_shells);
    let mut cell_to_model = Vec::with_capacity(n_shells);

    for shell in 0..n_shells {
        let index: usize = tokens.next_value("shell index")?;
        if index != shell {
            return Err(invalid(format!(
                "model shells out of order: found {} expected {}",
                index, shell
            )));
        }
        let v_outer_kms: fcn = tokens.next_value("outer velocity [km/s]")?;
        let log10rho: fcn = tokens.next_value("log10 density")?;
        let rho_model = fcn::powf(10.0, log10rho);

        shell_edges.push(v_outer_kms * 1.0e5 * t_min);

        let mut cell = ModelCell::new(atomic.nelements(), decay_data.n_nuclides());
        // model densities are given at t_model; rescale to the reference
        // time of the homologous grid
        cell.rho_init = rho_model * (t_model / t_min).powi(3);
        read_radioactive_fractions(&mut tokens, decay_data, &mut cell)?;
        cell_to_model.push(if cell.rho_init >= MIN_DENSITY {
            Some(cells.len())
        } else {
            None
        });
        if cell.rho_init >= MIN_DENSITY {
            cells.push(cell);
        }
    }

    let grid = PropagationGrid::spherical(shell_edges, t_min, cell_to_model);
    Ok(EjectaModel {
        grid,
        cells,
        t_model,
    })
}

/// Reads a three-dimensional Cartesian model.
///
/// Format: cells-per-axis, the model time in days and the maximum velocity
/// in cm/s, then one row per propagation cell:
/// `index rho X_Fegroup X_Ni56 X_Co56 X_Fe52 X_Cr48`.
pub fn read_model_3d(
    path: &Path,
    t_min: fcn,
    atomic: &AtomicModel,
    decay_data: &DecayData,
) -> io::Result<EjectaModel> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let ncoord: usize = tokens.next_value("cells per axis")?;
    let t_model_days: fcn = tokens.next_value("model time [days]")?;
    let t_model = t_model_days * DAY_TO_S;
    let vmax: fcn = tokens.next_value("maximum velocity [cm/s]")?;
    let xmax = vmax * t_min;

    let n_cells = ncoord * ncoord * ncoord;
    let mut cells = Vec::new();
    let mut cell_to_model = Vec::with_capacity(n_cells);

    for cellindex in 0..n_cells {
        let index: usize = tokens.next_value("cell index")?;
        if index != cellindex {
            return Err(invalid(format!(
                "model cells out of order: found {} expected {}",
                index, cellindex
            )));
        }
        let rho_model: fcn = tokens.next_value("density")?;

        let mut cell = ModelCell::new(atomic.nelements(), decay_data.n_nuclides());
        cell.rho_init = rho_model * (t_model / t_min).powi(3);
        read_radioactive_fractions(&mut tokens, decay_data, &mut cell)?;

        cell_to_model.push(if cell.rho_init >= MIN_DENSITY {
            Some(cells.len())
        } else {
            None
        });
        if cell.rho_init >= MIN_DENSITY {
            cells.push(cell);
        }
    }

    let grid = PropagationGrid::cartesian([ncoord; 3], xmax, t_min, cell_to_model);
    Ok(EjectaModel {
        grid,
        cells,
        t_model,
    })
}

fn read_radioactive_fractions<R: BufRead>(
    tokens: &mut TokenReader<R>,
    decay_data: &DecayData,
    cell: &mut ModelCell,
) -> io::Result<()> {
    let fegroup: fcn = tokens.next_value("Fe-group fraction")?;
    let f_ni56: fcn = tokens.next_value("Ni56 fraction")?;
    let f_co56: fcn = tokens.next_value("Co56 fraction")?;
    let f_fe52: fcn = tokens.next_value("Fe52 fraction")?;
    let f_cr48: fcn = tokens.next_value("Cr48 fraction")?;
    cell.fegroup_fraction = fegroup;
    for (z, a, fraction) in [
        (28, 56, f_ni56),
        (27, 56, f_co56),
        (26, 52, f_fe52),
        (24, 48, f_cr48),
    ] {
        if fraction > 0.0 {
            match decay_data.nuclide_index(z, a) {
                Some(nucindex) => cell.nuc_mass_fractions[nucindex] = fraction,
                None => {
                    return Err(invalid(format!(
                        "model contains Z={} A={} but the nuclide library does not",
                        z, a
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Reads `abundances.txt`: per model row, the cell index followed by the
/// mass fractions of Z = 1 to 30, mapped onto the composition elements.
pub fn read_abundances(
    path: &Path,
    atomic: &AtomicModel,
    grid: &PropagationGrid,
    cells: &mut [ModelCell],
) -> io::Result<()> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    for cellindex in 0..grid.n_cells() {
        let index: usize = tokens.next_value("abundance cell index")?;
        if index != cellindex {
            return Err(invalid(format!(
                "abundance rows out of order: found {} expected {}",
                index, cellindex
            )));
        }
        let mut row = [0.0; N_ABUNDANCE_COLUMNS];
        for value in row.iter_mut() {
            *value = tokens.next_value("mass fraction")?;
        }
        if let Some(mgi) = grid.model_cell(cellindex) {
            for (elementindex, element) in atomic.elements.iter().enumerate() {
                let z = element.atomic_number as usize;
                if (1..=N_ABUNDANCE_COLUMNS).contains(&z) {
                    cells[mgi].abundances[elementindex] = row[z - 1];
                }
            }
        }
    }
    Ok(())
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Streams whitespace-separated values from non-comment lines.
pub(crate) struct TokenReader<R> {
    lines: io::Lines<R>,
    pending: Vec<String>,
}

impl<R: BufRead> TokenReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn next_value<T: std::str::FromStr>(&mut self, what: &str) -> io::Result<T>
    where
        T::Err: std::fmt::Display,
    {
        loop {
            if let Some(token) = self.pending.pop() {
                return token.parse().map_err(|err| {
                    invalid(format!("Failed parsing `{}` for {}: {}", token, what, err))
                });
            }
            match self.lines.next() {
                Some(line) => {
                    let line = line?;
                    let trimmed = line.trim();
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    self.pending = trimmed
                        .split_whitespace()
                        .rev()
                        .map(str::to_string)
                        .collect();
                }
                None => {
                    return Err(invalid(format!(
                        "File ended before `{}` was found",
                        what
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpkt::tests::three_line_atomic_model;
    use std::io::Write;

    #[test]
    fn one_dimensional_model_builds_spherical_grid() {
        let atomic = three_line_atomic_model();
        let decay_data = DecayData::standard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# one-zone nickel shell").unwrap();
        writeln!(file, "2").unwrap();
        writeln!(file, "2.0").unwrap();
        writeln!(file, "0 5000.0 -14.0 0.8 0.6 0.0 0.0 0.0").unwrap();
        writeln!(file, "1 10000.0 -15.0 0.5 0.3 0.0 0.0 0.0").unwrap();

        let t_min = 2.0 * DAY_TO_S;
        let model = read_model_1d(&path, t_min, &atomic, &decay_data).unwrap();
        assert_eq!(model.cells.len(), 2);
        assert_eq!(model.grid.n_cells(), 2);
        assert!((model.t_model - t_min).abs() < 1.0);
        // t_model == t_min so no density rescaling
        assert!((model.cells[0].rho_init - 1.0e-14).abs() / 1.0e-14 < 1e-10);
        let ni56 = decay_data.nuclide_index(28, 56).unwrap();
        assert!((model.cells[0].nuc_mass_fractions[ni56] - 0.6).abs() < 1e-12);
        // outer shell edge at v_outer * t_min
        assert!(
            (model.grid.cell_coord_max(1, 0) - 1.0e9 * t_min).abs() / (1.0e9 * t_min) < 1e-12
        );
    }

    #[test]
    fn empty_cells_map_to_no_model_cell() {
        let atomic = three_line_atomic_model();
        let decay_data = DecayData::standard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "2").unwrap();
        writeln!(file, "2.0").unwrap();
        writeln!(file, "0 5000.0 -14.0 0.8 0.6 0.0 0.0 0.0").unwrap();
        writeln!(file, "1 10000.0 -99.0 0.0 0.0 0.0 0.0 0.0").unwrap();

        let model = read_model_1d(&path, 2.0 * DAY_TO_S, &atomic, &decay_data).unwrap();
        assert_eq!(model.cells.len(), 1);
        assert_eq!(model.grid.model_cell(0), Some(0));
        assert_eq!(model.grid.model_cell(1), None);
    }

    #[test]
    fn abundance_rows_map_by_atomic_number() {
        let atomic = three_line_atomic_model();
        let decay_data = DecayData::standard();
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("model.txt");
        let mut file = std::fs::File::create(&model_path).unwrap();
        writeln!(file, "1").unwrap();
        writeln!(file, "2.0").unwrap();
        writeln!(file, "0 5000.0 -14.0 0.0 0.0 0.0 0.0 0.0").unwrap();
        let mut model = read_model_1d(&model_path, 2.0 * DAY_TO_S, &atomic, &decay_data).unwrap();

        let abund_path = dir.path().join("abundances.txt");
        let mut file = std::fs::File::create(&abund_path).unwrap();
        // oxygen is Z=8: put 0.75 in column 8
        let mut row = vec!["0".to_string()];
        for z in 1..=30 {
            row.push(if z == 8 { "0.75".into() } else { "0.0".into() });
        }
        writeln!(file, "{}", row.join(" ")).unwrap();

        read_abundances(&abund_path, &atomic, &model.grid, &mut model.cells).unwrap();
        assert!((model.cells[0].abundances[0] - 0.75).abs() < 1e-12);
    }
}
