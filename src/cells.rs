//! Model-cell state, Monte Carlo estimators and the per-thread cell cache.

use crate::atomic::AtomicModel;
use crate::constants::{
    fcn, FOURPI, HOVERKB, KBOLTZMANN, MIN_DENSITY, MIN_POPULATION, M_ELECTRON, PI, STEFBOLTZ,
};
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, Ordering};

lazy_static! {
    /// Constant factor in the Saha equation: (h^2/(2 pi m_e k_B))^(3/2).
    static ref SAHA_SCALE: fcn = fcn::powf(
        crate::constants::HPLANCK * crate::constants::HPLANCK
            / (2.0 * PI * M_ELECTRON * KBOLTZMANN),
        1.5
    );
}

/// Mean photon frequency of a Planck field in units of k_B T / h.
const PLANCK_MEAN_NU_FACTOR: fcn = 3.832_229_494;

/// A float accumulator supporting lock-free concurrent adds.
///
/// Stored as the bit pattern of an `f64` inside an `AtomicU64`; adds use a
/// compare-exchange loop with relaxed ordering, which is sufficient because
/// estimator sums are commutative and only read after the propagation
/// barrier.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: fcn) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> fcn {
        fcn::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: fcn) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, increment: fcn) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let new = (fcn::from_bits(current) + increment).to_bits();
            match self
                .0
                .compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// Physical state of one model cell.
///
/// Multiple propagation cells may share a model cell; fully empty
/// propagation cells have no model cell at all.
#[derive(Clone, Debug)]
pub struct ModelCell {
    /// Mass density at the reference time [g/cm^3].
    pub rho_init: fcn,
    /// Elemental mass fractions, indexed like `AtomicModel::elements`.
    pub abundances: Vec<fcn>,
    /// Ion number densities [1/cm^3], per element and ion.
    pub ion_populations: Vec<Vec<fcn>>,
    /// Partition functions per element and ion, for the current T_e.
    pub partition_functions: Vec<Vec<fcn>>,
    /// Electron number density [1/cm^3].
    pub nne: fcn,
    /// Total electron density including bound electrons [1/cm^3].
    pub nne_tot: fcn,
    /// Electron temperature [K].
    pub t_e: fcn,
    /// Radiation temperature [K].
    pub t_r: fcn,
    /// Dilution factor of the radiation field.
    pub w: fcn,
    /// Whether the cell is treated in the grey approximation.
    pub thick: bool,
    /// Grey mass absorption coefficient [cm^2/g].
    pub kappa_grey: fcn,
    /// Initial radioactive mass fractions per nuclide, indexed like the
    /// decay model's nuclide table.
    pub nuc_mass_fractions: Vec<fcn>,
    /// Iron-group mass fraction, entering the grey opacity scaling.
    pub fegroup_fraction: fcn,
}

impl ModelCell {
    pub fn new(nelements: usize, n_nuclides: usize) -> Self {
        Self {
            rho_init: 0.0,
            abundances: vec![0.0; nelements],
            ion_populations: Vec::new(),
            partition_functions: Vec::new(),
            nne: 0.0,
            nne_tot: 0.0,
            t_e: 0.0,
            t_r: 0.0,
            w: 1.0,
            thick: false,
            kappa_grey: 0.0,
            nuc_mass_fractions: vec![0.0; n_nuclides],
            fegroup_fraction: 0.0,
        }
    }

    /// Mass density at the given time, diluted by homologous expansion.
    pub fn rho(&self, time: fcn, t_min: fcn) -> fcn {
        self.rho_init * (t_min / time).powi(3)
    }

    pub fn is_empty(&self) -> bool {
        self.rho_init < MIN_DENSITY
    }

    /// Total atom number density [1/cm^3] at the given time.
    pub fn total_atom_density(&self, atomic: &AtomicModel, time: fcn, t_min: fcn) -> fcn {
        let rho = self.rho(time, t_min);
        self.abundances
            .iter()
            .zip(&atomic.elements)
            .map(|(&x, element)| x * rho / element.mass)
            .sum()
    }

    /// Total ion number density [1/cm^3] from the stored populations.
    pub fn total_ion_density(&self) -> fcn {
        self.ion_populations
            .iter()
            .map(|ions| ions.iter().sum::<fcn>())
            .sum()
    }

    /// Population of a bound level [1/cm^3], assuming a Boltzmann
    /// distribution at T_e within the ion.
    pub fn level_population(
        &self,
        atomic: &AtomicModel,
        element: usize,
        ion: usize,
        level: usize,
    ) -> fcn {
        let n_ion = self.ion_populations[element][ion];
        if n_ion < MIN_POPULATION {
            return 0.0;
        }
        let level_data = atomic.level(element, ion, level);
        let partition = self.partition_functions[element][ion];
        let population = n_ion * level_data.stat_weight
            * fcn::exp(-level_data.energy / (KBOLTZMANN * self.t_e))
            / partition;
        if population < MIN_POPULATION {
            0.0
        } else {
            population
        }
    }

    /// Saha factor relating `n_upper * nne / n_lower` to the Boltzmann
    /// exponential for the given ionisation edge energy.
    pub fn saha_factor(&self, g_lower: fcn, g_upper: fcn, edge_energy: fcn) -> fcn {
        g_lower / (2.0 * g_upper) * (*SAHA_SCALE) / fcn::powf(self.t_e, 1.5)
            * fcn::exp(edge_energy / (KBOLTZMANN * self.t_e))
    }

    /// Recomputes the partition functions for the current T_e.
    pub fn update_partition_functions(&mut self, atomic: &AtomicModel) {
        self.partition_functions = atomic
            .elements
            .iter()
            .map(|element| {
                element
                    .ions
                    .iter()
                    .map(|ion| {
                        ion.levels
                            .iter()
                            .map(|level| {
                                level.stat_weight
                                    * fcn::exp(-level.energy / (KBOLTZMANN * self.t_e.max(1000.0)))
                            })
                            .sum::<fcn>()
                            .max(1.0)
                    })
                    .collect()
            })
            .collect();
    }

    /// Solves the Saha ionisation balance at T_e for the current density,
    /// iterating the electron density to consistency by bisection.
    pub fn update_ionisation_balance(&mut self, atomic: &AtomicModel, time: fcn, t_min: fcn) {
        self.update_partition_functions(atomic);

        let rho = self.rho(time, t_min);
        let atom_densities: Vec<fcn> = self
            .abundances
            .iter()
            .zip(&atomic.elements)
            .map(|(&x, element)| x * rho / element.mass)
            .collect();

        let nne_max: fcn = atom_densities
            .iter()
            .zip(&atomic.elements)
            .map(|(&n, element)| n * element.atomic_number as fcn)
            .sum();
        self.nne_tot = nne_max;
        if nne_max <= 0.0 {
            self.nne = 0.0;
            self.ion_populations = atomic
                .elements
                .iter()
                .map(|element| vec![0.0; element.nions()])
                .collect();
            return;
        }

        let mut nne_low = nne_max * 1e-10;
        let mut nne_high = nne_max;
        for _ in 0..60 {
            let nne_try = fcn::sqrt(nne_low * nne_high);
            let nne_implied = self.implied_electron_density(atomic, &atom_densities, nne_try);
            if nne_implied > nne_try {
                nne_low = nne_try;
            } else {
                nne_high = nne_try;
            }
        }
        let nne = fcn::sqrt(nne_low * nne_high);
        self.nne = nne;
        self.ion_populations = self.solve_ion_populations(atomic, &atom_densities, nne);
    }

    fn implied_electron_density(
        &self,
        atomic: &AtomicModel,
        atom_densities: &[fcn],
        nne: fcn,
    ) -> fcn {
        let populations = self.solve_ion_populations(atomic, atom_densities, nne);
        populations
            .iter()
            .zip(&atomic.elements)
            .map(|(ions, element)| {
                ions.iter()
                    .zip(&element.ions)
                    .map(|(&n, ion)| n * (ion.ion_stage as fcn - 1.0))
                    .sum::<fcn>()
            })
            .sum()
    }

    fn solve_ion_populations(
        &self,
        atomic: &AtomicModel,
        atom_densities: &[fcn],
        nne: fcn,
    ) -> Vec<Vec<fcn>> {
        atomic
            .elements
            .iter()
            .enumerate()
            .map(|(elementindex, element)| {
                let n_atom = atom_densities[elementindex];
                if n_atom <= 0.0 || element.nions() == 0 {
                    return vec![0.0; element.nions()];
                }
                // ratios n_{i+1}/n_i from the Saha equation
                let mut ratios = Vec::with_capacity(element.nions().saturating_sub(1));
                for ionindex in 0..element.nions() - 1 {
                    let u_lower = self.partition_functions[elementindex][ionindex];
                    let u_upper = self.partition_functions[elementindex][ionindex + 1];
                    let chi = element.ions[ionindex].ionpot;
                    let ratio = 2.0 * u_upper / u_lower / (nne.max(1e-10) * (*SAHA_SCALE))
                        * fcn::powf(self.t_e, 1.5)
                        * fcn::exp(-chi / (KBOLTZMANN * self.t_e));
                    ratios.push(ratio.min(1e30));
                }
                // relative populations with the neutral stage as reference
                let mut relative = vec![1.0_f64; element.nions()];
                for ionindex in 1..element.nions() {
                    relative[ionindex] = relative[ionindex - 1] * ratios[ionindex - 1];
                    if !relative[ionindex].is_finite() {
                        relative[ionindex] = 1e30;
                    }
                }
                let total: fcn = relative.iter().sum();
                relative
                    .iter()
                    .map(|&population| population / total * n_atom)
                    .collect()
            })
            .collect()
    }
}

/// Per-frequency-bin pieces of the radiation-field descriptor.
#[derive(Debug, Default)]
pub struct RadFieldBin {
    pub j_sum: AtomicF64,
    pub nuj_sum: AtomicF64,
    pub contribution_count: AtomicU64,
}

impl Clone for RadFieldBin {
    fn clone(&self) -> Self {
        Self {
            j_sum: self.j_sum.clone(),
            nuj_sum: self.nuj_sum.clone(),
            contribution_count: AtomicU64::new(self.contribution_count.load(Ordering::Relaxed)),
        }
    }
}

/// Monte Carlo estimators, write-accumulated from all packets during
/// propagation and consumed (then zeroed) at each grid update.
pub struct Estimators {
    n_cells: usize,
    n_bins: usize,
    nu_bin_edges: Vec<fcn>,
    /// Frequency-integrated J estimator per model cell.
    pub j: Vec<AtomicF64>,
    /// Frequency-integrated nu*J estimator per model cell.
    pub nuj: Vec<AtomicF64>,
    /// Free-free heating estimator per model cell.
    pub ff_heating: Vec<AtomicF64>,
    /// Gamma-ray energy deposition per model cell.
    pub gamma_deposition: Vec<AtomicF64>,
    /// Binned radiation-field descriptor, `cell * n_bins + bin`.
    pub radfield: Vec<RadFieldBin>,
    /// Photoionisation rate estimator per (cell, element, ion).
    pub photoion: Vec<AtomicF64>,
    /// Bound-free heating estimator per (cell, element, ion).
    pub bf_heating: Vec<AtomicF64>,
    /// Line estimator slots; `line_slots[line]` is `usize::MAX` for lines
    /// without detailed estimators.
    pub line_slots: Vec<usize>,
    pub line_estimators: Vec<AtomicF64>,
    n_ion_slots: usize,
}

impl Estimators {
    pub fn new(
        n_cells: usize,
        nelements: usize,
        max_nions: usize,
        nu_min: fcn,
        nu_max: fcn,
        n_bins: usize,
        detailed_lines: &[usize],
        nlines: usize,
    ) -> Self {
        let dlognu = (fcn::ln(nu_max) - fcn::ln(nu_min)) / n_bins as fcn;
        let nu_bin_edges = (0..=n_bins)
            .map(|i| fcn::exp(fcn::ln(nu_min) + i as fcn * dlognu))
            .collect();
        let n_ion_slots = n_cells * nelements * max_nions;
        let mut line_slots = vec![usize::MAX; nlines];
        for (slot, &line) in detailed_lines.iter().enumerate() {
            line_slots[line] = slot;
        }
        Self {
            n_cells,
            n_bins,
            nu_bin_edges,
            j: init_accumulators(n_cells),
            nuj: init_accumulators(n_cells),
            ff_heating: init_accumulators(n_cells),
            gamma_deposition: init_accumulators(n_cells),
            radfield: (0..n_cells * n_bins).map(|_| RadFieldBin::default()).collect(),
            photoion: init_accumulators(n_ion_slots),
            bf_heating: init_accumulators(n_ion_slots),
            line_slots,
            line_estimators: init_accumulators(detailed_lines.len() * n_cells),
            n_ion_slots,
        }
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    /// Records a path segment of an r-packet in the given model cell.
    pub fn update_radfield(&self, model_cell: usize, distance_e_cmf: fcn, nu_cmf: fcn) {
        self.j[model_cell].add(distance_e_cmf);
        self.nuj[model_cell].add(distance_e_cmf * nu_cmf);

        if let Some(bin) = self.frequency_bin(nu_cmf) {
            let entry = &self.radfield[model_cell * self.n_bins + bin];
            entry.j_sum.add(distance_e_cmf);
            entry.nuj_sum.add(distance_e_cmf * nu_cmf);
            entry.contribution_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a detailed-line estimator contribution
    /// (`distance * e_cmf / nu_cmf` at the line crossing).
    pub fn update_line_estimator(&self, model_cell: usize, lineindex: usize, contribution: fcn) {
        let slot = self.line_slots[lineindex];
        if slot != usize::MAX {
            self.line_estimators[slot * self.n_cells + model_cell].add(contribution);
        }
    }

    pub fn ion_slot(
        &self,
        model_cell: usize,
        nelements: usize,
        max_nions: usize,
        element: usize,
        ion: usize,
    ) -> usize {
        let slot = model_cell * nelements * max_nions + element * max_nions + ion;
        debug_assert!(slot < self.n_ion_slots);
        slot
    }

    fn frequency_bin(&self, nu: fcn) -> Option<usize> {
        if nu < self.nu_bin_edges[0] || nu >= self.nu_bin_edges[self.n_bins] {
            return None;
        }
        Some(self.nu_bin_edges.partition_point(|&edge| edge <= nu) - 1)
    }

    /// Normalised mean J in the given cell for the path-sum normalisation
    /// `1/(4 pi V dt)`.
    pub fn mean_j(&self, model_cell: usize, volume: fcn, dt: fcn) -> fcn {
        self.j[model_cell].get() / (FOURPI * volume * dt)
    }

    pub fn mean_nuj(&self, model_cell: usize, volume: fcn, dt: fcn) -> fcn {
        self.nuj[model_cell].get() / (FOURPI * volume * dt)
    }

    /// Zeroes every accumulator for the next timestep.
    pub fn reset(&self) {
        for acc in self
            .j
            .iter()
            .chain(&self.nuj)
            .chain(&self.ff_heating)
            .chain(&self.gamma_deposition)
            .chain(&self.photoion)
            .chain(&self.bf_heating)
            .chain(&self.line_estimators)
        {
            acc.set(0.0);
        }
        for bin in &self.radfield {
            bin.j_sum.set(0.0);
            bin.nuj_sum.set(0.0);
            bin.contribution_count.store(0, Ordering::Relaxed);
        }
    }
}

fn init_accumulators(n: usize) -> Vec<AtomicF64> {
    (0..n).map(|_| AtomicF64::new(0.0)).collect()
}

/// Updates a model cell's radiation temperatures and ionisation state from
/// the estimators accumulated over the last timestep.
///
/// With no contributions the cell keeps its previous temperatures.
pub fn update_cell_thermodynamics(
    cell: &mut ModelCell,
    model_cell_index: usize,
    atomic: &AtomicModel,
    estimators: &Estimators,
    volume: fcn,
    dt: fcn,
    time: fcn,
    t_min: fcn,
    lte_mode: bool,
) {
    let jbar = estimators.mean_j(model_cell_index, volume, dt);
    let nujbar = estimators.mean_nuj(model_cell_index, volume, dt);

    if jbar > 0.0 && nujbar > 0.0 {
        let t_r = HOVERKB * (nujbar / jbar) / PLANCK_MEAN_NU_FACTOR;
        cell.t_r = t_r.clamp(1.0e3, 1.0e6);
        cell.w = (PI * jbar / (STEFBOLTZ * cell.t_r.powi(4))).clamp(1e-10, 1.0);
    }
    cell.t_e = if lte_mode {
        cell.t_r
    } else {
        (0.9 * cell.t_r).max(1.0e3)
    };

    cell.update_ionisation_balance(atomic, time, t_min);
}

/// Hot derived quantities for the model cell a worker thread is currently
/// visiting, invalidated whenever the thread changes cell.
pub struct CellCache {
    /// Model cell the cached values belong to.
    pub model_cell: Option<usize>,
    /// Photoionisation departure ratios per bound-free continuum;
    /// NaN marks entries not yet computed for this cell.
    pub departure_ratios: Vec<fcn>,
    /// Cumulative bound-free opacity per continuum, filled by the opacity
    /// calculation for the event sampler's binary search.
    pub kappa_bf_cumulative: Vec<fcn>,
    /// Per-continuum photoionisation contribution `sigma * p * corr` from
    /// the last opacity calculation, consumed by the ion estimators.
    pub gamma_contr: Vec<fcn>,
    /// Cached cooling-channel cumulative distribution for k-packets.
    pub cooling_cumulative: Vec<fcn>,
    /// Channel descriptors matching `cooling_cumulative`.
    pub cooling_channels: Vec<crate::kpkt::CoolingChannel>,
}

impl CellCache {
    pub fn new(n_bf_continua: usize) -> Self {
        Self {
            model_cell: None,
            departure_ratios: vec![fcn::NAN; n_bf_continua],
            kappa_bf_cumulative: vec![0.0; n_bf_continua],
            gamma_contr: vec![0.0; n_bf_continua],
            cooling_cumulative: Vec::new(),
            cooling_channels: Vec::new(),
        }
    }

    /// Points the cache at a new model cell, clearing everything derived.
    pub fn reset_for_cell(&mut self, model_cell: usize) {
        if self.model_cell != Some(model_cell) {
            self.model_cell = Some(model_cell);
            self.departure_ratios.iter_mut().for_each(|r| *r = fcn::NAN);
            self.kappa_bf_cumulative.iter_mut().for_each(|k| *k = 0.0);
            self.gamma_contr.iter_mut().for_each(|g| *g = 0.0);
            self.cooling_cumulative.clear();
            self.cooling_channels.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_f64_accumulates_concurrently() {
        use std::sync::Arc;
        let acc = Arc::new(AtomicF64::new(0.0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let acc = Arc::clone(&acc);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        acc.add(0.5);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!((acc.get() - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn radfield_binning_and_reset() {
        let estimators = Estimators::new(2, 1, 1, 1.0e14, 1.0e16, 10, &[], 0);
        estimators.update_radfield(1, 2.0, 3.0e14);
        assert_eq!(estimators.j[1].get(), 2.0);
        assert_eq!(estimators.nuj[1].get(), 6.0e14);
        assert_eq!(estimators.j[0].get(), 0.0);
        estimators.reset();
        assert_eq!(estimators.j[1].get(), 0.0);
    }

    #[test]
    fn frequency_bin_edges_are_half_open() {
        let estimators = Estimators::new(1, 1, 1, 1.0e14, 1.0e16, 10, &[], 0);
        assert_eq!(estimators.frequency_bin(0.5e14), None);
        assert_eq!(estimators.frequency_bin(1.001e14), Some(0));
        assert_eq!(estimators.frequency_bin(0.999e16), Some(9));
        assert_eq!(estimators.frequency_bin(1.001e16), None);
    }
}
