//! Continuum opacities for r-packet propagation.

use crate::atomic::AtomicModel;
use crate::cells::{CellCache, ModelCell};
use crate::constants::{fcn, HOVERKB, HPLANCK, MIN_POPULATION, SIGMA_T};
use log::warn;

/// Relative comoving-frequency drift beyond which a cached opacity is stale.
const NU_CACHE_TOLERANCE: fcn = 1e-4;

/// Free-free opacity scale from the Kramers-type absorption formula.
const KAPPA_FF_SCALE: fcn = 3.69255e8;

/// The continuum opacity at one (model cell, frequency), with its process
/// breakdown. Cached per worker thread; `calculate` is a no-op while the
/// key still matches.
#[derive(Clone, Debug)]
pub struct ContinuumOpacity {
    pub model_cell: Option<usize>,
    pub nu: fcn,
    pub recalculate_required: bool,
    /// Total continuum opacity [1/cm] in the comoving frame.
    pub total: fcn,
    /// Electron-scattering contribution.
    pub es: fcn,
    /// Free-free contribution.
    pub ff: fcn,
    /// Bound-free contribution.
    pub bf: fcn,
    /// Free-free heating contribution for the heating estimator.
    pub ff_heating: fcn,
    /// Number of full recomputations performed (cache misses).
    pub computations: u64,
}

impl ContinuumOpacity {
    pub fn new() -> Self {
        Self {
            model_cell: None,
            nu: 0.0,
            recalculate_required: true,
            total: 0.0,
            es: 0.0,
            ff: 0.0,
            bf: 0.0,
            ff_heating: 0.0,
            computations: 0,
        }
    }

    fn is_fresh(&self, model_cell: usize, nu_cmf: fcn) -> bool {
        self.model_cell == Some(model_cell)
            && !self.recalculate_required
            && fcn::abs(self.nu / nu_cmf - 1.0) < NU_CACHE_TOLERANCE
    }
}

impl Default for ContinuumOpacity {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the comoving-frame continuum opacity at the packet's frequency,
/// reusing the cached value when the (cell, frequency) key still matches.
///
/// Must only be called for non-empty, non-grey cells.
pub fn calculate_continuum_opacity(
    opacity: &mut ContinuumOpacity,
    cell: &ModelCell,
    model_cell: usize,
    atomic: &AtomicModel,
    nu_cmf: fcn,
    opacity_case: i32,
    cache: &mut CellCache,
) {
    debug_assert!(!cell.is_empty() && !cell.thick);
    if opacity.is_fresh(model_cell, nu_cmf) {
        return;
    }

    let (es, ff, bf, ff_heating);
    if opacity_case == 4 {
        es = SIGMA_T * cell.nne;
        ff = calculate_kappa_ff(cell, atomic, nu_cmf);
        ff_heating = ff;
        bf = calculate_kappa_bf(cell, atomic, nu_cmf, cache);
    } else {
        // grey opacity cases keep a scaled free-free absorption only
        es = 0.0;
        ff = 1e5 * calculate_kappa_ff(cell, atomic, nu_cmf);
        ff_heating = ff;
        bf = 0.0;
        for value in cache.kappa_bf_cumulative.iter_mut() {
            *value = 0.0;
        }
    }

    opacity.model_cell = Some(model_cell);
    opacity.nu = nu_cmf;
    opacity.recalculate_required = false;
    opacity.es = es;
    opacity.ff = ff;
    opacity.bf = bf;
    opacity.ff_heating = ff_heating;
    opacity.total = es + ff + bf;
    opacity.computations += 1;

    if !opacity.total.is_finite() {
        warn!(
            "non-finite continuum opacity in cell {}: es {:.3e} ff {:.3e} bf {:.3e} at nu {:.4e}",
            model_cell, es, ff, bf, nu_cmf
        );
        if es.is_finite() {
            opacity.ff = 0.0;
            opacity.bf = 0.0;
            opacity.ff_heating = 0.0;
            opacity.total = es;
        } else {
            crate::exit_with_error!(
                "[fatal] continuum opacity non-finite with non-finite electron scattering"
            );
        }
    }
}

/// Free-free opacity [1/cm] at the given comoving frequency.
fn calculate_kappa_ff(cell: &ModelCell, atomic: &AtomicModel, nu: fcn) -> fcn {
    debug_assert!(nu > 0.0);
    let g_ff = 1.0;
    let t_e = cell.t_e;

    let mut zsum = 0.0;
    for (elementindex, element) in atomic.elements.iter().enumerate() {
        for (ionindex, ion) in element.ions.iter().enumerate() {
            // the ionic charge enters, so neutral stages do not contribute
            let charge = ion.ion_stage as fcn - 1.0;
            if charge > 0.0 {
                zsum += charge * charge * g_ff * cell.ion_populations[elementindex][ionindex];
            }
        }
    }
    zsum * KAPPA_FF_SCALE / t_e.sqrt() * nu.powi(-3) * cell.nne
        * (1.0 - fcn::exp(-HOVERKB * nu / t_e))
}

/// Bound-free opacity [1/cm], filling the cumulative per-continuum sums in
/// the cell cache for the event sampler.
fn calculate_kappa_bf(
    cell: &ModelCell,
    atomic: &AtomicModel,
    nu: fcn,
    cache: &mut CellCache,
) -> fcn {
    let mut kappa_bf_sum = 0.0;
    let nne_tot = cell.nne_tot.max(1e-100);

    let mut index = 0;
    // the continuum list is sorted by nu_edge ascending, so all continua
    // past the first threshold above nu contribute nothing
    while index < atomic.bf_continua.len() {
        let continuum = &atomic.bf_continua[index];
        if nu < continuum.nu_edge {
            break;
        }
        cache.gamma_contr[index] = 0.0;

        let n_ion = cell.ion_populations[continuum.element][continuum.ion];
        let important = n_ion / nne_tot > 1e-6 || continuum.level == 0;
        if important {
            let table = &atomic.phixs_tables[continuum.table];
            let nnlevel =
                cell.level_population(atomic, continuum.element, continuum.ion, continuum.level);
            if nu <= table.nu_max(atomic.phixs_nu_increment) && nnlevel > MIN_POPULATION {
                let sigma_bf = table.sigma_at(nu, atomic.phixs_nu_increment);

                // stimulated recombination correction, cached through the
                // departure ratio of the target level
                let mut departure_ratio = cache.departure_ratios[index];
                if departure_ratio.is_nan() {
                    departure_ratio = compute_departure_ratio(cell, atomic, continuum, nnlevel);
                    cache.departure_ratios[index] = departure_ratio;
                }
                let stimfactor = departure_ratio * fcn::exp(-HOVERKB * nu / cell.t_e);
                let corrfactor = (1.0 - stimfactor).max(0.0);

                let kappa_bf_contr = nnlevel * sigma_bf * continuum.probability * corrfactor;
                cache.gamma_contr[index] = sigma_bf * continuum.probability * corrfactor;
                if !kappa_bf_contr.is_finite() {
                    crate::exit_with_error!(
                        "[fatal] non-finite bound-free contribution: continuum {} element {} ion {} level {}",
                        index,
                        continuum.element,
                        continuum.ion,
                        continuum.level
                    );
                }
                kappa_bf_sum += kappa_bf_contr;
            }
        }
        cache.kappa_bf_cumulative[index] = kappa_bf_sum;
        index += 1;
    }
    for remaining in index..atomic.bf_continua.len() {
        cache.kappa_bf_cumulative[remaining] = kappa_bf_sum;
        cache.gamma_contr[remaining] = 0.0;
    }
    kappa_bf_sum
}

fn compute_departure_ratio(
    cell: &ModelCell,
    atomic: &AtomicModel,
    continuum: &crate::atomic::BfContinuum,
    nnlevel: fcn,
) -> fcn {
    let upper_ion = continuum.ion + 1;
    if upper_ion >= atomic.elements[continuum.element].nions() {
        return 0.0;
    }
    let nn_upper =
        cell.level_population(atomic, continuum.element, upper_ion, continuum.upper_level);
    if nn_upper <= 0.0 || nnlevel <= 0.0 {
        return 0.0;
    }
    let g_lower = atomic.stat_weight(continuum.element, continuum.ion, continuum.level);
    let g_upper = atomic.stat_weight(continuum.element, upper_ion, continuum.upper_level);
    let saha = cell.saha_factor(g_lower, g_upper, HPLANCK * continuum.nu_edge);
    nn_upper / nnlevel * cell.nne * saha
}

/// Selects the bound-free continuum in which an absorption occurs, by a
/// binary search on the cumulative opacities from the last calculation.
pub fn sample_bf_continuum(cache: &CellCache, kappa_bf_total: fcn, zrand: fcn) -> usize {
    let target = zrand * kappa_bf_total;
    cache
        .kappa_bf_cumulative
        .partition_point(|&value| value < target)
        .min(cache.kappa_bf_cumulative.len().saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::{BfContinuum, Element, Ion, Level, LineList, PhixsTarget, PhotoionTable};

    fn minimal_atomic_model() -> AtomicModel {
        let level = |energy: fcn, g: fcn| Level {
            energy,
            stat_weight: g,
            downtrans: 0..0,
            uptrans: 0..0,
        };
        let mut atomic = AtomicModel {
            elements: vec![Element {
                atomic_number: 8,
                mass: 16.0 * crate::constants::M_H,
                ions: vec![
                    Ion {
                        ion_stage: 1,
                        ionpot: 13.6 * crate::constants::EV_TO_ERG,
                        levels: vec![level(0.0, 1.0), level(2.0e-12, 3.0)],
                    },
                    Ion {
                        ion_stage: 2,
                        ionpot: 35.1 * crate::constants::EV_TO_ERG,
                        levels: vec![level(0.0, 2.0)],
                    },
                ],
            }],
            lines: LineList::default(),
            downtrans_arena: Vec::new(),
            uptrans_arena: Vec::new(),
            phixs_tables: vec![PhotoionTable {
                element: 0,
                ion: 0,
                level: 0,
                nu_edge: 3.0e15,
                targets: vec![PhixsTarget {
                    upper_level: 0,
                    probability: 1.0,
                }],
                sigma: vec![6.0e-18; 100],
            }],
            bf_continua: Vec::new(),
            phixs_nu_increment: 0.1,
        };
        atomic.bf_continua = vec![BfContinuum {
            element: 0,
            ion: 0,
            level: 0,
            upper_level: 0,
            probability: 1.0,
            nu_edge: 3.0e15,
            table: 0,
        }];
        atomic
    }

    fn test_cell() -> ModelCell {
        let mut cell = ModelCell::new(1, 0);
        cell.rho_init = 1.0e-14;
        cell.abundances = vec![1.0];
        cell.t_e = 1.0e4;
        cell.t_r = 1.0e4;
        cell.nne = 1.0e8;
        cell.nne_tot = 1.0e8;
        cell.ion_populations = vec![vec![1.0e8, 1.0e6]];
        cell
    }

    #[test]
    fn opacity_cache_avoids_recomputation() {
        let atomic = minimal_atomic_model();
        let mut cell = test_cell();
        cell.update_partition_functions(&atomic);
        let mut cache = CellCache::new(atomic.bf_continua.len());
        cache.reset_for_cell(0);
        let mut opacity = ContinuumOpacity::new();

        calculate_continuum_opacity(&mut opacity, &cell, 0, &atomic, 4.0e15, 4, &mut cache);
        assert_eq!(opacity.computations, 1);
        // identical (cell, nu) key: no recomputation
        calculate_continuum_opacity(&mut opacity, &cell, 0, &atomic, 4.0e15, 4, &mut cache);
        assert_eq!(opacity.computations, 1);
        // frequency drifted past the tolerance: recompute
        calculate_continuum_opacity(&mut opacity, &cell, 0, &atomic, 4.1e15, 4, &mut cache);
        assert_eq!(opacity.computations, 2);
    }

    #[test]
    fn thomson_term_scales_with_electron_density() {
        let atomic = minimal_atomic_model();
        let mut cell = test_cell();
        cell.update_partition_functions(&atomic);
        let mut cache = CellCache::new(atomic.bf_continua.len());
        cache.reset_for_cell(0);
        let mut opacity = ContinuumOpacity::new();
        // far below the bf edge, only es and ff contribute
        calculate_continuum_opacity(&mut opacity, &cell, 0, &atomic, 1.0e14, 4, &mut cache);
        assert!((opacity.es - SIGMA_T * cell.nne).abs() / opacity.es < 1e-12);
        assert_eq!(opacity.bf, 0.0);
        assert!(opacity.ff > 0.0);
    }

    #[test]
    fn bound_free_contributes_above_threshold_only() {
        let atomic = minimal_atomic_model();
        let mut cell = test_cell();
        cell.update_partition_functions(&atomic);
        let mut cache = CellCache::new(atomic.bf_continua.len());
        cache.reset_for_cell(0);
        let mut opacity = ContinuumOpacity::new();

        calculate_continuum_opacity(&mut opacity, &cell, 0, &atomic, 2.0e15, 4, &mut cache);
        assert_eq!(opacity.bf, 0.0);

        calculate_continuum_opacity(&mut opacity, &cell, 0, &atomic, 3.5e15, 4, &mut cache);
        assert!(opacity.bf > 0.0);
        assert_eq!(
            cache.kappa_bf_cumulative[atomic.bf_continua.len() - 1],
            opacity.bf
        );
    }
}
