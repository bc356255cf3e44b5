//! K-packets: the thermal energy pool of a cell.

use crate::atomic::AtomicModel;
use crate::cells::ModelCell;
use crate::constants::{fcn, HOVERKB, HPLANCK, KBOLTZMANN, MIN_POPULATION};
use crate::macroatom::{alpha_sp, col_excitation_ratecoeff, col_ionisation_ratecoeff};
use crate::packets::{EmissionType, MacroAtomState, Packet, PacketType};
use crate::random::RandomStream;
use crate::rpkt::{PropagationEnv, Worker};

/// Free-free cooling rate scale [cgs], 1.426e-27 sqrt(T) Z^2 n_ion n_e.
const FF_COOLING_SCALE: fcn = 1.426e-27;

/// One contribution to the cooling of a cell's thermal pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CoolingProcess {
    FreeFree,
    /// Radiative recombination through the given continuum.
    FreeBound { continuum: usize },
    /// Collisional excitation of the given line.
    CollisionalExcitation { line: usize },
    /// Collisional ionisation out of the given continuum's lower level.
    CollisionalIonisation { continuum: usize },
}

/// A cooling channel with its rate [erg/s/cm^3].
#[derive(Clone, Copy, Debug)]
pub struct CoolingChannel {
    pub process: CoolingProcess,
    pub rate: fcn,
}

/// Builds the ordered cooling-channel list of a cell, so a cumulative
/// distribution over it can be sampled.
pub fn build_cooling_channels(
    atomic: &AtomicModel,
    cell: &ModelCell,
) -> (Vec<CoolingChannel>, Vec<fcn>) {
    let mut channels = Vec::new();
    let mut cumulative = Vec::new();
    let mut total = 0.0;
    let mut push = |process: CoolingProcess, rate: fcn| {
        if rate > 0.0 && rate.is_finite() {
            total += rate;
            channels.push(CoolingChannel { process, rate });
            cumulative.push(total);
        }
    };

    let t_e = cell.t_e;
    let nne = cell.nne;

    // free-free cooling from all charged ions
    let mut ff_rate = 0.0;
    for (elementindex, element) in atomic.elements.iter().enumerate() {
        for (ionindex, ion) in element.ions.iter().enumerate() {
            let charge = ion.ion_stage as fcn - 1.0;
            if charge > 0.0 {
                ff_rate += FF_COOLING_SCALE
                    * t_e.sqrt()
                    * charge
                    * charge
                    * cell.ion_populations[elementindex][ionindex]
                    * nne;
            }
        }
    }
    push(CoolingProcess::FreeFree, ff_rate);

    for (continuum_index, continuum) in atomic.bf_continua.iter().enumerate() {
        let upper_ion = continuum.ion + 1;
        if upper_ion >= atomic.elements[continuum.element].nions() {
            continue;
        }
        // radiative recombination cooling: captured electrons carry of
        // order kT above the edge
        let n_upper = cell.level_population(atomic, continuum.element, upper_ion, continuum.upper_level);
        if n_upper > MIN_POPULATION {
            let alpha = alpha_sp(atomic, continuum_index, t_e);
            push(
                CoolingProcess::FreeBound {
                    continuum: continuum_index,
                },
                n_upper * nne * alpha * (HPLANCK * continuum.nu_edge + KBOLTZMANN * t_e),
            );
        }
        // collisional ionisation cooling
        let n_lower =
            cell.level_population(atomic, continuum.element, continuum.ion, continuum.level);
        if n_lower > MIN_POPULATION {
            let chi = HPLANCK * continuum.nu_edge;
            let sigma_threshold = atomic.phixs_tables[continuum.table]
                .sigma
                .first()
                .copied()
                .unwrap_or(0.0);
            let c_ion = col_ionisation_ratecoeff(sigma_threshold, chi, t_e) * nne;
            push(
                CoolingProcess::CollisionalIonisation {
                    continuum: continuum_index,
                },
                n_lower * c_ion * chi,
            );
        }
    }

    // collisional excitation cooling over the line list
    for (lineindex, line) in atomic.lines.entries().iter().enumerate() {
        let n_lower = cell.level_population(atomic, line.element, line.ion, line.lower);
        if n_lower > MIN_POPULATION {
            let c_lu = col_excitation_ratecoeff(atomic, line, t_e) * nne;
            push(
                CoolingProcess::CollisionalExcitation { line: lineindex },
                n_lower * c_lu * atomic.epsilon_trans(line),
            );
        }
    }

    (channels, cumulative)
}

/// Samples a frequency from a thermal free-free emissivity at the given
/// temperature.
fn sample_ff_frequency(t_e: fcn, rng: &mut RandomStream) -> fcn {
    -KBOLTZMANN * t_e / HPLANCK * fcn::ln(rng.uniform_pos())
}

/// Samples a frequency from a Planck distribution at the given
/// temperature, by rejection against the peak intensity.
pub fn sample_planck_frequency(t: fcn, rng: &mut RandomStream) -> fcn {
    let nu_peak = 2.821_439_4 / HOVERKB * t;
    let b_peak = planck_shape(nu_peak, t);
    loop {
        // sample well past the Wien tail
        let nu = rng.uniform_pos() * 10.0 * nu_peak;
        if rng.uniform() * b_peak <= planck_shape(nu, t) {
            return nu;
        }
    }
}

fn planck_shape(nu: fcn, t: fcn) -> fcn {
    nu * nu * nu / (fcn::exp(HOVERKB * nu / t) - 1.0).max(1e-300)
}

/// Processes a k-packet: samples the cell's cooling channels and converts
/// the packet to an r-packet or re-activates a macro-atom.
///
/// The optional diffusion time delays the conversion; a packet whose
/// delay crosses the timestep end stays thermal until the next step.
pub fn do_kpkt(
    env: &PropagationEnv,
    pkt: &mut Packet,
    worker: &mut Worker,
    t2: fcn,
    timestep_width: fcn,
    apply_diffusion: bool,
) {
    let Some(model_cell) = env.grid.model_cell(pkt.cell) else {
        crate::exit_with_error!("[fatal] k-packet in an empty cell");
    };
    let cell = &env.cells[model_cell];

    if apply_diffusion && env.params.kpkt_diffusion_fraction > 0.0 {
        let delay = env.params.kpkt_diffusion_fraction * timestep_width;
        let t_new = pkt.prop_time + delay;
        if t_new >= t2 {
            pkt.drift_with_flow(t2);
            return;
        }
        pkt.drift_with_flow(t_new);
    }

    // per-thread cached snapshot of the cooling distribution
    worker.cache.reset_for_cell(model_cell);
    if worker.cache.cooling_channels.is_empty() {
        let (channels, cumulative) = build_cooling_channels(env.atomic, cell);
        worker.cache.cooling_channels = channels;
        worker.cache.cooling_cumulative = cumulative;
    }
    if worker.cache.cooling_channels.is_empty() {
        // nothing can cool; emit thermally so the energy is not lost
        pkt.nu_cmf = sample_planck_frequency(cell.t_e.max(1000.0), &mut worker.rng);
        pkt.emit_rpkt(&mut worker.rng);
        pkt.record_true_emission(EmissionType::FreeFree);
        pkt.next_trans = env.atomic.lines.sync_transition_hint(pkt.nu_cmf, 0);
        return;
    }

    let pick = worker.rng.sample_cumulative(&worker.cache.cooling_cumulative);
    match worker.cache.cooling_channels[pick].process {
        CoolingProcess::FreeFree => {
            pkt.nu_cmf = sample_ff_frequency(cell.t_e, &mut worker.rng);
            pkt.emit_rpkt(&mut worker.rng);
            pkt.record_true_emission(EmissionType::FreeFree);
            pkt.next_trans = env.atomic.lines.sync_transition_hint(pkt.nu_cmf, 0);
        }
        CoolingProcess::FreeBound { continuum } => {
            let nu_edge = env.atomic.bf_continua[continuum].nu_edge;
            let thermal = -KBOLTZMANN * cell.t_e / HPLANCK * fcn::ln(worker.rng.uniform_pos());
            pkt.nu_cmf = nu_edge + thermal;
            pkt.emit_rpkt(&mut worker.rng);
            pkt.record_true_emission(EmissionType::BoundFree(continuum));
            pkt.next_trans = env.atomic.lines.sync_transition_hint(pkt.nu_cmf, 0);
        }
        CoolingProcess::CollisionalExcitation { line } => {
            let line_entry = env.atomic.lines.entry(line);
            pkt.ptype = PacketType::MacroAtom(MacroAtomState {
                element: line_entry.element,
                ion: line_entry.ion,
                level: line_entry.upper,
                activating_line: None,
            });
        }
        CoolingProcess::CollisionalIonisation { continuum } => {
            let target = &env.atomic.bf_continua[continuum];
            pkt.ptype = PacketType::MacroAtom(MacroAtomState {
                element: target.element,
                ion: target.ion + 1,
                level: target.upper_level,
                activating_line: None,
            });
        }
    }
}

/// Emits a k-packet directly as a thermal r-packet, used for pre-t_min
/// decays and optically thick cells where the detailed cooling channels
/// are not meaningful.
pub fn do_kpkt_blackbody(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker) {
    let t_e = env
        .grid
        .model_cell(pkt.cell)
        .map(|mgi| env.cells[mgi].t_e)
        .unwrap_or(6000.0)
        .max(1000.0);
    pkt.nu_cmf = sample_planck_frequency(t_e, &mut worker.rng);
    pkt.emit_rpkt(&mut worker.rng);
    pkt.record_true_emission(EmissionType::FreeFree);
    pkt.next_trans = env.atomic.lines.sync_transition_hint(pkt.nu_cmf, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpkt::tests::three_line_atomic_model;

    #[test]
    fn cooling_channels_form_cumulative_distribution() {
        let atomic = three_line_atomic_model();
        let mut cell = ModelCell::new(1, 0);
        cell.rho_init = 1.0e-14;
        cell.abundances = vec![1.0];
        cell.t_e = 1.0e4;
        cell.t_r = 1.0e4;
        cell.nne = 1.0e8;
        cell.nne_tot = 1.0e8;
        cell.ion_populations = vec![vec![1.0e8]];
        cell.update_partition_functions(&atomic);

        let (channels, cumulative) = build_cooling_channels(&atomic, &cell);
        assert_eq!(channels.len(), cumulative.len());
        // collisional excitation of the permitted lines must appear
        assert!(channels
            .iter()
            .any(|channel| matches!(channel.process, CoolingProcess::CollisionalExcitation { .. })));
        for window in cumulative.windows(2) {
            assert!(window[1] >= window[0]);
        }
        let channel_sum: fcn = channels.iter().map(|channel| channel.rate).sum();
        let last = cumulative.last().copied().unwrap();
        assert!((channel_sum - last).abs() / last < 1e-12);
    }

    #[test]
    fn planck_sampling_peaks_near_wien_maximum() {
        let mut rng = RandomStream::new(9, 0, 0);
        let t = 1.0e4;
        let n = 2000;
        let mean: fcn = (0..n)
            .map(|_| sample_planck_frequency(t, &mut rng))
            .sum::<fcn>()
            / n as fcn;
        // mean photon frequency of a Planck field is 3.832 kT/h
        let expected = 3.832 * t / HOVERKB;
        assert!((mean - expected).abs() / expected < 0.1);
    }
}
