//! The macro-atom state machine.
//!
//! A macro-atom holds a packet's energy in an excited atomic state and
//! resamples its de-excitation pathway at every visit. Channel selection
//! follows the energy-weighted transition probabilities of the macro-atom
//! formalism: deactivating channels are weighted by the emitted transition
//! energy, internal channels by the energy of the target state.

use crate::atomic::{AtomicModel, LineEntry};
use crate::cells::ModelCell;
use crate::constants::{
    fcn, CLIGHTSQUARED, HCLIGHTOVERFOURPI, HOVERKB, HPLANCK, KBOLTZMANN, H_IONPOT, PI,
};
use crate::packets::{EmissionType, MacroAtomState, Packet, PacketType};
use crate::rpkt::{PropagationEnv, Worker};
use atomic_counter::AtomicCounter;
use log::warn;

/// Effective-collision-strength rate scale, 8.629e-6 in cgs.
const COLL_STR_SCALE: fcn = 8.629e-6;
/// Van Regemorter rate scale C_0 [cgs].
const VAN_REGEMORTER_C0: fcn = 5.465e-11;
/// Seaton-style collisional ionisation efficiency factor.
const COLL_ION_GBAR: fcn = 0.2;
/// Macro-atom visits before the packet is forcibly thermalised.
const MAX_INTERNAL_JUMPS: usize = 1_000_000;

/// One possible outcome of a macro-atom visit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MacroAtomChannel {
    /// Radiative de-excitation in the given downward line.
    RadiativeDeexcitation { line: usize },
    /// Collisional de-excitation to the thermal pool.
    CollisionalDeexcitation,
    /// Radiative recombination through the given continuum.
    RadiativeRecombination { continuum: usize },
    /// Collisional recombination to the thermal pool.
    CollisionalRecombination,
    /// Internal transition to another level of the same ion.
    InternalSameIon { level: usize },
    /// Internal transition into a level of the neighbouring ion.
    InternalCrossIon { ion: usize, level: usize },
}

/// The sampled discrete distribution over the outgoing channels of one
/// macro-atom state.
pub struct MacroAtomChannels {
    pub channels: Vec<MacroAtomChannel>,
    pub cumulative_rates: Vec<fcn>,
}

impl MacroAtomChannels {
    pub fn total_rate(&self) -> fcn {
        self.cumulative_rates.last().copied().unwrap_or(0.0)
    }

    /// Channel probabilities, summing to one.
    pub fn probabilities(&self) -> Vec<fcn> {
        let total = self.total_rate();
        let mut previous = 0.0;
        self.cumulative_rates
            .iter()
            .map(|&cumulative| {
                let probability = (cumulative - previous) / total;
                previous = cumulative;
                probability
            })
            .collect()
    }
}

/// Collisional excitation rate coefficient for the given line [cm^3/s]
/// (multiply by n_e and the lower-level population for a volume rate).
///
/// Uses the effective collision strength when available, the Van
/// Regemorter formula for permitted lines otherwise; forbidden lines
/// without collision data get no collisional excitation.
pub fn col_excitation_ratecoeff(atomic: &AtomicModel, line: &LineEntry, t_e: fcn) -> fcn {
    let epsilon_trans = atomic.epsilon_trans(line);
    let boltzmann = fcn::exp(-epsilon_trans / (KBOLTZMANN * t_e));
    match line.coll_str {
        Some(coll_str) => {
            let g_lower = atomic.stat_weight(line.element, line.ion, line.lower);
            COLL_STR_SCALE / t_e.sqrt() * coll_str / g_lower * boltzmann
        }
        None if !line.forbidden => {
            let u = epsilon_trans / (KBOLTZMANN * t_e);
            let g_bar = 0.2_f64.max(0.276 * exp1_upper_bound(u));
            VAN_REGEMORTER_C0 * t_e.sqrt() * 14.5 * (H_IONPOT / epsilon_trans).powi(2)
                * line.osc_strength
                * u
                * boltzmann
                * g_bar
        }
        None => 0.0,
    }
}

/// Collisional de-excitation rate coefficient, from detailed balance with
/// the excitation coefficient.
pub fn col_deexcitation_ratecoeff(atomic: &AtomicModel, line: &LineEntry, t_e: fcn) -> fcn {
    let g_lower = atomic.stat_weight(line.element, line.ion, line.lower);
    let g_upper = atomic.stat_weight(line.element, line.ion, line.upper);
    let epsilon_trans = atomic.epsilon_trans(line);
    col_excitation_ratecoeff(atomic, line, t_e) * g_lower / g_upper
        * fcn::exp(epsilon_trans / (KBOLTZMANN * t_e))
}

/// Approximation of exp(u) * E1(u) with the first exponential integral,
/// used only inside the g-bar estimate.
fn exp1_upper_bound(u: fcn) -> fcn {
    fcn::ln(1.0 + 1.0 / u.max(1e-10))
}

/// Sobolev escape probability (1 - exp(-tau)) / tau.
pub fn sobolev_escape_probability(tau: fcn) -> fcn {
    if tau < 1e-6 {
        1.0 - tau / 2.0
    } else {
        (1.0 - fcn::exp(-tau)) / tau
    }
}

/// Sobolev optical depth of a line in the given cell at the given time.
pub fn tau_sobolev(atomic: &AtomicModel, cell: &ModelCell, line: &LineEntry, time: fcn) -> fcn {
    let n_l = cell.level_population(atomic, line.element, line.ion, line.lower);
    let n_u = cell.level_population(atomic, line.element, line.ion, line.upper);
    let tau = (atomic.einstein_b_lu(line) * n_l - atomic.einstein_b_ul(line) * n_u)
        * HCLIGHTOVERFOURPI
        * time;
    tau.max(0.0)
}

/// Spontaneous radiative recombination rate coefficient [cm^3/s] into the
/// given continuum's lower level, from the Milne relation applied to the
/// photoionisation cross-section table.
pub fn alpha_sp(atomic: &AtomicModel, continuum_index: usize, t_e: fcn) -> fcn {
    let continuum = &atomic.bf_continua[continuum_index];
    let table = &atomic.phixs_tables[continuum.table];
    let g_lower = atomic.stat_weight(continuum.element, continuum.ion, continuum.level);
    let upper_ion = continuum.ion + 1;
    if upper_ion >= atomic.elements[continuum.element].nions() {
        return 0.0;
    }
    let g_upper = atomic.stat_weight(continuum.element, upper_ion, continuum.upper_level);

    let nu_edge = table.nu_edge;
    let dnu = nu_edge * atomic.phixs_nu_increment;
    let mut integral = 0.0;
    for (i, &sigma) in table.sigma.iter().enumerate() {
        let nu = nu_edge * (1.0 + atomic.phixs_nu_increment * i as fcn);
        integral += sigma * nu * nu * fcn::exp(-HPLANCK * (nu - nu_edge) / (KBOLTZMANN * t_e)) * dnu;
    }

    // Milne relation: the LTE Saha factor carries the exp(+E_edge/kT)
    // balancing the stimulated Boltzmann factor above
    let saha = g_lower / (2.0 * g_upper)
        * fcn::powf(
            HPLANCK * HPLANCK / (2.0 * PI * crate::constants::M_ELECTRON * KBOLTZMANN * t_e),
            1.5,
        );
    saha * 8.0 * PI / CLIGHTSQUARED * (g_upper / g_lower) * integral * continuum.probability
}

/// Photoionisation rate coefficient [1/s] out of the continuum's lower
/// level, for a diluted Planck radiation field (W, T_R).
pub fn photoionisation_ratecoeff(
    atomic: &AtomicModel,
    continuum_index: usize,
    w: fcn,
    t_r: fcn,
) -> fcn {
    let continuum = &atomic.bf_continua[continuum_index];
    let table = &atomic.phixs_tables[continuum.table];
    let nu_edge = table.nu_edge;
    let dnu = nu_edge * atomic.phixs_nu_increment;
    let mut gamma = 0.0;
    for (i, &sigma) in table.sigma.iter().enumerate() {
        let nu = nu_edge * (1.0 + atomic.phixs_nu_increment * i as fcn);
        // 4 pi J_nu / (h nu) with J_nu = W B_nu(T_R)
        let bnu = 2.0 * HPLANCK * nu.powi(3) / CLIGHTSQUARED
            / (fcn::exp(HOVERKB * nu / t_r) - 1.0).max(1e-300);
        gamma += 4.0 * PI * w * bnu / (HPLANCK * nu) * sigma * dnu;
    }
    gamma * continuum.probability
}

/// Collisional ionisation rate coefficient [cm^3/s] out of a level with
/// the given threshold, in a Seaton-style hydrogenic approximation scaled
/// by the threshold cross section.
pub fn col_ionisation_ratecoeff(sigma_threshold: fcn, chi: fcn, t_e: fcn) -> fcn {
    let u = chi / (KBOLTZMANN * t_e);
    1.55e13 / t_e.sqrt() * COLL_ION_GBAR * sigma_threshold * fcn::exp(-u) / u
}

/// Builds the outgoing-channel distribution of one macro-atom state from
/// the local cell conditions.
pub fn compute_channels(
    atomic: &AtomicModel,
    cell: &ModelCell,
    state: &MacroAtomState,
    time: fcn,
) -> MacroAtomChannels {
    let mut channels = Vec::new();
    let mut cumulative_rates = Vec::new();
    let mut total = 0.0;
    let mut push = |channel: MacroAtomChannel, rate: fcn, total: &mut fcn| {
        if rate > 0.0 && rate.is_finite() {
            *total += rate;
            channels.push(channel);
            cumulative_rates.push(*total);
        }
    };

    let level_data = atomic.level(state.element, state.ion, state.level);
    let epsilon_state = atomic.epsilon_total(state.element, state.ion, state.level);
    let nne = cell.nne;
    let t_e = cell.t_e;

    // downward bound-bound transitions out of this level
    for &lineindex in &atomic.downtrans_arena[level_data.downtrans.clone()] {
        let line = atomic.lines.entry(lineindex);
        let epsilon_trans = atomic.epsilon_trans(line);
        let epsilon_target = atomic.epsilon_total(line.element, line.ion, line.lower);
        let beta = sobolev_escape_probability(tau_sobolev(atomic, cell, line, time));
        let r_ul = line.einstein_a * beta;
        let c_ul = col_deexcitation_ratecoeff(atomic, line, t_e) * nne;

        push(
            MacroAtomChannel::RadiativeDeexcitation { line: lineindex },
            r_ul * epsilon_trans,
            &mut total,
        );
        push(MacroAtomChannel::CollisionalDeexcitation, c_ul * epsilon_trans, &mut total);
        push(
            MacroAtomChannel::InternalSameIon { level: line.lower },
            (r_ul + c_ul) * epsilon_target,
            &mut total,
        );
    }

    // upward bound-bound transitions out of this level
    for &lineindex in &atomic.uptrans_arena[level_data.uptrans.clone()] {
        let line = atomic.lines.entry(lineindex);
        let c_lu = col_excitation_ratecoeff(atomic, line, t_e) * nne;
        // radiative excitation from the diluted field, reduced by the
        // Sobolev escape probability of the line
        let beta = sobolev_escape_probability(tau_sobolev(atomic, cell, line, time));
        let bnu = 2.0 * HPLANCK * line.nu.powi(3) / CLIGHTSQUARED
            / (fcn::exp(HOVERKB * line.nu / cell.t_r) - 1.0).max(1e-300);
        let r_lu = atomic.einstein_b_lu(line) * cell.w * bnu * beta;
        push(
            MacroAtomChannel::InternalSameIon { level: line.upper },
            (r_lu + c_lu) * epsilon_state,
            &mut total,
        );
    }

    // recombination: only out of the ground level, into the ion below
    if state.level == 0 && state.ion > 0 {
        for (continuum_index, continuum) in atomic.bf_continua.iter().enumerate() {
            if continuum.element != state.element
                || continuum.ion + 1 != state.ion
                || continuum.upper_level != 0
            {
                continue;
            }
            let alpha = alpha_sp(atomic, continuum_index, t_e) * nne;
            let chi = HPLANCK * continuum.nu_edge;
            let g_lower = atomic.stat_weight(continuum.element, continuum.ion, continuum.level);
            let g_upper = atomic.stat_weight(state.element, state.ion, 0);
            let sigma_threshold = atomic.phixs_tables[continuum.table]
                .sigma
                .first()
                .copied()
                .unwrap_or(0.0);
            let c_ion = col_ionisation_ratecoeff(sigma_threshold, chi, t_e);
            let c_rec = c_ion * nne * nne * cell.saha_factor(g_lower, g_upper, chi)
                * fcn::exp(-chi / (KBOLTZMANN * t_e));

            let epsilon_target =
                atomic.epsilon_total(continuum.element, continuum.ion, continuum.level);
            push(
                MacroAtomChannel::RadiativeRecombination { continuum: continuum_index },
                alpha * chi,
                &mut total,
            );
            push(MacroAtomChannel::CollisionalRecombination, c_rec * chi, &mut total);
            push(
                MacroAtomChannel::InternalCrossIon {
                    ion: continuum.ion,
                    level: continuum.level,
                },
                (alpha + c_rec) * epsilon_target,
                &mut total,
            );
        }
    }

    // ionisation into the ion above
    if state.ion + 1 < atomic.elements[state.element].nions() {
        for (continuum_index, continuum) in atomic.bf_continua.iter().enumerate() {
            if continuum.element != state.element
                || continuum.ion != state.ion
                || continuum.level != state.level
            {
                continue;
            }
            let gamma = photoionisation_ratecoeff(atomic, continuum_index, cell.w, cell.t_r);
            let chi = HPLANCK * continuum.nu_edge;
            let sigma_threshold = atomic.phixs_tables[continuum.table]
                .sigma
                .first()
                .copied()
                .unwrap_or(0.0);
            let c_ion = col_ionisation_ratecoeff(sigma_threshold, chi, t_e) * nne;
            push(
                MacroAtomChannel::InternalCrossIon {
                    ion: continuum.ion + 1,
                    level: continuum.upper_level,
                },
                (gamma + c_ion) * epsilon_state,
                &mut total,
            );
        }
    }

    MacroAtomChannels {
        channels,
        cumulative_rates,
    }
}

/// Processes a macro-atom packet until it deactivates into an r-packet or
/// a k-packet.
pub fn do_macroatom(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker) {
    let PacketType::MacroAtom(mut state) = pkt.ptype else {
        crate::exit_with_error!("[fatal] do_macroatom called on a non-macro-atom packet");
    };
    let Some(model_cell) = env.grid.model_cell(pkt.cell) else {
        crate::exit_with_error!("[fatal] macro-atom activated in an empty cell");
    };
    let cell = &env.cells[model_cell];
    let time = pkt.prop_time;

    for _ in 0..MAX_INTERNAL_JUMPS {
        let channels = compute_channels(env.atomic, cell, &state, time);
        if channels.total_rate() <= 0.0 {
            // isolated state with no outgoing channel: thermalise
            warn!(
                "macro-atom state (element {} ion {} level {}) has no channels; converting to k-packet",
                state.element, state.ion, state.level
            );
            pkt.ptype = PacketType::KPacket;
            return;
        }

        let pick = worker.rng.sample_cumulative(&channels.cumulative_rates);
        match channels.channels[pick] {
            MacroAtomChannel::RadiativeDeexcitation { line } => {
                let line_entry = env.atomic.lines.entry(line);
                pkt.nu_cmf = line_entry.nu;
                pkt.emit_rpkt(&mut worker.rng);
                pkt.record_true_emission(EmissionType::BoundBound(line));
                // never re-absorb in the emitting line during this step
                pkt.next_trans = line + 1;
                return;
            }
            MacroAtomChannel::CollisionalDeexcitation
            | MacroAtomChannel::CollisionalRecombination => {
                pkt.ptype = PacketType::KPacket;
                return;
            }
            MacroAtomChannel::RadiativeRecombination { continuum } => {
                let nu_edge = env.atomic.bf_continua[continuum].nu_edge;
                // edge frequency plus a thermal tail
                let thermal = -KBOLTZMANN * cell.t_e / HPLANCK * fcn::ln(worker.rng.uniform_pos());
                pkt.nu_cmf = nu_edge + thermal;
                pkt.emit_rpkt(&mut worker.rng);
                pkt.record_true_emission(EmissionType::BoundFree(continuum));
                pkt.next_trans = env
                    .atomic
                    .lines
                    .sync_transition_hint(pkt.nu_cmf, 0);
                return;
            }
            MacroAtomChannel::InternalSameIon { level } => {
                state.level = level;
                state.activating_line = None;
            }
            MacroAtomChannel::InternalCrossIon { ion, level } => {
                state.ion = ion;
                state.level = level;
                state.activating_line = None;
            }
        }
        pkt.ptype = PacketType::MacroAtom(state);
    }

    warn!(
        "macro-atom exceeded {} internal jumps in cell {}; thermalising",
        MAX_INTERNAL_JUMPS, model_cell
    );
    pkt.ptype = PacketType::KPacket;
}

/// Entry point for a non-thermal lepton: selects ionisation or excitation
/// using the Spencer-Fano deposition-fraction lists, falling through to
/// the thermal pool.
pub fn do_ntlepton(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker) {
    let Some(model_cell) = env.grid.model_cell(pkt.cell) else {
        // leptons in empty cells can only heat nothing; drop to k-packet
        pkt.ptype = PacketType::KPacket;
        return;
    };
    let solution = &env.nt_solutions[model_cell];

    let mut zrand = worker.rng.uniform();
    if zrand < solution.frac_ionisation as fcn {
        for channel in &solution.ionisations {
            if zrand < channel.frac_deposition {
                let upper_ion = solution.sample_upper_ion(
                    channel.element,
                    channel.ion,
                    env.atomic.elements[channel.element].nions(),
                    &mut worker.rng,
                );
                pkt.ptype = PacketType::MacroAtom(MacroAtomState {
                    element: channel.element,
                    ion: upper_ion,
                    level: 0,
                    activating_line: None,
                });
                pkt.interactions += 1;
                return;
            }
            zrand -= channel.frac_deposition;
        }
    } else if zrand < (solution.frac_ionisation + solution.frac_excitation) as fcn {
        zrand -= solution.frac_ionisation as fcn;
        for channel in &solution.excitations {
            if zrand < channel.frac_deposition {
                let line = env.atomic.lines.entry(channel.line);
                pkt.ptype = PacketType::MacroAtom(MacroAtomState {
                    element: line.element,
                    ion: line.ion,
                    level: line.upper,
                    activating_line: None,
                });
                pkt.interactions += 1;
                return;
            }
            zrand -= channel.frac_deposition;
        }
    }

    // remaining deposition heats the thermal pool
    env.counters.kpkts_from_lepton.inc();
    pkt.ptype = PacketType::KPacket;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpkt::tests::three_line_atomic_model;

    fn populated_cell(atomic: &AtomicModel) -> ModelCell {
        let mut cell = ModelCell::new(1, 0);
        cell.rho_init = 1.0e-14;
        cell.abundances = vec![1.0];
        cell.t_e = 1.0e4;
        cell.t_r = 1.0e4;
        cell.w = 0.5;
        cell.nne = 1.0e8;
        cell.nne_tot = 1.0e8;
        cell.ion_populations = vec![vec![1.0e8]];
        cell.update_partition_functions(atomic);
        cell
    }

    #[test]
    fn channel_probabilities_sum_to_one() {
        let atomic = three_line_atomic_model();
        let cell = populated_cell(&atomic);
        let state = MacroAtomState {
            element: 0,
            ion: 0,
            level: 3,
            activating_line: Some(0),
        };
        let channels = compute_channels(&atomic, &cell, &state, 1.0e6);
        assert!(!channels.channels.is_empty());
        let sum: fcn = channels.probabilities().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "probability sum {}", sum);
    }

    #[test]
    fn excited_state_has_radiative_deexcitation_channel() {
        let atomic = three_line_atomic_model();
        let cell = populated_cell(&atomic);
        let state = MacroAtomState {
            element: 0,
            ion: 0,
            level: 2,
            activating_line: Some(1),
        };
        let channels = compute_channels(&atomic, &cell, &state, 1.0e6);
        assert!(channels
            .channels
            .iter()
            .any(|channel| matches!(channel, MacroAtomChannel::RadiativeDeexcitation { .. })));
        assert!(channels
            .channels
            .iter()
            .any(|channel| matches!(channel, MacroAtomChannel::InternalSameIon { .. })));
    }

    #[test]
    fn detailed_balance_between_collisional_rates() {
        let atomic = three_line_atomic_model();
        let line = atomic.lines.entry(1);
        let t_e = 1.2e4;
        let c_lu = col_excitation_ratecoeff(&atomic, line, t_e);
        let c_ul = col_deexcitation_ratecoeff(&atomic, line, t_e);
        let g_lower = atomic.stat_weight(line.element, line.ion, line.lower);
        let g_upper = atomic.stat_weight(line.element, line.ion, line.upper);
        let boltzmann = fcn::exp(-atomic.epsilon_trans(line) / (KBOLTZMANN * t_e));
        // in LTE, upward and downward collision rates balance
        let lhs = c_lu * g_lower;
        let rhs = c_ul * g_upper * boltzmann;
        assert!((lhs - rhs).abs() / lhs < 1e-10);
    }

    #[test]
    fn sobolev_escape_probability_limits() {
        assert!((sobolev_escape_probability(1e-12) - 1.0).abs() < 1e-9);
        assert!(sobolev_escape_probability(50.0) < 0.03);
    }
}
