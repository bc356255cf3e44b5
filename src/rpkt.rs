//! The r-packet propagation kernel.

use crate::atomic::AtomicModel;
use crate::cells::{CellCache, Estimators, ModelCell};
use crate::constants::{fcn, CLIGHT, HCLIGHTOVERFOURPI};
use crate::grid::{GridGeometry, PropagationGrid};
use crate::io::input::RunParameters;
use crate::nonthermal::NtSolution;
use crate::opacity::{calculate_continuum_opacity, sample_bf_continuum, ContinuumOpacity};
use crate::packets::{MacroAtomState, Packet, PacketType};
use crate::random::RandomStream;
use crate::stats::Counters;
use atomic_counter::AtomicCounter;
use log::{debug, warn};

/// Near-boundary clamp applied when a line event lands past the abort
/// distance despite the frequency checks.
const ABORT_DIST_CLAMP: fcn = 1.0 - 2e-8;

/// Shared read-only state threaded through the packet handlers.
pub struct PropagationEnv<'a> {
    pub grid: &'a PropagationGrid,
    pub atomic: &'a AtomicModel,
    pub cells: &'a [ModelCell],
    pub estimators: &'a Estimators,
    pub counters: &'a Counters,
    pub nt_solutions: &'a [NtSolution],
    pub params: &'a RunParameters,
    /// Maximum distance a packet may travel in one step [cm].
    pub max_path_step: fcn,
}

/// Mutable per-worker scratch state.
pub struct Worker {
    pub rng: RandomStream,
    pub opacity: ContinuumOpacity,
    pub cache: CellCache,
}

impl Worker {
    pub fn new(rng: RandomStream, n_bf_continua: usize) -> Self {
        Self {
            rng,
            opacity: ContinuumOpacity::new(),
            cache: CellCache::new(n_bf_continua),
        }
    }
}

/// The physical event terminating a propagation segment.
#[derive(Clone, Copy, Debug)]
enum RpktEvent {
    Continuum,
    BoundBound {
        line: usize,
        mastate: MacroAtomState,
    },
}

/// Computes the distance to the next physical event (continuum or
/// bound-bound) within the current cell, walking the line list from the
/// packet's transition hint.
///
/// Must only be called for non-empty, non-grey cells. Returns infinity when
/// no event occurs before `abort_dist` (the boundary or timestep end).
fn get_event(
    env: &PropagationEnv,
    pkt: &mut Packet,
    worker: &mut Worker,
    model_cell: usize,
    tau_rnd: fcn,
    abort_dist: fcn,
) -> (fcn, Option<RpktEvent>) {
    let cell = &env.cells[model_cell];
    let lines = &env.atomic.lines;

    // comoving frequency the packet will have at the abort point
    let mut dummy_abort = pkt.clone();
    dummy_abort.advance(abort_dist);
    let nu_cmf_abort = dummy_abort.nu_cmf;
    debug_assert!(nu_cmf_abort <= pkt.nu_cmf);

    let mut dummy = pkt.clone();

    calculate_continuum_opacity(
        &mut worker.opacity,
        cell,
        model_cell,
        env.atomic,
        pkt.nu_cmf,
        env.params.opacity_case,
        &mut worker.cache,
    );
    // opacity is computed in the comoving frame; the Doppler factor
    // converts it to a rest-frame path opacity
    let kap_cont = worker.opacity.total * pkt.doppler();

    let mut tau = 0.0;
    let mut dist = 0.0;

    loop {
        let lineindex = lines.closest_transition(dummy.nu_cmf, dummy.next_trans);

        let Some(lineindex) = lineindex else {
            // no line interaction possible any more; only the continuum
            // can terminate the segment
            dummy.next_trans = lines.len() + 1;
            pkt.next_trans = dummy.next_trans;

            let tau_cont = kap_cont * (abort_dist - dist);
            if tau_rnd - tau > tau_cont {
                return (fcn::INFINITY, None);
            }
            return (dist + (tau_rnd - tau) / kap_cont, Some(RpktEvent::Continuum));
        };

        let line = lines.entry(lineindex);
        let nu_trans = line.nu;

        // further interactions must be at lower frequencies, so one line
        // never scatters a packet twice in a single propagation step
        dummy.next_trans = lineindex + 1;

        let mut ldist = if dummy.nu_cmf <= nu_trans {
            // propagated slightly past the resonance; do not miss the line
            0.0
        } else if !env.params.relativistic_doppler {
            CLIGHT * dummy.prop_time * (dummy.nu_cmf / nu_trans - 1.0)
        } else {
            relativistic_line_distance(&dummy, nu_trans)
        };

        if ldist < 0.0 {
            warn!("line distance {:.3e} < 0, clamping to zero", ldist);
            if ldist < -100.0 {
                crate::exit_with_error!(
                    "[fatal] line distance {:.6e} below clamp range for packet {}",
                    ldist,
                    pkt.id
                );
            }
            ldist = 0.0;
        }

        let tau_cont = kap_cont * ldist;

        if tau_rnd - tau > tau_cont {
            // the continuum optical depth budget reaches the line
            if nu_trans < nu_cmf_abort {
                // the line lies past the boundary or timestep end; back up
                // one line so the next cell starts with it
                dummy.next_trans -= 1;
                pkt.next_trans = dummy.next_trans;
                return (fcn::INFINITY, None);
            }

            let n_u = cell.level_population(env.atomic, line.element, line.ion, line.upper);
            let n_l = cell.level_population(env.atomic, line.element, line.ion, line.lower);
            let b_ul = env.atomic.einstein_b_ul(line);
            let b_lu = env.atomic.einstein_b_lu(line);

            let mut tau_line =
                (b_lu * n_l - b_ul * n_u) * HCLIGHTOVERFOURPI * dummy.prop_time;
            if tau_line < 0.0 {
                // negative Sobolev depths are numerical artefacts at cold
                // edges; clamp and continue
                tau_line = 0.0;
            }

            if tau_rnd - tau > tau_cont + tau_line {
                // still below the optical depth budget: pass the line
                dist += ldist;
                tau += tau_cont + tau_line;
                dummy.advance(ldist);
                env.estimators.update_line_estimator(
                    model_cell,
                    lineindex,
                    dummy.prop_time * CLIGHT * dummy.e_cmf / dummy.nu_cmf,
                );
            } else {
                // bound-bound event at this line
                let mastate = MacroAtomState {
                    element: line.element,
                    ion: line.ion,
                    level: line.upper,
                    activating_line: Some(lineindex),
                };

                let mut edist = dist + ldist;
                if edist >= abort_dist {
                    // the frequency checks guarantee the resonance lies
                    // inside the segment; clamp accumulated rounding error
                    let edist_new = abort_dist * ABORT_DIST_CLAMP;
                    warn!(
                        "bound-bound event distance {:.8e} >= abort distance {:.8e}; clamping to {:.8e}",
                        edist, abort_dist, edist_new
                    );
                    edist = edist_new;
                }

                pkt.next_trans = dummy.next_trans;
                return (edist, Some(RpktEvent::BoundBound { line: lineindex, mastate }));
            }
        } else {
            // continuum event before the line is reached
            let edist = dist + (tau_rnd - tau) / kap_cont;
            dummy.next_trans -= 1;
            pkt.next_trans = dummy.next_trans;
            return (edist, Some(RpktEvent::Continuum));
        }
    }
}

/// The relativistic line-crossing distance, which depends on the packet
/// position and direction as well as the frequencies.
fn relativistic_line_distance(pkt: &Packet, nu_trans: fcn) -> fcn {
    let nu_r = nu_trans / pkt.nu_rf;
    let ct = CLIGHT * pkt.prop_time;
    let r = pkt.pos.length();
    let mu = pkt.dir.dot(&pkt.pos) / r;
    -mu * r
        + (ct
            - nu_r
                * nu_r
                * fcn::sqrt(
                    ct * ct - (1.0 + r * r * (1.0 - mu * mu) * (1.0 + nu_r.powi(-2))),
                ))
            / (1.0 + nu_r * nu_r)
}

/// Handles a continuum event: electron scattering, free-free absorption or
/// bound-free absorption, selected in proportion to their opacities.
fn rpkt_event_continuum(
    env: &PropagationEnv,
    pkt: &mut Packet,
    worker: &mut Worker,
    _model_cell: usize,
) {
    let dopplerfactor = pkt.doppler();
    let kappa_cont = worker.opacity.total * dopplerfactor;
    let sigma = worker.opacity.es * dopplerfactor;
    let kappa_ff = worker.opacity.ff * dopplerfactor;
    let kappa_bf = worker.opacity.bf * dopplerfactor;

    let zrand = worker.rng.uniform();
    if zrand * kappa_cont < sigma {
        // coherent electron scattering: nu_cmf is conserved
        env.counters.electron_scatterings.inc();
        pkt.electron_scatter(&mut worker.rng);
        // the transition hint survives scattering; the comoving frequency
        // is unchanged so the line history stays valid
    } else if zrand * kappa_cont < sigma + kappa_ff {
        // free-free absorption thermalises the packet
        env.counters.kpkts_from_ff.inc();
        pkt.interactions += 1;
        pkt.absorption.line = None;
        pkt.ptype = PacketType::KPacket;
    } else if zrand * kappa_cont < sigma + kappa_ff + kappa_bf {
        // bound-free absorption
        pkt.absorption.line = None;

        let kappa_bf_cmf = worker.opacity.bf;
        let zrand2 = worker.rng.uniform();
        let continuum_index = sample_bf_continuum(&worker.cache, kappa_bf_cmf, zrand2);
        let continuum = &env.atomic.bf_continua[continuum_index];
        let nu_edge = continuum.nu_edge;
        let nu = pkt.nu_cmf;

        let zrand3 = worker.rng.uniform();
        if zrand3 < nu_edge / nu {
            // the ionisation energy activates a macro-atom in the upper ion
            env.counters.macroatom_activations_bf.inc();
            pkt.interactions += 1;
            pkt.ptype = PacketType::MacroAtom(MacroAtomState {
                element: continuum.element,
                ion: continuum.ion + 1,
                level: continuum.upper_level,
                activating_line: None,
            });
        } else {
            // the leftover photon energy thermalises
            env.counters.kpkts_from_bf.inc();
            pkt.interactions += 1;
            pkt.ptype = PacketType::KPacket;
        }
    } else {
        crate::exit_with_error!(
            "[fatal] could not select a continuum process: zrand*kappa {:.4e} es {:.4e} ff {:.4e} bf {:.4e}",
            zrand * kappa_cont,
            sigma,
            kappa_ff,
            kappa_bf
        );
    }
}

/// Handles a bound-bound event: activates the macro-atom in the line's
/// upper level and records the absorption for the spectra.
fn rpkt_event_boundbound(env: &PropagationEnv, pkt: &mut Packet, line: usize, mastate: MacroAtomState) {
    env.counters.macroatom_activations_bb.inc();
    pkt.interactions += 1;

    pkt.absorption.line = Some(line);
    pkt.absorption.nu_rf = pkt.nu_rf;
    pkt.absorption.direction = pkt.dir;
    pkt.ptype = PacketType::MacroAtom(mastate);
}

/// Event handling for optically thick cells: grey coherent scattering only.
fn rpkt_event_thickcell(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker) {
    env.counters.electron_scatterings.inc();
    pkt.interactions += 1;
    pkt.nscatterings += 1;
    pkt.emit_rpkt(&mut worker.rng);
    pkt.emission.position = pkt.pos;
    pkt.emission.time = pkt.prop_time;
}

/// Accumulates the volume estimators for a path segment.
fn update_estimators(env: &PropagationEnv, pkt: &Packet, worker: &Worker, distance: fcn) {
    let Some(model_cell) = env.grid.model_cell(pkt.cell) else {
        return;
    };
    let distance_e_cmf = distance * pkt.e_cmf;
    let nu = pkt.nu_cmf;
    env.estimators.update_radfield(model_cell, distance_e_cmf, nu);
    env.estimators.ff_heating[model_cell].add(distance_e_cmf * worker.opacity.ff_heating);

    let nelements = env.atomic.nelements();
    let max_nions = env.atomic.max_nions();
    let distance_e_cmf_over_nu = distance_e_cmf / nu;
    for (index, continuum) in env.atomic.bf_continua.iter().enumerate() {
        if nu <= continuum.nu_edge {
            // the list is sorted by edge, so no later continuum is reachable
            break;
        }
        if continuum.level != 0 {
            continue;
        }
        let contr = worker.cache.gamma_contr[index];
        if contr <= 0.0 {
            continue;
        }
        let slot = env.estimators.ion_slot(
            model_cell,
            nelements,
            max_nions,
            continuum.element,
            continuum.ion,
        );
        env.estimators.photoion[slot].add(contr * distance_e_cmf_over_nu);
        env.estimators.bf_heating[slot]
            .add(contr * distance_e_cmf * (1.0 - continuum.nu_edge / nu));
        if !env.estimators.photoion[slot].get().is_finite() {
            crate::exit_with_error!(
                "[fatal] photoionisation estimator became non-finite: cell {} element {} ion {}",
                model_cell,
                continuum.element,
                continuum.ion
            );
        }
    }
}

/// Moves an r-packet one step: to the cell boundary, the next physical
/// event, or the end of the timestep, whichever comes first.
///
/// Returns `true` while the packet remains an r-packet in the same (or an
/// empty) model cell with time left in the step.
fn do_rpkt_step(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker, t2: fcn) -> bool {
    let old_model_cell = env.grid.model_cell(pkt.cell);

    let tau_next = worker.rng.optical_depth();

    let Some(boundary) = env.grid.boundary_distance(
        pkt.cell,
        &pkt.pos,
        &pkt.dir,
        pkt.prop_time,
        pkt.last_cross,
    ) else {
        crate::exit_with_error!(
            "[fatal] no forward boundary found for r-packet {} in cell {} at t {:.6e}",
            pkt.id,
            pkt.cell,
            pkt.prop_time
        );
    };
    pkt.last_cross = boundary.last_cross;

    if boundary.distance == 0.0 {
        // tolerance reconciliation re-homed the packet
        pkt.change_cell(boundary.crossing, env.counters);
        let model_cell = if pkt.ptype == PacketType::Escaped {
            None
        } else {
            env.grid.model_cell(pkt.cell)
        };
        return pkt.ptype == PacketType::RPacket
            && (model_cell.is_none() || model_cell == old_model_cell);
    }

    let mut sdist = boundary.distance;
    let mut crossing = Some(boundary.crossing);

    let max_sdist = match env.grid.geometry() {
        GridGeometry::Spherical1D => {
            2.0 * env.grid.r_max() * (pkt.prop_time + sdist / CLIGHT) / env.grid.t_min()
        }
        GridGeometry::Cartesian3D => env.grid.r_max() * pkt.prop_time / env.grid.t_min(),
    };
    if sdist > max_sdist {
        crate::exit_with_error!(
            "[fatal] unreasonably large boundary distance {:.6e} for r-packet {}",
            sdist,
            pkt.id
        );
    }
    if sdist < 0.0 {
        warn!("negative boundary distance {:.6e} for packet {}", sdist, pkt.id);
        sdist = 0.0;
    }
    if sdist > env.max_path_step {
        sdist = env.max_path_step;
        crossing = None;
    }

    let tdist = (t2 - pkt.prop_time) * CLIGHT;
    debug_assert!(tdist >= 0.0);

    let mut resync_line_hint = false;
    let (edist, event) = match old_model_cell {
        None => {
            // empty cells have no physical events
            resync_line_hint = true;
            (fcn::INFINITY, None)
        }
        Some(model_cell) if env.cells[model_cell].thick => {
            // grey approximation: electron scattering only
            let cell = &env.cells[model_cell];
            let kappa =
                cell.kappa_grey * cell.rho(pkt.prop_time, env.grid.t_min()) * pkt.doppler();
            resync_line_hint = true;
            (tau_next / kappa, None)
        }
        Some(model_cell) => get_event(
            env,
            pkt,
            worker,
            model_cell,
            tau_next,
            fcn::min(tdist, sdist),
        ),
    };
    debug_assert!(edist >= 0.0);

    if sdist < tdist && sdist < edist {
        // boundary crossing comes first
        pkt.advance(sdist / 2.0);
        update_estimators(env, pkt, worker, sdist);
        pkt.advance(sdist / 2.0);

        if let Some(crossing) = crossing {
            pkt.change_cell(crossing, env.counters);
        }
        pkt.scat_count = 0;

        let model_cell = if pkt.ptype == PacketType::Escaped {
            None
        } else {
            env.grid.model_cell(pkt.cell)
        };
        // after drifting over empty or grey cells the transition hint may
        // lag many lines behind the comoving frequency
        if resync_line_hint && pkt.ptype == PacketType::RPacket {
            if let Some(mgi) = model_cell {
                if !env.cells[mgi].thick {
                    pkt.next_trans = env
                        .atomic
                        .lines
                        .sync_transition_hint(pkt.nu_cmf, pkt.next_trans);
                }
            }
        }

        pkt.ptype == PacketType::RPacket
            && (model_cell.is_none() || model_cell == old_model_cell)
    } else if edist <= sdist && edist < tdist {
        // physical event comes first
        pkt.advance(edist / 2.0);
        update_estimators(env, pkt, worker, edist);
        pkt.advance(edist / 2.0);

        match (old_model_cell, event) {
            (Some(model_cell), _) if env.cells[model_cell].thick => {
                rpkt_event_thickcell(env, pkt, worker);
            }
            (Some(model_cell), Some(RpktEvent::Continuum)) => {
                rpkt_event_continuum(env, pkt, worker, model_cell);
            }
            (Some(_), Some(RpktEvent::BoundBound { line, mastate })) => {
                rpkt_event_boundbound(env, pkt, line, mastate);
            }
            _ => {
                crate::exit_with_error!("[fatal] r-packet event in an empty cell");
            }
        }

        let model_cell = env.grid.model_cell(pkt.cell);
        pkt.ptype == PacketType::RPacket
            && (model_cell.is_none() || model_cell == old_model_cell)
    } else if tdist < sdist && tdist < edist {
        // end of timestep comes first
        pkt.advance(tdist / 2.0);
        update_estimators(env, pkt, worker, tdist);
        pkt.advance(tdist / 2.0);
        pkt.prop_time = t2;

        if resync_line_hint {
            pkt.next_trans = env
                .atomic
                .lines
                .sync_transition_hint(pkt.nu_cmf, pkt.next_trans);
        }
        false
    } else {
        crate::exit_with_error!(
            "[fatal] failed to identify the governing distance: edist {:.6e} sdist {:.6e} tdist {:.6e}",
            edist,
            sdist,
            tdist
        );
    }
}

/// Propagates an r-packet until it escapes, reaches the end of the
/// timestep, changes type, or enters a different model cell.
pub fn do_rpkt(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker, t2: fcn) {
    if let Some(id) = env.params.debug_packet {
        if id == pkt.id {
            debug!(
                "r-packet {}: cell {} nu_cmf {:.6e} next_trans {}",
                pkt.id, pkt.cell, pkt.nu_cmf, pkt.next_trans
            );
        }
    }
    while do_rpkt_step(env, pkt, worker, t2) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::atomic::{Element, Ion, Level, LineEntry, LineList};
    use crate::geometry::Vec3;

    pub(crate) fn three_line_atomic_model() -> AtomicModel {
        let level = |energy: fcn, g: fcn| Level {
            energy,
            stat_weight: g,
            downtrans: 0..0,
            uptrans: 0..0,
        };
        let line = |nu: fcn, lower: usize, upper: usize| LineEntry {
            nu,
            element: 0,
            ion: 0,
            lower,
            upper,
            einstein_a: 1.0e8,
            osc_strength: 0.5,
            coll_str: None,
            forbidden: false,
        };
        let mut atomic = AtomicModel {
            elements: vec![Element {
                atomic_number: 8,
                mass: 16.0 * crate::constants::M_H,
                ions: vec![Ion {
                    ion_stage: 1,
                    ionpot: 13.6 * crate::constants::EV_TO_ERG,
                    levels: vec![
                        level(0.0, 1.0),
                        level(crate::constants::HPLANCK * 1.0e15, 3.0),
                        level(crate::constants::HPLANCK * 2.0e15, 5.0),
                        level(crate::constants::HPLANCK * 3.0e15, 7.0),
                    ],
                }],
            }],
            lines: LineList::from_unsorted(vec![
                line(3.0e15, 0, 3),
                line(2.0e15, 0, 2),
                line(1.0e15, 0, 1),
            ]),
            downtrans_arena: Vec::new(),
            uptrans_arena: Vec::new(),
            phixs_tables: Vec::new(),
            bf_continua: Vec::new(),
            phixs_nu_increment: 0.1,
        };
        atomic.rebuild_transition_arenas();
        atomic
    }

    pub(crate) fn test_params() -> RunParameters {
        RunParameters {
            seed: 1,
            n_timesteps: 10,
            itstep: 0,
            ftstep: 10,
            t_min: 1.0e5,
            t_max: 1.0e6,
            nusyn_min: 1.0e19,
            nusyn_max: 1.0e21,
            n_syn_times: 10,
            tsyn_start: 1.0e5,
            tsyn_end: 1.0e6,
            model_type: 3,
            r_lc_mode: crate::io::input::RLightCurveMode::Off,
            n_out_it: 1,
            grey_gamma_opacity: false,
            observer_direction: Vec3::new(0.0, 0.0, 1.0),
            opacity_case: 4,
            rho_crit_para: 1.0,
            debug_packet: None,
            continue_from_checkpoint: false,
            radfield_cutoff_lambda: 3.0e-4,
            n_lte_timesteps: 3,
            cell_grey_tau_threshold: 1.0e3,
            n_grey_timesteps: 3,
            max_bf_continua_per_ion: None,
            n_procs_spectrum: 1,
            emission_resolution: true,
            kpkt_diffusion_fraction: 0.0,
            n_kpkt_diffusion_timesteps: 0,
            relativistic_doppler: false,
        }
    }

    fn test_cell(atomic: &AtomicModel) -> ModelCell {
        let mut cell = ModelCell::new(1, 0);
        cell.rho_init = 1.0e-15;
        cell.abundances = vec![1.0];
        cell.t_e = 8.0e3;
        cell.t_r = 8.0e3;
        // essentially no continuum so line events dominate
        cell.nne = 1.0;
        cell.nne_tot = 1.0;
        cell.ion_populations = vec![vec![1.0e7]];
        cell.update_partition_functions(atomic);
        cell
    }

    struct KernelFixture {
        grid: PropagationGrid,
        atomic: AtomicModel,
        cells: Vec<ModelCell>,
        estimators: Estimators,
        counters: Counters,
        nt_solutions: Vec<NtSolution>,
        params: RunParameters,
    }

    impl KernelFixture {
        fn new() -> Self {
            let atomic = three_line_atomic_model();
            let cells = vec![test_cell(&atomic)];
            let grid =
                PropagationGrid::cartesian([1, 1, 1], 1.0e15, 1.0e5, vec![Some(0)]);
            let estimators =
                Estimators::new(1, 1, 1, 1.0e13, 1.0e16, 16, &[], atomic.lines.len());
            Self {
                grid,
                atomic,
                cells,
                estimators,
                counters: Counters::new(),
                nt_solutions: vec![NtSolution::default()],
                params: test_params(),
            }
        }

        fn env(&self) -> PropagationEnv<'_> {
            PropagationEnv {
                grid: &self.grid,
                atomic: &self.atomic,
                cells: &self.cells,
                estimators: &self.estimators,
                counters: &self.counters,
                nt_solutions: &self.nt_solutions,
                params: &self.params,
                max_path_step: 1.0e30,
            }
        }
    }

    fn rpkt_at_origin(nu_cmf: fcn) -> Packet {
        let mut pkt = Packet::placeholder(0);
        pkt.ptype = PacketType::RPacket;
        pkt.pos = Vec3::new(1.0e10, 0.0, 0.0);
        pkt.dir = Vec3::new(1.0, 0.0, 0.0);
        pkt.prop_time = 1.0e5;
        pkt.nu_rf = nu_cmf / crate::geometry::doppler_factor(&pkt.pos, &pkt.dir, pkt.prop_time);
        pkt.e_rf = 1.0e-10 / crate::geometry::doppler_factor(&pkt.pos, &pkt.dir, pkt.prop_time);
        pkt.nu_cmf = nu_cmf;
        pkt.e_cmf = 1.0e-10;
        pkt
    }

    #[test]
    fn line_walk_activates_macro_atom_at_reachable_line() {
        let fixture = KernelFixture::new();
        let env = fixture.env();
        let mut worker = Worker::new(RandomStream::new(1, 0, 0), 0);
        worker.cache.reset_for_cell(0);

        // nu_cmf = 2.5e15 with hint 0: the first reachable line is index 1
        // (nu = 2e15); with a huge optical depth budget never reached by the
        // tiny continuum, the walk must stop there
        let mut pkt = rpkt_at_origin(2.5e15);
        let (edist, event) = get_event(&env, &mut pkt, &mut worker, 0, 1.0e3, 1.0e15);

        match event {
            Some(RpktEvent::BoundBound { line, mastate }) => {
                assert_eq!(line, 1);
                assert_eq!(mastate.level, 2);
                assert_eq!(mastate.activating_line, Some(1));
            }
            other => panic!("Expected a bound-bound event, got {:?}", other),
        }
        // the resonance distance c t (nu/nu_line - 1) = c * 1e5 * 0.25
        let expected = CLIGHT * 1.0e5 * 0.25;
        assert!((edist - expected).abs() / expected < 1e-2);
        // the hint advanced past the interacting line
        assert_eq!(pkt.next_trans, 2);
    }

    #[test]
    fn line_walk_returns_no_event_past_redmost_line() {
        let fixture = KernelFixture::new();
        let env = fixture.env();
        let mut worker = Worker::new(RandomStream::new(1, 0, 0), 0);
        worker.cache.reset_for_cell(0);

        // hint past the end and nu_cmf below every line: continuum only,
        // and with a huge budget the segment has no event at all
        let mut pkt = rpkt_at_origin(0.5e15);
        pkt.next_trans = 3;
        let (edist, event) = get_event(&env, &mut pkt, &mut worker, 0, 1.0e3, 1.0e14);
        assert!(event.is_none());
        assert!(edist.is_infinite());
    }

    #[test]
    fn continuum_event_when_budget_is_tiny() {
        let mut fixture = KernelFixture::new();
        // boost the electron density so the continuum dominates
        fixture.cells[0].nne = 1.0e12;
        fixture.cells[0].nne_tot = 1.0e12;
        let env = fixture.env();
        let mut worker = Worker::new(RandomStream::new(1, 0, 0), 0);
        worker.cache.reset_for_cell(0);

        let mut pkt = rpkt_at_origin(2.5e15);
        let (edist, event) = get_event(&env, &mut pkt, &mut worker, 0, 1.0e-8, 1.0e15);
        assert!(matches!(event, Some(RpktEvent::Continuum)));
        assert!(edist.is_finite() && edist > 0.0);
    }

    #[test]
    fn rpkt_step_to_timestep_end_updates_estimators() {
        let fixture = KernelFixture::new();
        let env = fixture.env();
        let mut worker = Worker::new(RandomStream::new(2, 0, 0), 0);
        worker.cache.reset_for_cell(0);

        let mut pkt = rpkt_at_origin(0.5e15);
        pkt.next_trans = env.atomic.lines.len() + 1;
        let t2 = pkt.prop_time + 10.0;
        do_rpkt(&env, &mut pkt, &mut worker, t2);

        assert_eq!(pkt.ptype, PacketType::RPacket);
        assert!((pkt.prop_time - t2).abs() < 1e-6);
        assert!(env.estimators.j[0].get() > 0.0);
    }
}
