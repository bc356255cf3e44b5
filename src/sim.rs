//! The timestep driver: grid updates, packet-pool propagation and output.

use crate::atomic::AtomicModel;
use crate::cells::{update_cell_thermodynamics, Estimators, ModelCell};
use crate::constants::{fcn, DAY_TO_S, MEV_TO_ERG, SIGMA_T};
use crate::decay::{DecayData, DecayType};
use crate::gamma::{do_gamma, pellet_gamma_decay};
use crate::geometry::Vec3;
use crate::grid::PropagationGrid;
use crate::io::gridsave;
use crate::io::input::RunParameters;
use crate::kpkt::{do_kpkt, do_kpkt_blackbody};
use crate::macroatom::{do_macroatom, do_ntlepton};
use crate::nonthermal::{NonThermalSolver, NtSolution};
use crate::packets::{Packet, PacketType};
use crate::random::RandomStream;
use crate::rpkt::{do_rpkt, PropagationEnv, Worker};
use crate::spectrum::{accumulate_escaped_packets, LightCurve, Spectrum};
use crate::stats::Counters;
use atomic_counter::{AtomicCounter, RelaxedCounter};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use rayon::prelude::*;
use std::io::{self, Write};
use std::path::Path;

/// Number of frequency bins of the escaping-packet spectra.
pub const N_NUBINS: usize = 1000;

/// Grey mass absorption coefficient for optically thick cells [cm^2/g].
const KAPPA_GREY_DEFAULT: fcn = 0.1;

/// Reference density scale of the opacity-case-3 critical density [g/cm^3].
const RHO_CRIT_SCALE: fcn = 1.0e-14;

/// Stopping powers for decay particles [erg cm^3 / g / s].
const ENDOT_ALPHA: fcn = 5.0e11 * MEV_TO_ERG;
const ENDOT_BETA: fcn = 4.0e10 * MEV_TO_ERG;

/// One entry of the logarithmic timestep table.
#[derive(Clone, Copy, Debug)]
pub struct TimeStep {
    pub start: fcn,
    pub width: fcn,
    pub mid: fcn,
}

impl TimeStep {
    pub fn end(&self) -> fcn {
        self.start + self.width
    }
}

/// Builds the logarithmically spaced timestep table covering
/// [t_min, t_max].
pub fn build_timesteps(t_min: fcn, t_max: fcn, n_timesteps: usize) -> Vec<TimeStep> {
    let dlogt = (fcn::ln(t_max) - fcn::ln(t_min)) / n_timesteps as fcn;
    (0..n_timesteps)
        .map(|i| {
            let start = t_min * fcn::exp(i as fcn * dlogt);
            let end = t_min * fcn::exp((i + 1) as fcn * dlogt);
            TimeStep {
                start,
                width: end - start,
                mid: 0.5 * (start + end),
            }
        })
        .collect()
}

/// The complete state of a run.
pub struct Simulation {
    pub params: RunParameters,
    pub atomic: AtomicModel,
    pub grid: PropagationGrid,
    pub cells: Vec<ModelCell>,
    pub estimators: Estimators,
    pub counters: Counters,
    pub decay_data: DecayData,
    pub solver: NonThermalSolver,
    pub nt_solutions: Vec<NtSolution>,
    pub timesteps: Vec<TimeStep>,
    pub syn_dir: Vec3<fcn>,
    pub rank: usize,
    pub n_procs: usize,
}

impl Simulation {
    /// Assembles a run from its parsed inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: RunParameters,
        atomic: AtomicModel,
        grid: PropagationGrid,
        mut cells: Vec<ModelCell>,
        decay_data: DecayData,
        solver: NonThermalSolver,
        rank: usize,
        n_procs: usize,
    ) -> Self {
        let timesteps = build_timesteps(params.t_min, params.t_max, params.n_timesteps);
        let estimators = Estimators::new(
            cells.len(),
            atomic.nelements(),
            atomic.max_nions(),
            params.nu_min_r(),
            params.nu_max_r(),
            128,
            &[],
            atomic.lines.len(),
        );
        let nt_solutions = vec![NtSolution::for_model(&atomic); cells.len()];

        // initial thermodynamic state before any estimators exist
        let t_min = params.t_min;
        for cell in cells.iter_mut() {
            cell.t_r = 1.0e4;
            cell.t_e = 1.0e4;
            cell.w = 1.0;
            cell.kappa_grey = KAPPA_GREY_DEFAULT;
            cell.update_ionisation_balance(&atomic, t_min, t_min);
        }

        let mut rng = RandomStream::new(params.seed, rank as u64, u64::MAX);
        let syn_dir = if params.observer_direction.squared_length() < 1e-12 {
            rng.isotropic_direction()
        } else {
            params.observer_direction
        };

        Self {
            params,
            atomic,
            grid,
            cells,
            estimators,
            counters: Counters::new(),
            decay_data,
            solver,
            nt_solutions,
            timesteps,
            syn_dir,
            rank,
            n_procs,
        }
    }

    /// Creates this rank's share of the packet pool.
    pub fn initialise_packets(&self, n_packets: usize) -> Vec<Packet> {
        let mut rng = RandomStream::new(self.params.seed, self.rank as u64, u64::MAX - 1);
        crate::packets::initialise_packet_pool(
            &self.grid,
            &self.cells,
            &self.decay_data,
            n_packets,
            self.params.t_max,
            &mut rng,
        )
    }

    /// Runs the configured timestep range, writing outputs and checkpoints
    /// into the given directory.
    pub fn run(&mut self, packets: &mut [Packet], outdir: &Path) -> io::Result<()> {
        self.write_timesteps_file(&outdir.join("timesteps.out"))?;

        for nts in self.params.itstep..self.params.ftstep.min(self.params.n_timesteps) {
            let ts = self.timesteps[nts];
            info!(
                "timestep {}: {:.3} to {:.3} days",
                nts,
                ts.start / DAY_TO_S,
                ts.end() / DAY_TO_S
            );

            self.update_grid(nts);
            self.propagate_pool(packets, nts);
            self.write_outputs(packets, outdir, nts)?;
            gridsave::write_gridsave(
                &outdir.join("gridsave.dat"),
                nts,
                &self.solver,
                &self.nt_solutions,
            )?;
            gridsave::write_temp_packets(
                &outdir.join(format!("packets_{:04}_ts{}.tmp", self.rank, nts)),
                packets,
            )?;
        }

        gridsave::write_packets_text(
            &outdir.join(format!("packets{:02}_{:04}.out", 0, self.rank)),
            packets,
        )?;
        Ok(())
    }

    /// Consumes the estimators of the previous timestep into new cell
    /// thermodynamics and Spencer-Fano solutions, then zeroes them.
    pub fn update_grid(&mut self, nts: usize) {
        let lte_mode = nts < self.params.n_lte_timesteps;
        let grey_allowed = nts < self.params.n_grey_timesteps;
        let ts = self.timesteps[nts];
        let t_min = self.grid.t_min();

        // per-model-cell volumes at the previous mid-time, for estimator
        // normalisation
        let prev_mid = if nts > 0 {
            self.timesteps[nts - 1].mid
        } else {
            ts.start
        };
        let prev_width = if nts > 0 {
            self.timesteps[nts - 1].width
        } else {
            ts.width
        };
        let mut volumes = vec![0.0; self.cells.len()];
        let mut widths = vec![0.0; self.cells.len()];
        for cellindex in 0..self.grid.n_cells() {
            if let Some(mgi) = self.grid.model_cell(cellindex) {
                let scale = (prev_mid / t_min).powi(3);
                volumes[mgi] += self.grid.cell_volume_init(cellindex) * scale;
                let width = self.grid.cell_coord_max(cellindex, 0)
                    - self.grid.cell_coord_min(cellindex, 0);
                widths[mgi] = width * prev_mid / t_min;
            }
        }

        let have_estimators = nts > self.params.itstep;
        for (mgi, cell) in self.cells.iter_mut().enumerate() {
            if cell.is_empty() {
                continue;
            }
            if have_estimators && volumes[mgi] > 0.0 {
                update_cell_thermodynamics(
                    cell,
                    mgi,
                    &self.atomic,
                    &self.estimators,
                    volumes[mgi],
                    prev_width,
                    ts.start,
                    t_min,
                    lte_mode,
                );
            } else {
                cell.update_ionisation_balance(&self.atomic, ts.start, t_min);
            }

            // grey mass absorption coefficient; the composition-dependent
            // opacity cases scale it with the iron-group fraction, case 3
            // additionally with the density against rho_crit
            cell.kappa_grey = match self.params.opacity_case {
                0 => KAPPA_GREY_DEFAULT,
                3 => {
                    let rho_crit = self.params.rho_crit_para * RHO_CRIT_SCALE;
                    KAPPA_GREY_DEFAULT
                        * (0.9 * cell.fegroup_fraction + 0.1)
                        * (cell.rho(ts.start, t_min) / rho_crit).min(1.0)
                }
                _ => KAPPA_GREY_DEFAULT * (0.9 * cell.fegroup_fraction + 0.1),
            };

            // grey approximation for optically thick cells in the early
            // timesteps
            let tau_thomson = SIGMA_T * cell.nne * widths[mgi];
            cell.thick = grey_allowed && tau_thomson > self.params.cell_grey_tau_threshold;
        }

        // deposition rate density: the gamma estimator plus the analytic
        // particle injection channels
        let mut depositions = vec![0.0; self.cells.len()];
        for (mgi, cell) in self.cells.iter().enumerate() {
            if cell.is_empty() || volumes[mgi] <= 0.0 {
                continue;
            }
            let gamma_dep =
                self.estimators.gamma_deposition[mgi].get() / volumes[mgi] / prev_width;
            let particle_dep = self.decay_data.particle_deposition_rate_density(
                &cell.nuc_mass_fractions,
                cell.rho(ts.mid, t_min),
                ts.mid,
            );
            depositions[mgi] = gamma_dep + particle_dep;
        }

        let atomic = &self.atomic;
        let solver = &self.solver;
        let cells = &self.cells;
        self.nt_solutions
            .par_iter_mut()
            .enumerate()
            .for_each(|(mgi, solution)| {
                if cells[mgi].is_empty() {
                    return;
                }
                solver.solve(atomic, &cells[mgi], depositions[mgi], nts, solution);
            });

        self.estimators.reset();
        self.counters.reset();
    }

    /// Propagates every active packet of the pool through one timestep.
    pub fn propagate_pool(&self, packets: &mut [Packet], nts: usize) {
        let ts = self.timesteps[nts];
        let env = PropagationEnv {
            grid: &self.grid,
            atomic: &self.atomic,
            cells: &self.cells,
            estimators: &self.estimators,
            counters: &self.counters,
            nt_solutions: &self.nt_solutions,
            params: &self.params,
            max_path_step: self.grid.r_max() * ts.start / self.grid.t_min() / 10.0,
        };

        let progress = ProgressBar::new(packets.len() as u64).with_style(
            ProgressStyle::with_template("{bar:30} {pos}/{len} packets {elapsed}")
                .expect("Invalid progress style"),
        );
        let progress_counter = RelaxedCounter::new(0);

        let seed = self.params.seed;
        let rank = self.rank as u64;
        let n_bf = self.atomic.bf_continua.len();
        let kpkt_diffusion = nts < self.params.n_kpkt_diffusion_timesteps;

        packets
            .par_chunks_mut(256)
            .for_each_init(
                || Worker::new(RandomStream::for_next_worker(seed, rank), n_bf),
                |worker, chunk| {
                    for pkt in chunk.iter_mut() {
                        propagate_packet(&env, pkt, worker, &self.decay_data, ts, nts, kpkt_diffusion);
                        let done = progress_counter.inc();
                        if done % 4096 == 0 {
                            progress.inc(4096);
                        }
                    }
                },
            );
        progress.finish_and_clear();

        info!(
            "timestep {}: {} escapes so far, {} cell crossings, {} bb activations",
            nts,
            self.counters.escapes.get(),
            self.counters.cell_crossings.get(),
            self.counters.macroatom_activations_bb.get()
        );
    }

    /// Accumulates the escaped packets into spectra and light curves and
    /// writes the output files (including the angle-resolved variants).
    fn write_outputs(&self, packets: &[Packet], outdir: &Path, nts: usize) -> io::Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let numtimesteps = nts + 1;
        let timesteps = &self.timesteps[..numtimesteps];
        let do_emission_res = self.params.emission_resolution;

        let mut spectrum = Spectrum::new(
            self.params.nu_min_r(),
            self.params.nu_max_r(),
            N_NUBINS,
            numtimesteps,
            &self.atomic,
            do_emission_res,
        );
        let mut stokes_q = Spectrum::new(
            self.params.nu_min_r(),
            self.params.nu_max_r(),
            N_NUBINS,
            numtimesteps,
            &self.atomic,
            false,
        );
        let mut stokes_u = stokes_q.clone();
        let mut stokes_i = stokes_q.clone();
        let mut light_curve = LightCurve::new(numtimesteps);
        let mut gamma_light_curve = LightCurve::new(numtimesteps);

        accumulate_escaped_packets(
            packets,
            &self.atomic,
            timesteps,
            self.n_procs,
            None,
            &self.syn_dir,
            self.params.t_min,
            self.params.t_max,
            &mut spectrum,
            Some((&mut stokes_i, &mut stokes_q, &mut stokes_u)),
            &mut light_curve,
            &mut gamma_light_curve,
        );

        spectrum.write_spectrum_file(&outdir.join("spec.out"), timesteps)?;
        light_curve.write_file(&outdir.join("light_curve.out"), timesteps)?;
        gamma_light_curve.write_file(&outdir.join("gamma_light_curve.out"), timesteps)?;
        if do_emission_res {
            spectrum.write_emission_files(
                &outdir.join("emission.out"),
                &outdir.join("emissiontrue.out"),
                &outdir.join("absorption.out"),
                numtimesteps,
            )?;
        }
        crate::spectrum::write_specpol_file(
            &outdir.join("specpol.out"),
            timesteps,
            &stokes_i,
            &stokes_q,
            &stokes_u,
        )?;

        // angle-resolved variants are produced once, after the last step
        if nts + 1 == self.params.ftstep.min(self.params.n_timesteps) {
            for bin in 0..crate::spectrum::MABINS {
                let mut spectrum_res = Spectrum::new(
                    self.params.nu_min_r(),
                    self.params.nu_max_r(),
                    N_NUBINS,
                    numtimesteps,
                    &self.atomic,
                    false,
                );
                let mut light_curve_res = LightCurve::new(numtimesteps);
                let mut gamma_res = LightCurve::new(numtimesteps);
                accumulate_escaped_packets(
                    packets,
                    &self.atomic,
                    timesteps,
                    self.n_procs,
                    Some(bin),
                    &self.syn_dir,
                    self.params.t_min,
                    self.params.t_max,
                    &mut spectrum_res,
                    None,
                    &mut light_curve_res,
                    &mut gamma_res,
                );
                spectrum_res.write_spectrum_file(
                    &outdir.join(format!("spec_res_{:02}.out", bin)),
                    timesteps,
                )?;
                light_curve_res.write_file(
                    &outdir.join(format!("light_curve_res_{:02}.out", bin)),
                    timesteps,
                )?;
            }
        }
        Ok(())
    }

    fn write_timesteps_file(&self, path: &Path) -> io::Result<()> {
        if self.rank != 0 {
            return Ok(());
        }
        let mut file = io::BufWriter::new(std::fs::File::create(path)?);
        writeln!(file, "#timestep start_days mid_days width_days")?;
        for (nts, ts) in self.timesteps.iter().enumerate() {
            writeln!(
                file,
                "{} {:.6e} {:.6e} {:.6e}",
                nts,
                ts.start / DAY_TO_S,
                ts.mid / DAY_TO_S,
                ts.width / DAY_TO_S
            )?;
        }
        Ok(())
    }
}

/// Moves one packet to the end of the timestep, dispatching on its type as
/// it changes.
fn propagate_packet(
    env: &PropagationEnv,
    pkt: &mut Packet,
    worker: &mut Worker,
    decay_data: &DecayData,
    ts: TimeStep,
    nts: usize,
    kpkt_diffusion: bool,
) {
    let t2 = ts.end();
    loop {
        if pkt.ptype == PacketType::Escaped || pkt.prop_time >= t2 {
            return;
        }

        // per-thread caches follow the packet's model cell
        if let Some(mgi) = env.grid.model_cell(pkt.cell) {
            if worker.cache.model_cell != Some(mgi) {
                worker.cache.reset_for_cell(mgi);
                worker.opacity.recalculate_required = true;
                env.counters.cellcache_resets.inc();
            }
        }

        match pkt.ptype {
            PacketType::Pellet { .. } => update_pellet(env, pkt, worker, decay_data, ts, nts),
            PacketType::Gamma => do_gamma(env, pkt, worker, t2),
            PacketType::RPacket => do_rpkt(env, pkt, worker, t2),
            PacketType::KPacket => do_kpkt(env, pkt, worker, t2, ts.width, kpkt_diffusion),
            PacketType::PreKPacket => do_kpkt_blackbody(env, pkt, worker),
            PacketType::NonThermalPredeposit => do_nonthermal_predeposit(env, pkt, worker, t2),
            PacketType::NonThermalLepton => do_ntlepton(env, pkt, worker),
            PacketType::MacroAtom(_) => do_macroatom(env, pkt, worker),
            PacketType::Escaped => return,
        }
    }
}

/// Handles an undecayed pellet: drifts it with the flow until it decays in
/// this timestep or survives into the next one.
fn update_pellet(
    env: &PropagationEnv,
    pkt: &mut Packet,
    worker: &mut Worker,
    decay_data: &DecayData,
    ts: TimeStep,
    nts: usize,
) {
    let t2 = ts.end();
    let t_decay = pkt.t_decay;
    if t_decay > t2 {
        // survives this timestep: ride along with the matter
        pkt.drift_with_flow(t2);
    } else if t_decay >= pkt.prop_time {
        env.counters.pellet_decays.inc();
        pkt.drift_with_flow(t_decay);

        if pkt.originated_from_particle {
            match pkt.pellet_decaytype {
                DecayType::BetaPlus => {
                    // positrons thermalise essentially instantly
                    pkt.nu_cmf = decay_data.nuclides[pkt.pellet_nuclide].endecay_particle
                        / crate::constants::HPLANCK;
                    pkt.ptype = PacketType::NonThermalLepton;
                }
                DecayType::BetaMinus | DecayType::Alpha => {
                    pkt.nu_cmf = decay_data.nuclides[pkt.pellet_nuclide].endecay_particle
                        / crate::constants::HPLANCK;
                    pkt.ptype = PacketType::NonThermalPredeposit;
                }
                _ => {
                    pkt.ptype = PacketType::NonThermalLepton;
                }
            }
        } else {
            pellet_gamma_decay(decay_data, pkt, worker);
        }
    } else if t_decay > 0.0 && nts == 0 {
        // decayed before the simulation started: thermal packet with the
        // energy reduced for work done on the ejecta
        pkt.e_cmf *= t_decay / env.grid.t_min();
        pkt.ptype = PacketType::PreKPacket;
        pkt.prop_time = env.grid.t_min();
    } else {
        crate::exit_with_error!(
            "[fatal] pellet {} has decay time {:.6e} before its clock {:.6e}",
            pkt.id,
            t_decay,
            pkt.prop_time
        );
    }
}

/// Stops a decay particle along its continuous slowing-down track; the
/// absorption point is uniform in energy because the loss rate is taken
/// energy-independent.
fn do_nonthermal_predeposit(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker, t2: fcn) {
    let ts_now = pkt.prop_time;
    let particle_en = crate::constants::HPLANCK * pkt.nu_cmf;

    let rho = env
        .grid
        .model_cell(pkt.cell)
        .map(|mgi| env.cells[mgi].rho(ts_now, env.grid.t_min()))
        .unwrap_or(0.0);

    if rho <= 0.0 {
        // no material to stop in: deposit on the spot
        pkt.ptype = PacketType::NonThermalLepton;
        return;
    }

    let endot = if pkt.pellet_decaytype == DecayType::Alpha {
        ENDOT_ALPHA * rho
    } else {
        ENDOT_BETA * rho
    };

    let zrand = worker.rng.uniform();
    let en_absorb = zrand * particle_en;
    let t_absorb = ts_now + en_absorb / endot;

    if t_absorb <= t2 {
        pkt.drift_with_flow(t_absorb);
        pkt.ptype = PacketType::NonThermalLepton;
    } else {
        pkt.nu_cmf = (particle_en - endot * (t2 - ts_now)) / crate::constants::HPLANCK;
        pkt.drift_with_flow(t2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timesteps_cover_the_range_logarithmically() {
        let t_min = 2.0 * DAY_TO_S;
        let t_max = 80.0 * DAY_TO_S;
        let timesteps = build_timesteps(t_min, t_max, 50);
        assert_eq!(timesteps.len(), 50);
        assert!((timesteps[0].start - t_min).abs() < 1e-6);
        assert!((timesteps[49].end() - t_max).abs() / t_max < 1e-12);
        // contiguity and constant logarithmic ratio
        for window in timesteps.windows(2) {
            assert!((window[0].end() - window[1].start).abs() / window[1].start < 1e-12);
            let r0 = window[0].end() / window[0].start;
            let r1 = window[1].end() / window[1].start;
            assert!((r0 - r1).abs() < 1e-10);
        }
    }
}
