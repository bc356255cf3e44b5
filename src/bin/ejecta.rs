use clap::Parser;
use ejecta::decay::DecayData;
use ejecta::io::{atomicdata, gridsave, input::RunParameters, model};
use ejecta::nonthermal::{NonThermalSolver, EMAX_DEFAULT, EMIN_DEFAULT, SFPTS_DEFAULT};
use ejecta::sim::Simulation;
use ejecta::{exit_on_error, exit_with_error};
use log::info;
use std::path::PathBuf;

/// Monte Carlo radiative transfer in expanding supernova ejecta.
#[derive(Parser, Debug)]
#[command(name = "ejecta", version, about)]
struct Cli {
    /// Run directory containing input.txt, the model and the atomic data
    #[arg(long, default_value = ".")]
    run_dir: PathBuf,

    /// Number of packets owned by this process
    #[arg(long, default_value_t = 100_000)]
    n_packets: usize,

    /// Rank of this process in a distributed run
    #[arg(long, default_value_t = 0)]
    rank: usize,

    /// Total number of processes sharing the packet pool
    #[arg(long, default_value_t = 1)]
    n_procs: usize,

    /// Number of Spencer-Fano energy grid points
    #[arg(long, default_value_t = SFPTS_DEFAULT)]
    sf_points: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let dir = cli.run_dir.clone();

    let params = exit_on_error!(
        RunParameters::from_file(&dir.join("input.txt")),
        "Failed reading the parameter file: {}"
    );
    exit_on_error!(
        std::fs::copy(dir.join("input.txt"), dir.join("input.txt.tmp")).map(|_| ()),
        "Failed backing up the parameter file: {}"
    );

    let mut atomic = exit_on_error!(
        atomicdata::read_atomic_model(&dir),
        "Failed reading the atomic dataset: {}"
    );
    exit_on_error!(
        atomicdata::read_phixs_data(&dir, &mut atomic),
        "Failed reading the photoionisation data: {}"
    );
    atomic.limit_bf_continua_per_ion(params.max_bf_continua_per_ion);
    let collion = exit_on_error!(
        atomicdata::read_collion_data(&dir),
        "Failed reading the collisional ionisation data: {}"
    );
    let binding = exit_on_error!(
        atomicdata::read_binding_energies(&dir.join("binding_energies.txt")),
        "Failed reading the binding energy tables: {}"
    );
    info!(
        "atomic dataset: {} elements, {} lines, {} bound-free continua",
        atomic.nelements(),
        atomic.lines.len(),
        atomic.bf_continua.len()
    );

    let decay_data = DecayData::standard();
    let model_path = dir.join("model.txt");
    let mut ejecta_model = match params.model_type {
        1 => exit_on_error!(
            model::read_model_1d(&model_path, params.t_min, &atomic, &decay_data),
            "Failed reading the 1-D model: {}"
        ),
        3 => exit_on_error!(
            model::read_model_3d(&model_path, params.t_min, &atomic, &decay_data),
            "Failed reading the 3-D model: {}"
        ),
        other => {
            exit_with_error!("Model type {} is not supported by this engine", other);
        }
    };
    exit_on_error!(
        model::read_abundances(
            &dir.join("abundances.txt"),
            &atomic,
            &ejecta_model.grid,
            &mut ejecta_model.cells,
        ),
        "Failed reading the abundances: {}"
    );
    info!(
        "model: {} propagation cells, {} model cells",
        ejecta_model.grid.n_cells(),
        ejecta_model.cells.len()
    );

    let solver = NonThermalSolver::new(cli.sf_points, EMIN_DEFAULT, EMAX_DEFAULT, collion, binding);

    let mut simulation = Simulation::new(
        params,
        atomic,
        ejecta_model.grid,
        ejecta_model.cells,
        decay_data,
        solver,
        cli.rank,
        cli.n_procs,
    );

    let mut packets = if simulation.params.continue_from_checkpoint {
        let itstep = simulation.params.itstep;
        let packets_path = dir.join(format!(
            "packets_{:04}_ts{}.tmp",
            cli.rank,
            itstep.saturating_sub(1)
        ));
        let packets = exit_on_error!(
            gridsave::read_temp_packets(&packets_path),
            "Failed reading the packet checkpoint: {}"
        );
        let (checkpoint_ts, solutions) = exit_on_error!(
            gridsave::read_gridsave(
                &dir.join("gridsave.dat"),
                &simulation.solver,
                &simulation.nt_solutions,
            ),
            "Failed reading the gridsave checkpoint: {}"
        );
        info!("restored checkpoint from timestep {}", checkpoint_ts);
        simulation.nt_solutions = solutions;
        packets
    } else {
        simulation.initialise_packets(cli.n_packets)
    };

    exit_on_error!(
        simulation.run(&mut packets, &dir),
        "Simulation failed: {}"
    );
    info!("run complete");
}
