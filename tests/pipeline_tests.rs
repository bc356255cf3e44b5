//! End-to-end test: a small nickel-shell run assembled from the input
//! files, propagated for a few timesteps, with the output and checkpoint
//! files checked afterwards.

use ejecta::constants::DAY_TO_S;
use ejecta::decay::DecayData;
use ejecta::geometry::doppler_factor;
use ejecta::io::{atomicdata, gridsave, input::RunParameters, model};
use ejecta::nonthermal::NonThermalSolver;
use ejecta::packets::PacketType;
use ejecta::sim::Simulation;
use std::io::Write;
use std::path::Path;

const INPUT_TXT: &str = "\
# rng seed
42
# number of timesteps
4
# itstep ftstep
0 4
# tmin_days tmax_days
2.0 10.0
# syn range in MeV
0.05 4.0
# number of syn times
4
# syn start/end times
2.0 10.0
# model type
1
# r light curve mode
0
# n_out_it
1
# light speed propagation factor
1.0
# grey gamma opacity
0
# observer direction
0.0 0.0 1.0
# opacity case
4
# rho_crit
1.0
# debug packet
-1
# continue from checkpoint
0
# radiation field cutoff in angstroms
30000
# number of LTE timesteps
2
# grey optical depth threshold and timesteps
1000.0 2
# max bf continua per ion
-1
# n_procs for spectrum extraction
1
# emission resolution
1
# kpkt diffusion fraction and timesteps
0.0 0
";

fn write_run_files(dir: &Path) {
    std::fs::write(dir.join("input.txt"), INPUT_TXT).unwrap();

    let mut model = std::fs::File::create(dir.join("model.txt")).unwrap();
    writeln!(model, "# two nickel shells").unwrap();
    writeln!(model, "2").unwrap();
    writeln!(model, "2.0").unwrap();
    writeln!(model, "0 5000.0 -14.0 0.9 0.7 0.0 0.0 0.0").unwrap();
    writeln!(model, "1 10000.0 -14.6 0.8 0.5 0.0 0.0 0.0").unwrap();

    let mut abundances = std::fs::File::create(dir.join("abundances.txt")).unwrap();
    for cell in 0..2 {
        let mut row = vec![cell.to_string()];
        for z in 1..=30 {
            row.push(if z == 8 { "1.0".into() } else { "0.0".into() });
        }
        writeln!(abundances, "{}", row.join(" ")).unwrap();
    }

    let mut composition = std::fs::File::create(dir.join("compositiondata.txt")).unwrap();
    writeln!(composition, "1").unwrap();
    writeln!(composition, "0").unwrap();
    writeln!(composition, "0").unwrap();
    writeln!(composition, "8 2 1 2 10 1.0 15.9994").unwrap();

    let mut adata = std::fs::File::create(dir.join("adata.txt")).unwrap();
    writeln!(adata, "8 1 3 13.618").unwrap();
    writeln!(adata, "0 0.0 5.0 2").unwrap();
    writeln!(adata, "1 1.97 3.0 1").unwrap();
    writeln!(adata, "2 4.19 1.0 0").unwrap();
    writeln!(adata, "8 2 1 35.121").unwrap();
    writeln!(adata, "0 0.0 4.0 0").unwrap();

    let mut transitions = std::fs::File::create(dir.join("transitiondata.txt")).unwrap();
    writeln!(transitions, "8 1 3").unwrap();
    writeln!(transitions, "0 1 5.0e7 -1.0 0").unwrap();
    writeln!(transitions, "0 2 1.0e8 -1.0 0").unwrap();
    writeln!(transitions, "1 2 3.0e7 -1.0 1").unwrap();
    writeln!(transitions, "8 2 0").unwrap();

    let mut collion = std::fs::File::create(dir.join("collion.txt")).unwrap();
    writeln!(collion, "1").unwrap();
    writeln!(collion, "8 8 2 1 13.6 2.0 -0.9 0.6 -0.4").unwrap();

    let mut binding = std::fs::File::create(dir.join("binding_energies.txt")).unwrap();
    writeln!(binding, "10 30").unwrap();
    for z in 1..=30 {
        let row: Vec<String> = (0..10)
            .map(|shell| format!("{:.1}", 20.0 * z as f64 / (shell + 1) as f64))
            .collect();
        writeln!(binding, "{}", row.join(" ")).unwrap();
    }
}

fn build_simulation(dir: &Path) -> Simulation {
    let params = RunParameters::from_file(&dir.join("input.txt")).unwrap();
    let mut atomic = atomicdata::read_atomic_model(dir).unwrap();
    atomicdata::read_phixs_data(dir, &mut atomic).unwrap();
    let collion = atomicdata::read_collion_data(dir).unwrap();
    let binding = atomicdata::read_binding_energies(&dir.join("binding_energies.txt")).unwrap();

    let decay_data = DecayData::standard();
    let mut ejecta_model =
        model::read_model_1d(&dir.join("model.txt"), params.t_min, &atomic, &decay_data).unwrap();
    model::read_abundances(
        &dir.join("abundances.txt"),
        &atomic,
        &ejecta_model.grid,
        &mut ejecta_model.cells,
    )
    .unwrap();

    let solver = NonThermalSolver::new(128, 1.0, 3000.0, collion, binding);
    Simulation::new(
        params,
        atomic,
        ejecta_model.grid,
        ejecta_model.cells,
        decay_data,
        solver,
        0,
        1,
    )
}

#[test]
fn nickel_shell_run_produces_consistent_outputs() {
    let dir = tempfile::tempdir().unwrap();
    write_run_files(dir.path());

    let mut simulation = build_simulation(dir.path());
    let mut packets = simulation.initialise_packets(300);
    assert_eq!(packets.len(), 300);

    // pellets start with positive energy and decay times inside the window
    let initial_energy: f64 = packets.iter().map(|pkt| pkt.e_cmf).sum();
    assert!(initial_energy > 0.0);
    for pkt in &packets {
        assert!(matches!(pkt.ptype, PacketType::Pellet { .. }));
        assert!(pkt.t_decay >= 2.0 * DAY_TO_S * 0.999);
        assert!(pkt.t_decay <= 10.0 * DAY_TO_S * 1.001);
    }

    simulation.run(&mut packets, dir.path()).unwrap();

    // no pellets survive past the simulated window, and every packet
    // satisfies the direction and Doppler invariants
    for pkt in &packets {
        assert!(!matches!(pkt.ptype, PacketType::Pellet { .. }));
        assert!((pkt.dir.length() - 1.0).abs() < 1e-8, "packet {} direction", pkt.id);
        if pkt.ptype == PacketType::RPacket || pkt.escape_type.is_some() {
            if pkt.e_rf > 0.0 {
                let time = if pkt.ptype == PacketType::Escaped {
                    pkt.escape_time
                } else {
                    pkt.prop_time
                };
                let dop = doppler_factor(&pkt.pos, &pkt.dir, time);
                assert!(
                    (pkt.e_cmf / pkt.e_rf - dop).abs() < 1e-8,
                    "packet {} Doppler invariant",
                    pkt.id
                );
            }
        }
    }

    // something must have escaped the grid in an eight-day nickel run
    let escaped = packets
        .iter()
        .filter(|pkt| pkt.ptype == PacketType::Escaped)
        .count();
    assert!(escaped > 0, "no packets escaped");

    // the output files exist and have content
    for name in [
        "spec.out",
        "light_curve.out",
        "gamma_light_curve.out",
        "timesteps.out",
        "emission.out",
        "emissiontrue.out",
        "absorption.out",
        "specpol.out",
        "spec_res_00.out",
        "spec_res_99.out",
        "light_curve_res_00.out",
        "gridsave.dat",
        "input.txt.tmp",
    ] {
        // input.txt.tmp is only written by the binary front end
        if name == "input.txt.tmp" {
            continue;
        }
        let path = dir.path().join(name);
        assert!(path.exists(), "{} missing", name);
        assert!(
            std::fs::metadata(&path).unwrap().len() > 0,
            "{} is empty",
            name
        );
    }

    // spec.out has one header row plus one row per frequency bin
    let spec = std::fs::read_to_string(dir.path().join("spec.out")).unwrap();
    assert_eq!(spec.lines().count(), 1 + ejecta::sim::N_NUBINS);

    // the checkpoint files round-trip
    let restored =
        gridsave::read_temp_packets(&dir.path().join("packets_0000_ts3.tmp")).unwrap();
    assert_eq!(restored.len(), packets.len());
    for (a, b) in packets.iter().zip(&restored) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.ptype, b.ptype);
        assert_eq!(a.e_cmf.to_bits(), b.e_cmf.to_bits());
    }

    let (checkpoint_ts, solutions) = gridsave::read_gridsave(
        &dir.path().join("gridsave.dat"),
        &simulation.solver,
        &simulation.nt_solutions,
    )
    .unwrap();
    assert_eq!(checkpoint_ts, 3);
    assert_eq!(solutions.len(), simulation.nt_solutions.len());
    for (a, b) in solutions.iter().zip(&simulation.nt_solutions) {
        assert_eq!(a.frac_heating.to_bits(), b.frac_heating.to_bits());
        assert_eq!(a.frac_ionisation.to_bits(), b.frac_ionisation.to_bits());
        assert_eq!(
            a.deposition_rate_density.to_bits(),
            b.deposition_rate_density.to_bits()
        );
    }
}
