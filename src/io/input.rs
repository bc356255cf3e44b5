//! Parsing of the ordered-directive parameter file (`input.txt`).

use crate::constants::{fcn, ANGSTROM_TO_CM, CLIGHT, DAY_TO_S, MEV_TO_ERG, HPLANCK};
use crate::geometry::Vec3;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// How the r-packet light curve is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RLightCurveMode {
    Off,
    OpticallyThin,
    OpticallyThick,
    GammaHeating,
}

/// The full run configuration, in directive order.
#[derive(Clone, Debug)]
pub struct RunParameters {
    /// RNG seed; non-positive input values are replaced by the wall clock.
    pub seed: u64,
    pub n_timesteps: usize,
    pub itstep: usize,
    pub ftstep: usize,
    /// Simulation start time [s].
    pub t_min: fcn,
    /// Simulation end time [s].
    pub t_max: fcn,
    /// Gamma spectrum lower frequency [Hz].
    pub nusyn_min: fcn,
    /// Gamma spectrum upper frequency [Hz].
    pub nusyn_max: fcn,
    pub n_syn_times: usize,
    /// Synthesis window start [s].
    pub tsyn_start: fcn,
    /// Synthesis window end [s].
    pub tsyn_end: fcn,
    /// 1 = 1-D spherical, 2 = 2-D, 3 = 3-D Cartesian.
    pub model_type: u32,
    pub r_lc_mode: RLightCurveMode,
    /// Kept for file compatibility; unused.
    pub n_out_it: usize,
    pub grey_gamma_opacity: bool,
    /// Observer direction for angle-resolved spectra (unit vector).
    pub observer_direction: Vec3<fcn>,
    pub opacity_case: i32,
    pub rho_crit_para: fcn,
    /// Packet id with debug output enabled; `None` = off.
    pub debug_packet: Option<usize>,
    pub continue_from_checkpoint: bool,
    /// Radiation-field estimator cut-off wavelength [cm].
    pub radfield_cutoff_lambda: fcn,
    pub n_lte_timesteps: usize,
    /// Cells above this Thomson optical depth are treated as grey.
    pub cell_grey_tau_threshold: fcn,
    pub n_grey_timesteps: usize,
    /// Maximum bound-free continua per ion; `None` = all.
    pub max_bf_continua_per_ion: Option<usize>,
    /// Number of processes assumed by the spectrum extraction.
    pub n_procs_spectrum: usize,
    pub emission_resolution: bool,
    pub kpkt_diffusion_fraction: fcn,
    pub n_kpkt_diffusion_timesteps: usize,
    /// Use the relativistic line-crossing distance formula.
    pub relativistic_doppler: bool,
}

impl RunParameters {
    /// Reads the parameter file, one directive per non-comment line.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut tokens = super::model::TokenReader::new(io::BufReader::new(file));

        let seed_in: i64 = tokens.next_value("rng seed")?;
        let seed = if seed_in <= 0 {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(1)
        } else {
            seed_in as u64
        };

        let n_timesteps: usize = tokens.next_value("number of timesteps")?;
        let itstep: usize = tokens.next_value("initial timestep")?;
        let ftstep: usize = tokens.next_value("final timestep")?;
        if !(itstep <= ftstep && ftstep <= n_timesteps) {
            return Err(invalid(format!(
                "timestep range {}..{} incompatible with {} timesteps",
                itstep, ftstep, n_timesteps
            )));
        }

        let t_min_days: fcn = tokens.next_value("start time [days]")?;
        let t_max_days: fcn = tokens.next_value("end time [days]")?;
        if t_min_days <= 0.0 || t_max_days <= t_min_days {
            return Err(invalid(format!(
                "invalid time range {} to {} days",
                t_min_days, t_max_days
            )));
        }

        let syn_min_mev: fcn = tokens.next_value("syn lower energy [MeV]")?;
        let syn_max_mev: fcn = tokens.next_value("syn upper energy [MeV]")?;
        let n_syn_times: usize = tokens.next_value("number of syn times")?;
        let tsyn_start_days: fcn = tokens.next_value("syn start time [days]")?;
        let tsyn_end_days: fcn = tokens.next_value("syn end time [days]")?;

        let model_type: u32 = tokens.next_value("model type")?;
        if !(1..=3).contains(&model_type) {
            return Err(invalid(format!("unknown model type {}", model_type)));
        }

        let r_lc_mode = match tokens.next_value::<i32>("r light curve mode")? {
            0 => RLightCurveMode::Off,
            1 => RLightCurveMode::OpticallyThin,
            2 => RLightCurveMode::OpticallyThick,
            3 => RLightCurveMode::GammaHeating,
            other => return Err(invalid(format!("unknown r light curve mode {}", other))),
        };

        let n_out_it: usize = tokens.next_value("n_out_it")?;

        let clight_prop_factor: fcn = tokens.next_value("light propagation speed factor")?;
        if (clight_prop_factor - 1.0).abs() > 1e-12 {
            return Err(invalid(format!(
                "light propagation speed factor must be 1.0, got {}",
                clight_prop_factor
            )));
        }

        let grey_gamma_opacity = tokens.next_value::<i32>("grey gamma opacity switch")? != 0;

        let obs_x: fcn = tokens.next_value("observer direction x")?;
        let obs_y: fcn = tokens.next_value("observer direction y")?;
        let obs_z: fcn = tokens.next_value("observer direction z")?;
        let observer = Vec3::new(obs_x, obs_y, obs_z);
        let observer_direction = if observer.squared_length() < 1e-12 {
            // direction is randomised later, once the RNG is seeded
            Vec3::new(0.0, 0.0, 0.0)
        } else {
            observer.normalized()
        };

        let opacity_case: i32 = tokens.next_value("opacity case")?;
        if !(0..=4).contains(&opacity_case) {
            return Err(invalid(format!("unknown opacity case {}", opacity_case)));
        }

        let rho_crit_para: fcn = tokens.next_value("rho_crit parameter")?;

        let debug_packet_in: i64 = tokens.next_value("debug packet id")?;
        let debug_packet = usize::try_from(debug_packet_in).ok();

        let continue_from_checkpoint = tokens.next_value::<i32>("continue flag")? != 0;

        let cutoff_angstrom: fcn = tokens.next_value("radiation field cut-off [A]")?;
        let n_lte_timesteps: usize = tokens.next_value("number of LTE timesteps")?;

        let cell_grey_tau_threshold: fcn = tokens.next_value("grey optical depth threshold")?;
        let n_grey_timesteps: usize = tokens.next_value("number of grey timesteps")?;

        let max_bf_in: i64 = tokens.next_value("max bf continua per ion")?;
        let max_bf_continua_per_ion = usize::try_from(max_bf_in).ok();

        let n_procs_spectrum: usize = tokens.next_value("n_procs for spectrum extraction")?;
        let emission_resolution = tokens.next_value::<i32>("emission resolution flag")? != 0;

        let kpkt_diffusion_fraction: fcn = tokens.next_value("kpkt diffusion fraction")?;
        let n_kpkt_diffusion_timesteps: usize =
            tokens.next_value("kpkt diffusion timesteps")?;

        Ok(Self {
            seed,
            n_timesteps,
            itstep,
            ftstep,
            t_min: t_min_days * DAY_TO_S,
            t_max: t_max_days * DAY_TO_S,
            nusyn_min: syn_min_mev * MEV_TO_ERG / HPLANCK,
            nusyn_max: syn_max_mev * MEV_TO_ERG / HPLANCK,
            n_syn_times,
            tsyn_start: tsyn_start_days * DAY_TO_S,
            tsyn_end: tsyn_end_days * DAY_TO_S,
            model_type,
            r_lc_mode,
            n_out_it,
            grey_gamma_opacity,
            observer_direction,
            opacity_case,
            rho_crit_para,
            debug_packet,
            continue_from_checkpoint,
            radfield_cutoff_lambda: cutoff_angstrom * ANGSTROM_TO_CM,
            n_lte_timesteps,
            cell_grey_tau_threshold,
            n_grey_timesteps,
            max_bf_continua_per_ion,
            n_procs_spectrum,
            emission_resolution,
            kpkt_diffusion_fraction,
            n_kpkt_diffusion_timesteps,
            relativistic_doppler: false,
        })
    }

    /// Lower frequency bound of the r-packet spectral window [Hz], the
    /// frequency of the cut-off wavelength.
    pub fn nu_min_r(&self) -> fcn {
        CLIGHT / self.radfield_cutoff_lambda.max(1e-8)
    }

    /// Upper frequency bound of the r-packet spectral window [Hz],
    /// corresponding to a 50 Angstrom blue edge.
    pub fn nu_max_r(&self) -> fcn {
        CLIGHT / (50.0 * ANGSTROM_TO_CM)
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const EXAMPLE_INPUT: &str = "\
# rng seed
42
# number of timesteps
100
# itstep ftstep
0 100
# tmin_days tmax_days
2.0 80.0
# syn range in MeV
0.2 4.0
# number of syn times
50
# syn start/end times
2.0 80.0
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
10
# grey optical depth threshold and timesteps
1000.0 10
# max bf continua per ion
-1
# n_procs for spectrum extraction
1
# emission resolution
1
# kpkt diffusion fraction and timesteps
0.0 0
";

    #[test]
    fn parses_the_full_directive_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(EXAMPLE_INPUT.as_bytes()).unwrap();

        let params = RunParameters::from_file(&path).unwrap();
        assert_eq!(params.seed, 42);
        assert_eq!(params.n_timesteps, 100);
        assert_eq!(params.itstep, 0);
        assert_eq!(params.ftstep, 100);
        assert!((params.t_min - 2.0 * DAY_TO_S).abs() < 1.0);
        assert!((params.t_max - 80.0 * DAY_TO_S).abs() < 1.0);
        assert_eq!(params.model_type, 1);
        assert_eq!(params.r_lc_mode, RLightCurveMode::Off);
        assert_eq!(params.opacity_case, 4);
        assert_eq!(params.debug_packet, None);
        assert!(!params.continue_from_checkpoint);
        assert_eq!(params.max_bf_continua_per_ion, None);
        assert!(params.emission_resolution);
        assert_eq!(params.n_kpkt_diffusion_timesteps, 0);
    }

    #[test]
    fn rejects_bad_light_speed_factor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        let modified = EXAMPLE_INPUT.replacen("1.0\n# grey gamma", "0.5\n# grey gamma", 1);
        std::fs::write(&path, modified).unwrap();
        assert!(RunParameters::from_file(&path).is_err());
    }

    #[test]
    fn rejects_inverted_timestep_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        let modified = EXAMPLE_INPUT.replacen("0 100", "50 20", 1);
        std::fs::write(&path, modified).unwrap();
        assert!(RunParameters::from_file(&path).is_err());
    }
}
