//! Spectrum and light-curve accumulators for escaped packets.

use crate::atomic::AtomicModel;
use crate::constants::{fcn, CLIGHT, DAY_TO_S, FLUX_REFERENCE_DISTANCE, FOURPI};
use crate::geometry::Vec3;
use crate::packets::{EmissionType, EscapeKind, Packet, PacketType};
use crate::sim::TimeStep;
use ndarray::{Array2, Array3};
use std::io::{self, Write};
use std::path::Path;

/// Number of sky-direction bins for angle-resolved spectra: a 10 x 10
/// grid in (cos theta, phi) about the observer direction.
pub const MABINS: usize = 100;
const N_COSTHETA_BINS: usize = 10;
const N_PHI_BINS: usize = 10;

/// Arrival time of an escaped packet at a distant observer: the escape
/// time minus the light-travel head start along the line of flight.
pub fn arrival_time(pkt: &Packet) -> fcn {
    pkt.escape_time - pkt.pos.dot(&pkt.dir) / CLIGHT
}

/// Sky-direction bin of an escape direction relative to the observer
/// direction, or the full 10 x 10 grid layout.
pub fn escape_direction_bin(dir: &Vec3<fcn>, syn_dir: &Vec3<fcn>) -> usize {
    let costheta = dir.dot(syn_dir).clamp(-1.0, 1.0);
    let costheta_bin =
        (((costheta + 1.0) / 2.0 * N_COSTHETA_BINS as fcn) as usize).min(N_COSTHETA_BINS - 1);

    // orthonormal basis perpendicular to the observer direction
    let mut e1 = syn_dir.cross(&Vec3::new(0.0, 0.0, 1.0));
    if e1.squared_length() < 1e-8 {
        e1 = syn_dir.cross(&Vec3::new(0.0, 1.0, 0.0));
    }
    e1.normalize();
    let e2 = syn_dir.cross(&e1);

    let phi = fcn::atan2(dir.dot(&e2), dir.dot(&e1));
    let phi_frac = (phi / (2.0 * crate::constants::PI)).rem_euclid(1.0);
    let phi_bin = ((phi_frac * N_PHI_BINS as fcn) as usize).min(N_PHI_BINS - 1);

    costheta_bin * N_PHI_BINS + phi_bin
}

/// A time- and frequency-binned spectrum, optionally resolved by emission
/// and absorption process.
#[derive(Clone, Debug)]
pub struct Spectrum {
    nu_min: fcn,
    nu_max: fcn,
    dlognu: fcn,
    /// Lower edge of each frequency bin [Hz].
    pub lower_freq: Vec<fcn>,
    /// Width of each frequency bin [Hz].
    pub delta_freq: Vec<fcn>,
    /// Flux per (timestep, frequency bin).
    pub flux: Array2<fcn>,
    /// Emission-process-resolved flux per (timestep, bin, process column).
    pub emission: Option<Array3<fcn>>,
    /// Like `emission`, but indexed by the intrinsic emission event.
    pub true_emission: Option<Array3<fcn>>,
    /// Absorption flux per (timestep, bin, ion column).
    pub absorption: Option<Array3<fcn>>,
    n_elements: usize,
    max_nions: usize,
}

impl Spectrum {
    pub fn new(
        nu_min: fcn,
        nu_max: fcn,
        n_nubins: usize,
        n_timesteps: usize,
        atomic: &AtomicModel,
        do_emission_res: bool,
    ) -> Self {
        let dlognu = (fcn::ln(nu_max) - fcn::ln(nu_min)) / n_nubins as fcn;
        let lower_freq: Vec<fcn> = (0..n_nubins)
            .map(|i| fcn::exp(fcn::ln(nu_min) + i as fcn * dlognu))
            .collect();
        let delta_freq: Vec<fcn> = lower_freq
            .iter()
            .enumerate()
            .map(|(i, &lower)| fcn::exp(fcn::ln(nu_min) + (i + 1) as fcn * dlognu) - lower)
            .collect();

        let n_elements = atomic.nelements();
        let max_nions = atomic.max_nions();
        let proccount = Self::process_count(n_elements, max_nions);
        let ioncount = n_elements * max_nions;

        Self {
            nu_min,
            nu_max,
            dlognu,
            lower_freq,
            delta_freq,
            flux: Array2::zeros((n_timesteps, n_nubins)),
            emission: do_emission_res
                .then(|| Array3::zeros((n_timesteps, n_nubins, proccount))),
            true_emission: do_emission_res
                .then(|| Array3::zeros((n_timesteps, n_nubins, proccount))),
            absorption: do_emission_res
                .then(|| Array3::zeros((n_timesteps, n_nubins, ioncount))),
            n_elements,
            max_nions,
        }
    }

    /// Number of distinct emission processes: bound-bound and bound-free
    /// per (element, ion), plus one free-free column.
    pub fn process_count(n_elements: usize, max_nions: usize) -> usize {
        2 * n_elements * max_nions + 1
    }

    pub fn n_nubins(&self) -> usize {
        self.lower_freq.len()
    }

    fn frequency_bin(&self, nu: fcn) -> Option<usize> {
        if nu <= self.nu_min || nu >= self.nu_max {
            return None;
        }
        let bin = ((fcn::ln(nu) - fcn::ln(self.nu_min)) / self.dlognu) as usize;
        (bin < self.n_nubins()).then_some(bin)
    }

    fn emission_column(&self, emission_type: Option<EmissionType>, atomic: &AtomicModel) -> usize {
        match emission_type {
            Some(EmissionType::BoundBound(line)) => {
                let entry = atomic.lines.entry(line);
                entry.element * self.max_nions + entry.ion
            }
            Some(EmissionType::BoundFree(continuum)) => {
                let entry = &atomic.bf_continua[continuum];
                self.n_elements * self.max_nions + entry.element * self.max_nions + entry.ion
            }
            Some(EmissionType::FreeFree) | None => 2 * self.n_elements * self.max_nions,
        }
    }

    /// Bins an escaped r-packet, with `stokes_weight` selecting the Stokes
    /// component accumulated (1 for intensity, Q/I or U/I for the
    /// polarised spectra).
    #[allow(clippy::too_many_arguments)]
    pub fn add_packet(
        &mut self,
        pkt: &Packet,
        atomic: &AtomicModel,
        timesteps: &[TimeStep],
        n_procs: usize,
        angle_factor: fcn,
        stokes_weight: fcn,
        t_min: fcn,
        t_max: fcn,
    ) {
        let t_arrive = arrival_time(pkt);
        if t_arrive <= t_min || t_arrive >= t_max {
            return;
        }
        let Some(nt) = timestep_of(timesteps, t_arrive) else {
            return;
        };
        let Some(nnu) = self.frequency_bin(pkt.nu_rf) else {
            return;
        };

        let normalisation = timesteps[nt].width
            * self.delta_freq[nnu]
            * FOURPI
            * FLUX_REFERENCE_DISTANCE
            * FLUX_REFERENCE_DISTANCE
            * n_procs as fcn;
        let delta_e = pkt.e_rf / normalisation * angle_factor * stokes_weight;

        self.flux[[nt, nnu]] += delta_e;

        let proc = self.emission_column(pkt.emission.emission_type, atomic);
        let true_proc = self.emission_column(pkt.true_emission.emission_type, atomic);
        if let (Some(emission), Some(true_emission)) =
            (self.emission.as_mut(), self.true_emission.as_mut())
        {
            emission[[nt, nnu, proc]] += delta_e;
            true_emission[[nt, nnu, true_proc]] += delta_e;
        }

        if self.absorption.is_some() {
            if let Some(absorbing_line) = pkt.absorption.line {
                // absorption is binned at the rest-frame absorption
                // frequency, not the escape frequency
                if let Some(nnu_abs) = self.frequency_bin(pkt.absorption.nu_rf) {
                    let entry = atomic.lines.entry(absorbing_line);
                    let column = entry.element * self.max_nions + entry.ion;
                    let normalisation_abs = timesteps[nt].width
                        * self.delta_freq[nnu_abs]
                        * FOURPI
                        * FLUX_REFERENCE_DISTANCE
                        * FLUX_REFERENCE_DISTANCE
                        * n_procs as fcn;
                    let delta_e_abs =
                        pkt.e_rf / normalisation_abs * angle_factor * stokes_weight;
                    if let Some(absorption) = self.absorption.as_mut() {
                        absorption[[nt, nnu_abs, column]] += delta_e_abs;
                    }
                }
            }
        }
    }

    /// Sums another accumulator into this one; the cross-process reduction
    /// with the master keeping the result.
    pub fn merge(&mut self, other: &Spectrum) {
        self.flux += &other.flux;
        if let (Some(a), Some(b)) = (self.emission.as_mut(), other.emission.as_ref()) {
            *a += b;
        }
        if let (Some(a), Some(b)) = (self.true_emission.as_mut(), other.true_emission.as_ref()) {
            *a += b;
        }
        if let (Some(a), Some(b)) = (self.absorption.as_mut(), other.absorption.as_ref()) {
            *a += b;
        }
    }

    /// Writes `spec.out`: the first row holds the timestep mid-times in
    /// days, the first column the mid-bin frequencies.
    pub fn write_spectrum_file(&self, path: &Path, timesteps: &[TimeStep]) -> io::Result<()> {
        let mut file = io::BufWriter::new(std::fs::File::create(path)?);
        write!(file, "{:.6e}", 0.0)?;
        for ts in timesteps {
            write!(file, " {:.6e}", ts.mid / DAY_TO_S)?;
        }
        writeln!(file)?;
        for nnu in 0..self.n_nubins() {
            write!(
                file,
                "{:.6e}",
                self.lower_freq[nnu] + self.delta_freq[nnu] / 2.0
            )?;
            for nt in 0..timesteps.len() {
                write!(file, " {:.6e}", self.flux[[nt, nnu]])?;
            }
            writeln!(file)?;
        }
        Ok(())
    }

    /// Writes the emission, true-emission and absorption matrices.
    pub fn write_emission_files(
        &self,
        emission_path: &Path,
        true_emission_path: &Path,
        absorption_path: &Path,
        n_timesteps: usize,
    ) -> io::Result<()> {
        let (Some(emission), Some(true_emission), Some(absorption)) = (
            self.emission.as_ref(),
            self.true_emission.as_ref(),
            self.absorption.as_ref(),
        ) else {
            return Ok(());
        };

        let mut emission_file = io::BufWriter::new(std::fs::File::create(emission_path)?);
        let mut true_file = io::BufWriter::new(std::fs::File::create(true_emission_path)?);
        let mut absorption_file = io::BufWriter::new(std::fs::File::create(absorption_path)?);

        let proccount = emission.shape()[2];
        let ioncount = absorption.shape()[2];
        for nnu in 0..self.n_nubins() {
            for nt in 0..n_timesteps {
                for proc in 0..proccount {
                    write!(emission_file, "{:.6e} ", emission[[nt, nnu, proc]])?;
                }
                writeln!(emission_file)?;
                for proc in 0..proccount {
                    write!(true_file, "{:.6e} ", true_emission[[nt, nnu, proc]])?;
                }
                writeln!(true_file)?;
                for column in 0..ioncount {
                    write!(absorption_file, "{:.6e} ", absorption[[nt, nnu, column]])?;
                }
                writeln!(absorption_file)?;
            }
        }
        Ok(())
    }
}

/// Writes the polarised spectrum file: Stokes I, then Q, then U blocks
/// across the timestep columns.
pub fn write_specpol_file(
    path: &Path,
    timesteps: &[TimeStep],
    stokes_i: &Spectrum,
    stokes_q: &Spectrum,
    stokes_u: &Spectrum,
) -> io::Result<()> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    write!(file, "{:.6e}", 0.0)?;
    for _ in 0..3 {
        for ts in timesteps {
            write!(file, " {:.6e}", ts.mid / DAY_TO_S)?;
        }
    }
    writeln!(file)?;
    for nnu in 0..stokes_i.n_nubins() {
        write!(
            file,
            "{:.6e}",
            stokes_i.lower_freq[nnu] + stokes_i.delta_freq[nnu] / 2.0
        )?;
        for spectrum in [stokes_i, stokes_q, stokes_u] {
            for nt in 0..timesteps.len() {
                write!(file, " {:.6e}", spectrum.flux[[nt, nnu]])?;
            }
        }
        writeln!(file)?;
    }
    Ok(())
}

/// A light curve: escaped energy binned by arrival time, in the rest and
/// comoving frames.
#[derive(Clone, Debug)]
pub struct LightCurve {
    /// Rest-frame luminosity per timestep [erg/s].
    pub lum: Vec<fcn>,
    /// Comoving-frame luminosity per timestep [erg/s].
    pub lum_cmf: Vec<fcn>,
}

impl LightCurve {
    pub fn new(n_timesteps: usize) -> Self {
        Self {
            lum: vec![0.0; n_timesteps],
            lum_cmf: vec![0.0; n_timesteps],
        }
    }

    pub fn add_packet(
        &mut self,
        pkt: &Packet,
        timesteps: &[TimeStep],
        n_procs: usize,
        angle_factor: fcn,
    ) {
        let t_arrive = arrival_time(pkt);
        if let Some(nt) = timestep_of(timesteps, t_arrive) {
            self.lum[nt] += pkt.e_rf / timesteps[nt].width / n_procs as fcn * angle_factor;
        }
        // the comoving-frame curve bins by escape time without the
        // line-of-flight correction
        if let Some(nt) = timestep_of(timesteps, pkt.escape_time) {
            self.lum_cmf[nt] += pkt.e_cmf / timesteps[nt].width / n_procs as fcn * angle_factor;
        }
    }

    pub fn merge(&mut self, other: &LightCurve) {
        for (a, b) in self.lum.iter_mut().zip(&other.lum) {
            *a += b;
        }
        for (a, b) in self.lum_cmf.iter_mut().zip(&other.lum_cmf) {
            *a += b;
        }
    }

    /// Writes `light_curve.out`: mid-time in days, rest-frame and
    /// comoving-frame luminosities.
    pub fn write_file(&self, path: &Path, timesteps: &[TimeStep]) -> io::Result<()> {
        let mut file = io::BufWriter::new(std::fs::File::create(path)?);
        for (nt, ts) in timesteps.iter().enumerate() {
            writeln!(
                file,
                "{:.6e} {:.6e} {:.6e}",
                ts.mid / DAY_TO_S,
                self.lum[nt],
                self.lum_cmf[nt]
            )?;
        }
        Ok(())
    }
}

/// Bins every escaped packet of the pool into the given accumulators;
/// `angle_bin` of `None` produces the angle-averaged spectra, otherwise
/// only packets escaping into that direction bin contribute (scaled up by
/// the number of bins).
#[allow(clippy::too_many_arguments)]
pub fn accumulate_escaped_packets(
    packets: &[Packet],
    atomic: &AtomicModel,
    timesteps: &[TimeStep],
    n_procs: usize,
    angle_bin: Option<usize>,
    syn_dir: &Vec3<fcn>,
    t_min: fcn,
    t_max: fcn,
    rpkt_spectrum: &mut Spectrum,
    stokes: Option<(&mut Spectrum, &mut Spectrum, &mut Spectrum)>,
    rpkt_light_curve: &mut LightCurve,
    gamma_light_curve: &mut LightCurve,
) {
    let angle_factor = if angle_bin.is_some() {
        MABINS as fcn
    } else {
        1.0
    };
    let mut stokes = stokes;

    for pkt in packets {
        if pkt.ptype != PacketType::Escaped {
            continue;
        }
        if let Some(bin) = angle_bin {
            if escape_direction_bin(&pkt.dir, syn_dir) != bin {
                continue;
            }
        }
        match pkt.escape_type {
            Some(EscapeKind::RPacket) => {
                rpkt_spectrum.add_packet(
                    pkt,
                    atomic,
                    timesteps,
                    n_procs,
                    angle_factor,
                    1.0,
                    t_min,
                    t_max,
                );
                if let Some((ref mut i, ref mut q, ref mut u)) = stokes {
                    i.add_packet(pkt, atomic, timesteps, n_procs, angle_factor, pkt.stokes[0], t_min, t_max);
                    q.add_packet(pkt, atomic, timesteps, n_procs, angle_factor, pkt.stokes[1], t_min, t_max);
                    u.add_packet(pkt, atomic, timesteps, n_procs, angle_factor, pkt.stokes[2], t_min, t_max);
                }
                rpkt_light_curve.add_packet(pkt, timesteps, n_procs, angle_factor);
            }
            Some(EscapeKind::Gamma) => {
                gamma_light_curve.add_packet(pkt, timesteps, n_procs, angle_factor);
            }
            None => {}
        }
    }
}

fn timestep_of(timesteps: &[TimeStep], time: fcn) -> Option<usize> {
    if timesteps.is_empty() {
        return None;
    }
    if time < timesteps[0].start || time >= timesteps.last().unwrap().end() {
        return None;
    }
    Some(
        timesteps
            .partition_point(|ts| ts.start <= time)
            .saturating_sub(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::RandomStream;
    use crate::rpkt::tests::three_line_atomic_model;
    use crate::sim::build_timesteps;

    fn escaped_packet(id: usize, nu_rf: fcn, escape_time: fcn, dir: Vec3<fcn>) -> Packet {
        let mut pkt = Packet::placeholder(id);
        pkt.ptype = PacketType::Escaped;
        pkt.escape_type = Some(EscapeKind::RPacket);
        pkt.escape_time = escape_time;
        pkt.pos = Vec3::zero();
        pkt.dir = dir;
        pkt.e_rf = 1.0;
        pkt.e_cmf = 1.0;
        pkt.nu_rf = nu_rf;
        pkt.nu_cmf = nu_rf;
        pkt
    }

    #[test]
    fn flux_normalisation_matches_injected_energy() {
        let atomic = three_line_atomic_model();
        let t_min = 2.0 * DAY_TO_S;
        let t_max = 60.0 * DAY_TO_S;
        let timesteps = build_timesteps(t_min, t_max, 20);
        let n_nubins = 10;
        let mut spectrum = Spectrum::new(1.0e14, 1.0e16, n_nubins, 20, &atomic, false);
        let mut lc = LightCurve::new(20);
        let mut gamma_lc = LightCurve::new(20);

        // all packets arrive at the middle of timestep 0 in the middle
        // frequency bin, at the origin so arrival equals escape time
        let nu_mid = spectrum.lower_freq[5] + spectrum.delta_freq[5] / 2.0;
        let t_arrive = timesteps[0].mid;
        let n_pkt = 10_000;
        let mut rng = RandomStream::new(12, 0, 0);
        let packets: Vec<Packet> = (0..n_pkt)
            .map(|id| escaped_packet(id, nu_mid, t_arrive, rng.isotropic_direction()))
            .collect();

        let syn_dir = Vec3::new(0.0, 0.0, 1.0);
        accumulate_escaped_packets(
            &packets,
            &atomic,
            &timesteps,
            1,
            None,
            &syn_dir,
            t_min,
            t_max,
            &mut spectrum,
            None,
            &mut lc,
            &mut gamma_lc,
        );

        let expected = n_pkt as fcn
            / (timesteps[0].width
                * spectrum.delta_freq[5]
                * FOURPI
                * FLUX_REFERENCE_DISTANCE
                * FLUX_REFERENCE_DISTANCE);
        let measured = spectrum.flux[[0, 5]];
        assert!(
            (measured - expected).abs() / expected < 1e-12,
            "flux {} expected {}",
            measured,
            expected
        );
        // every other bin stays empty
        assert_eq!(spectrum.flux[[0, 4]], 0.0);
        assert_eq!(spectrum.flux[[1, 5]], 0.0);
        // the light curve collected every packet
        assert!((lc.lum[0] - n_pkt as fcn / timesteps[0].width).abs() < 1e-6);
    }

    #[test]
    fn angle_binned_spectra_sum_to_angle_average() {
        let atomic = three_line_atomic_model();
        let t_min = 2.0 * DAY_TO_S;
        let t_max = 60.0 * DAY_TO_S;
        let timesteps = build_timesteps(t_min, t_max, 5);
        let n_nubins = 8;

        let nu_mid = fcn::exp((fcn::ln(1.0e14) + fcn::ln(1.0e16)) / 2.0);
        let mut rng = RandomStream::new(13, 0, 0);
        let packets: Vec<Packet> = (0..5_000)
            .map(|id| escaped_packet(id, nu_mid, timesteps[2].mid, rng.isotropic_direction()))
            .collect();
        let syn_dir = Vec3::new(0.3, -0.5, 0.8).normalized();

        let mut averaged = Spectrum::new(1.0e14, 1.0e16, n_nubins, 5, &atomic, false);
        let mut lc = LightCurve::new(5);
        let mut gamma_lc = LightCurve::new(5);
        accumulate_escaped_packets(
            &packets,
            &atomic,
            &timesteps,
            1,
            None,
            &syn_dir,
            t_min,
            t_max,
            &mut averaged,
            None,
            &mut lc,
            &mut gamma_lc,
        );

        let mut summed = Spectrum::new(1.0e14, 1.0e16, n_nubins, 5, &atomic, false);
        for bin in 0..MABINS {
            let mut per_bin = Spectrum::new(1.0e14, 1.0e16, n_nubins, 5, &atomic, false);
            let mut lc_bin = LightCurve::new(5);
            let mut gamma_bin = LightCurve::new(5);
            accumulate_escaped_packets(
                &packets,
                &atomic,
                &timesteps,
                1,
                Some(bin),
                &syn_dir,
                t_min,
                t_max,
                &mut per_bin,
                None,
                &mut lc_bin,
                &mut gamma_bin,
            );
            // per-bin spectra are scaled by MABINS; the average over bins
            // recovers the angle-averaged spectrum
            per_bin.flux /= MABINS as fcn;
            summed.merge(&per_bin);
        }

        for nt in 0..5 {
            for nnu in 0..n_nubins {
                let a = averaged.flux[[nt, nnu]];
                let b = summed.flux[[nt, nnu]];
                assert!(
                    (a - b).abs() <= 1e-6 * a.abs().max(1e-300),
                    "bin ({}, {}): angle-averaged {} vs summed {}",
                    nt,
                    nnu,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn packets_outside_windows_are_rejected() {
        let atomic = three_line_atomic_model();
        let t_min = 2.0 * DAY_TO_S;
        let t_max = 60.0 * DAY_TO_S;
        let timesteps = build_timesteps(t_min, t_max, 5);
        let mut spectrum = Spectrum::new(1.0e14, 1.0e16, 8, 5, &atomic, false);

        // too early
        let early = escaped_packet(0, 1.0e15, 1.0 * DAY_TO_S, Vec3::new(0.0, 0.0, 1.0));
        spectrum.add_packet(&early, &atomic, &timesteps, 1, 1.0, 1.0, t_min, t_max);
        // frequency out of window
        let red = escaped_packet(1, 1.0e12, timesteps[1].mid, Vec3::new(0.0, 0.0, 1.0));
        spectrum.add_packet(&red, &atomic, &timesteps, 1, 1.0, 1.0, t_min, t_max);

        assert!(spectrum.flux.iter().all(|&value| value == 0.0));
    }

    #[test]
    fn every_direction_lands_in_exactly_one_bin() {
        let mut rng = RandomStream::new(21, 0, 0);
        let syn_dir = Vec3::new(0.0, 0.0, 1.0);
        for _ in 0..1000 {
            let dir = rng.isotropic_direction();
            let bin = escape_direction_bin(&dir, &syn_dir);
            assert!(bin < MABINS);
        }
    }
}
