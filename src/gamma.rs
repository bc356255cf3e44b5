//! Gamma-ray packet emission and grey transport.

use crate::constants::{fcn, CLIGHT, HPLANCK, M_ELECTRON, SIGMA_T};
use crate::decay::DecayData;
use crate::packets::{Packet, PacketType};
use crate::rpkt::{PropagationEnv, Worker};

/// Grey gamma-ray mass absorption coefficient [cm^2/g].
const KAPPA_GAMMA_GREY: fcn = 0.05;

/// Converts a decayed pellet into a gamma packet: a line energy from the
/// nuclide's spectrum, emitted isotropically in the comoving frame.
pub fn pellet_gamma_decay(
    decay_data: &DecayData,
    pkt: &mut Packet,
    worker: &mut Worker,
) {
    let energy = decay_data.sample_gamma_line(pkt.pellet_nuclide, &mut worker.rng);
    pkt.nu_cmf = energy / HPLANCK;
    pkt.emit_rpkt(&mut worker.rng);
    pkt.ptype = PacketType::Gamma;
    pkt.emission.emission_type = None;
    pkt.true_emission.emission_type = None;
}

/// Total Klein-Nishina cross section per electron [cm^2] for a photon of
/// the given energy in electron rest-mass units.
pub fn klein_nishina_cross_section(x: fcn) -> fcn {
    if x < 1e-4 {
        return SIGMA_T;
    }
    let prefactor = 3.0 / 4.0 * SIGMA_T;
    let term1 = (1.0 + x) / (x * x * x)
        * (2.0 * x * (1.0 + x) / (1.0 + 2.0 * x) - fcn::ln(1.0 + 2.0 * x));
    let term2 = fcn::ln(1.0 + 2.0 * x) / (2.0 * x);
    let term3 = -(1.0 + 3.0 * x) / (1.0 + 2.0 * x).powi(2);
    prefactor * (term1 + term2 + term3)
}

/// Gamma-ray opacity [1/cm] in the comoving frame: Compton scattering on
/// all electrons, or a grey mass absorption coefficient when the grey
/// switch is on.
fn gamma_opacity(env: &PropagationEnv, pkt: &Packet, model_cell: usize) -> fcn {
    let cell = &env.cells[model_cell];
    let rho = cell.rho(pkt.prop_time, env.grid.t_min());
    if env.params.grey_gamma_opacity {
        KAPPA_GAMMA_GREY * rho
    } else {
        let x = HPLANCK * pkt.nu_cmf / (M_ELECTRON * CLIGHT * CLIGHT);
        klein_nishina_cross_section(x) * cell.nne_tot
    }
}

/// Propagates a gamma packet until it escapes, deposits, or reaches the
/// end of the timestep. An interaction deposits the full packet energy
/// locally as a non-thermal lepton.
pub fn do_gamma(env: &PropagationEnv, pkt: &mut Packet, worker: &mut Worker, t2: fcn) {
    while pkt.ptype == PacketType::Gamma && pkt.prop_time < t2 {
        let Some(boundary) = env.grid.boundary_distance(
            pkt.cell,
            &pkt.pos,
            &pkt.dir,
            pkt.prop_time,
            pkt.last_cross,
        ) else {
            crate::exit_with_error!(
                "[fatal] no forward boundary found for gamma packet {} in cell {}",
                pkt.id,
                pkt.cell
            );
        };
        pkt.last_cross = boundary.last_cross;
        let sdist = boundary.distance;

        if sdist == 0.0 {
            pkt.change_cell(boundary.crossing, env.counters);
            continue;
        }

        let tdist = (t2 - pkt.prop_time) * CLIGHT;
        let model_cell = env.grid.model_cell(pkt.cell);
        let edist = match model_cell {
            Some(mgi) if !env.cells[mgi].is_empty() => {
                let kappa = gamma_opacity(env, pkt, mgi) * pkt.doppler();
                worker.rng.optical_depth() / kappa
            }
            _ => fcn::INFINITY,
        };

        if sdist < tdist && sdist < edist {
            pkt.advance(sdist);
            pkt.change_cell(boundary.crossing, env.counters);
        } else if edist <= sdist && edist < tdist {
            pkt.advance(edist);
            let mgi = model_cell.expect("Gamma interactions require material");
            env.estimators.gamma_deposition[mgi].add(pkt.e_cmf);
            pkt.ptype = PacketType::NonThermalLepton;
        } else {
            pkt.advance(tdist);
            pkt.prop_time = t2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn klein_nishina_reduces_to_thomson_at_low_energy() {
        assert!((klein_nishina_cross_section(1e-6) - SIGMA_T).abs() / SIGMA_T < 1e-3);
        let x = 1e-3;
        let sigma = klein_nishina_cross_section(x);
        // leading correction is sigma_T (1 - 2x)
        assert!((sigma / SIGMA_T - (1.0 - 2.0 * x)).abs() < 1e-2);
    }

    #[test]
    fn klein_nishina_falls_with_energy() {
        let low = klein_nishina_cross_section(0.1);
        let mid = klein_nishina_cross_section(1.0);
        let high = klein_nishina_cross_section(5.0);
        assert!(low > mid && mid > high);
        assert!(high > 0.0);
    }
}
