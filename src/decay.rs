//! Radioactive nuclides, decay chains and pellet activation.

use crate::constants::{fcn, DAY_TO_S, MEV_TO_ERG, M_H};
use crate::random::RandomStream;

/// The branching type of a nuclear decay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecayType {
    Alpha,
    ElectronCapture,
    BetaPlus,
    BetaMinus,
    None,
}

/// A line in a nuclide's gamma spectrum.
#[derive(Clone, Copy, Debug)]
pub struct GammaLine {
    /// Photon energy [erg].
    pub energy: fcn,
    /// Photons per decay.
    pub probability: fcn,
}

/// A radioactive nuclide.
#[derive(Clone, Debug)]
pub struct Nuclide {
    pub z: u32,
    pub a: u32,
    /// Mean lifetime [s].
    pub meanlife: fcn,
    /// Gamma-ray energy per decay [erg].
    pub endecay_gamma: fcn,
    /// Kinetic particle energy per decay [erg].
    pub endecay_particle: fcn,
    pub decay_type: DecayType,
    /// Gamma lines, sorted by energy ascending.
    pub gamma_spec: Vec<GammaLine>,
}

impl Nuclide {
    /// Nuclear mass [g].
    pub fn mass(&self) -> fcn {
        self.a as fcn * M_H
    }

    pub fn endecay_total(&self) -> fcn {
        self.endecay_gamma + self.endecay_particle
    }
}

/// A decay chain: consecutive nuclide indices; the last member decays to a
/// stable species.
pub type DecayChain = Vec<usize>;

/// The nuclide chain library for a run.
#[derive(Clone, Debug)]
pub struct DecayData {
    pub nuclides: Vec<Nuclide>,
    pub chains: Vec<DecayChain>,
}

impl DecayData {
    /// The standard double-chain library:
    /// 56Ni -> 56Co -> 56Fe, 48Cr -> 48V -> 48Ti, 52Fe -> 52Mn -> 52Cr.
    pub fn standard() -> Self {
        let nuclides = vec![
            Nuclide {
                z: 28,
                a: 56,
                meanlife: 8.80 * DAY_TO_S,
                endecay_gamma: 1.75 * MEV_TO_ERG,
                endecay_particle: 0.0,
                decay_type: DecayType::ElectronCapture,
                gamma_spec: vec![
                    GammaLine { energy: 0.158 * MEV_TO_ERG, probability: 0.988 },
                    GammaLine { energy: 0.750 * MEV_TO_ERG, probability: 0.495 },
                    GammaLine { energy: 0.812 * MEV_TO_ERG, probability: 0.860 },
                    GammaLine { energy: 1.562 * MEV_TO_ERG, probability: 0.140 },
                ],
            },
            Nuclide {
                z: 27,
                a: 56,
                meanlife: 113.7 * DAY_TO_S,
                endecay_gamma: 3.61 * MEV_TO_ERG,
                // 19% branching to positrons of 0.610 MeV mean energy
                endecay_particle: 0.610 * 0.19 * MEV_TO_ERG,
                decay_type: DecayType::BetaPlus,
                gamma_spec: vec![
                    GammaLine { energy: 0.847 * MEV_TO_ERG, probability: 1.000 },
                    GammaLine { energy: 1.238 * MEV_TO_ERG, probability: 0.685 },
                    GammaLine { energy: 2.598 * MEV_TO_ERG, probability: 0.170 },
                    GammaLine { energy: 3.253 * MEV_TO_ERG, probability: 0.076 },
                ],
            },
            Nuclide {
                z: 24,
                a: 48,
                meanlife: 1.296_02 * DAY_TO_S,
                endecay_gamma: 0.422 * MEV_TO_ERG,
                endecay_particle: 0.0,
                decay_type: DecayType::ElectronCapture,
                gamma_spec: vec![
                    GammaLine { energy: 0.112 * MEV_TO_ERG, probability: 0.960 },
                    GammaLine { energy: 0.308 * MEV_TO_ERG, probability: 1.000 },
                ],
            },
            Nuclide {
                z: 23,
                a: 48,
                meanlife: 23.044_2 * DAY_TO_S,
                endecay_gamma: 2.874 * MEV_TO_ERG,
                // 50% branching to positrons of 0.290 MeV mean energy
                endecay_particle: 0.290 * 0.499 * MEV_TO_ERG,
                decay_type: DecayType::BetaPlus,
                gamma_spec: vec![
                    GammaLine { energy: 0.944 * MEV_TO_ERG, probability: 0.078 },
                    GammaLine { energy: 0.983 * MEV_TO_ERG, probability: 1.000 },
                    GammaLine { energy: 1.312 * MEV_TO_ERG, probability: 0.975 },
                ],
            },
            Nuclide {
                z: 26,
                a: 52,
                meanlife: 0.497_429 * DAY_TO_S,
                endecay_gamma: 0.86 * MEV_TO_ERG,
                endecay_particle: 0.0,
                decay_type: DecayType::ElectronCapture,
                gamma_spec: vec![GammaLine { energy: 0.169 * MEV_TO_ERG, probability: 0.993 }],
            },
            Nuclide {
                z: 25,
                a: 52,
                meanlife: 0.021_139_5 * DAY_TO_S,
                endecay_gamma: 3.415 * MEV_TO_ERG,
                endecay_particle: 0.0,
                decay_type: DecayType::BetaPlus,
                gamma_spec: vec![GammaLine { energy: 1.434 * MEV_TO_ERG, probability: 0.983 }],
            },
        ];
        let chains = vec![vec![0, 1], vec![2, 3], vec![4, 5]];
        Self { nuclides, chains }
    }

    pub fn n_nuclides(&self) -> usize {
        self.nuclides.len()
    }

    pub fn nuclide_index(&self, z: u32, a: u32) -> Option<usize> {
        self.nuclides
            .iter()
            .position(|nuclide| nuclide.z == z && nuclide.a == a)
    }

    /// Decays per initial chain-head atom occurring in [t1, t2] for the
    /// chain member at the given position (0 = chain head).
    fn decays_per_head_atom(&self, chain: &DecayChain, position: usize, t1: fcn, t2: fcn) -> fcn {
        let lam_a = 1.0 / self.nuclides[chain[0]].meanlife;
        match position {
            0 => fcn::exp(-lam_a * t1) - fcn::exp(-lam_a * t2),
            1 => {
                // Bateman solution for the daughter of a two-step chain
                let lam_b = 1.0 / self.nuclides[chain[1]].meanlife;
                let prefactor = lam_a * lam_b / (lam_b - lam_a);
                prefactor
                    * ((fcn::exp(-lam_a * t1) - fcn::exp(-lam_a * t2)) / lam_a
                        - (fcn::exp(-lam_b * t1) - fcn::exp(-lam_b * t2)) / lam_b)
            }
            _ => 0.0,
        }
    }

    /// Instantaneous decay rate per initial chain-head atom at time t.
    fn decay_rate_per_head_atom(&self, chain: &DecayChain, position: usize, t: fcn) -> fcn {
        let lam_a = 1.0 / self.nuclides[chain[0]].meanlife;
        match position {
            0 => lam_a * fcn::exp(-lam_a * t),
            1 => {
                let lam_b = 1.0 / self.nuclides[chain[1]].meanlife;
                lam_a * lam_b / (lam_b - lam_a) * (fcn::exp(-lam_a * t) - fcn::exp(-lam_b * t))
            }
            _ => 0.0,
        }
    }

    /// Decay energy released per unit mass [erg/g] in the time window, for
    /// material with the given initial nuclide mass fractions.
    pub fn simtime_endecay_per_mass(
        &self,
        nuc_mass_fractions: &[fcn],
        t1: fcn,
        t2: fcn,
    ) -> fcn {
        let mut endecay = 0.0;
        for chain in &self.chains {
            let head = chain[0];
            let head_fraction = nuc_mass_fractions[head];
            if head_fraction <= 0.0 {
                continue;
            }
            let atoms_per_mass = head_fraction / self.nuclides[head].mass();
            for (position, &member) in chain.iter().enumerate() {
                endecay += atoms_per_mass
                    * self.decays_per_head_atom(chain, position, t1, t2)
                    * self.nuclides[member].endecay_total();
            }
        }
        endecay
    }

    /// Kinetic-particle energy deposition rate density [erg/s/cm^3] at the
    /// given time, assuming local instantaneous deposition.
    pub fn particle_deposition_rate_density(
        &self,
        nuc_mass_fractions: &[fcn],
        rho: fcn,
        t: fcn,
    ) -> fcn {
        let mut rate = 0.0;
        for chain in &self.chains {
            let head = chain[0];
            let head_fraction = nuc_mass_fractions[head];
            if head_fraction <= 0.0 {
                continue;
            }
            let atoms_per_volume = head_fraction * rho / self.nuclides[head].mass();
            for (position, &member) in chain.iter().enumerate() {
                rate += atoms_per_volume
                    * self.decay_rate_per_head_atom(chain, position, t)
                    * self.nuclides[member].endecay_particle;
            }
        }
        rate
    }

    /// Configures a freshly placed pellet: selects the decaying nuclide in
    /// proportion to its share of the in-window decay energy, samples the
    /// decay time, and decides between gamma and particle energy release.
    pub fn setup_radioactive_pellet(
        &self,
        e0: fcn,
        nuc_mass_fractions: &[fcn],
        t1: fcn,
        t2: fcn,
        rng: &mut RandomStream,
        pkt: &mut crate::packets::Packet,
    ) {
        // cumulative energy contribution per (chain, position)
        let mut cumulative = Vec::new();
        let mut channels = Vec::new();
        let mut total = 0.0;
        for (chainindex, chain) in self.chains.iter().enumerate() {
            let head = chain[0];
            let head_fraction = nuc_mass_fractions[head];
            if head_fraction <= 0.0 {
                continue;
            }
            let atoms_per_mass = head_fraction / self.nuclides[head].mass();
            for (position, &member) in chain.iter().enumerate() {
                total += atoms_per_mass
                    * self.decays_per_head_atom(chain, position, t1, t2)
                    * self.nuclides[member].endecay_total();
                cumulative.push(total);
                channels.push((chainindex, position, member));
            }
        }
        assert!(total > 0.0, "Pellet placed in cell without radioactivity");

        let pick = rng.sample_cumulative(&cumulative);
        let (chainindex, position, nucindex) = channels[pick];
        let nuclide = &self.nuclides[nucindex];

        pkt.t_decay = self.sample_decay_time(&self.chains[chainindex], position, t1, t2, rng);
        pkt.ptype = crate::packets::PacketType::Pellet { nuclide: nucindex };
        pkt.pellet_nuclide = nucindex;
        pkt.e_cmf = e0;

        // a pellet carries either the gamma or the particle share of the
        // decay energy
        let en_gamma = nuclide.endecay_gamma;
        let en_particle = nuclide.endecay_particle;
        let zrand = rng.uniform();
        pkt.originated_from_particle = zrand >= en_gamma / (en_gamma + en_particle);
        pkt.pellet_decaytype = if pkt.originated_from_particle {
            nuclide.decay_type
        } else {
            DecayType::None
        };
    }

    /// Samples a decay time within [t1, t2] from the decay probability
    /// density of the chain member.
    fn sample_decay_time(
        &self,
        chain: &DecayChain,
        position: usize,
        t1: fcn,
        t2: fcn,
        rng: &mut RandomStream,
    ) -> fcn {
        let tau_head = self.nuclides[chain[0]].meanlife;
        if position == 0 {
            // inverse CDF of the truncated exponential
            let w1 = fcn::exp(-t1 / tau_head);
            let w2 = fcn::exp(-t2 / tau_head);
            let zrand = rng.uniform();
            -tau_head * fcn::ln(w1 - zrand * (w1 - w2))
        } else {
            // parent then daughter lifetime, rejection-sampled into the window
            let tau_daughter = self.nuclides[chain[position]].meanlife;
            for _ in 0..1000 {
                let t_parent = -tau_head * fcn::ln(rng.uniform_pos());
                let t_decay = t_parent - tau_daughter * fcn::ln(rng.uniform_pos());
                if t_decay >= t1 && t_decay <= t2 {
                    return t_decay;
                }
            }
            // pathological windows: fall back to the window midpoint
            0.5 * (t1 + t2)
        }
    }

    /// Samples a photon energy from the nuclide's gamma spectrum [erg].
    pub fn sample_gamma_line(&self, nucindex: usize, rng: &mut RandomStream) -> fcn {
        let spec = &self.nuclides[nucindex].gamma_spec;
        if spec.is_empty() {
            return self.nuclides[nucindex].endecay_gamma;
        }
        let mut cumulative = Vec::with_capacity(spec.len());
        let mut total = 0.0;
        for line in spec {
            total += line.energy * line.probability;
            cumulative.push(total);
        }
        spec[rng.sample_cumulative(&cumulative)].energy
    }

    /// Total decay energy [erg] released from t = 0 to infinity for the
    /// whole model, given per-cell masses and nuclide fractions.
    pub fn global_etot(&self, cell_masses: &[fcn], cell_nuc_fractions: &[Vec<fcn>]) -> fcn {
        cell_masses
            .iter()
            .zip(cell_nuc_fractions)
            .map(|(&mass, fractions)| mass * self.simtime_endecay_per_mass(fractions, 0.0, fcn::INFINITY))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_decays_happen_eventually() {
        let data = DecayData::standard();
        let chain = &data.chains[0];
        // over all time, each chain member decays exactly once per head atom
        let head_decays = data.decays_per_head_atom(chain, 0, 0.0, fcn::INFINITY);
        let daughter_decays = data.decays_per_head_atom(chain, 1, 0.0, fcn::INFINITY);
        assert!((head_decays - 1.0).abs() < 1e-12);
        assert!((daughter_decays - 1.0).abs() < 1e-10);
    }

    #[test]
    fn decay_rate_integrates_to_decay_count() {
        let data = DecayData::standard();
        let chain = &data.chains[0];
        let t1 = 5.0 * DAY_TO_S;
        let t2 = 50.0 * DAY_TO_S;
        // midpoint-rule integral of the daughter decay rate
        let nsteps = 20000;
        let dt = (t2 - t1) / nsteps as fcn;
        let integral: fcn = (0..nsteps)
            .map(|i| data.decay_rate_per_head_atom(chain, 1, t1 + (i as fcn + 0.5) * dt) * dt)
            .sum();
        let direct = data.decays_per_head_atom(chain, 1, t1, t2);
        assert!((integral - direct).abs() / direct < 1e-5);
    }

    #[test]
    fn sampled_decay_times_stay_in_window() {
        let data = DecayData::standard();
        let mut rng = RandomStream::new(3, 0, 0);
        let t1 = 2.0 * DAY_TO_S;
        let t2 = 80.0 * DAY_TO_S;
        for position in 0..2 {
            for _ in 0..200 {
                let t = data.sample_decay_time(&data.chains[0], position, t1, t2, &mut rng);
                assert!(t >= t1 * 0.999 && t <= t2 * 1.001);
            }
        }
    }

    #[test]
    fn pellet_setup_assigns_valid_nuclide() {
        let data = DecayData::standard();
        let mut rng = RandomStream::new(4, 0, 0);
        let mut fractions = vec![0.0; data.n_nuclides()];
        fractions[data.nuclide_index(28, 56).unwrap()] = 0.5;
        let mut pkt = crate::packets::Packet::placeholder(0);
        data.setup_radioactive_pellet(
            1.0e40,
            &fractions,
            2.0 * DAY_TO_S,
            60.0 * DAY_TO_S,
            &mut rng,
            &mut pkt,
        );
        match pkt.ptype {
            crate::packets::PacketType::Pellet { nuclide } => {
                // the nickel chain contains Ni56 and Co56 only
                assert!(data.chains[0].contains(&nuclide));
            }
            _ => panic!("Pellet setup must leave the packet a pellet"),
        }
        assert!(pkt.e_cmf > 0.0);
        assert!(pkt.t_decay >= 2.0 * DAY_TO_S);
    }
}
