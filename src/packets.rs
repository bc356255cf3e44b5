//! Radiation and decay-energy packets.

use crate::constants::{fcn, CLIGHT};
use crate::decay::DecayData;
use crate::geometry::{aberrate_direction, doppler_factor, flow_velocity, Vec3};
use crate::grid::{BoundaryCrossing, CellFace, PropagationGrid};
use crate::random::RandomStream;
use crate::stats::Counters;
use atomic_counter::AtomicCounter;
use log::info;

/// The macro-atom substate: the excited level holding the packet's energy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacroAtomState {
    pub element: usize,
    pub ion: usize,
    pub level: usize,
    /// Line whose absorption activated the macro-atom, if any.
    pub activating_line: Option<usize>,
}

/// The packet type tag; variants carry the state only they need.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// An undecayed radioactive pellet of the given nuclide.
    Pellet { nuclide: usize },
    Gamma,
    RPacket,
    KPacket,
    /// A pellet that decayed before the simulation start; thermalised with
    /// its energy reduced for work done on the ejecta.
    PreKPacket,
    /// A decay particle still being stopped by the ejecta.
    NonThermalPredeposit,
    /// A fast lepton about to be partitioned by the Spencer-Fano solution.
    NonThermalLepton,
    MacroAtom(MacroAtomState),
    Escaped,
}

/// What kind of packet crossed the outer boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeKind {
    RPacket,
    Gamma,
}

/// The physical process that created an r-packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmissionType {
    /// Bound-bound emission in the given line.
    BoundBound(usize),
    /// Bound-free emission in the given continuum.
    BoundFree(usize),
    FreeFree,
}

/// Where, when and how the packet's current photon was emitted; consumed by
/// the spectrum accumulators at escape.
#[derive(Clone, Copy, Debug)]
pub struct EmissionRecord {
    pub emission_type: Option<EmissionType>,
    pub position: Vec3<fcn>,
    pub time: fcn,
}

impl EmissionRecord {
    fn unset() -> Self {
        Self {
            emission_type: None,
            position: Vec3::zero(),
            time: 0.0,
        }
    }
}

/// The most recent line absorption, binned into the absorption spectra.
#[derive(Clone, Copy, Debug)]
pub struct AbsorptionRecord {
    pub line: Option<usize>,
    /// Rest-frame frequency at absorption.
    pub nu_rf: fcn,
    pub direction: Vec3<fcn>,
}

/// A discrete parcel of radiation or decay energy.
#[derive(Clone, Debug)]
pub struct Packet {
    pub id: usize,
    pub ptype: PacketType,
    /// Propagation cell the packet is in.
    pub cell: usize,
    /// Position in the rest frame [cm].
    pub pos: Vec3<fcn>,
    /// Direction unit vector in the rest frame.
    pub dir: Vec3<fcn>,
    /// Rest-frame energy [erg].
    pub e_rf: fcn,
    /// Comoving-frame energy [erg].
    pub e_cmf: fcn,
    /// Rest-frame frequency [Hz].
    pub nu_rf: fcn,
    /// Comoving-frame frequency [Hz].
    pub nu_cmf: fcn,
    /// Current propagation time [s].
    pub prop_time: fcn,
    /// Decay time sampled at initialisation [s].
    pub t_decay: fcn,
    pub last_cross: Option<CellFace>,
    /// Lower bound for the next line-list search.
    pub next_trans: usize,
    pub emission: EmissionRecord,
    /// Emission record of the intrinsic (pre-electron-scattering) event.
    pub true_emission: EmissionRecord,
    /// Radial velocity of the ejecta at the true emission point [cm/s].
    pub true_emission_velocity: fcn,
    pub absorption: AbsorptionRecord,
    /// Stokes (I, Q, U).
    pub stokes: [fcn; 3],
    /// Polarisation reference direction, orthogonal to `dir`.
    pub pol_dir: Vec3<fcn>,
    pub nscatterings: u32,
    pub interactions: u32,
    /// Scatterings since the last cell crossing.
    pub scat_count: u32,
    pub escape_time: fcn,
    pub escape_type: Option<EscapeKind>,
    /// Nuclide the originating pellet carried.
    pub pellet_nuclide: usize,
    pub pellet_decaytype: crate::decay::DecayType,
    /// Whether the decay released a particle rather than a gamma ray.
    pub originated_from_particle: bool,
}

impl Packet {
    pub fn placeholder(id: usize) -> Self {
        Self {
            id,
            ptype: PacketType::Pellet { nuclide: 0 },
            cell: 0,
            pos: Vec3::zero(),
            dir: Vec3::new(0.0, 0.0, 1.0),
            e_rf: 0.0,
            e_cmf: 0.0,
            nu_rf: 0.0,
            nu_cmf: 0.0,
            prop_time: 0.0,
            t_decay: 0.0,
            last_cross: None,
            next_trans: 0,
            emission: EmissionRecord::unset(),
            true_emission: EmissionRecord::unset(),
            true_emission_velocity: -1.0,
            absorption: AbsorptionRecord {
                line: None,
                nu_rf: 0.0,
                direction: Vec3::new(0.0, 0.0, 1.0),
            },
            stokes: [1.0, 0.0, 0.0],
            pol_dir: Vec3::new(1.0, 0.0, 0.0),
            nscatterings: 0,
            interactions: 0,
            scat_count: 0,
            escape_time: -1.0,
            escape_type: None,
            pellet_nuclide: 0,
            pellet_decaytype: crate::decay::DecayType::None,
            originated_from_particle: false,
        }
    }

    /// Doppler factor at the packet's current position and direction.
    pub fn doppler(&self) -> fcn {
        doppler_factor(&self.pos, &self.dir, self.prop_time)
    }

    /// Moves the packet the given distance along its direction, advancing
    /// its clock and refreshing the comoving-frame quantities.
    pub fn advance(&mut self, distance: fcn) {
        debug_assert!(distance >= 0.0);
        self.pos = self.pos.added(&self.dir.scaled(distance));
        self.prop_time += distance / CLIGHT;
        let dopplerfactor = self.doppler();
        self.nu_cmf = self.nu_rf * dopplerfactor;
        self.e_cmf = self.e_rf * dopplerfactor;
    }

    /// Drifts an inactive packet with the homologous flow to the given time.
    pub fn drift_with_flow(&mut self, time: fcn) {
        self.pos = self.pos.scaled(time / self.prop_time);
        self.prop_time = time;
    }

    /// Turns the packet into an r-packet with an isotropic comoving-frame
    /// direction, transforming frequency, energy and polarisation state to
    /// the rest frame.
    pub fn emit_rpkt(&mut self, rng: &mut RandomStream) {
        self.ptype = PacketType::RPacket;
        self.last_cross = None;

        let dir_cmf = rng.isotropic_direction();
        // convert from the comoving to the rest frame, so the aberration
        // uses the negated flow velocity
        let vel = flow_velocity(&self.pos, -self.prop_time);
        self.dir = aberrate_direction(&dir_cmf, &vel);
        debug_assert!((self.dir.length() - 1.0).abs() < 1e-8);

        let dopplerfactor = self.doppler();
        self.nu_rf = self.nu_cmf / dopplerfactor;
        self.e_rf = self.e_cmf / dopplerfactor;

        self.stokes = [1.0, 0.0, 0.0];
        self.reseed_polarisation_reference();
    }

    /// Re-derives the polarisation reference direction from the propagation
    /// direction, falling back to an alternative basis vector when the
    /// first cross product degenerates.
    pub fn reseed_polarisation_reference(&mut self) {
        let mut reference = self.dir.cross(&Vec3::new(0.0, 0.0, 1.0));
        if reference.squared_length() < 1e-8 {
            reference = self.dir.cross(&Vec3::new(0.0, 1.0, 0.0));
        }
        reference.normalize();
        self.pol_dir = reference;
    }

    /// Coherent electron scattering: nu_cmf is conserved, the comoving
    /// direction is redrawn isotropically and the Stokes vector is passed
    /// through the Thomson phase matrix.
    pub fn electron_scatter(&mut self, rng: &mut RandomStream) {
        let old_dir = self.dir;
        let dir_cmf = rng.isotropic_direction();
        let vel = flow_velocity(&self.pos, -self.prop_time);
        self.dir = aberrate_direction(&dir_cmf, &vel);

        let cos_theta = old_dir.dot(&self.dir);
        let (i, q, u) = thomson_phase(self.stokes, cos_theta);
        self.stokes = [1.0, q / i, u / i];

        // the reference direction must stay orthogonal to the new direction
        let mut reference = self.dir.cross(&old_dir);
        if reference.squared_length() < 1e-8 {
            self.reseed_polarisation_reference();
        } else {
            reference.normalize();
            self.pol_dir = reference;
        }

        let dopplerfactor = self.doppler();
        self.nu_rf = self.nu_cmf / dopplerfactor;
        self.e_rf = self.e_cmf / dopplerfactor;

        self.interactions += 1;
        self.nscatterings += 1;
        self.scat_count += 1;

        // electron scattering keeps the emission type but moves the
        // emission position
        self.emission.position = self.pos;
        self.emission.time = self.prop_time;
    }

    /// Records the intrinsic emission event for the true-emission spectra.
    pub fn record_true_emission(&mut self, emission_type: EmissionType) {
        self.emission = EmissionRecord {
            emission_type: Some(emission_type),
            position: self.pos,
            time: self.prop_time,
        };
        self.true_emission = self.emission;
        self.true_emission_velocity = self.pos.length() / self.prop_time;
    }

    /// Takes the packet across a cell boundary, or freezes it as escaped.
    pub fn change_cell(&mut self, crossing: BoundaryCrossing, counters: &Counters) {
        match crossing {
            BoundaryCrossing::Escape => {
                self.escape_type = match self.ptype {
                    PacketType::Gamma => Some(EscapeKind::Gamma),
                    _ => Some(EscapeKind::RPacket),
                };
                self.escape_time = self.prop_time;
                self.ptype = PacketType::Escaped;
                counters.escapes.inc();
            }
            BoundaryCrossing::Cell(next) => {
                self.cell = next;
                counters.cell_crossings.inc();
            }
        }
    }
}

/// Applies the Thomson scattering phase matrix for the given scattering
/// angle cosine to a Stokes vector (intensity-normalised on input).
fn thomson_phase(stokes: [fcn; 3], cos_theta: fcn) -> (fcn, fcn, fcn) {
    let mu2 = cos_theta * cos_theta;
    let i = 0.75 * ((1.0 + mu2) * stokes[0] + (mu2 - 1.0) * stokes[1]);
    let q = 0.75 * ((mu2 - 1.0) * stokes[0] + (1.0 + mu2) * stokes[1]);
    let u = 0.75 * 2.0 * cos_theta * stokes[2];
    (i.max(1e-30), q, u)
}

/// Creates the packet pool: pellets with decay times, distributed over the
/// grid in proportion to the time-integrated decay energy of each cell.
///
/// After placement the pool is renormalised so the comoving energies sum to
/// the total decay energy released in the simulated time range.
pub fn initialise_packet_pool(
    grid: &PropagationGrid,
    model_cells: &[crate::cells::ModelCell],
    decay_data: &DecayData,
    n_packets: usize,
    t_max: fcn,
    rng: &mut RandomStream,
) -> Vec<Packet> {
    let t_min = grid.t_min();

    // cumulative decay energy over the propagation cells
    let mut cumulative = Vec::with_capacity(grid.n_cells());
    let mut norm = 0.0;
    for cellindex in 0..grid.n_cells() {
        if let Some(mgi) = grid.model_cell(cellindex) {
            let cell = &model_cells[mgi];
            let endecay_per_mass =
                decay_data.simtime_endecay_per_mass(&cell.nuc_mass_fractions, t_min, t_max);
            norm += grid.cell_volume_init(cellindex) * cell.rho_init * endecay_per_mass;
        }
        cumulative.push(norm);
    }
    assert!(norm > 0.0, "Model contains no radioactive energy");

    let e0 = norm / n_packets as fcn;
    info!("packet e0 (in time range) {:.6e} erg", e0);

    let mut packets: Vec<Packet> = (0..n_packets)
        .map(|id| {
            let target = rng.uniform() * norm;
            let cellindex = cumulative.partition_point(|&value| value <= target);
            let cellindex = cellindex.min(grid.n_cells() - 1);
            place_pellet(e0, cellindex, id, grid, model_cells, decay_data, t_min, t_max, rng)
        })
        .collect();

    // renormalise so the pool sums to the exact decay energy in range
    let e_cmf_total: fcn = packets.iter().map(|pkt| pkt.e_cmf).sum();
    assert!(e_cmf_total.is_finite() && e_cmf_total > 0.0);
    let e_ratio = norm / e_cmf_total;
    info!(
        "packet energy sum {:.6e} should be {:.6e}, normalisation factor {:.6}",
        e_cmf_total, norm, e_ratio
    );
    for pkt in &mut packets {
        pkt.e_cmf *= e_ratio;
        pkt.e_rf *= e_ratio;
    }
    packets
}

#[allow(clippy::too_many_arguments)]
fn place_pellet(
    e0: fcn,
    cellindex: usize,
    id: usize,
    grid: &PropagationGrid,
    model_cells: &[crate::cells::ModelCell],
    decay_data: &DecayData,
    t_min: fcn,
    t_max: fcn,
    rng: &mut RandomStream,
) -> Packet {
    let mut pkt = Packet::placeholder(id);
    pkt.cell = cellindex;
    pkt.prop_time = t_min;

    match grid.geometry() {
        crate::grid::GridGeometry::Spherical1D => {
            // volume-uniform radius within the shell
            let zrand = rng.uniform();
            let r_inner = grid.cell_coord_min(cellindex, 0);
            let r_outer = grid.cell_coord_max(cellindex, 0);
            let radius = (zrand * r_inner.powi(3) + (1.0 - zrand) * r_outer.powi(3)).cbrt();
            pkt.pos = rng.isotropic_direction().scaled(radius);
        }
        crate::grid::GridGeometry::Cartesian3D => {
            for dim in 0..3 {
                let zrand = rng.uniform_pos();
                let min = grid.cell_coord_min(cellindex, dim);
                let max = grid.cell_coord_max(cellindex, dim);
                pkt.pos[dim] = min + zrand * (max - min);
            }
        }
    }

    let mgi = grid
        .model_cell(cellindex)
        .expect("Pellets are only placed in non-empty cells");
    decay_data.setup_radioactive_pellet(
        e0,
        &model_cells[mgi].nuc_mass_fractions,
        t_min,
        t_max,
        rng,
        &mut pkt,
    );

    // the pellet rides the homologous flow, so its direction is radial
    pkt.dir = pkt.pos.normalized();
    let dopplerfactor = pkt.doppler();
    pkt.e_rf = pkt.e_cmf / dopplerfactor;
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_preserves_doppler_invariant() {
        let mut pkt = Packet::placeholder(0);
        pkt.ptype = PacketType::RPacket;
        pkt.pos = Vec3::new(1.0e14, 0.0, 0.0);
        pkt.dir = Vec3::new(0.6, 0.8, 0.0);
        pkt.prop_time = 1.0e5;
        pkt.nu_rf = 1.0e15;
        pkt.e_rf = 1.0e-8;
        pkt.nu_cmf = pkt.nu_rf * pkt.doppler();
        pkt.e_cmf = pkt.e_rf * pkt.doppler();

        pkt.advance(3.0e13);

        let dopplerfactor = pkt.doppler();
        assert!((pkt.e_cmf / pkt.e_rf - dopplerfactor).abs() < 1e-12);
        assert!((pkt.nu_cmf / pkt.nu_rf - dopplerfactor).abs() < 1e-12);
        assert!((pkt.dir.length() - 1.0).abs() < 1e-8);
    }

    #[test]
    fn emitted_rpkt_has_valid_polarisation_state() {
        let mut rng = RandomStream::new(5, 0, 0);
        let mut pkt = Packet::placeholder(0);
        pkt.pos = Vec3::new(0.0, 0.0, 2.0e14);
        pkt.prop_time = 1.0e5;
        pkt.nu_cmf = 1.0e15;
        pkt.e_cmf = 1.0e-8;
        pkt.emit_rpkt(&mut rng);

        assert_eq!(pkt.ptype, PacketType::RPacket);
        assert_eq!(pkt.stokes, [1.0, 0.0, 0.0]);
        assert!((pkt.pol_dir.length() - 1.0).abs() < 1e-8);
        assert!(pkt.pol_dir.dot(&pkt.dir).abs() < 1e-8);
        assert!((pkt.e_cmf / pkt.e_rf - pkt.doppler()).abs() < 1e-10);
    }

    #[test]
    fn electron_scattering_conserves_comoving_frequency() {
        let mut rng = RandomStream::new(6, 0, 0);
        let mut pkt = Packet::placeholder(0);
        pkt.ptype = PacketType::RPacket;
        pkt.pos = Vec3::new(1.0e14, 1.0e14, 0.0);
        pkt.prop_time = 2.0e5;
        pkt.nu_cmf = 8.0e14;
        pkt.e_cmf = 1.0e-8;
        pkt.dir = Vec3::new(0.0, 0.0, 1.0);
        pkt.nu_rf = pkt.nu_cmf / pkt.doppler();
        pkt.e_rf = pkt.e_cmf / pkt.doppler();

        let nu_cmf_before = pkt.nu_cmf;
        pkt.electron_scatter(&mut rng);

        assert_eq!(pkt.nu_cmf, nu_cmf_before);
        assert_eq!(pkt.nscatterings, 1);
        assert!(pkt.pol_dir.dot(&pkt.dir).abs() < 1e-8);
        assert!((pkt.e_cmf / pkt.e_rf - pkt.doppler()).abs() < 1e-10);
    }

    #[test]
    fn escape_freezes_packet_state() {
        let counters = Counters::new();
        let mut pkt = Packet::placeholder(0);
        pkt.ptype = PacketType::RPacket;
        pkt.prop_time = 3.0e5;
        pkt.change_cell(BoundaryCrossing::Escape, &counters);
        assert_eq!(pkt.ptype, PacketType::Escaped);
        assert_eq!(pkt.escape_type, Some(EscapeKind::RPacket));
        assert_eq!(pkt.escape_time, 3.0e5);
        assert_eq!(counters.escapes.get(), 1);
    }
}
