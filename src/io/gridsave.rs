//! The gridsave checkpoint and the per-rank packet dump files.

use super::model::TokenReader;
use crate::constants::fcn;
use crate::decay::DecayType;
use crate::geometry::Vec3;
use crate::grid::CellFace;
use crate::nonthermal::{NonThermalSolver, NtSolution};
use crate::packets::{
    AbsorptionRecord, EmissionRecord, EmissionType, EscapeKind, MacroAtomState, Packet, PacketType,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::path::Path;

/// Sentinel marking the beginning of the Spencer-Fano checkpoint section.
pub const NT_SECTION_SENTINEL: i64 = 24_724_518;

/// Magic number of the binary packet checkpoint files.
const PACKET_FILE_MAGIC: u32 = 0x504b_5431; // "PKT1"

/// Writes the gridsave checkpoint: the timestep plus the full per-cell
/// Spencer-Fano solution state.
///
/// Floats are written in Rust's shortest round-trip representation, so a
/// read restores them bit-identically.
pub fn write_gridsave(
    path: &Path,
    timestep: usize,
    solver: &NonThermalSolver,
    solutions: &[NtSolution],
) -> io::Result<()> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(file, "{}", timestep)?;
    writeln!(file, "{}", NT_SECTION_SENTINEL)?;
    writeln!(
        file,
        "{} {} {}",
        solver.grid.len(),
        solver.grid.energies_ev[0],
        solver.grid.energies_ev[solver.grid.len() - 1]
    )?;

    for (mgi, solution) in solutions.iter().enumerate() {
        write!(
            file,
            "{} {} {} {} {} {} {}",
            mgi,
            solution.timestep.map_or(-1, |ts| ts as i64),
            solution.e_0,
            solution.frac_heating,
            solution.frac_ionisation,
            solution.frac_excitation,
            solution.deposition_rate_density
        )?;
        for per_element in &solution.eff_ionpot {
            for &value in per_element {
                write!(file, " {}", value)?;
            }
        }
        for table in [&solution.prob_doubleionize, &solution.prob_tripleionize] {
            for per_element in table.iter() {
                for &value in per_element {
                    write!(file, " {}", value)?;
                }
            }
        }

        write!(file, " {}", solution.ionisations.len())?;
        for channel in &solution.ionisations {
            write!(
                file,
                " {} {} {}",
                channel.frac_deposition, channel.element, channel.ion
            )?;
        }
        write!(file, " {}", solution.excitations.len())?;
        for channel in &solution.excitations {
            write!(
                file,
                " {} {} {}",
                channel.frac_deposition, channel.ratecoeff_per_deposition, channel.line
            )?;
        }
        writeln!(file)?;
    }
    Ok(())
}

/// Reads a gridsave checkpoint back, restoring the per-cell solutions.
///
/// Corrupt checkpoints (missing sentinel, wrong solver grid) are fatal
/// configuration errors reported through the `Err` variant.
pub fn read_gridsave(
    path: &Path,
    solver: &NonThermalSolver,
    template: &[NtSolution],
) -> io::Result<(usize, Vec<NtSolution>)> {
    let file = std::fs::File::open(path)?;
    let mut tokens = TokenReader::new(io::BufReader::new(file));

    let timestep: usize = tokens.next_value("checkpoint timestep")?;
    let sentinel: i64 = tokens.next_value("non-thermal section sentinel")?;
    if sentinel != NT_SECTION_SENTINEL {
        return Err(invalid(format!(
            "non-thermal restart sentinel not found: got {}",
            sentinel
        )));
    }
    let npts: usize = tokens.next_value("solver grid size")?;
    let emin: fcn = tokens.next_value("solver emin")?;
    let emax: fcn = tokens.next_value("solver emax")?;
    if npts != solver.grid.len()
        || emin != solver.grid.energies_ev[0]
        || emax != solver.grid.energies_ev[npts - 1]
    {
        return Err(invalid(format!(
            "checkpoint solver grid ({} points, {} to {} eV) does not match this run",
            npts, emin, emax
        )));
    }

    let mut solutions = template.to_vec();
    for (mgi, solution) in solutions.iter_mut().enumerate() {
        let mgi_in: usize = tokens.next_value("checkpoint cell index")?;
        if mgi_in != mgi {
            return Err(invalid(format!(
                "expected checkpoint data for cell {} but found cell {}",
                mgi, mgi_in
            )));
        }
        let timestep_in: i64 = tokens.next_value("solution timestep")?;
        solution.timestep = usize::try_from(timestep_in).ok();
        solution.e_0 = tokens.next_value("E_0")?;
        solution.frac_heating = tokens.next_value("heating fraction")?;
        solution.frac_ionisation = tokens.next_value("ionisation fraction")?;
        solution.frac_excitation = tokens.next_value("excitation fraction")?;
        solution.deposition_rate_density = tokens.next_value("deposition rate density")?;

        for per_element in solution.eff_ionpot.iter_mut() {
            for value in per_element.iter_mut() {
                *value = tokens.next_value("effective ionisation potential")?;
            }
        }
        for table in [
            &mut solution.prob_doubleionize,
            &mut solution.prob_tripleionize,
        ] {
            for per_element in table.iter_mut() {
                for value in per_element.iter_mut() {
                    *value = tokens.next_value("Auger probability")?;
                }
            }
        }

        let n_ionisations: usize = tokens.next_value("ionisation list size")?;
        solution.ionisations.clear();
        for _ in 0..n_ionisations {
            solution.ionisations.push(crate::nonthermal::NtIonisationChannel {
                frac_deposition: tokens.next_value("ionisation fraction")?,
                element: tokens.next_value("ionisation element")?,
                ion: tokens.next_value("ionisation ion")?,
            });
        }
        let n_excitations: usize = tokens.next_value("excitation list size")?;
        solution.excitations.clear();
        for _ in 0..n_excitations {
            solution.excitations.push(crate::nonthermal::NtExcitationChannel {
                frac_deposition: tokens.next_value("excitation fraction")?,
                ratecoeff_per_deposition: tokens.next_value("excitation rate coefficient")?,
                line: tokens.next_value("excitation line")?,
            });
        }
    }

    Ok((timestep, solutions))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn packet_type_tag(ptype: PacketType) -> u8 {
    match ptype {
        PacketType::Pellet { .. } => 0,
        PacketType::Gamma => 1,
        PacketType::RPacket => 2,
        PacketType::KPacket => 3,
        PacketType::PreKPacket => 4,
        PacketType::NonThermalPredeposit => 5,
        PacketType::NonThermalLepton => 6,
        PacketType::MacroAtom(_) => 7,
        PacketType::Escaped => 8,
    }
}

fn decay_type_tag(decay_type: DecayType) -> u8 {
    match decay_type {
        DecayType::Alpha => 0,
        DecayType::ElectronCapture => 1,
        DecayType::BetaPlus => 2,
        DecayType::BetaMinus => 3,
        DecayType::None => 4,
    }
}

fn decay_type_from_tag(tag: u8) -> io::Result<DecayType> {
    Ok(match tag {
        0 => DecayType::Alpha,
        1 => DecayType::ElectronCapture,
        2 => DecayType::BetaPlus,
        3 => DecayType::BetaMinus,
        4 => DecayType::None,
        other => return Err(invalid(format!("unknown decay type tag {}", other))),
    })
}

fn cell_face_tag(face: Option<CellFace>) -> u8 {
    match face {
        None => 0,
        Some(CellFace::NegX) => 1,
        Some(CellFace::PosX) => 2,
        Some(CellFace::NegY) => 3,
        Some(CellFace::PosY) => 4,
        Some(CellFace::NegZ) => 5,
        Some(CellFace::PosZ) => 6,
    }
}

fn cell_face_from_tag(tag: u8) -> io::Result<Option<CellFace>> {
    Ok(match tag {
        0 => None,
        1 => Some(CellFace::NegX),
        2 => Some(CellFace::PosX),
        3 => Some(CellFace::NegY),
        4 => Some(CellFace::PosY),
        5 => Some(CellFace::NegZ),
        6 => Some(CellFace::PosZ),
        other => return Err(invalid(format!("unknown cell face tag {}", other))),
    })
}

fn emission_type_code(emission_type: Option<EmissionType>) -> (u8, u64) {
    match emission_type {
        None => (0, 0),
        Some(EmissionType::BoundBound(line)) => (1, line as u64),
        Some(EmissionType::BoundFree(continuum)) => (2, continuum as u64),
        Some(EmissionType::FreeFree) => (3, 0),
    }
}

fn emission_type_from_code(tag: u8, index: u64) -> io::Result<Option<EmissionType>> {
    Ok(match tag {
        0 => None,
        1 => Some(EmissionType::BoundBound(index as usize)),
        2 => Some(EmissionType::BoundFree(index as usize)),
        3 => Some(EmissionType::FreeFree),
        other => return Err(invalid(format!("unknown emission type tag {}", other))),
    })
}

fn write_vec3<W: Write>(writer: &mut W, vec: &Vec3<fcn>) -> io::Result<()> {
    for dim in 0..3 {
        writer.write_f64::<LittleEndian>(vec[dim])?;
    }
    Ok(())
}

fn read_vec3<R: Read>(reader: &mut R) -> io::Result<Vec3<fcn>> {
    let x = reader.read_f64::<LittleEndian>()?;
    let y = reader.read_f64::<LittleEndian>()?;
    let z = reader.read_f64::<LittleEndian>()?;
    Ok(Vec3::new(x, y, z))
}

fn write_emission_record<W: Write>(writer: &mut W, record: &EmissionRecord) -> io::Result<()> {
    let (tag, index) = emission_type_code(record.emission_type);
    writer.write_u8(tag)?;
    writer.write_u64::<LittleEndian>(index)?;
    write_vec3(writer, &record.position)?;
    writer.write_f64::<LittleEndian>(record.time)
}

fn read_emission_record<R: Read>(reader: &mut R) -> io::Result<EmissionRecord> {
    let tag = reader.read_u8()?;
    let index = reader.read_u64::<LittleEndian>()?;
    Ok(EmissionRecord {
        emission_type: emission_type_from_code(tag, index)?,
        position: read_vec3(reader)?,
        time: reader.read_f64::<LittleEndian>()?,
    })
}

/// Writes the binary per-rank packet checkpoint (`packets_*.tmp`).
pub fn write_temp_packets(path: &Path, packets: &[Packet]) -> io::Result<()> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    file.write_u32::<LittleEndian>(PACKET_FILE_MAGIC)?;
    file.write_u64::<LittleEndian>(packets.len() as u64)?;
    for pkt in packets {
        file.write_u64::<LittleEndian>(pkt.id as u64)?;
        file.write_u8(packet_type_tag(pkt.ptype))?;
        match pkt.ptype {
            PacketType::Pellet { nuclide } => {
                file.write_u64::<LittleEndian>(nuclide as u64)?;
            }
            PacketType::MacroAtom(state) => {
                file.write_u64::<LittleEndian>(state.element as u64)?;
                file.write_u64::<LittleEndian>(state.ion as u64)?;
                file.write_u64::<LittleEndian>(state.level as u64)?;
                file.write_i64::<LittleEndian>(
                    state.activating_line.map_or(-1, |line| line as i64),
                )?;
            }
            _ => {}
        }
        file.write_u64::<LittleEndian>(pkt.cell as u64)?;
        write_vec3(&mut file, &pkt.pos)?;
        write_vec3(&mut file, &pkt.dir)?;
        for value in [
            pkt.e_rf, pkt.e_cmf, pkt.nu_rf, pkt.nu_cmf, pkt.prop_time, pkt.t_decay,
        ] {
            file.write_f64::<LittleEndian>(value)?;
        }
        file.write_u8(cell_face_tag(pkt.last_cross))?;
        file.write_u64::<LittleEndian>(pkt.next_trans as u64)?;
        write_emission_record(&mut file, &pkt.emission)?;
        write_emission_record(&mut file, &pkt.true_emission)?;
        file.write_f64::<LittleEndian>(pkt.true_emission_velocity)?;
        file.write_i64::<LittleEndian>(pkt.absorption.line.map_or(-1, |line| line as i64))?;
        file.write_f64::<LittleEndian>(pkt.absorption.nu_rf)?;
        write_vec3(&mut file, &pkt.absorption.direction)?;
        for value in pkt.stokes {
            file.write_f64::<LittleEndian>(value)?;
        }
        write_vec3(&mut file, &pkt.pol_dir)?;
        file.write_u32::<LittleEndian>(pkt.nscatterings)?;
        file.write_u32::<LittleEndian>(pkt.interactions)?;
        file.write_u32::<LittleEndian>(pkt.scat_count)?;
        file.write_f64::<LittleEndian>(pkt.escape_time)?;
        file.write_u8(match pkt.escape_type {
            None => 0,
            Some(EscapeKind::RPacket) => 1,
            Some(EscapeKind::Gamma) => 2,
        })?;
        file.write_u64::<LittleEndian>(pkt.pellet_nuclide as u64)?;
        file.write_u8(decay_type_tag(pkt.pellet_decaytype))?;
        file.write_u8(pkt.originated_from_particle as u8)?;
    }
    Ok(())
}

/// Reads a binary packet checkpoint written by `write_temp_packets`.
pub fn read_temp_packets(path: &Path) -> io::Result<Vec<Packet>> {
    let mut file = io::BufReader::new(std::fs::File::open(path)?);
    let magic = file.read_u32::<LittleEndian>()?;
    if magic != PACKET_FILE_MAGIC {
        return Err(invalid(format!(
            "bad packet checkpoint magic {:#x}",
            magic
        )));
    }
    let count = file.read_u64::<LittleEndian>()? as usize;
    let mut packets = Vec::with_capacity(count);
    for _ in 0..count {
        let id = file.read_u64::<LittleEndian>()? as usize;
        let mut pkt = Packet::placeholder(id);
        let type_tag = file.read_u8()?;
        pkt.ptype = match type_tag {
            0 => PacketType::Pellet {
                nuclide: file.read_u64::<LittleEndian>()? as usize,
            },
            1 => PacketType::Gamma,
            2 => PacketType::RPacket,
            3 => PacketType::KPacket,
            4 => PacketType::PreKPacket,
            5 => PacketType::NonThermalPredeposit,
            6 => PacketType::NonThermalLepton,
            7 => {
                let element = file.read_u64::<LittleEndian>()? as usize;
                let ion = file.read_u64::<LittleEndian>()? as usize;
                let level = file.read_u64::<LittleEndian>()? as usize;
                let line = file.read_i64::<LittleEndian>()?;
                PacketType::MacroAtom(MacroAtomState {
                    element,
                    ion,
                    level,
                    activating_line: usize::try_from(line).ok(),
                })
            }
            8 => PacketType::Escaped,
            other => return Err(invalid(format!("unknown packet type tag {}", other))),
        };
        pkt.cell = file.read_u64::<LittleEndian>()? as usize;
        pkt.pos = read_vec3(&mut file)?;
        pkt.dir = read_vec3(&mut file)?;
        pkt.e_rf = file.read_f64::<LittleEndian>()?;
        pkt.e_cmf = file.read_f64::<LittleEndian>()?;
        pkt.nu_rf = file.read_f64::<LittleEndian>()?;
        pkt.nu_cmf = file.read_f64::<LittleEndian>()?;
        pkt.prop_time = file.read_f64::<LittleEndian>()?;
        pkt.t_decay = file.read_f64::<LittleEndian>()?;
        pkt.last_cross = cell_face_from_tag(file.read_u8()?)?;
        pkt.next_trans = file.read_u64::<LittleEndian>()? as usize;
        pkt.emission = read_emission_record(&mut file)?;
        pkt.true_emission = read_emission_record(&mut file)?;
        pkt.true_emission_velocity = file.read_f64::<LittleEndian>()?;
        let absorption_line = file.read_i64::<LittleEndian>()?;
        pkt.absorption = AbsorptionRecord {
            line: usize::try_from(absorption_line).ok(),
            nu_rf: file.read_f64::<LittleEndian>()?,
            direction: read_vec3(&mut file)?,
        };
        for value in pkt.stokes.iter_mut() {
            *value = file.read_f64::<LittleEndian>()?;
        }
        pkt.pol_dir = read_vec3(&mut file)?;
        pkt.nscatterings = file.read_u32::<LittleEndian>()?;
        pkt.interactions = file.read_u32::<LittleEndian>()?;
        pkt.scat_count = file.read_u32::<LittleEndian>()?;
        pkt.escape_time = file.read_f64::<LittleEndian>()?;
        pkt.escape_type = match file.read_u8()? {
            0 => None,
            1 => Some(EscapeKind::RPacket),
            2 => Some(EscapeKind::Gamma),
            other => return Err(invalid(format!("unknown escape kind tag {}", other))),
        };
        pkt.pellet_nuclide = file.read_u64::<LittleEndian>()? as usize;
        pkt.pellet_decaytype = decay_type_from_tag(file.read_u8()?)?;
        pkt.originated_from_particle = file.read_u8()? != 0;
        packets.push(pkt);
    }
    Ok(packets)
}

/// Writes the human-readable per-rank packet dump (`packets*.out`).
pub fn write_packets_text(path: &Path, packets: &[Packet]) -> io::Result<()> {
    let mut file = io::BufWriter::new(std::fs::File::create(path)?);
    writeln!(
        file,
        "#id cell type posx posy posz dirx diry dirz tdecay e_cmf e_rf nu_cmf nu_rf \
         escape_type escape_time scat_count next_trans interactions nscatterings \
         stokes_i stokes_q stokes_u pellet_nuclide"
    )?;
    for pkt in packets {
        writeln!(
            file,
            "{} {} {} {:e} {:e} {:e} {:e} {:e} {:e} {:e} {:e} {:e} {:e} {:e} {} {:e} {} {} {} {} {:e} {:e} {:e} {}",
            pkt.id,
            pkt.cell,
            packet_type_tag(pkt.ptype),
            pkt.pos[0],
            pkt.pos[1],
            pkt.pos[2],
            pkt.dir[0],
            pkt.dir[1],
            pkt.dir[2],
            pkt.t_decay,
            pkt.e_cmf,
            pkt.e_rf,
            pkt.nu_cmf,
            pkt.nu_rf,
            match pkt.escape_type {
                None => 0,
                Some(EscapeKind::RPacket) => 1,
                Some(EscapeKind::Gamma) => 2,
            },
            pkt.escape_time,
            pkt.scat_count,
            pkt.next_trans,
            pkt.interactions,
            pkt.nscatterings,
            pkt.stokes[0],
            pkt.stokes[1],
            pkt.stokes[2],
            pkt.pellet_nuclide
        )?;
    }
    Ok(())
}
