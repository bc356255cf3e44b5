//! The atomic model: elements, ions, levels and the sorted line list.

use crate::constants::{fcn, CLIGHTSQUAREDOVERTWOH, HPLANCK};
use std::ops::Range;

/// Relative frequency difference below which two lines are considered
/// degenerate by the sort and the duplicate merge.
const NU_DEGENERACY_TOLERANCE: fcn = 1e-10;

/// An atomic energy level.
#[derive(Clone, Debug)]
pub struct Level {
    /// Energy above the ion ground state [erg].
    pub energy: fcn,
    /// Statistical weight g.
    pub stat_weight: fcn,
    /// Range into the downward-transition arena (lines with this level as upper).
    pub downtrans: Range<usize>,
    /// Range into the upward-transition arena (lines with this level as lower).
    pub uptrans: Range<usize>,
}

/// An ionisation stage of an element.
#[derive(Clone, Debug)]
pub struct Ion {
    /// Ionisation stage (1 = neutral).
    pub ion_stage: u32,
    /// Ionisation potential to the next stage [erg].
    pub ionpot: fcn,
    pub levels: Vec<Level>,
}

impl Ion {
    pub fn nlevels(&self) -> usize {
        self.levels.len()
    }
}

/// An element included in the model.
#[derive(Clone, Debug)]
pub struct Element {
    /// Atomic number Z.
    pub atomic_number: u32,
    /// Atomic mass [g].
    pub mass: fcn,
    pub ions: Vec<Ion>,
}

impl Element {
    pub fn nions(&self) -> usize {
        self.ions.len()
    }
}

/// A bound-bound transition in the global line list.
#[derive(Clone, Debug)]
pub struct LineEntry {
    /// Transition frequency [Hz].
    pub nu: fcn,
    pub element: usize,
    pub ion: usize,
    pub lower: usize,
    pub upper: usize,
    /// Einstein spontaneous emission coefficient A_ul [1/s].
    pub einstein_a: fcn,
    /// Absorption oscillator strength f_lu.
    pub osc_strength: fcn,
    /// Effective collision strength, if known.
    pub coll_str: Option<fcn>,
    pub forbidden: bool,
}

/// The global line list, sorted by descending frequency.
///
/// The descending order is a hard invariant consumed by the event-sampling
/// walk: a packet redshifting through the ejecta encounters lines in list
/// order.
#[derive(Clone, Debug, Default)]
pub struct LineList {
    entries: Vec<LineEntry>,
}

impl LineList {
    /// Builds the list from unsorted entries.
    ///
    /// Frequencies within `NU_DEGENERACY_TOLERANCE` relative are clamped to
    /// exact equality before the stable sort, so duplicate detection is
    /// deterministic. Duplicate transitions (same element, ion, lower,
    /// upper) are merged by summing A and f and keeping the largest
    /// collision strength.
    pub fn from_unsorted(mut entries: Vec<LineEntry>) -> Self {
        entries.sort_by(|a, b| b.nu.partial_cmp(&a.nu).expect("Non-finite line frequency"));

        for i in 1..entries.len() {
            let nu_prev = entries[i - 1].nu;
            if (nu_prev - entries[i].nu).abs() < NU_DEGENERACY_TOLERANCE * nu_prev {
                entries[i].nu = nu_prev;
            }
        }
        // clamping can only reorder within degenerate groups, so a second
        // stable sort leaves the order deterministic
        entries.sort_by(|a, b| b.nu.partial_cmp(&a.nu).expect("Non-finite line frequency"));

        let mut merged: Vec<LineEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match merged.last_mut() {
                Some(last)
                    if last.nu == entry.nu
                        && last.element == entry.element
                        && last.ion == entry.ion
                        && last.lower == entry.lower
                        && last.upper == entry.upper =>
                {
                    last.einstein_a += entry.einstein_a;
                    last.osc_strength += entry.osc_strength;
                    last.coll_str = match (last.coll_str, entry.coll_str) {
                        (Some(a), Some(b)) => Some(fcn::max(a, b)),
                        (a, b) => a.or(b),
                    };
                    last.forbidden = last.forbidden && entry.forbidden;
                }
                _ => merged.push(entry),
            }
        }

        Self { entries: merged }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, lineindex: usize) -> &LineEntry {
        &self.entries[lineindex]
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }

    /// Finds the next transition a redshifting packet can reach.
    ///
    /// Returns the index of the highest-frequency line with nu <= `nu_cmf`,
    /// searching no earlier than `next_trans`. A non-zero hint is returned
    /// as-is: a packet that interacted with line k can only redshift into
    /// lines with index >= k+1, independent of accumulated propagation
    /// error in its current nu_cmf. Returns `None` when no line can be
    /// reached any more.
    pub fn closest_transition(&self, nu_cmf: fcn, next_trans: usize) -> Option<usize> {
        let nlines = self.entries.len();
        if nlines == 0 || next_trans >= nlines {
            return None;
        }
        if nu_cmf < self.entries[nlines - 1].nu {
            return None;
        }

        if next_trans > 0 {
            Some(next_trans)
        } else if nu_cmf >= self.entries[0].nu {
            Some(0)
        } else {
            // first index where nu <= nu_cmf, in a descending list
            let idx = self
                .entries
                .partition_point(|line| line.nu > nu_cmf);
            debug_assert!(idx < nlines);
            Some(idx)
        }
    }

    /// Re-synchronises a packet's transition hint after it crossed empty or
    /// grey cells, where it may have redshifted over several lines.
    ///
    /// Unlike `closest_transition` the returned index is where the *next*
    /// search should start, not a line to interact with now.
    pub fn sync_transition_hint(&self, nu_cmf: fcn, next_trans: usize) -> usize {
        let nlines = self.entries.len();
        if nlines == 0 || next_trans > nlines {
            return nlines + 1;
        }
        if nu_cmf < self.entries[nlines - 1].nu {
            return nlines + 1;
        }
        let start = next_trans.min(nlines.saturating_sub(1));
        if nu_cmf >= self.entries[start].nu {
            start
        } else {
            self.entries[start..]
                .partition_point(|line| line.nu > nu_cmf)
                + start
        }
    }
}

/// A photoionisation target: the level of the upper ion reached by
/// ionisation from a given lower level, with its branching probability.
#[derive(Clone, Debug)]
pub struct PhixsTarget {
    pub upper_level: usize,
    pub probability: fcn,
}

/// A photoionisation cross-section table for one lower level.
///
/// Cross sections are sampled on a uniform grid in nu/nu_edge starting at
/// the threshold, with spacing `nu_increment`; all targets of the same
/// lower level share the table.
#[derive(Clone, Debug)]
pub struct PhotoionTable {
    pub element: usize,
    pub ion: usize,
    pub level: usize,
    /// Threshold frequency [Hz].
    pub nu_edge: fcn,
    pub targets: Vec<PhixsTarget>,
    /// Cross sections [cm^2] at nu/nu_edge = 1, 1+d, 1+2d, ...
    pub sigma: Vec<fcn>,
}

impl PhotoionTable {
    /// Interpolates the cross section at the given frequency, or returns
    /// zero outside the tabulated range.
    pub fn sigma_at(&self, nu: fcn, nu_increment: fcn) -> fcn {
        if nu < self.nu_edge {
            return 0.0;
        }
        let ratio = nu / self.nu_edge;
        let pos = (ratio - 1.0) / nu_increment;
        let below = pos.floor() as usize;
        if below + 1 >= self.sigma.len() {
            return 0.0;
        }
        let frac = pos - below as fcn;
        (1.0 - frac) * self.sigma[below] + frac * self.sigma[below + 1]
    }

    /// The highest tabulated frequency [Hz].
    pub fn nu_max(&self, nu_increment: fcn) -> fcn {
        self.nu_edge * (1.0 + nu_increment * (self.sigma.len() as fcn - 1.0))
    }
}

/// One bound-free continuum: a (lower level, target) pair, flattened for
/// the opacity sum and sorted by threshold frequency ascending.
#[derive(Clone, Debug)]
pub struct BfContinuum {
    pub element: usize,
    pub ion: usize,
    pub level: usize,
    pub upper_level: usize,
    pub probability: fcn,
    pub nu_edge: fcn,
    /// Index of the shared cross-section table.
    pub table: usize,
}

/// The complete atomic dataset for a run.
#[derive(Clone, Debug, Default)]
pub struct AtomicModel {
    pub elements: Vec<Element>,
    pub lines: LineList,
    /// Arena of line indices for downward transitions, indexed through
    /// `Level::downtrans`.
    pub downtrans_arena: Vec<usize>,
    /// Arena of line indices for upward transitions, indexed through
    /// `Level::uptrans`.
    pub uptrans_arena: Vec<usize>,
    /// Photoionisation tables, one per lower level with data.
    pub phixs_tables: Vec<PhotoionTable>,
    /// Flattened continua sorted by nu_edge ascending.
    pub bf_continua: Vec<BfContinuum>,
    /// Spacing of the shared nu/nu_edge cross-section grid.
    pub phixs_nu_increment: fcn,
}

impl AtomicModel {
    pub fn nelements(&self) -> usize {
        self.elements.len()
    }

    /// The largest ion count of any element; spectra index their
    /// per-(element, ion) columns with this stride.
    pub fn max_nions(&self) -> usize {
        self.elements
            .iter()
            .map(|element| element.nions())
            .max()
            .unwrap_or(0)
    }

    pub fn level(&self, element: usize, ion: usize, level: usize) -> &Level {
        &self.elements[element].ions[ion].levels[level]
    }

    pub fn stat_weight(&self, element: usize, ion: usize, level: usize) -> fcn {
        self.level(element, ion, level).stat_weight
    }

    /// Level energy above the ion ground state [erg].
    pub fn epsilon(&self, element: usize, ion: usize, level: usize) -> fcn {
        self.level(element, ion, level).energy
    }

    /// Einstein B_ul for the given line, from A_ul.
    pub fn einstein_b_ul(&self, line: &LineEntry) -> fcn {
        CLIGHTSQUAREDOVERTWOH / (line.nu * line.nu * line.nu) * line.einstein_a
    }

    /// Einstein B_lu for the given line.
    pub fn einstein_b_lu(&self, line: &LineEntry) -> fcn {
        let g_upper = self.stat_weight(line.element, line.ion, line.upper);
        let g_lower = self.stat_weight(line.element, line.ion, line.lower);
        g_upper / g_lower * self.einstein_b_ul(line)
    }

    /// Transition energy of the given line [erg].
    pub fn epsilon_trans(&self, line: &LineEntry) -> fcn {
        HPLANCK * line.nu
    }

    /// Level energy measured from the neutral ground state [erg]: the
    /// ionisation potentials of all lower stages plus the in-ion energy.
    /// Used to weight macro-atom internal transitions consistently across
    /// ions.
    pub fn epsilon_total(&self, element: usize, ion: usize, level: usize) -> fcn {
        let ion_base: fcn = self.elements[element].ions[..ion]
            .iter()
            .map(|lower_ion| lower_ion.ionpot)
            .sum();
        ion_base + self.epsilon(element, ion, level)
    }

    /// Rebuilds the per-level transition arenas from the sorted line list.
    ///
    /// Must be called after the line list changes; the level ranges are
    /// invalid until then.
    pub fn rebuild_transition_arenas(&mut self) {
        let mut down_lists: Vec<Vec<Vec<Vec<usize>>>> = self
            .elements
            .iter()
            .map(|element| {
                element
                    .ions
                    .iter()
                    .map(|ion| vec![Vec::new(); ion.nlevels()])
                    .collect()
            })
            .collect();
        let mut up_lists = down_lists.clone();

        for (lineindex, line) in self.lines.entries().iter().enumerate() {
            down_lists[line.element][line.ion][line.upper].push(lineindex);
            up_lists[line.element][line.ion][line.lower].push(lineindex);
        }

        self.downtrans_arena.clear();
        self.uptrans_arena.clear();
        for (elementindex, element) in self.elements.iter_mut().enumerate() {
            for (ionindex, ion) in element.ions.iter_mut().enumerate() {
                for (levelindex, level) in ion.levels.iter_mut().enumerate() {
                    let down = &down_lists[elementindex][ionindex][levelindex];
                    let up = &up_lists[elementindex][ionindex][levelindex];
                    let down_start = self.downtrans_arena.len();
                    self.downtrans_arena.extend_from_slice(down);
                    level.downtrans = down_start..self.downtrans_arena.len();
                    let up_start = self.uptrans_arena.len();
                    self.uptrans_arena.extend_from_slice(up);
                    level.uptrans = up_start..self.uptrans_arena.len();
                }
            }
        }
    }

    /// Drops photoionisation tables beyond the given number of lower
    /// levels per ion, then rebuilds the flattened continuum list.
    pub fn limit_bf_continua_per_ion(&mut self, max_per_ion: Option<usize>) {
        if let Some(max_per_ion) = max_per_ion {
            self.phixs_tables
                .retain(|table| table.level < max_per_ion);
        }
        self.rebuild_bf_continua();
    }

    /// Rebuilds the flattened bound-free continuum list, sorted by
    /// threshold frequency ascending.
    pub fn rebuild_bf_continua(&mut self) {
        self.bf_continua.clear();
        for (table_index, table) in self.phixs_tables.iter().enumerate() {
            for target in &table.targets {
                self.bf_continua.push(BfContinuum {
                    element: table.element,
                    ion: table.ion,
                    level: table.level,
                    upper_level: target.upper_level,
                    probability: target.probability,
                    nu_edge: table.nu_edge,
                    table: table_index,
                });
            }
        }
        self.bf_continua.sort_by(|a, b| {
            a.nu_edge
                .partial_cmp(&b.nu_edge)
                .expect("Non-finite continuum edge")
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_line(nu: fcn, lower: usize, upper: usize) -> LineEntry {
        LineEntry {
            nu,
            element: 0,
            ion: 0,
            lower,
            upper,
            einstein_a: 1.0e7,
            osc_strength: 0.1,
            coll_str: None,
            forbidden: false,
        }
    }

    #[test]
    fn line_list_is_sorted_descending() {
        let list = LineList::from_unsorted(vec![
            test_line(1.0e15, 0, 1),
            test_line(3.0e15, 0, 3),
            test_line(2.0e15, 0, 2),
        ]);
        for i in 1..list.len() {
            assert!(list.entry(i - 1).nu >= list.entry(i).nu);
        }
    }

    #[test]
    fn line_list_sort_is_idempotent() {
        let list = LineList::from_unsorted(vec![
            test_line(2.0e15, 0, 2),
            test_line(2.0e15 * (1.0 + 1e-12), 1, 3),
            test_line(1.0e15, 0, 1),
        ]);
        let nus: Vec<fcn> = list.entries().iter().map(|line| line.nu).collect();
        let resorted = LineList::from_unsorted(list.entries().to_vec());
        let nus2: Vec<fcn> = resorted.entries().iter().map(|line| line.nu).collect();
        assert_eq!(nus, nus2);
        // the near-equal pair was clamped to one frequency
        assert_eq!(nus[0], nus[1]);
    }

    #[test]
    fn duplicate_lines_are_merged() {
        let mut a = test_line(2.0e15, 0, 2);
        a.coll_str = Some(1.5);
        let mut b = test_line(2.0e15, 0, 2);
        b.coll_str = Some(4.0);
        let list = LineList::from_unsorted(vec![a, b]);
        assert_eq!(list.len(), 1);
        let merged = list.entry(0);
        assert!((merged.einstein_a - 2.0e7).abs() < 1.0);
        assert!((merged.osc_strength - 0.2).abs() < 1e-12);
        assert_eq!(merged.coll_str, Some(4.0));
    }

    #[test]
    fn closest_transition_respects_hint() {
        // linelist [3e15, 2e15, 1e15]; nu_cmf = 2.5e15 and hint 0 finds
        // index 1; after interacting the hint advances to 2 and the same
        // query returns 2.
        let list = LineList::from_unsorted(vec![
            test_line(3.0e15, 0, 3),
            test_line(2.0e15, 0, 2),
            test_line(1.0e15, 0, 1),
        ]);
        assert_eq!(list.closest_transition(2.5e15, 0), Some(1));
        assert_eq!(list.closest_transition(2.5e15, 2), Some(2));
        // below the redmost line no interaction is possible
        assert_eq!(list.closest_transition(0.5e15, 0), None);
        // hint past the end of the list
        assert_eq!(list.closest_transition(2.5e15, 3), None);
    }

    #[test]
    fn phixs_interpolation_hits_table_points() {
        let table = PhotoionTable {
            element: 0,
            ion: 0,
            level: 0,
            nu_edge: 1.0e15,
            targets: vec![PhixsTarget {
                upper_level: 0,
                probability: 1.0,
            }],
            sigma: vec![4.0e-18, 2.0e-18, 1.0e-18],
        };
        let d = 0.1;
        assert!((table.sigma_at(1.0e15, d) - 4.0e-18).abs() < 1e-30);
        assert!((table.sigma_at(1.05e15, d) - 3.0e-18).abs() < 1e-30);
        assert_eq!(table.sigma_at(0.9e15, d), 0.0);
        assert_eq!(table.sigma_at(1.3e15, d), 0.0);
    }
}
