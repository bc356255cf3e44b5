//! Relaxed event counters shared across worker threads.

use atomic_counter::{AtomicCounter, RelaxedCounter};

/// Counters of notable packet events, accumulated over a timestep.
#[derive(Default)]
pub struct Counters {
    pub cell_crossings: RelaxedCounter,
    pub escapes: RelaxedCounter,
    pub electron_scatterings: RelaxedCounter,
    pub macroatom_activations_bb: RelaxedCounter,
    pub macroatom_activations_bf: RelaxedCounter,
    pub kpkts_from_ff: RelaxedCounter,
    pub kpkts_from_bf: RelaxedCounter,
    pub kpkts_from_lepton: RelaxedCounter,
    pub pellet_decays: RelaxedCounter,
    pub cellcache_resets: RelaxedCounter,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.cell_crossings.reset();
        self.escapes.reset();
        self.electron_scatterings.reset();
        self.macroatom_activations_bb.reset();
        self.macroatom_activations_bf.reset();
        self.kpkts_from_ff.reset();
        self.kpkts_from_bf.reset();
        self.kpkts_from_lepton.reset();
        self.pellet_decays.reset();
        self.cellcache_resets.reset();
    }
}
