//! Physical and mathematical constants.

/// Floating-point precision to use for constants.
#[allow(non_camel_case_types)]
pub type fcn = f64;

// Mathematical constants

pub const PI: fcn = std::f64::consts::PI;
/// 4*pi.
pub const FOURPI: fcn = 4.0 * PI;

// Physical constants (CGS)

/// Speed of light in vacuum [cm/s].
pub const CLIGHT: fcn = 2.997_924_58e10;
/// Planck constant [erg s].
pub const HPLANCK: fcn = 6.626_075_5e-27;
/// Boltzmann constant [erg/K].
pub const KBOLTZMANN: fcn = 1.380_658e-16;
/// Electron mass [g].
pub const M_ELECTRON: fcn = 9.109_389_7e-28;
/// Electron charge [esu].
pub const Q_ELECTRON: fcn = 4.803_25e-10;
/// Hydrogen mass [g].
pub const M_H: fcn = 1.673_52e-24;
/// Thomson cross-section [cm^2].
pub const SIGMA_T: fcn = 6.652_4e-25;
/// Stefan-Boltzmann constant [erg/(cm^2 s K^4)].
pub const STEFBOLTZ: fcn = 5.670_400e-5;
/// Solar mass [g].
pub const MSUN: fcn = 1.988_55e33;
/// Bohr radius squared [cm^2].
pub const A_NAUGHT_SQUARED: fcn = 2.800_285_203e-17;
/// Ionization potential of hydrogen [erg].
pub const H_IONPOT: fcn = 13.598 * EV_TO_ERG;

// Derived constants

/// Speed of light squared [cm^2/s^2].
pub const CLIGHTSQUARED: fcn = CLIGHT * CLIGHT;
/// c^2 / 2h, relating Einstein A and B coefficients.
pub const CLIGHTSQUAREDOVERTWOH: fcn = CLIGHTSQUARED / (2.0 * HPLANCK);
/// h / k_B [K s].
pub const HOVERKB: fcn = HPLANCK / KBOLTZMANN;
/// h c / 4 pi, the Sobolev opacity scale [erg cm].
pub const HCLIGHTOVERFOURPI: fcn = HPLANCK * CLIGHT / FOURPI;

// Unit conversion factors

/// Conversion factor from electron volts to ergs.
pub const EV_TO_ERG: fcn = 1.602_177_33e-12;
/// Conversion factor from mega electron volts to ergs.
pub const MEV_TO_ERG: fcn = EV_TO_ERG * 1e6;
/// Conversion factor from days to seconds.
pub const DAY_TO_S: fcn = 86_400.0;
/// Conversion factor from parsecs to centimeters.
pub const PARSEC_TO_CM: fcn = 3.085_7e18;
/// Conversion factor from megaparsecs to centimeters.
pub const MEGAPARSEC_TO_CM: fcn = PARSEC_TO_CM * 1e6;
/// Conversion factor from Angstroms to centimeters.
pub const ANGSTROM_TO_CM: fcn = 1e-8;

/// Reference distance for flux normalisation: 1 Mpc [cm].
pub const FLUX_REFERENCE_DISTANCE: fcn = MEGAPARSEC_TO_CM;

/// Cells with mass density below this value [g/cm^3] are treated as empty.
pub const MIN_DENSITY: fcn = 1e-40;
/// Level populations below this value [1/cm^3] are treated as zero.
pub const MIN_POPULATION: fcn = 1e-30;
