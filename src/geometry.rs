//! Geometric utility objects and frame transformations.

use crate::constants::CLIGHT;
use num;
use std::{
    fmt,
    ops::{Index, IndexMut},
};

/// Floating-point precision to use for geometric quantities.
#[allow(non_camel_case_types)]
pub type fgd = f64;

/// Denotes the x-, y- or z-dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim3 {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Dim3 {
    /// Creates an array for iterating over the x-, y- and z-dimensions.
    pub fn slice() -> [Self; 3] {
        [Self::X, Self::Y, Self::Z]
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::X => "x",
                Self::Y => "y",
                Self::Z => "z",
            }
        )
    }
}

use Dim3::{X, Y, Z};

/// A 3D vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Vec3<F>([F; 3]);

impl<F: num::Float> Vec3<F> {
    /// Creates a new 3D vector given the three components.
    pub fn new(x: F, y: F, z: F) -> Self {
        Self([x, y, z])
    }

    /// Creates a new zero vector.
    pub fn zero() -> Self {
        Self::new(F::zero(), F::zero(), F::zero())
    }

    /// Computes the dot product with the given vector.
    pub fn dot(&self, other: &Self) -> F {
        self[X] * other[X] + self[Y] * other[Y] + self[Z] * other[Z]
    }

    /// Computes the cross product with the given vector.
    pub fn cross(&self, other: &Self) -> Self {
        Self::new(
            self[Y] * other[Z] - self[Z] * other[Y],
            self[Z] * other[X] - self[X] * other[Z],
            self[X] * other[Y] - self[Y] * other[X],
        )
    }

    /// Computes the squared length of the vector.
    pub fn squared_length(&self) -> F {
        self.dot(self)
    }

    /// Computes the length of the vector.
    pub fn length(&self) -> F {
        self.squared_length().sqrt()
    }

    /// Constructs a new vector scaled by the given factor.
    pub fn scaled(&self, factor: F) -> Self {
        Self::new(self[X] * factor, self[Y] * factor, self[Z] * factor)
    }

    /// Constructs the sum of this vector and the given vector.
    pub fn added(&self, other: &Self) -> Self {
        Self::new(self[X] + other[X], self[Y] + other[Y], self[Z] + other[Z])
    }

    /// Constructs the difference between this vector and the given vector.
    pub fn subbed(&self, other: &Self) -> Self {
        Self::new(self[X] - other[X], self[Y] - other[Y], self[Z] - other[Z])
    }

    /// Normalizes the vector to unit length in place.
    pub fn normalize(&mut self) {
        let length = self.length();
        debug_assert!(length > F::zero(), "Cannot normalize zero vector");
        *self = self.scaled(F::one() / length);
    }

    /// Constructs a unit vector in the direction of this vector.
    pub fn normalized(&self) -> Self {
        let mut result = *self;
        result.normalize();
        result
    }
}

impl<F> Index<Dim3> for Vec3<F> {
    type Output = F;
    fn index(&self, dim: Dim3) -> &Self::Output {
        &self.0[dim as usize]
    }
}

impl<F> IndexMut<Dim3> for Vec3<F> {
    fn index_mut(&mut self, dim: Dim3) -> &mut Self::Output {
        &mut self.0[dim as usize]
    }
}

impl<F> Index<usize> for Vec3<F> {
    type Output = F;
    fn index(&self, idx: usize) -> &Self::Output {
        &self.0[idx]
    }
}

impl<F> IndexMut<usize> for Vec3<F> {
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.0[idx]
    }
}

/// Computes the local velocity of the homologous flow at the given
/// position and time, `v = pos / t`.
pub fn flow_velocity(position: &Vec3<fgd>, time: fgd) -> Vec3<fgd> {
    position.scaled(1.0 / time)
}

/// Computes the Doppler factor nu_cmf/nu_rf for a photon at the given
/// position travelling in the given direction at the given time.
///
/// In the homologous flow the local matter velocity is `pos/t`, so the
/// first-order Doppler factor is `1 - (pos . dir)/(c t)`.
pub fn doppler_factor(position: &Vec3<fgd>, direction: &Vec3<fgd>, time: fgd) -> fgd {
    let dopplerfactor = 1.0 - position.dot(direction) / (CLIGHT * time);
    debug_assert!(
        dopplerfactor > 0.0 && dopplerfactor.is_finite(),
        "Doppler factor {} out of range",
        dopplerfactor
    );
    dopplerfactor
}

/// Aberrates a direction between frames connected by the given velocity.
///
/// For the comoving -> rest transformation pass the negated local flow
/// velocity. First order in v/c, matching the frame convention of
/// `doppler_factor`.
pub fn aberrate_direction(direction_initial: &Vec3<fgd>, velocity: &Vec3<fgd>) -> Vec3<fgd> {
    let gamma_rel =
        1.0 / (1.0 - velocity.squared_length() / crate::constants::CLIGHTSQUARED).sqrt();
    let ndotv = direction_initial.dot(velocity);
    let fact1 = gamma_rel * (1.0 - ndotv / CLIGHT);
    let fact2 = (gamma_rel - (gamma_rel * gamma_rel * ndotv / (gamma_rel + 1.0) / CLIGHT)) / CLIGHT;

    let mut direction_final = Vec3::new(
        (direction_initial[X] - velocity[X] * fact2) / fact1,
        (direction_initial[Y] - velocity[Y] * fact2) / fact1,
        (direction_initial[Z] - velocity[Z] * fact2) / fact1,
    );
    direction_final.normalize();
    direction_final
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doppler_factor_matches_radial_flow() {
        // Radially outgoing photon at v = 0.01c sees a redshift of 1%.
        let t = 1.0e5;
        let pos = Vec3::new(0.01 * CLIGHT * t, 0.0, 0.0);
        let dir = Vec3::new(1.0, 0.0, 0.0);
        let dop = doppler_factor(&pos, &dir, t);
        assert!((dop - 0.99).abs() < 1e-12);

        // Transverse direction has no first-order shift.
        let dir_perp = Vec3::new(0.0, 1.0, 0.0);
        let dop_perp = doppler_factor(&pos, &dir_perp, t);
        assert!((dop_perp - 1.0).abs() < 1e-12);
    }

    #[test]
    fn aberration_roundtrip_preserves_direction() {
        let vel = Vec3::new(1.0e9, -5.0e8, 2.0e8);
        let dir = Vec3::new(0.5, 0.5, std::f64::consts::FRAC_1_SQRT_2).normalized();

        let dir_cmf = aberrate_direction(&dir, &vel);
        let dir_back = aberrate_direction(&dir_cmf, &vel.scaled(-1.0));

        for d in Dim3::slice() {
            assert!((dir_back[d] - dir[d]).abs() < 1e-10);
        }
        assert!((dir_cmf.length() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cross_product_is_orthogonal() {
        let a = Vec3::<f64>::new(1.0, 2.0, 3.0);
        let b = Vec3::<f64>::new(-2.0, 0.5, 1.5);
        let c = a.cross(&b);
        assert!(a.dot(&c).abs() < 1e-12);
        assert!(b.dot(&c).abs() < 1e-12);
    }
}
