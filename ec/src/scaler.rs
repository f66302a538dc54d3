//! Parameter Scaler - native units <-> unit cube
//!
//! `to_cube` maps each coordinate affinely onto `[0, 1]` using the
//! parameter's bounds; `to_native` is the inverse. Periodic parameters are
//! wrapped mod 1 on the cube side.

use tracing::debug;

use crate::domain::ParameterSpec;
use crate::error::{CoordError, CoordResult};

fn check_len(got: usize, specs: &[ParameterSpec]) -> CoordResult<()> {
    if got != specs.len() {
        return Err(CoordError::config(format!(
            "mismatched parameter count: expected {}, got {}",
            specs.len(),
            got
        )));
    }
    Ok(())
}

/// Wrap a cube coordinate into `[0, 1)`
fn wrap_unit(v: f64) -> f64 {
    let wrapped = v.rem_euclid(1.0);
    // rem_euclid can round up to exactly 1.0 for tiny negative inputs
    if wrapped >= 1.0 { 0.0 } else { wrapped }
}

/// Map a native point onto the unit cube
pub fn to_cube(x: &[f64], specs: &[ParameterSpec]) -> CoordResult<Vec<f64>> {
    check_len(x.len(), specs)?;
    Ok(x.iter()
        .zip(specs)
        .map(|(v, spec)| {
            let c = (v - spec.lower) / spec.span();
            if spec.periodic { wrap_unit(c) } else { c }
        })
        .collect())
}

/// Map a unit-cube point back to native units
pub fn to_native(x_cube: &[f64], specs: &[ParameterSpec]) -> CoordResult<Vec<f64>> {
    check_len(x_cube.len(), specs)?;
    Ok(x_cube
        .iter()
        .zip(specs)
        .map(|(c, spec)| spec.lower + c * spec.span())
        .collect())
}

/// Validated, ordered parameter list with scaling helpers
#[derive(Debug, Clone)]
pub struct ParameterScaler {
    specs: Vec<ParameterSpec>,
}

impl ParameterScaler {
    /// Validate every spec and the list as a whole
    pub fn new(specs: Vec<ParameterSpec>) -> CoordResult<Self> {
        debug!(count = specs.len(), "ParameterScaler::new: called");
        if specs.is_empty() {
            return Err(CoordError::config("at least one parameter is required"));
        }
        for (i, spec) in specs.iter().enumerate() {
            spec.validate()?;
            if specs[..i].iter().any(|other| other.name == spec.name) {
                return Err(CoordError::config(format!("duplicate parameter name '{}'", spec.name)));
            }
        }
        Ok(Self { specs })
    }

    /// Dimensionality of the parameter space
    pub fn dim(&self) -> usize {
        self.specs.len()
    }

    /// Parameter specs in positional order
    pub fn specs(&self) -> &[ParameterSpec] {
        &self.specs
    }

    /// Parameter names in positional order
    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub fn to_cube(&self, x: &[f64]) -> CoordResult<Vec<f64>> {
        to_cube(x, &self.specs)
    }

    pub fn to_native(&self, x_cube: &[f64]) -> CoordResult<Vec<f64>> {
        to_native(x_cube, &self.specs)
    }

    /// Configured start point on the unit cube
    pub fn start_cube(&self) -> Vec<f64> {
        let start: Vec<f64> = self.specs.iter().map(|s| s.start).collect();
        // lengths match by construction
        to_cube(&start, &self.specs).unwrap_or_default()
    }

    /// Check a proposed cube point and wrap its periodic coordinates
    ///
    /// Returns a description of the problem when the point has the wrong
    /// length, a non-finite coordinate, or leaves `[0, 1]` on a non-periodic
    /// axis.
    pub fn admit(&self, x_cube: &[f64]) -> Result<Vec<f64>, String> {
        debug!(?x_cube, "ParameterScaler::admit: called");
        if x_cube.len() != self.dim() {
            return Err(format!(
                "proposal has {} coordinates, expected {}",
                x_cube.len(),
                self.dim()
            ));
        }
        x_cube
            .iter()
            .zip(&self.specs)
            .map(|(c, spec)| {
                if !c.is_finite() {
                    Err(format!("non-finite coordinate for '{}'", spec.name))
                } else if spec.periodic {
                    Ok(wrap_unit(*c))
                } else if (0.0..=1.0).contains(c) {
                    Ok(*c)
                } else {
                    Err(format!("coordinate {} for '{}' outside the unit cube", c, spec.name))
                }
            })
            .collect()
    }
}
