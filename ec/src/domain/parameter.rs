//! ParameterSpec - one optimized parameter

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordError, CoordResult};

/// Bounds and start value of one parameter
///
/// The ordered list of specs fixes the dimensionality and the positional
/// meaning of every point for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub start: f64,

    /// Wrap unit-cube coordinates mod 1 (angles, phases)
    #[serde(default)]
    pub periodic: bool,
}

impl ParameterSpec {
    /// Create a non-periodic parameter
    pub fn new(name: impl Into<String>, lower: f64, upper: f64, start: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
            start,
            periodic: false,
        }
    }

    /// Mark the parameter periodic
    pub fn periodic(mut self) -> Self {
        self.periodic = true;
        self
    }

    /// Width of the native interval
    pub fn span(&self) -> f64 {
        self.upper - self.lower
    }

    /// Check `lower < upper` and `lower <= start <= upper`
    ///
    /// A periodic parameter's `upper` is the same point as its `lower`, so its
    /// start must lie strictly below `upper`.
    pub fn validate(&self) -> CoordResult<()> {
        debug!(name = %self.name, lower = self.lower, upper = self.upper, start = self.start, "ParameterSpec::validate: called");
        if self.name.trim().is_empty() {
            return Err(CoordError::config("parameter name must not be empty"));
        }
        if !(self.lower.is_finite() && self.upper.is_finite() && self.start.is_finite()) {
            return Err(CoordError::config(format!(
                "parameter '{}' has non-finite bounds or start",
                self.name
            )));
        }
        if self.lower >= self.upper {
            return Err(CoordError::config(format!(
                "parameter '{}': lower ({}) must be less than upper ({})",
                self.name, self.lower, self.upper
            )));
        }
        if self.start < self.lower || self.start > self.upper {
            return Err(CoordError::config(format!(
                "parameter '{}': start ({}) outside [{}, {}]",
                self.name, self.start, self.lower, self.upper
            )));
        }
        if self.periodic && self.start == self.upper {
            return Err(CoordError::config(format!(
                "parameter '{}' is periodic: start ({}) must be below upper, use lower ({}) instead",
                self.name, self.start, self.lower
            )));
        }
        Ok(())
    }
}
