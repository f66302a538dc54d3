//! Sample point generation on the unit cube

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoordError, CoordResult};

/// Largest grid a scan may request
const MAX_GRID_POINTS: usize = 1_000_000;

/// How a parameter scan chooses its points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum ScanConfig {
    /// Full mesh including both bounds of every axis
    Grid {
        #[serde(rename = "points-per-dim")]
        points_per_dim: usize,
    },
    /// Uniform random points from a reproducible seed
    Random {
        samples: usize,
        #[serde(default)]
        seed: u64,
    },
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self::Grid { points_per_dim: 3 }
    }
}

impl ScanConfig {
    /// Unit-cube points for a `dim`-dimensional space
    pub fn points(&self, dim: usize) -> CoordResult<Vec<Vec<f64>>> {
        debug!(?self, dim, "ScanConfig::points: called");
        match self {
            Self::Grid { points_per_dim } => grid_points(dim, *points_per_dim),
            Self::Random { samples, seed } => {
                if *samples == 0 {
                    return Err(CoordError::config("random scan needs at least one sample"));
                }
                Ok(random_points(dim, *samples, *seed))
            }
        }
    }
}

/// Random points issued ahead of the seed to warm the worker pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InitialSamples {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub seed: u64,
}

impl InitialSamples {
    pub fn points(&self, dim: usize) -> Vec<Vec<f64>> {
        random_points(dim, self.count, self.seed)
    }
}

/// Full mesh with `per_dim` evenly spaced values per axis, endpoints included
///
/// A single value per axis sits at the centre.
pub fn grid_points(dim: usize, per_dim: usize) -> CoordResult<Vec<Vec<f64>>> {
    if dim == 0 || per_dim == 0 {
        return Err(CoordError::config("grid scan needs at least one point per dimension"));
    }
    let total = u32::try_from(dim)
        .ok()
        .and_then(|d| per_dim.checked_pow(d))
        .filter(|n| *n <= MAX_GRID_POINTS)
        .ok_or_else(|| {
            CoordError::config(format!(
                "grid of {}^{} points exceeds the limit of {}",
                per_dim, dim, MAX_GRID_POINTS
            ))
        })?;

    let axis: Vec<f64> = if per_dim == 1 {
        vec![0.5]
    } else {
        (0..per_dim).map(|i| i as f64 / (per_dim - 1) as f64).collect()
    };

    // Row-major: the last axis varies fastest
    let points = (0..total)
        .map(|mut n| {
            let mut point = vec![0.0; dim];
            for slot in point.iter_mut().rev() {
                *slot = axis[n % per_dim];
                n /= per_dim;
            }
            point
        })
        .collect();
    Ok(points)
}

/// `count` uniform points in `[0, 1)^dim`
pub fn random_points(dim: usize, count: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dim).map(|_| rng.random::<f64>()).collect())
        .collect()
}
