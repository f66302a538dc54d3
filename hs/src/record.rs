//! Row types for the history store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Evaluation status of a history row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvalStatus {
    /// Proposed, no result yet
    #[default]
    Pending,
    /// Pipeline completed and the objective was extracted
    Evaluated,
    /// A hook stopped the pipeline early with its own payload
    Halted,
    /// Pipeline step exceeded its time budget; value is the penalty
    PenalizedTimeout,
    /// Pipeline step failed; value is the penalty
    PenalizedFailure,
}

impl EvalStatus {
    /// True when the stored value is a substituted penalty
    pub fn is_penalized(&self) -> bool {
        matches!(self, Self::PenalizedTimeout | Self::PenalizedFailure)
    }

    /// True for every status except `Pending`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Evaluated => "evaluated",
            Self::Halted => "halted",
            Self::PenalizedTimeout => "penalized-timeout",
            Self::PenalizedFailure => "penalized-failure",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EvalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "evaluated" => Ok(Self::Evaluated),
            "halted" => Ok(Self::Halted),
            "penalized-timeout" => Ok(Self::PenalizedTimeout),
            "penalized-failure" => Ok(Self::PenalizedFailure),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Shape of the objective stored per row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectiveShape {
    /// One scalar `f` per row
    Scalar,
    /// A residual vector `fvec` of fixed length per row
    Vector(usize),
}

impl ObjectiveShape {
    /// Number of f64 slots one row occupies
    pub fn width(&self) -> usize {
        match self {
            Self::Scalar => 1,
            Self::Vector(k) => *k,
        }
    }
}

impl fmt::Display for ObjectiveShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar => write!(f, "scalar"),
            Self::Vector(k) => write!(f, "vector[{}]", k),
        }
    }
}

/// Value produced by one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Evaluation {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl Evaluation {
    /// Scalar summary: the value itself, or the sum of squares of a residual vector
    pub fn scalar(&self) -> f64 {
        match self {
            Self::Scalar(v) => *v,
            Self::Vector(v) => v.iter().map(|r| r * r).sum(),
        }
    }

    /// Shape this value would occupy in a store
    pub fn shape(&self) -> ObjectiveShape {
        match self {
            Self::Scalar(_) => ObjectiveShape::Scalar,
            Self::Vector(v) => ObjectiveShape::Vector(v.len()),
        }
    }

    /// Raw values in storage order
    pub fn as_slice(&self) -> &[f64] {
        match self {
            Self::Scalar(v) => std::slice::from_ref(v),
            Self::Vector(v) => v,
        }
    }

    /// A value of `shape` with every slot set to `value`
    pub fn filled(shape: ObjectiveShape, value: f64) -> Self {
        match shape {
            ObjectiveShape::Scalar => Self::Scalar(value),
            ObjectiveShape::Vector(k) => Self::Vector(vec![value; k]),
        }
    }

    /// Rebuild a value of `shape` from raw storage slots
    pub fn from_slots(shape: ObjectiveShape, slots: &[f64]) -> Self {
        match shape {
            ObjectiveShape::Scalar => Self::Scalar(slots.first().copied().unwrap_or(f64::NAN)),
            ObjectiveShape::Vector(_) => Self::Vector(slots.to_vec()),
        }
    }

    /// True when every component is finite
    pub fn is_finite(&self) -> bool {
        self.as_slice().iter().all(|v| v.is_finite())
    }
}

/// A row to append
#[derive(Debug, Clone, Copy)]
pub struct NewRow<'a> {
    /// Point in native parameter units
    pub x: &'a [f64],
    /// Same point on the unit cube
    pub x_cube: &'a [f64],
    /// Proposed by the local optimizer rather than an initial sample
    pub is_local_point: bool,
    /// Dispatch deferred
    pub paused: bool,
}

/// Result written back to a row
#[derive(Debug, Clone, PartialEq)]
pub struct Returned {
    pub value: Evaluation,
    pub status: EvalStatus,
    /// Worker slot that produced the result
    pub worker: Option<u32>,
}

/// Owned copy of one history row
///
/// Used for messages, persistence and analysis; the store itself keeps rows
/// in a columnar arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: u64,
    pub x: Vec<f64>,
    #[serde(rename = "x-cube")]
    pub x_cube: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Evaluation>,
    #[serde(rename = "is-local-point")]
    pub is_local_point: bool,
    pub returned: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<u32>,
    #[serde(rename = "returned-at", default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<i64>,
}

impl HistoryRecord {
    /// Scalar objective, NaN while the row is pending
    pub fn f(&self) -> f64 {
        self.value.as_ref().map(Evaluation::scalar).unwrap_or(f64::NAN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            EvalStatus::Pending,
            EvalStatus::Evaluated,
            EvalStatus::Halted,
            EvalStatus::PenalizedTimeout,
            EvalStatus::PenalizedFailure,
        ] {
            let parsed: EvalStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<EvalStatus>().is_err());
    }

    #[test]
    fn test_penalized_statuses() {
        assert!(EvalStatus::PenalizedTimeout.is_penalized());
        assert!(EvalStatus::PenalizedFailure.is_penalized());
        assert!(!EvalStatus::Halted.is_penalized());
        assert!(!EvalStatus::Pending.is_terminal());
    }

    #[test]
    fn test_vector_scalar_is_sum_of_squares() {
        let value = Evaluation::Vector(vec![3.0, 4.0]);
        assert_eq!(value.scalar(), 25.0);
        assert_eq!(value.shape(), ObjectiveShape::Vector(2));
    }

    #[test]
    fn test_filled_penalty() {
        assert_eq!(Evaluation::filled(ObjectiveShape::Scalar, 1e9), Evaluation::Scalar(1e9));
        assert_eq!(
            Evaluation::filled(ObjectiveShape::Vector(3), 2.0),
            Evaluation::Vector(vec![2.0, 2.0, 2.0])
        );
    }

    #[test]
    fn test_record_serialization_uses_kebab_keys() {
        let record = HistoryRecord {
            id: 0,
            x: vec![1.0],
            x_cube: vec![0.5],
            value: Some(Evaluation::Scalar(2.0)),
            is_local_point: true,
            returned: true,
            paused: false,
            status: EvalStatus::Evaluated,
            worker: Some(1),
            returned_at: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("x-cube"));
        assert!(json.contains("is-local-point"));
        let back: HistoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
