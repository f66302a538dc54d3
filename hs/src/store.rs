//! HistoryStore - columnar arena of evaluation rows
//!
//! Rows are fixed width for the lifetime of a store: `dim` slots for `x`,
//! `dim` slots for `x_cube` and `shape.width()` slots for the objective.
//! Each column is a flat `Vec<f64>`, so appending a row extends the columns
//! with amortized doubling and never moves existing rows' ids.

use tracing::debug;

use crate::error::{HistoryError, Result};
use crate::now_ms;
use crate::record::{EvalStatus, Evaluation, HistoryRecord, NewRow, ObjectiveShape, Returned};

/// Per-row flags and bookkeeping
#[derive(Debug, Clone, Copy)]
struct RowMeta {
    is_local_point: bool,
    returned: bool,
    paused: bool,
    status: EvalStatus,
    worker: Option<u32>,
    returned_at: Option<i64>,
}

/// Borrowed view of one row
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub id: u64,
    pub x: &'a [f64],
    pub x_cube: &'a [f64],
    slots: &'a [f64],
    shape: ObjectiveShape,
    pub is_local_point: bool,
    pub returned: bool,
    pub paused: bool,
    pub status: EvalStatus,
    pub worker: Option<u32>,
    pub returned_at: Option<i64>,
}

impl<'a> RecordView<'a> {
    /// The written value, `None` while pending
    pub fn value(&self) -> Option<Evaluation> {
        self.returned.then(|| Evaluation::from_slots(self.shape, self.slots))
    }

    /// Scalar objective (sum of squares for vectors), NaN while pending
    pub fn f(&self) -> f64 {
        self.value().map(|v| v.scalar()).unwrap_or(f64::NAN)
    }

    /// Raw objective slots (`fvec` for vector shapes)
    pub fn slots(&self) -> &'a [f64] {
        self.slots
    }

    /// Owned copy of this row
    pub fn to_record(&self) -> HistoryRecord {
        HistoryRecord {
            id: self.id,
            x: self.x.to_vec(),
            x_cube: self.x_cube.to_vec(),
            value: self.value(),
            is_local_point: self.is_local_point,
            returned: self.returned,
            paused: self.paused,
            status: self.status,
            worker: self.worker,
            returned_at: self.returned_at,
        }
    }
}

/// Aggregate counts over a store
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct HistorySummary {
    pub rows: u64,
    pub returned: u64,
    pub pending: u64,
    pub local_points: u64,
    pub penalized: u64,
    pub halted: u64,
    /// Id and scalar objective of the best genuinely evaluated row
    pub best: Option<(u64, f64)>,
}

/// The evaluation history
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dim: usize,
    shape: ObjectiveShape,
    x: Vec<f64>,
    x_cube: Vec<f64>,
    slots: Vec<f64>,
    meta: Vec<RowMeta>,
}

impl HistoryStore {
    /// Create an empty store for `dim`-dimensional points
    pub fn new(dim: usize, shape: ObjectiveShape) -> Self {
        debug!(dim, %shape, "HistoryStore::new: called");
        Self {
            dim,
            shape,
            x: Vec::new(),
            x_cube: Vec::new(),
            slots: Vec::new(),
            meta: Vec::new(),
        }
    }

    /// Create an empty store with room for `rows` rows before reallocating
    pub fn with_capacity(dim: usize, shape: ObjectiveShape, rows: usize) -> Self {
        debug!(dim, %shape, rows, "HistoryStore::with_capacity: called");
        Self {
            dim,
            shape,
            x: Vec::with_capacity(rows * dim),
            x_cube: Vec::with_capacity(rows * dim),
            slots: Vec::with_capacity(rows * shape.width()),
            meta: Vec::with_capacity(rows),
        }
    }

    /// Rebuild a store from owned rows, e.g. after loading from disk
    ///
    /// Rows must be ordered by id starting at 0.
    pub fn from_records(dim: usize, shape: ObjectiveShape, records: &[HistoryRecord]) -> Result<Self> {
        debug!(dim, %shape, count = records.len(), "HistoryStore::from_records: called");
        let mut store = Self::with_capacity(dim, shape, records.len());
        for (position, record) in records.iter().enumerate() {
            if record.id != position as u64 {
                return Err(HistoryError::Parse {
                    line: position + 1,
                    reason: format!("row id {} out of order, expected {}", record.id, position),
                });
            }
            let id = store.append(NewRow {
                x: &record.x,
                x_cube: &record.x_cube,
                is_local_point: record.is_local_point,
                paused: record.paused,
            })?;
            if record.returned {
                let value = record.value.clone().ok_or_else(|| HistoryError::Parse {
                    line: position + 1,
                    reason: "returned row without a value".to_string(),
                })?;
                store.mark_returned(
                    id,
                    Returned {
                        value,
                        status: record.status,
                        worker: record.worker,
                    },
                )?;
                store.meta[position].returned_at = record.returned_at;
            }
        }
        Ok(store)
    }

    /// Dimensionality of every point
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Objective shape of every row
    pub fn shape(&self) -> ObjectiveShape {
        self.shape
    }

    /// Number of rows
    pub fn count(&self) -> u64 {
        self.meta.len() as u64
    }

    /// True when no row has been appended
    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    /// Number of rows with a result written back
    pub fn returned_count(&self) -> u64 {
        self.meta.iter().filter(|m| m.returned).count() as u64
    }

    /// Append a row, returning its id (equal to its position)
    pub fn append(&mut self, row: NewRow<'_>) -> Result<u64> {
        if row.x.len() != self.dim {
            debug!(expected = self.dim, got = row.x.len(), "HistoryStore::append: x dimension mismatch");
            return Err(HistoryError::DimensionMismatch {
                expected: self.dim,
                got: row.x.len(),
            });
        }
        if row.x_cube.len() != self.dim {
            debug!(expected = self.dim, got = row.x_cube.len(), "HistoryStore::append: x_cube dimension mismatch");
            return Err(HistoryError::DimensionMismatch {
                expected: self.dim,
                got: row.x_cube.len(),
            });
        }

        let id = self.meta.len() as u64;
        self.x.extend_from_slice(row.x);
        self.x_cube.extend_from_slice(row.x_cube);
        self.slots.extend(std::iter::repeat_n(f64::NAN, self.shape.width()));
        self.meta.push(RowMeta {
            is_local_point: row.is_local_point,
            returned: false,
            paused: row.paused,
            status: EvalStatus::Pending,
            worker: None,
            returned_at: None,
        });
        debug!(id, is_local_point = row.is_local_point, "HistoryStore::append: row appended");
        Ok(id)
    }

    /// Write the result for row `id`
    ///
    /// Each row accepts exactly one write. A second write, or a write to an id
    /// that was never appended, is an integrity violation.
    pub fn mark_returned(&mut self, id: u64, returned: Returned) -> Result<()> {
        debug!(id, status = %returned.status, "HistoryStore::mark_returned: called");
        let len = self.count();
        let index = usize::try_from(id).map_err(|_| HistoryError::UnknownId { id, len })?;
        let Some(meta) = self.meta.get(index) else {
            debug!(id, len, "HistoryStore::mark_returned: unknown id");
            return Err(HistoryError::UnknownId { id, len });
        };
        if meta.returned {
            debug!(id, "HistoryStore::mark_returned: row already returned");
            return Err(HistoryError::AlreadyReturned { id });
        }
        if !returned.status.is_terminal() {
            return Err(HistoryError::InvalidStatus(returned.status));
        }
        if returned.value.shape() != self.shape {
            return Err(HistoryError::ShapeMismatch {
                expected: self.shape.to_string(),
                got: returned.value.shape().to_string(),
            });
        }

        let width = self.shape.width();
        self.slots[index * width..(index + 1) * width].copy_from_slice(returned.value.as_slice());
        let meta = &mut self.meta[index];
        meta.returned = true;
        meta.status = returned.status;
        meta.worker = returned.worker;
        meta.returned_at = Some(now_ms());
        Ok(())
    }

    /// Flag a pending row's dispatch as deferred (or resumed)
    pub fn set_paused(&mut self, id: u64, paused: bool) -> Result<()> {
        debug!(id, paused, "HistoryStore::set_paused: called");
        let len = self.count();
        let meta = usize::try_from(id)
            .ok()
            .and_then(|index| self.meta.get_mut(index))
            .ok_or(HistoryError::UnknownId { id, len })?;
        meta.paused = paused;
        Ok(())
    }

    /// Borrow row `id`
    pub fn get(&self, id: u64) -> Option<RecordView<'_>> {
        let index = usize::try_from(id).ok()?;
        let meta = self.meta.get(index)?;
        let width = self.shape.width();
        Some(RecordView {
            id,
            x: &self.x[index * self.dim..(index + 1) * self.dim],
            x_cube: &self.x_cube[index * self.dim..(index + 1) * self.dim],
            slots: &self.slots[index * width..(index + 1) * width],
            shape: self.shape,
            is_local_point: meta.is_local_point,
            returned: meta.returned,
            paused: meta.paused,
            status: meta.status,
            worker: meta.worker,
            returned_at: meta.returned_at,
        })
    }

    /// Iterate over every row in id order
    pub fn iter(&self) -> impl Iterator<Item = RecordView<'_>> {
        (0..self.count()).filter_map(move |id| self.get(id))
    }

    /// Rows matching `predicate`, in id order
    pub fn slice<P>(&self, predicate: P) -> Vec<RecordView<'_>>
    where
        P: Fn(&RecordView<'_>) -> bool,
    {
        self.iter().filter(|row| predicate(row)).collect()
    }

    /// Rows with a result written back
    pub fn returned(&self) -> Vec<RecordView<'_>> {
        self.slice(|row| row.returned)
    }

    /// Owned copies of every row
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.iter().map(|row| row.to_record()).collect()
    }

    /// Aggregate counts and the best genuinely evaluated row
    pub fn summary(&self) -> HistorySummary {
        debug!(rows = self.count(), "HistoryStore::summary: called");
        let mut summary = HistorySummary {
            rows: self.count(),
            ..Default::default()
        };
        for row in self.iter() {
            if row.returned {
                summary.returned += 1;
            } else {
                summary.pending += 1;
            }
            if row.is_local_point {
                summary.local_points += 1;
            }
            if row.status.is_penalized() {
                summary.penalized += 1;
                continue;
            }
            if row.status == EvalStatus::Halted {
                summary.halted += 1;
            }
            if row.returned {
                let f = row.f();
                if f.is_finite() && summary.best.is_none_or(|(_, best)| f < best) {
                    summary.best = Some((row.id, f));
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row<'a>(x: &'a [f64], x_cube: &'a [f64]) -> NewRow<'a> {
        NewRow {
            x,
            x_cube,
            is_local_point: false,
            paused: false,
        }
    }

    fn evaluated(f: f64) -> Returned {
        Returned {
            value: Evaluation::Scalar(f),
            status: EvalStatus::Evaluated,
            worker: Some(0),
        }
    }

    #[test]
    fn test_append_assigns_positional_ids() {
        let mut store = HistoryStore::new(2, ObjectiveShape::Scalar);
        assert!(store.is_empty());
        for expected in 0..5u64 {
            let id = store.append(row(&[1.0, 2.0], &[0.1, 0.2])).unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(store.count(), 5);
        assert_eq!(store.get(3).unwrap().x, &[1.0, 2.0]);
    }

    #[test]
    fn test_append_rejects_wrong_dimension() {
        let mut store = HistoryStore::new(2, ObjectiveShape::Scalar);
        let err = store.append(row(&[1.0], &[0.1])).unwrap_err();
        assert!(matches!(err, HistoryError::DimensionMismatch { expected: 2, got: 1 }));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_pending_rows_have_no_value() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        let id = store.append(row(&[1.0], &[0.5])).unwrap();
        let view = store.get(id).unwrap();
        assert!(!view.returned);
        assert!(view.value().is_none());
        assert!(view.f().is_nan());
        assert_eq!(view.status, EvalStatus::Pending);
    }

    #[test]
    fn test_mark_returned_writes_value() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        let id = store.append(row(&[1.0], &[0.5])).unwrap();
        store.mark_returned(id, evaluated(4.5)).unwrap();

        let view = store.get(id).unwrap();
        assert!(view.returned);
        assert_eq!(view.f(), 4.5);
        assert_eq!(view.worker, Some(0));
        assert!(view.returned_at.is_some());
        assert_eq!(store.returned_count(), 1);
    }

    #[test]
    fn test_second_write_is_integrity_error() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        let id = store.append(row(&[1.0], &[0.5])).unwrap();
        store.mark_returned(id, evaluated(1.0)).unwrap();

        let err = store.mark_returned(id, evaluated(2.0)).unwrap_err();
        assert!(matches!(err, HistoryError::AlreadyReturned { id: 0 }));
        assert!(err.is_integrity());
        assert_eq!(store.get(id).unwrap().f(), 1.0);
    }

    #[test]
    fn test_unknown_id_is_integrity_error() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        let err = store.mark_returned(7, evaluated(1.0)).unwrap_err();
        assert!(matches!(err, HistoryError::UnknownId { id: 7, len: 0 }));
        assert!(err.is_integrity());
    }

    #[test]
    fn test_mark_returned_rejects_pending_status_and_wrong_shape() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Vector(2));
        let id = store.append(row(&[1.0], &[0.5])).unwrap();

        let pending = Returned {
            value: Evaluation::Vector(vec![1.0, 2.0]),
            status: EvalStatus::Pending,
            worker: None,
        };
        assert!(matches!(
            store.mark_returned(id, pending),
            Err(HistoryError::InvalidStatus(EvalStatus::Pending))
        ));
        assert!(matches!(
            store.mark_returned(id, evaluated(1.0)),
            Err(HistoryError::ShapeMismatch { .. })
        ));

        let ok = Returned {
            value: Evaluation::Vector(vec![1.0, 2.0]),
            status: EvalStatus::Evaluated,
            worker: None,
        };
        store.mark_returned(id, ok).unwrap();
        assert_eq!(store.get(id).unwrap().slots(), &[1.0, 2.0]);
        assert_eq!(store.get(id).unwrap().f(), 5.0);
    }

    #[test]
    fn test_out_of_order_returns() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        for i in 0..3 {
            store.append(row(&[i as f64], &[0.0])).unwrap();
        }
        store.mark_returned(2, evaluated(20.0)).unwrap();
        store.mark_returned(0, evaluated(0.0)).unwrap();
        store.mark_returned(1, evaluated(10.0)).unwrap();

        let values: Vec<f64> = store.returned().iter().map(|r| r.f()).collect();
        assert_eq!(values, vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn test_slice_filters_returned_rows() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        for _ in 0..4 {
            store.append(row(&[0.0], &[0.0])).unwrap();
        }
        store.mark_returned(1, evaluated(1.0)).unwrap();
        store.mark_returned(3, evaluated(3.0)).unwrap();

        let ids: Vec<u64> = store.returned().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        let pending = store.slice(|r| !r.returned);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_summary_excludes_penalties_from_best() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        for _ in 0..3 {
            store.append(row(&[0.0], &[0.0])).unwrap();
        }
        store.mark_returned(0, evaluated(5.0)).unwrap();
        store
            .mark_returned(
                1,
                Returned {
                    value: Evaluation::Scalar(-1.0),
                    status: EvalStatus::PenalizedFailure,
                    worker: None,
                },
            )
            .unwrap();

        let summary = store.summary();
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.returned, 2);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.penalized, 1);
        assert_eq!(summary.best, Some((0, 5.0)));
    }

    #[test]
    fn test_from_records_roundtrip() {
        let mut store = HistoryStore::new(2, ObjectiveShape::Scalar);
        store.append(row(&[1.0, 2.0], &[0.1, 0.2])).unwrap();
        store.append(row(&[3.0, 4.0], &[0.3, 0.4])).unwrap();
        store.mark_returned(1, evaluated(9.0)).unwrap();

        let records = store.records();
        let rebuilt = HistoryStore::from_records(2, ObjectiveShape::Scalar, &records).unwrap();
        assert_eq!(rebuilt.records(), records);
    }

    #[test]
    fn test_from_records_rejects_gaps() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        store.append(row(&[1.0], &[0.1])).unwrap();
        let mut records = store.records();
        records[0].id = 4;
        assert!(HistoryStore::from_records(1, ObjectiveShape::Scalar, &records).is_err());
    }

    #[test]
    fn test_set_paused() {
        let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
        let id = store.append(row(&[1.0], &[0.1])).unwrap();
        store.set_paused(id, true).unwrap();
        assert!(store.get(id).unwrap().paused);
        assert!(store.set_paused(5, true).is_err());
    }

    proptest! {
        #[test]
        fn prop_ids_strictly_increasing_from_zero(count in 0usize..200) {
            let mut store = HistoryStore::new(1, ObjectiveShape::Scalar);
            let mut previous: Option<u64> = None;
            for _ in 0..count {
                let id = store.append(row(&[0.0], &[0.0])).unwrap();
                match previous {
                    None => prop_assert_eq!(id, 0),
                    Some(p) => prop_assert_eq!(id, p + 1),
                }
                previous = Some(id);
            }
            prop_assert_eq!(store.count(), count as u64);
        }
    }
}
