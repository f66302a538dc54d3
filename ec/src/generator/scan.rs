//! ScanLoop - evaluate a fixed point set

use historystore::{EvalStatus, HistoryRecord, HistoryStore, NewRow};
use tracing::{debug, info};

use super::{Terminal, mark_deferred, record_result, release};
use crate::error::{CoordError, CoordResult};
use crate::manager::{GeneratorLink, StopReason, Tag};
use crate::scaler::ParameterScaler;

/// Sends every point at once and records results as they arrive
pub struct ScanLoop {
    scaler: ParameterScaler,
    history: HistoryStore,
    link: GeneratorLink,
    penalty: f64,
    points: Vec<Vec<f64>>,
}

impl ScanLoop {
    pub fn new(
        scaler: ParameterScaler,
        history: HistoryStore,
        link: GeneratorLink,
        penalty: f64,
        points: Vec<Vec<f64>>,
    ) -> Self {
        debug!(points = points.len(), "ScanLoop::new: called");
        Self {
            scaler,
            history,
            link,
            penalty,
            points,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn into_history(self) -> HistoryStore {
        self.history
    }

    pub fn run(&mut self) -> CoordResult<Terminal> {
        debug!("ScanLoop::run: called");
        let result = self.drive();
        let released = release(&mut self.link, &mut self.history, self.penalty);
        let terminal = result?;
        released?;
        Ok(terminal)
    }

    fn drive(&mut self) -> CoordResult<Terminal> {
        if self.points.is_empty() {
            return Err(CoordError::config("scan has no points"));
        }

        let points = std::mem::take(&mut self.points);
        let mut rows = Vec::with_capacity(points.len());
        for point in &points {
            let x_cube = self.scaler.admit(point).map_err(CoordError::config)?;
            let x = self.scaler.to_native(&x_cube)?;
            let id = self.history.append(NewRow {
                x: &x,
                x_cube: &x_cube,
                is_local_point: false,
                paused: false,
            })?;
            rows.push(HistoryRecord {
                id,
                x,
                x_cube,
                value: None,
                is_local_point: false,
                returned: false,
                paused: false,
                status: EvalStatus::Pending,
                worker: None,
                returned_at: None,
            });
        }
        let total = rows.len() as u64;
        info!(points = total, "Starting scan");
        self.link.send(rows)?;

        let mut reason: Option<StopReason> = None;
        while self.history.returned_count() < total {
            let reply = self.link.receive()?;
            for result in reply.results {
                record_result(&mut self.history, self.penalty, result)?;
            }
            mark_deferred(&mut self.history, &reply.deferred)?;
            if reply.reason.is_some() {
                reason = reply.reason;
            }
            if reply.tag == Tag::Stop {
                info!(returned = self.history.returned_count(), total, "Scan stopped early");
                return Ok(Terminal::Stopped { reason });
            }
        }

        info!(points = total, "Scan completed");
        Ok(Terminal::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EvalOutcome, ParameterSpec};
    use crate::generator::grid_points;
    use crate::manager::{ManagerReply, ManagerRequest, ResultRecord};
    use historystore::{Evaluation, ObjectiveShape};
    use tokio::sync::mpsc;

    fn scaler() -> ParameterScaler {
        ParameterScaler::new(vec![ParameterSpec::new("q", -2.0, 2.0, 0.0)]).unwrap()
    }

    fn spawn_echo(limit: usize) -> GeneratorLink {
        let (req_tx, mut req_rx) = mpsc::channel(16);
        let (rep_tx, rep_rx) = mpsc::channel(64);
        std::thread::spawn(move || {
            let mut delivered = 0;
            while let Some(request) = req_rx.blocking_recv() {
                let ManagerRequest::Send { rows } = request else {
                    return;
                };
                for row in rows {
                    delivered += 1;
                    let stopping = delivered >= limit;
                    let reply = ManagerReply {
                        tag: if stopping { Tag::Stop } else { Tag::Continue },
                        results: vec![ResultRecord {
                            id: row.id,
                            outcome: EvalOutcome::Evaluated {
                                value: Evaluation::Scalar(row.x[0]),
                            },
                            worker: 0,
                            elapsed_ms: 0,
                        }],
                        deferred: Vec::new(),
                        reason: stopping.then_some(StopReason::MaxEvaluations),
                    };
                    if rep_tx.blocking_send(reply).is_err() || stopping {
                        return;
                    }
                }
            }
        });
        GeneratorLink::new(req_tx, rep_rx)
    }

    #[test]
    fn test_scan_completes() {
        let points = grid_points(1, 5).unwrap();
        let mut scan = ScanLoop::new(
            scaler(),
            HistoryStore::new(1, ObjectiveShape::Scalar),
            spawn_echo(usize::MAX),
            1.0e12,
            points,
        );
        assert_eq!(scan.run().unwrap(), Terminal::Completed);
        let values: Vec<f64> = scan.history().iter().map(|r| r.f()).collect();
        assert_eq!(values, vec![-2.0, -1.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_scan_stops_early() {
        let points = grid_points(1, 5).unwrap();
        let mut scan = ScanLoop::new(
            scaler(),
            HistoryStore::new(1, ObjectiveShape::Scalar),
            spawn_echo(2),
            1.0e12,
            points,
        );
        assert_eq!(
            scan.run().unwrap(),
            Terminal::Stopped {
                reason: Some(StopReason::MaxEvaluations)
            }
        );
        assert_eq!(scan.into_history().returned_count(), 2);
    }

    #[test]
    fn test_empty_scan_rejected() {
        let mut scan = ScanLoop::new(
            scaler(),
            HistoryStore::new(1, ObjectiveShape::Scalar),
            spawn_echo(1),
            1.0e12,
            Vec::new(),
        );
        assert!(matches!(scan.run(), Err(CoordError::Config(_))));
    }
}
