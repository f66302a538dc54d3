//! GeneratorLoop - the persistent local-search state machine

use historystore::{HistoryRecord, HistoryStore, NewRow};
use tracing::{debug, info, warn};

use super::{Terminal, mark_deferred, record_result, release};
use crate::error::{CoordError, CoordResult};
use crate::manager::{GeneratorLink, ManagerReply, StopReason, Tag};
use crate::optimizer::{LocalOptimizer, Proposal};
use crate::scaler::ParameterScaler;

/// Where the loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenState {
    Init,
    Seeding,
    AwaitResult,
    Proposing,
    Converged,
    Stopped,
}

/// Drives one local optimization run against the Manager
///
/// Exactly one local point is in flight at a time: the next proposal is only
/// requested once the awaited row has returned. Initial samples travel with
/// the seed and are recorded whenever they come back.
pub struct GeneratorLoop {
    scaler: ParameterScaler,
    optimizer: Box<dyn LocalOptimizer>,
    history: HistoryStore,
    link: GeneratorLink,
    penalty: f64,
    initial: Vec<Vec<f64>>,
    state: GenState,
    awaiting: Option<u64>,
    draining: bool,
    stop_reason: Option<StopReason>,
}

impl GeneratorLoop {
    pub fn new(
        scaler: ParameterScaler,
        optimizer: Box<dyn LocalOptimizer>,
        history: HistoryStore,
        link: GeneratorLink,
        penalty: f64,
    ) -> Self {
        debug!(dim = scaler.dim(), method = optimizer.name(), penalty, "GeneratorLoop::new: called");
        Self {
            scaler,
            optimizer,
            history,
            link,
            penalty,
            initial: Vec::new(),
            state: GenState::Init,
            awaiting: None,
            draining: false,
            stop_reason: None,
        }
    }

    /// Unit-cube points sent together with the seed
    pub fn with_initial_samples(mut self, points: Vec<Vec<f64>>) -> Self {
        self.initial = points;
        self
    }

    pub fn state(&self) -> GenState {
        self.state
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn into_history(self) -> HistoryStore {
        self.history
    }

    /// Run until convergence or a stop
    ///
    /// Fatal errors (integrity violation, optimizer divergence, a closed
    /// channel) release the Manager before returning.
    pub fn run(&mut self) -> CoordResult<Terminal> {
        debug!("GeneratorLoop::run: called");
        let result = self.drive();
        if let Err(e) = &result {
            warn!(error = %e, state = ?self.state, "Generator loop aborted");
            self.state = GenState::Stopped;
            if let Err(e) = release(&mut self.link, &mut self.history, self.penalty) {
                warn!(error = %e, "Leftover replies not recorded");
            }
        }
        result
    }

    fn drive(&mut self) -> CoordResult<Terminal> {
        loop {
            debug!(state = ?self.state, "GeneratorLoop::drive: transition");
            match self.state {
                GenState::Init => {
                    for point in &self.initial {
                        self.scaler.admit(point).map_err(CoordError::config)?;
                    }
                    self.state = GenState::Seeding;
                }
                GenState::Seeding => {
                    self.seed()?;
                    self.state = GenState::AwaitResult;
                }
                GenState::AwaitResult => {
                    let reply = self.link.receive()?;
                    self.absorb(reply)?;
                }
                GenState::Proposing => {
                    // a stop that is already queued wins over a new proposal
                    if let Some(reply) = self.link.try_receive()? {
                        self.absorb(reply)?;
                        continue;
                    }
                    self.propose()?;
                }
                GenState::Converged => {
                    self.drain_outstanding()?;
                    release(&mut self.link, &mut self.history, self.penalty)?;
                    info!(rows = self.history.count(), "Local optimization converged");
                    return Ok(Terminal::Converged);
                }
                GenState::Stopped => {
                    release(&mut self.link, &mut self.history, self.penalty)?;
                    info!(rows = self.history.count(), reason = ?self.stop_reason, "Generator stopped");
                    return Ok(Terminal::Stopped {
                        reason: self.stop_reason.clone(),
                    });
                }
            }
        }
    }

    fn append(&mut self, x_cube: &[f64], is_local_point: bool) -> CoordResult<HistoryRecord> {
        let x = self.scaler.to_native(x_cube)?;
        let id = self.history.append(NewRow {
            x: &x,
            x_cube,
            is_local_point,
            paused: false,
        })?;
        Ok(HistoryRecord {
            id,
            x,
            x_cube: x_cube.to_vec(),
            value: None,
            is_local_point,
            returned: false,
            paused: false,
            status: Default::default(),
            worker: None,
            returned_at: None,
        })
    }

    /// Append initial samples and the start point, then send them as one batch
    fn seed(&mut self) -> CoordResult<()> {
        let initial = std::mem::take(&mut self.initial);
        let mut rows = Vec::with_capacity(initial.len() + 1);
        for point in &initial {
            rows.push(self.append(point, false)?);
        }
        let start = self.scaler.start_cube();
        let seed = self.append(&start, false)?;
        self.awaiting = Some(seed.id);
        rows.push(seed);

        info!(initial = initial.len(), seed_id = ?self.awaiting, "Seeding local optimization");
        self.link.send(rows)
    }

    /// Fold one Manager reply into the history and pick the next state
    fn absorb(&mut self, reply: ManagerReply) -> CoordResult<()> {
        debug!(tag = %reply.tag, results = reply.results.len(), deferred = reply.deferred.len(), "GeneratorLoop::absorb: called");
        for result in reply.results {
            record_result(&mut self.history, self.penalty, result)?;
        }
        mark_deferred(&mut self.history, &reply.deferred)?;
        if reply.reason.is_some() {
            self.stop_reason = reply.reason;
        }

        match reply.tag {
            Tag::Stop => self.state = GenState::Stopped,
            Tag::StopAndDrain => {
                self.draining = true;
                if self.state == GenState::Proposing {
                    self.state = GenState::AwaitResult;
                }
            }
            Tag::Continue if self.draining || self.state == GenState::Converged => {}
            Tag::Continue => {
                let awaited_back = self
                    .awaiting
                    .and_then(|id| self.history.get(id))
                    .is_some_and(|row| row.returned);
                if awaited_back {
                    self.state = GenState::Proposing;
                }
            }
        }
        Ok(())
    }

    fn propose(&mut self) -> CoordResult<()> {
        let returned = self.history.returned();
        let proposal = self
            .optimizer
            .propose(&returned)
            .map_err(|e| CoordError::OptimizerDivergence(format!("{}: {}", self.optimizer.name(), e)))?;
        drop(returned);

        match proposal {
            Proposal::Point(point) => {
                let x_cube = self
                    .scaler
                    .admit(&point)
                    .map_err(|reason| CoordError::OptimizerDivergence(format!("{}: {}", self.optimizer.name(), reason)))?;
                let row = self.append(&x_cube, true)?;
                debug!(id = row.id, ?x_cube, "GeneratorLoop::propose: new local point");
                self.awaiting = Some(row.id);
                self.link.send(vec![row])?;
                self.state = GenState::AwaitResult;
            }
            Proposal::Converged => {
                debug!("GeneratorLoop::propose: optimizer converged");
                self.awaiting = None;
                self.state = GenState::Converged;
            }
        }
        Ok(())
    }

    /// Rows sent but neither returned nor deferred
    fn outstanding(&self) -> usize {
        self.history.iter().filter(|row| !row.returned && !row.paused).count()
    }

    /// Collect results still in flight after convergence
    fn drain_outstanding(&mut self) -> CoordResult<()> {
        while self.outstanding() > 0 && self.state == GenState::Converged {
            debug!(outstanding = self.outstanding(), "GeneratorLoop::drain_outstanding: waiting");
            let reply = self.link.receive()?;
            self.absorb(reply)?;
        }
        if self.state == GenState::Stopped {
            self.state = GenState::Converged;
        }
        Ok(())
    }
}
