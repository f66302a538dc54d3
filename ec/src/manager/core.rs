//! Main Manager task implementation

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use historystore::HistoryRecord;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::Evaluator;
use super::config::{ExitCriteria, ManagerConfig};
use super::handle::{GeneratorLink, ManagerHandle};
use super::messages::{ManagerMetrics, ManagerReply, ManagerRequest, ResultRecord, StopReason, Tag};
use crate::domain::{EvalOutcome, FailureKind, Sample};
use crate::error::{CoordError, CoordResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Done,
}

struct InFlight {
    id: u64,
    worker: u32,
}

/// Dispatch state owned by the running Manager task
struct Dispatcher {
    drain_on_stop: bool,
    exit: ExitCriteria,
    evaluator: Arc<dyn Evaluator>,
    reply_tx: mpsc::Sender<ManagerReply>,
    queue: VecDeque<HistoryRecord>,
    tasks: JoinSet<(EvalOutcome, u64)>,
    in_flight: HashMap<task::Id, InFlight>,
    idle: Vec<u32>,
    phase: Phase,
    /// Set once the generator is gone; the run loop exits
    finished: bool,
    metrics: ManagerMetrics,
}

impl Dispatcher {
    fn at_dispatch_cap(&self) -> bool {
        self.exit
            .max_evaluations
            .is_some_and(|max| self.metrics.dispatched >= max)
    }

    /// Start queued rows on idle workers
    fn dispatch(&mut self) {
        while self.phase == Phase::Running && !self.at_dispatch_cap() {
            let Some(worker) = self.idle.pop() else { break };
            let Some(row) = self.queue.pop_front() else {
                self.idle.push(worker);
                break;
            };

            let evaluator = Arc::clone(&self.evaluator);
            let sample = Sample { id: row.id, x: row.x };
            debug!(id = sample.id, worker, "Dispatching sample");
            let handle = self.tasks.spawn(async move {
                let started = Instant::now();
                let outcome = evaluator.evaluate(sample, worker).await;
                (outcome, started.elapsed().as_millis() as u64)
            });
            self.in_flight.insert(handle.id(), InFlight { id: row.id, worker });
            self.metrics.dispatched += 1;
        }
    }

    fn abort_all(&mut self) {
        // cancelled tasks stay in the JoinSet until joined, so count by row
        if !self.in_flight.is_empty() {
            warn!(count = self.in_flight.len(), "Aborting in-flight evaluations");
            self.metrics.aborted += self.in_flight.len() as u64;
        }
        self.tasks.abort_all();
        self.in_flight.clear();
    }

    async fn reply(&mut self, reply: ManagerReply) {
        debug!(tag = %reply.tag, results = reply.results.len(), "Dispatcher::reply: called");
        if self.reply_tx.send(reply).await.is_err() {
            warn!("Generator reply channel closed");
            self.abort_all();
            self.phase = Phase::Done;
            self.finished = true;
        }
    }

    async fn on_send(&mut self, rows: Vec<HistoryRecord>) {
        self.metrics.generator_calls += 1;
        self.metrics.received += rows.len() as u64;
        debug!(count = rows.len(), calls = self.metrics.generator_calls, "Dispatcher::on_send: called");

        if self.phase != Phase::Running {
            self.refuse_late(rows).await;
            return;
        }
        if let Some(max) = self.exit.max_generator_calls
            && self.metrics.generator_calls > max
        {
            let refused = rows.iter().map(|r| r.id).collect();
            self.begin_stop(StopReason::MaxGeneratorCalls, None, refused).await;
            return;
        }

        self.queue.extend(rows);
        self.dispatch();
    }

    /// Stop dispatching and tell the generator
    async fn begin_stop(&mut self, reason: StopReason, result: Option<ResultRecord>, mut deferred: Vec<u64>) {
        info!(%reason, in_flight = self.tasks.len(), "Manager stopping");
        self.metrics.stop_reason = Some(reason.clone());
        deferred.extend(self.queue.drain(..).map(|row| row.id));
        self.metrics.deferred += deferred.len() as u64;

        let tag = if self.drain_on_stop && !self.tasks.is_empty() {
            self.phase = Phase::Draining;
            Tag::StopAndDrain
        } else {
            self.abort_all();
            self.phase = Phase::Done;
            Tag::Stop
        };
        self.reply(ManagerReply {
            tag,
            results: result.into_iter().collect(),
            deferred,
            reason: Some(reason),
        })
        .await;
    }

    /// Rows sent after a stop never run; hand them back as deferred
    async fn refuse_late(&mut self, rows: Vec<HistoryRecord>) {
        debug!(count = rows.len(), phase = ?self.phase, "Rows arrived after stop, not dispatching");
        let deferred: Vec<u64> = rows.iter().map(|r| r.id).collect();
        self.metrics.deferred += deferred.len() as u64;
        let tag = if self.phase == Phase::Draining {
            Tag::StopAndDrain
        } else {
            Tag::Stop
        };
        let reason = self.metrics.stop_reason.clone();
        self.reply(ManagerReply {
            tag,
            results: Vec::new(),
            deferred,
            reason,
        })
        .await;
    }

    async fn on_stop_request(&mut self, reason: String) {
        match self.phase {
            Phase::Running => self.begin_stop(StopReason::External(reason), None, Vec::new()).await,
            Phase::Draining => {
                info!(%reason, "Second stop while draining, aborting remaining work");
                self.abort_all();
                self.phase = Phase::Done;
                let reason = self.metrics.stop_reason.clone();
                self.reply(ManagerReply {
                    tag: Tag::Stop,
                    results: Vec::new(),
                    deferred: Vec::new(),
                    reason,
                })
                .await;
            }
            Phase::Done => {}
        }
    }

    fn exit_reason(&self, outcome: &EvalOutcome) -> Option<StopReason> {
        if let Some(max) = self.exit.max_evaluations
            && self.metrics.completed >= max
        {
            return Some(StopReason::MaxEvaluations);
        }
        if let Some(target) = self.exit.target_value
            && let EvalOutcome::Evaluated { value } = outcome
            && value.scalar() <= target
        {
            return Some(StopReason::TargetReached);
        }
        None
    }

    fn count(&mut self, outcome: &EvalOutcome) {
        self.metrics.completed += 1;
        match outcome {
            EvalOutcome::Evaluated { .. } => {}
            EvalOutcome::Halted { .. } => self.metrics.halted += 1,
            EvalOutcome::Failed {
                kind: FailureKind::Timeout,
                ..
            } => {
                self.metrics.timeouts += 1;
                self.metrics.penalized += 1;
            }
            EvalOutcome::Failed {
                kind: FailureKind::Execution,
                ..
            } => {
                self.metrics.failures += 1;
                self.metrics.penalized += 1;
            }
        }
    }

    async fn on_joined(&mut self, joined: Result<(task::Id, (EvalOutcome, u64)), JoinError>) {
        let (task_id, outcome, elapsed_ms) = match joined {
            Ok((task_id, (outcome, elapsed_ms))) => (task_id, outcome, elapsed_ms),
            Err(e) if e.is_cancelled() => {
                self.in_flight.remove(&e.id());
                return;
            }
            Err(e) => {
                warn!(error = %e, "Evaluation task panicked");
                let outcome = EvalOutcome::Failed {
                    kind: FailureKind::Execution,
                    message: format!("worker panicked: {}", e),
                };
                (e.id(), outcome, 0)
            }
        };
        let Some(InFlight { id, worker }) = self.in_flight.remove(&task_id) else {
            warn!(?task_id, "Completion for unknown task");
            return;
        };
        self.idle.push(worker);
        self.count(&outcome);
        info!(id, worker, elapsed_ms, status = %outcome.task_status(), "Evaluation finished");

        let result = ResultRecord {
            id,
            outcome,
            worker,
            elapsed_ms,
        };
        match self.phase {
            Phase::Running => match self.exit_reason(&result.outcome) {
                Some(reason) => self.begin_stop(reason, Some(result), Vec::new()).await,
                None => {
                    self.dispatch();
                    self.reply(ManagerReply::proceed(result)).await;
                }
            },
            Phase::Draining => {
                let tag = if self.tasks.is_empty() {
                    self.phase = Phase::Done;
                    Tag::Stop
                } else {
                    Tag::StopAndDrain
                };
                let reason = self.metrics.stop_reason.clone();
                self.reply(ManagerReply {
                    tag,
                    results: vec![result],
                    deferred: Vec::new(),
                    reason,
                })
                .await;
            }
            Phase::Done => {}
        }
    }
}

/// Routes rows to a bounded pool of concurrent evaluations and results back
/// to the generator
pub struct Manager {
    config: ManagerConfig,
    exit: ExitCriteria,
    evaluator: Arc<dyn Evaluator>,
    tx: mpsc::Sender<ManagerRequest>,
    rx: mpsc::Receiver<ManagerRequest>,
    reply_tx: mpsc::Sender<ManagerReply>,
    reply_rx: Option<mpsc::Receiver<ManagerReply>>,
}

impl Manager {
    pub fn new(config: ManagerConfig, exit: ExitCriteria, evaluator: Arc<dyn Evaluator>) -> Self {
        debug!(workers = config.workers, "Manager::new: called");
        let buffer = config.channel_buffer.max(1);
        let (tx, rx) = mpsc::channel(buffer);
        let (reply_tx, reply_rx) = mpsc::channel(buffer);
        Self {
            config,
            exit,
            evaluator,
            tx,
            rx,
            reply_tx,
            reply_rx: Some(reply_rx),
        }
    }

    /// Control handle for stop requests and metrics
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle::new(self.tx.clone())
    }

    /// The generator's end of the contract; only one generator may connect
    pub fn connect(&mut self) -> CoordResult<GeneratorLink> {
        debug!("Manager::connect: called");
        let reply_rx = self
            .reply_rx
            .take()
            .ok_or_else(|| CoordError::Channel("a generator is already connected".to_string()))?;
        Ok(GeneratorLink::new(self.tx.clone(), reply_rx))
    }

    /// Run the Manager task until the generator finishes or disconnects
    pub async fn run(self) -> ManagerMetrics {
        let Manager {
            config,
            exit,
            evaluator,
            tx,
            mut rx,
            reply_tx,
            reply_rx,
        } = self;
        drop(tx);
        drop(reply_rx);

        let deadline = exit.wallclock().map(|limit| tokio::time::Instant::now() + limit);
        let closed_tx = reply_tx.clone();
        let mut dispatcher = Dispatcher {
            drain_on_stop: config.drain_on_stop,
            exit,
            evaluator,
            reply_tx,
            queue: VecDeque::new(),
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            idle: (0..config.workers.max(1)).rev().collect(),
            phase: Phase::Running,
            finished: false,
            metrics: ManagerMetrics::default(),
        };

        info!(workers = config.workers, drain_on_stop = config.drain_on_stop, "Manager started");

        // after a stop the loop keeps answering until the generator is done,
        // so a Send racing the STOP reply still gets an answer
        while !dispatcher.finished {
            let wallclock = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                req = rx.recv() => {
                    let Some(req) = req else {
                        debug!("Manager request channel closed");
                        dispatcher.abort_all();
                        break;
                    };
                    match req {
                        ManagerRequest::Send { rows } => dispatcher.on_send(rows).await,
                        ManagerRequest::Stop { reason } => dispatcher.on_stop_request(reason).await,
                        ManagerRequest::GeneratorDone => {
                            info!("Generator finished");
                            dispatcher.abort_all();
                            dispatcher.phase = Phase::Done;
                            dispatcher.finished = true;
                        }
                        ManagerRequest::GetMetrics { reply_tx } => {
                            let _ = reply_tx.send(dispatcher.metrics.clone());
                        }
                    }
                }

                Some(joined) = dispatcher.tasks.join_next_with_id(), if !dispatcher.tasks.is_empty() => {
                    dispatcher.on_joined(joined).await;
                }

                _ = wallclock, if dispatcher.phase == Phase::Running => {
                    dispatcher.begin_stop(StopReason::Wallclock, None, Vec::new()).await;
                }

                _ = closed_tx.closed() => {
                    warn!("Generator disconnected");
                    dispatcher.abort_all();
                    break;
                }
            }
        }

        let metrics = dispatcher.metrics;
        info!(
            dispatched = metrics.dispatched,
            completed = metrics.completed,
            penalized = metrics.penalized,
            timeouts = metrics.timeouts,
            "Manager stopped"
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use historystore::{EvalStatus, Evaluation};
    use std::time::Duration;

    /// Sums the coordinates after a delay of `x[0]` seconds when `delay` is set
    struct SumEvaluator {
        delay: bool,
    }

    #[async_trait]
    impl Evaluator for SumEvaluator {
        async fn evaluate(&self, sample: Sample, _worker: u32) -> EvalOutcome {
            if self.delay {
                tokio::time::sleep(Duration::from_secs_f64(sample.x[0])).await;
            }
            if sample.x[0] < 0.0 {
                return EvalOutcome::Failed {
                    kind: FailureKind::Timeout,
                    message: "negative".to_string(),
                };
            }
            EvalOutcome::Evaluated {
                value: Evaluation::Scalar(sample.x.iter().sum()),
            }
        }
    }

    fn row(id: u64, x: f64) -> HistoryRecord {
        HistoryRecord {
            id,
            x: vec![x],
            x_cube: vec![x],
            value: None,
            is_local_point: false,
            returned: false,
            paused: false,
            status: EvalStatus::Pending,
            worker: None,
            returned_at: None,
        }
    }

    fn manager(config: ManagerConfig, exit: ExitCriteria, delay: bool) -> Manager {
        Manager::new(config, exit, Arc::new(SumEvaluator { delay }))
    }

    #[tokio::test]
    async fn test_delivers_one_result_per_reply() {
        let mut manager = manager(ManagerConfig::default(), ExitCriteria::default(), false);
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let replies = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 1.0), row(1, 2.0), row(2, 3.0)]).unwrap();
            let replies: Vec<_> = (0..3).map(|_| link.receive().unwrap()).collect();
            link.finish();
            replies
        })
        .await
        .unwrap();

        let mut ids: Vec<u64> = replies
            .iter()
            .inspect(|r| assert_eq!(r.tag, Tag::Continue))
            .flat_map(|r| r.results.iter().map(|res| res.id))
            .collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);

        let metrics = run.await.unwrap();
        assert_eq!(metrics.dispatched, 3);
        assert_eq!(metrics.completed, 3);
        assert_eq!(metrics.generator_calls, 1);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let mut manager = manager(ManagerConfig::default(), ExitCriteria::default(), false);
        assert!(manager.connect().is_ok());
        assert!(matches!(manager.connect(), Err(CoordError::Channel(_))));
    }

    #[tokio::test]
    async fn test_max_evaluations_stops_and_defers_queue() {
        let config = ManagerConfig {
            workers: 1,
            ..Default::default()
        };
        let exit = ExitCriteria {
            max_evaluations: Some(2),
            ..Default::default()
        };
        let mut manager = manager(config, exit, false);
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let (first, second) = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 1.0), row(1, 2.0), row(2, 3.0)]).unwrap();
            let first = link.receive().unwrap();
            let second = link.receive().unwrap();
            link.finish();
            (first, second)
        })
        .await
        .unwrap();

        assert_eq!(first.tag, Tag::Continue);
        assert_eq!(second.tag, Tag::Stop);
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.deferred, vec![2]);
        assert_eq!(second.reason, Some(StopReason::MaxEvaluations));

        let metrics = run.await.unwrap();
        assert_eq!(metrics.dispatched, 2);
        assert_eq!(metrics.deferred, 1);
    }

    #[tokio::test]
    async fn test_send_after_stop_comes_back_deferred() {
        let config = ManagerConfig {
            workers: 1,
            ..Default::default()
        };
        let exit = ExitCriteria {
            max_evaluations: Some(1),
            ..Default::default()
        };
        let mut manager = manager(config, exit, false);
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let (stop, late, leftover) = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 1.0)]).unwrap();
            let stop = link.receive().unwrap();
            // the generator had not seen the STOP yet
            link.send(vec![row(1, 2.0)]).unwrap();
            let late = link.receive().unwrap();
            let leftover = link.finish();
            (stop, late, leftover)
        })
        .await
        .unwrap();

        assert_eq!(stop.tag, Tag::Stop);
        assert_eq!(stop.results.len(), 1);
        assert_eq!(late.tag, Tag::Stop);
        assert!(late.results.is_empty());
        assert_eq!(late.deferred, vec![1]);
        assert_eq!(late.reason, Some(StopReason::MaxEvaluations));
        assert!(leftover.is_empty());

        let metrics = run.await.unwrap();
        assert_eq!(metrics.dispatched, 1);
        assert_eq!(metrics.deferred, 1);
    }

    #[tokio::test]
    async fn test_max_generator_calls_refuses_extra_send() {
        let exit = ExitCriteria {
            max_generator_calls: Some(1),
            ..Default::default()
        };
        let mut manager = manager(ManagerConfig::default(), exit, false);
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let stop = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 1.0)]).unwrap();
            assert_eq!(link.receive().unwrap().tag, Tag::Continue);
            link.send(vec![row(1, 2.0)]).unwrap();
            link.receive().unwrap()
        })
        .await
        .unwrap();

        assert_eq!(stop.tag, Tag::Stop);
        assert_eq!(stop.deferred, vec![1]);
        assert_eq!(stop.reason, Some(StopReason::MaxGeneratorCalls));
        assert_eq!(run.await.unwrap().dispatched, 1);
    }

    #[tokio::test]
    async fn test_external_stop_aborts_in_flight() {
        let mut manager = manager(ManagerConfig::default(), ExitCriteria::default(), true);
        let handle = manager.handle();
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let waiter = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 30.0)]).unwrap();
            link.receive().unwrap()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop("operator").await.unwrap();

        let reply = waiter.await.unwrap();
        assert_eq!(reply.tag, Tag::Stop);
        assert!(reply.results.is_empty());
        assert_eq!(reply.reason, Some(StopReason::External("operator".to_string())));

        let metrics = run.await.unwrap();
        assert_eq!(metrics.aborted, 1);
        assert_eq!(metrics.completed, 0);
    }

    #[tokio::test]
    async fn test_drain_on_stop_delivers_in_flight() {
        let config = ManagerConfig {
            workers: 2,
            drain_on_stop: true,
            ..Default::default()
        };
        let mut manager = manager(config, ExitCriteria::default(), true);
        let handle = manager.handle();
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let waiter = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 0.3), row(1, 0.4)]).unwrap();
            let mut replies = Vec::new();
            loop {
                let reply = link.receive().unwrap();
                let done = reply.tag == Tag::Stop;
                replies.push(reply);
                if done {
                    break replies;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop("drain please").await.unwrap();

        let replies = waiter.await.unwrap();
        assert_eq!(replies[0].tag, Tag::StopAndDrain);
        let delivered: usize = replies.iter().map(|r| r.results.len()).sum();
        assert_eq!(delivered, 2);
        assert_eq!(run.await.unwrap().aborted, 0);
    }

    #[tokio::test]
    async fn test_wallclock_limit() {
        let exit = ExitCriteria {
            max_wallclock_seconds: Some(0.2),
            ..Default::default()
        };
        let mut manager = manager(ManagerConfig::default(), exit, true);
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let reply = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, 30.0)]).unwrap();
            link.receive().unwrap()
        })
        .await
        .unwrap();

        assert_eq!(reply.tag, Tag::Stop);
        assert_eq!(reply.reason, Some(StopReason::Wallclock));
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_target_value_and_penalty_counts() {
        let exit = ExitCriteria {
            target_value: Some(0.5),
            ..Default::default()
        };
        let config = ManagerConfig {
            workers: 1,
            ..Default::default()
        };
        let mut manager = manager(config, exit, false);
        let mut link = manager.connect().unwrap();
        let run = tokio::spawn(manager.run());

        let replies = tokio::task::spawn_blocking(move || {
            link.send(vec![row(0, -1.0), row(1, 0.25)]).unwrap();
            vec![link.receive().unwrap(), link.receive().unwrap()]
        })
        .await
        .unwrap();

        // The penalized row never satisfies the target even though -1 < 0.5
        assert_eq!(replies[0].tag, Tag::Continue);
        assert_eq!(replies[1].tag, Tag::Stop);
        assert_eq!(replies[1].reason, Some(StopReason::TargetReached));

        let metrics = run.await.unwrap();
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.penalized, 1);
    }
}
