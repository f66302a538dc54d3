//! Runs one sample through the pipeline

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::context::{PipelineContext, StepRecord};
use super::convert::FormatConverter;
use super::hooks::{Hook, HookOutcome};
use super::launcher::{LaunchCommand, Launcher, PollStatus};
use super::step::{Step, StepState};
use super::{Pipeline, PipelineError, PipelineResult};

/// Executes pipelines through an explicitly supplied launcher and converter
#[derive(Clone)]
pub struct PipelineRunner {
    pipeline: Arc<Pipeline>,
    launcher: Arc<dyn Launcher>,
    converter: Arc<dyn FormatConverter>,
}

enum HookStage {
    Pre,
    Post,
}

impl PipelineRunner {
    pub fn new(pipeline: Arc<Pipeline>, launcher: Arc<dyn Launcher>, converter: Arc<dyn FormatConverter>) -> Self {
        debug!(steps = pipeline.steps().len(), "PipelineRunner::new: called");
        Self {
            pipeline,
            launcher,
            converter,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run every step in order for the sample described by `ctx`
    pub async fn run(&self, mut ctx: PipelineContext) -> PipelineResult {
        debug!(sample_id = ctx.sample_id, "PipelineRunner::run: called");
        for (index, step) in self.pipeline.steps().iter().enumerate() {
            let started = Instant::now();
            let step_dir = ctx.run_dir.join(format!("{:02}_{}", index, step.name));
            if let Err(source) = tokio::fs::create_dir_all(&step_dir).await {
                return PipelineResult::Error(PipelineError::Io {
                    step: step.name.clone(),
                    source,
                });
            }
            ctx.step_dir = Some(step_dir);
            debug!(sample_id = ctx.sample_id, step = %step.name, state = ?StepState::Pending, "Step ready");

            if let Some(halt) = self.run_hook(step, HookStage::Pre, &mut ctx) {
                return halt;
            }

            let state = match self.run_step(step, &mut ctx).await {
                Ok(()) => StepState::Finished,
                Err(e) => {
                    let state = if e.is_timeout() {
                        StepState::KilledTimeout
                    } else {
                        StepState::Failed
                    };
                    warn!(sample_id = ctx.sample_id, step = %step.name, ?state, error = %e, "Step failed");
                    return PipelineResult::Error(e);
                }
            };
            ctx.steps.push(StepRecord {
                name: step.name.clone(),
                state,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });

            if let Some(halt) = self.run_hook(step, HookStage::Post, &mut ctx) {
                return halt;
            }
        }

        info!(sample_id = ctx.sample_id, steps = ctx.steps.len(), "Pipeline completed");
        PipelineResult::Success(ctx)
    }

    /// Returns a result only when the hook ends the chain
    fn run_hook(&self, step: &Step, stage: HookStage, ctx: &mut PipelineContext) -> Option<PipelineResult> {
        let hook: &Arc<dyn Hook> = match stage {
            HookStage::Pre => step.pre_hook.as_ref()?,
            HookStage::Post => step.post_hook.as_ref()?,
        };
        debug!(step = %step.name, hook = hook.name(), "PipelineRunner::run_hook: called");
        match hook.call(ctx) {
            Ok(HookOutcome::Continue) => None,
            Ok(HookOutcome::Halt { payload, code }) => {
                info!(sample_id = ctx.sample_id, step = %step.name, hook = hook.name(), code, "Pipeline halted by hook");
                Some(PipelineResult::Halt {
                    payload,
                    code,
                    context: ctx.clone(),
                })
            }
            Err(e) => Some(PipelineResult::Error(PipelineError::Hook {
                step: step.name.clone(),
                hook: hook.name().to_string(),
                reason: format!("{:#}", e),
            })),
        }
    }

    /// Render, launch, wait and collect one step
    async fn run_step(&self, step: &Step, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        let input = step.render_input(&self.pipeline, ctx)?;
        let cmd = step.launch_command(&self.pipeline, ctx, input.as_deref())?;
        info!(sample_id = ctx.sample_id, step = %step.name, command = %cmd.display(), "Launching step");

        self.execute(step, &cmd).await?;

        // only the immediately preceding step's output is carried forward
        ctx.previous = step.convert_output(ctx, self.converter.as_ref())?;
        Ok(())
    }

    /// Launch and poll until the process finishes, fails or times out
    async fn execute(&self, step: &Step, cmd: &LaunchCommand) -> Result<(), PipelineError> {
        let mut handle = self
            .launcher
            .launch(cmd)
            .await
            .map_err(|source| PipelineError::Launch {
                step: step.name.clone(),
                source,
            })?;
        debug!(step = %step.name, pid = ?handle.pid(), state = ?StepState::Running, "Step running");

        let started = Instant::now();
        let interval = self.pipeline.poll_interval();
        loop {
            let status = handle.poll().map_err(|source| PipelineError::Launch {
                step: step.name.clone(),
                source,
            })?;
            match status {
                PollStatus::Finished(0) => return Ok(()),
                PollStatus::Finished(code) => {
                    return Err(PipelineError::Exit {
                        step: step.name.clone(),
                        code,
                    });
                }
                PollStatus::Killed => {
                    return Err(PipelineError::Killed {
                        step: step.name.clone(),
                    });
                }
                PollStatus::Running => {}
            }

            if let Some(timeout) = step.timeout
                && started.elapsed() >= timeout
            {
                warn!(step = %step.name, ?timeout, "Step exceeded its timeout, killing");
                if let Err(e) = handle.kill().await {
                    warn!(step = %step.name, error = %e, "Failed to kill timed-out step");
                }
                return Err(PipelineError::Timeout {
                    step: step.name.clone(),
                    timeout,
                });
            }

            let wait = match step.timeout {
                Some(timeout) => interval.min(timeout.saturating_sub(started.elapsed())),
                None => interval,
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
