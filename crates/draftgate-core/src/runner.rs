use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use draftgate_faults::{classify, FailureCondition};
use draftgate_logging::{LogEvent, Logger};
use draftgate_store::{ReprocessStrategy, RetryContext, RetryIteration, StateStore, StepStatus};

use crate::error::RunnerError;
use crate::outcome::{RetryResult, TerminationReason};
use crate::policy::{
    self, PLATEAU_MIN_MEAN_DELTA, PLATEAU_WINDOW, STALL_TARGET_MARGIN,
};
use crate::traits::{StepArtifact, StepExecutor, StepInput, StepValidator};

/// Parameters for one retry run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub step_id: String,
    pub initial_input: StepInput,
    pub target_score: f64,
    pub max_iterations: usize,
}

/// Orchestrates the iterate-score-decide-reprocess loop for one step.
///
/// Iterations are strictly sequential; the only awaits are the executor and
/// validator calls. Cancellation is cooperative and takes effect between
/// iterations.
pub struct RetryRunner<'a> {
    executor: &'a dyn StepExecutor,
    validator: &'a dyn StepValidator,
    store: Arc<StateStore>,
    logger: Arc<Logger>,
    interrupted: Arc<AtomicBool>,
}

impl<'a> RetryRunner<'a> {
    pub fn new(
        executor: &'a dyn StepExecutor,
        validator: &'a dyn StepValidator,
        store: Arc<StateStore>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            executor,
            validator,
            store,
            logger,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a handle to signal interruption
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Latest persisted context for a step, if any
    pub fn active_context(&self, step_id: &str) -> Option<RetryContext> {
        self.store.get_retry_context(step_id)
    }

    /// Drop a step's retry context and mark it pending again
    pub fn clear_context(&self, step_id: &str) {
        self.store.reset_context(step_id);
    }

    /// Run the retry loop until the target is met, the budget is spent,
    /// improvement stalls, or the executor fails.
    pub async fn run(&self, request: RunRequest) -> Result<RetryResult, RunnerError> {
        if request.max_iterations == 0 {
            return Err(RunnerError::ConfigError(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let step_id = request.step_id.as_str();
        let started = Instant::now();

        self.store
            .init_retry_context(step_id, request.target_score, request.max_iterations);
        self.store.save_state(
            step_id,
            serde_json::to_value(&StepArtifact::new(request.initial_input.items.clone()))?,
            StepStatus::Running,
            BTreeMap::new(),
        );

        self.logger.log(&LogEvent::RunStarted {
            step_id: step_id.to_string(),
            target_score: request.target_score,
            max_iterations: request.max_iterations,
            item_count: request.initial_input.items.len(),
        });

        let mut input = request.initial_input.clone();
        input.locked_items = self.store.locked_items();

        // Last successfully scored iteration, carried into failure results.
        let mut last_scored: Option<(StepArtifact, f64)> = None;
        let mut scores: Vec<f64> = Vec::new();
        let mut iteration = 0usize;

        loop {
            iteration += 1;

            if self.interrupted.load(Ordering::SeqCst) {
                info!(step = step_id, "run interrupted before iteration {iteration}");
                self.logger.log(&LogEvent::RunInterrupted { iteration });
                let (artifact, score) = split_last(last_scored);
                return self.finish(
                    &request,
                    TerminationReason::Interrupted,
                    score,
                    iteration - 1,
                    artifact,
                    started,
                );
            }

            self.logger.log(&LogEvent::ExecutorStarted {
                iteration,
                input_items: input.items.len(),
            });

            debug!(step = step_id, iteration, executor = self.executor.name(), "running executor");
            let exec_start = Instant::now();
            let output = match self.executor.execute(&input).await {
                Ok(output) => output,
                Err(e) => {
                    let error = classify(&FailureCondition::ExecutorFailure {
                        step_id: step_id.to_string(),
                        message: e.to_string(),
                    });
                    warn!(step = step_id, iteration, error = %error, "aborting run");
                    self.logger.log(&LogEvent::ExecutorFailed {
                        iteration,
                        error: error.to_string(),
                    });
                    let (artifact, score) = split_last(last_scored);
                    return self.finish(
                        &request,
                        TerminationReason::CriticalError,
                        score,
                        iteration - 1,
                        artifact,
                        started,
                    );
                }
            };

            self.logger.log(&LogEvent::ExecutorCompleted {
                iteration,
                output_items: output.items.len(),
                duration_secs: exec_start.elapsed().as_secs_f64(),
            });

            let report = match self.validator.validate(&output).await {
                Ok(report) => report,
                Err(e) => {
                    let error = classify(&FailureCondition::ExecutorFailure {
                        step_id: step_id.to_string(),
                        message: format!("validator '{}': {}", self.validator.name(), e),
                    });
                    warn!(step = step_id, iteration, error = %error, "aborting run");
                    self.logger.log(&LogEvent::ExecutorFailed {
                        iteration,
                        error: error.to_string(),
                    });
                    let (artifact, score) = split_last(last_scored);
                    return self.finish(
                        &request,
                        TerminationReason::CriticalError,
                        score,
                        iteration - 1,
                        artifact,
                        started,
                    );
                }
            };

            let failing_categories = policy::failing_categories(&report);
            let failing_items = policy::failing_items(&report, &output);

            // Everything that passed this round joins the locked set. The
            // set only grows during a run.
            let locked_before = self.store.locked_items().len();
            let passing: Vec<String> = output
                .item_ids()
                .into_iter()
                .filter(|id| !failing_items.contains(id))
                .collect();
            self.store.lock_items(passing);
            let locked_now = self.store.locked_items();

            self.logger.log(&LogEvent::ItemsLocked {
                iteration,
                newly_locked: locked_now.len().saturating_sub(locked_before),
                total_locked: locked_now.len(),
            });

            self.store
                .set_retry_context(step_id, failing_categories.clone(), true);
            self.store.record_score(step_id, report.score);
            self.store.push_iteration(
                step_id,
                RetryIteration {
                    iteration,
                    score: report.score,
                    failing_categories: failing_categories.clone(),
                    failing_items: failing_items.iter().cloned().collect(),
                    locked_snapshot: locked_now.clone(),
                    modifications: Vec::new(),
                    timestamp: Utc::now(),
                },
            );
            self.store.save_state(
                step_id,
                serde_json::to_value(&output)?,
                StepStatus::Running,
                BTreeMap::new(),
            );

            self.logger.log(&LogEvent::ValidationCompleted {
                iteration,
                score: report.score,
                failing_categories: failing_categories.clone(),
                failing_items: failing_items.len(),
            });

            scores.push(report.score);
            last_scored = Some((output.clone(), report.score));

            if report.score >= request.target_score {
                return self.finish(
                    &request,
                    TerminationReason::Success,
                    report.score,
                    iteration,
                    Some(output),
                    started,
                );
            }

            if iteration >= request.max_iterations {
                self.logger.log(&LogEvent::MaxIterationsReached {
                    iterations: iteration,
                });
                return self.finish(
                    &request,
                    TerminationReason::MaxIterations,
                    report.score,
                    iteration,
                    Some(output),
                    started,
                );
            }

            if stalled(&scores, report.score, request.target_score) {
                self.logger.log(&LogEvent::RunStalled {
                    iteration,
                    score: report.score,
                    target_score: request.target_score,
                });
                return self.finish(
                    &request,
                    TerminationReason::Stalled,
                    report.score,
                    iteration,
                    Some(output),
                    started,
                );
            }

            // Observed behavior preserved: no failing categories counts as
            // success even when the aggregate score is below target.
            if failing_categories.is_empty() {
                debug!(
                    step = step_id,
                    score = report.score,
                    "no failing categories; ending run as success below target"
                );
                return self.finish(
                    &request,
                    TerminationReason::Success,
                    report.score,
                    iteration,
                    Some(output),
                    started,
                );
            }

            input = self.next_input(step_id, &output, &failing_categories, &failing_items, iteration);
        }
    }

    /// Build the next iteration's input from the chosen strategy.
    fn next_input(
        &self,
        step_id: &str,
        output: &StepArtifact,
        failing_categories: &[String],
        failing_items: &std::collections::BTreeSet<String>,
        iteration: usize,
    ) -> StepInput {
        let strategy = policy::select_strategy(failing_categories);
        self.store.set_strategy(step_id, strategy);

        let locked = self.store.locked_items();
        let items = match strategy {
            ReprocessStrategy::FullReprocess => output.items.clone(),
            ReprocessStrategy::IncrementalFix => output
                .items
                .iter()
                .filter(|i| failing_items.contains(&i.id))
                .cloned()
                .collect(),
            ReprocessStrategy::TargetedReprocess => output
                .items
                .iter()
                .filter(|i| !locked.contains(&i.id))
                .cloned()
                .collect(),
        };

        self.logger.log(&LogEvent::StrategySelected {
            iteration,
            strategy: strategy.to_string(),
            carried_items: items.len(),
        });

        StepInput {
            items,
            guidance: failing_categories
                .iter()
                .map(|c| policy::guidance_for(c))
                .collect(),
            locked_items: locked,
        }
    }

    /// Persist the final state and run log, emit the completion event, and
    /// shape the result.
    fn finish(
        &self,
        request: &RunRequest,
        reason: TerminationReason,
        final_score: f64,
        iterations_used: usize,
        artifact: Option<StepArtifact>,
        started: Instant,
    ) -> Result<RetryResult, RunnerError> {
        let step_id = request.step_id.as_str();
        let success = reason == TerminationReason::Success;
        let duration_secs = started.elapsed().as_secs_f64();

        let context = self
            .store
            .get_retry_context(step_id)
            .unwrap_or_else(|| {
                RetryContext::new(step_id, request.target_score, request.max_iterations)
            });

        let metadata = BTreeMap::from([
            ("reason".to_string(), reason.to_string()),
            ("final_score".to_string(), format!("{final_score:.1}")),
            ("iterations_used".to_string(), iterations_used.to_string()),
            ("duration_secs".to_string(), format!("{duration_secs:.1}")),
        ]);
        let payload = match &artifact {
            Some(a) => serde_json::to_value(a)?,
            None => serde_json::Value::Null,
        };
        let status = if success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        self.store.save_state(step_id, payload, status, metadata);

        self.logger.log(&LogEvent::RunCompleted {
            step_id: step_id.to_string(),
            reason: reason.to_string(),
            iterations: iterations_used,
            final_score,
            duration_secs,
        });

        Ok(if success {
            RetryResult::success(
                final_score,
                iterations_used,
                artifact.unwrap_or_default(),
                context,
            )
        } else {
            RetryResult::failed(reason, final_score, iterations_used, artifact, context)
        })
    }
}

fn split_last(last: Option<(StepArtifact, f64)>) -> (Option<StepArtifact>, f64) {
    match last {
        Some((artifact, score)) => (Some(artifact), score),
        None => (None, 0.0),
    }
}

/// Stop-condition checks for stalled improvement, in spec order: two
/// non-increasing scores while well short of the target, then a plateau in
/// the mean delta over the trailing window.
fn stalled(scores: &[f64], latest: f64, target: f64) -> bool {
    let n = scores.len();
    if n >= 2 && scores[n - 1] <= scores[n - 2] && target - latest > STALL_TARGET_MARGIN {
        return true;
    }
    if n >= PLATEAU_WINDOW {
        let window_start = scores[n - PLATEAU_WINDOW];
        let mean_delta = (scores[n - 1] - window_start) / (PLATEAU_WINDOW - 1) as f64;
        if mean_delta < PLATEAU_MIN_MEAN_DELTA {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_non_increasing_below_margin() {
        // 69 <= 70 and 90 - 69 > 10
        assert!(stalled(&[70.0, 69.0], 69.0, 90.0));
    }

    #[test]
    fn test_not_stalled_when_close_to_target() {
        // Non-increasing but within 10 of target
        assert!(!stalled(&[85.0, 84.0], 84.0, 90.0));
    }

    #[test]
    fn test_stalled_plateau() {
        // Mean delta over last 3 scores: (71.5 - 70.0) / 2 = 0.75 < 2.0
        assert!(stalled(&[70.0, 71.0, 71.5], 71.5, 90.0));
    }

    #[test]
    fn test_not_stalled_while_improving() {
        assert!(!stalled(&[70.0, 75.0, 81.0], 81.0, 90.0));
    }

    #[test]
    fn test_single_score_never_stalls() {
        assert!(!stalled(&[50.0], 50.0, 90.0));
    }
}
