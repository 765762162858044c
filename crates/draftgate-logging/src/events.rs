use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Structured log events for the retry loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        step_id: String,
        target_score: f64,
        max_iterations: usize,
        item_count: usize,
    },
    ExecutorStarted {
        iteration: usize,
        input_items: usize,
    },
    ExecutorCompleted {
        iteration: usize,
        output_items: usize,
        duration_secs: f64,
    },
    ExecutorFailed {
        iteration: usize,
        error: String,
    },
    ValidationCompleted {
        iteration: usize,
        score: f64,
        failing_categories: Vec<String>,
        failing_items: usize,
    },
    ItemsLocked {
        iteration: usize,
        newly_locked: usize,
        total_locked: usize,
    },
    StrategySelected {
        iteration: usize,
        strategy: String,
        carried_items: usize,
    },
    RunStalled {
        iteration: usize,
        score: f64,
        target_score: f64,
    },
    MaxIterationsReached {
        iterations: usize,
    },
    RunInterrupted {
        iteration: usize,
    },
    RunCompleted {
        step_id: String,
        reason: String,
        iterations: usize,
        final_score: f64,
        duration_secs: f64,
    },
    PersistenceDegraded {
        operation: String,
        error: String,
    },
    CheckpointCreated {
        name: String,
    },
    CheckpointRestored {
        name: String,
    },
}

impl LogEvent {
    /// Add a timestamp to serialize with the event
    fn with_timestamp(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }
        value
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Logger for retry-run events - handles both console output and file logging
pub struct Logger {
    format: LogFormat,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self {
            format,
            file_writer: None,
        }
    }

    /// Create a logger with file output in addition to console
    pub fn with_file(format: LogFormat, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        Ok(Self {
            format,
            file_writer: Some(Mutex::new(file)),
        })
    }

    pub fn log(&self, event: &LogEvent) {
        // File output is always JSON lines
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                let json = event.with_timestamp();
                let _ = writeln!(file, "{}", json);
            }
        }

        match self.format {
            LogFormat::Json => self.log_json(event),
            LogFormat::Pretty => self.log_pretty(event),
            LogFormat::Compact => self.log_compact(event),
        }
    }

    fn log_json(&self, event: &LogEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{}", json);
        }
    }

    fn log_pretty(&self, event: &LogEvent) {
        let mut stderr = std::io::stderr();
        match event {
            LogEvent::RunStarted {
                step_id,
                target_score,
                max_iterations,
                item_count,
            } => {
                let _ = writeln!(stderr);
                let _ = writeln!(
                    stderr,
                    "{} {}",
                    "▶ draftgate".bold().bright_white(),
                    format!(
                        "step '{}' · target {:.0} · budget {} iterations · {} items",
                        step_id, target_score, max_iterations, item_count
                    )
                    .dimmed()
                );
            }
            LogEvent::ExecutorStarted {
                iteration,
                input_items,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} {}",
                    format!("[{}]", iteration).bright_blue(),
                    format!("executor started ({} items)", input_items).dimmed()
                );
            }
            LogEvent::ExecutorCompleted {
                iteration,
                output_items,
                duration_secs,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} executor produced {} items in {:.1}s",
                    format!("[{}]", iteration).bright_blue(),
                    output_items,
                    duration_secs
                );
            }
            LogEvent::ExecutorFailed { iteration, error } => {
                let _ = writeln!(
                    stderr,
                    "{} {} {}",
                    format!("[{}]", iteration).bright_blue(),
                    "executor failed:".bright_red().bold(),
                    error
                );
            }
            LogEvent::ValidationCompleted {
                iteration,
                score,
                failing_categories,
                failing_items,
            } => {
                let score_str = format!("{:.1}", score);
                let colored_score = if failing_categories.is_empty() {
                    score_str.bright_green()
                } else {
                    score_str.bright_yellow()
                };
                let _ = writeln!(
                    stderr,
                    "{} score {} · failing categories: {} · failing items: {}",
                    format!("[{}]", iteration).bright_blue(),
                    colored_score,
                    if failing_categories.is_empty() {
                        "none".to_string()
                    } else {
                        failing_categories.join(", ")
                    },
                    failing_items
                );
            }
            LogEvent::ItemsLocked {
                iteration,
                newly_locked,
                total_locked,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} locked {} items ({} total)",
                    format!("[{}]", iteration).bright_blue(),
                    newly_locked,
                    total_locked
                );
            }
            LogEvent::StrategySelected {
                iteration,
                strategy,
                carried_items,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} next pass: {} ({} items carried forward)",
                    format!("[{}]", iteration).bright_blue(),
                    strategy.bright_cyan(),
                    carried_items
                );
            }
            LogEvent::RunStalled {
                iteration,
                score,
                target_score,
            } => {
                let _ = writeln!(
                    stderr,
                    "{} {} score {:.1} is not converging toward {:.0}",
                    format!("[{}]", iteration).bright_blue(),
                    "stalled:".bright_yellow().bold(),
                    score,
                    target_score
                );
            }
            LogEvent::MaxIterationsReached { iterations } => {
                let _ = writeln!(
                    stderr,
                    "{} after {} iterations",
                    "budget exhausted".bright_yellow().bold(),
                    iterations
                );
            }
            LogEvent::RunInterrupted { iteration } => {
                let _ = writeln!(
                    stderr,
                    "{} before iteration {}",
                    "interrupted".bright_yellow().bold(),
                    iteration
                );
            }
            LogEvent::RunCompleted {
                step_id,
                reason,
                iterations,
                final_score,
                duration_secs,
            } => {
                let reason_colored = if reason == "success" {
                    reason.bright_green().bold()
                } else {
                    reason.bright_red().bold()
                };
                let _ = writeln!(
                    stderr,
                    "{} step '{}' · {} · {} iterations · score {:.1} · {:.1}s",
                    "■".bright_white(),
                    step_id,
                    reason_colored,
                    iterations,
                    final_score,
                    duration_secs
                );
            }
            LogEvent::PersistenceDegraded { operation, error } => {
                let _ = writeln!(
                    stderr,
                    "{} {} ({})",
                    "persistence degraded:".bright_yellow(),
                    operation,
                    error
                );
            }
            LogEvent::CheckpointCreated { name } => {
                let _ = writeln!(stderr, "checkpoint '{}' created", name);
            }
            LogEvent::CheckpointRestored { name } => {
                let _ = writeln!(stderr, "checkpoint '{}' restored", name);
            }
        }
    }

    fn log_compact(&self, event: &LogEvent) {
        let mut stderr = std::io::stderr();
        let line = match event {
            LogEvent::RunStarted {
                step_id,
                target_score,
                max_iterations,
                ..
            } => format!("run step={step_id} target={target_score} max_iter={max_iterations}"),
            LogEvent::ExecutorStarted { iteration, .. } => format!("iter={iteration} exec"),
            LogEvent::ExecutorCompleted {
                iteration,
                duration_secs,
                ..
            } => format!("iter={iteration} exec done {duration_secs:.1}s"),
            LogEvent::ExecutorFailed { iteration, error } => {
                format!("iter={iteration} exec FAILED: {error}")
            }
            LogEvent::ValidationCompleted {
                iteration, score, ..
            } => format!("iter={iteration} score={score:.1}"),
            LogEvent::ItemsLocked {
                iteration,
                total_locked,
                ..
            } => format!("iter={iteration} locked={total_locked}"),
            LogEvent::StrategySelected {
                iteration,
                strategy,
                ..
            } => format!("iter={iteration} strategy={strategy}"),
            LogEvent::RunStalled {
                iteration, score, ..
            } => format!("iter={iteration} STALLED score={score:.1}"),
            LogEvent::MaxIterationsReached { iterations } => {
                format!("MAX_ITERATIONS iters={iterations}")
            }
            LogEvent::RunInterrupted { iteration } => format!("INTERRUPTED iter={iteration}"),
            LogEvent::RunCompleted {
                reason,
                iterations,
                final_score,
                ..
            } => format!("done reason={reason} iters={iterations} score={final_score:.1}"),
            LogEvent::PersistenceDegraded { operation, .. } => {
                format!("persistence degraded op={operation}")
            }
            LogEvent::CheckpointCreated { name } => format!("checkpoint created name={name}"),
            LogEvent::CheckpointRestored { name } => format!("checkpoint restored name={name}"),
        };
        let _ = writeln!(stderr, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("compact").unwrap(), LogFormat::Compact);
        assert!(LogFormat::from_str("verbose").is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let event = LogEvent::ValidationCompleted {
            iteration: 2,
            score: 81.5,
            failing_categories: vec!["formatting".to_string()],
            failing_items: 3,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "validation_completed");
        assert_eq!(value["iteration"], 2);
        assert_eq!(value["failing_categories"][0], "formatting");
    }

    #[test]
    fn test_with_timestamp_adds_field() {
        let event = LogEvent::CheckpointCreated {
            name: "pre-rework".to_string(),
        };
        let value = event.with_timestamp();
        assert!(value.get("timestamp").is_some());
    }
}
