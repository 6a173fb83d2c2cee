//! Fail-fast sequencing of provisioning steps.
//!
//! A [`Pipeline`] is an ordered list of [`Step`]s executed strictly one
//! after another: later steps depend on the side effects (installed
//! packages, written files, loaded modules) of earlier ones, so nothing
//! runs concurrently. The first failed `Required` step aborts the run;
//! `BestEffort` failures are logged and skipped.

use anyhow::{Context, Result};

use crate::artifact::ConfigArtifact;
use crate::output::Output;
use crate::runner::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Required,
    BestEffort,
}

#[derive(Debug, Clone)]
pub enum StepAction {
    Command { program: String, args: Vec<String> },
    /// A command line that genuinely needs shell pipes; runs via
    /// `/bin/bash -c`.
    Shell(String),
    Artifact(ConfigArtifact),
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub policy: Policy,
    pub action: StepAction,
}

impl Step {
    pub fn cmd(name: impl Into<String>, program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            policy: Policy::Required,
            action: StepAction::Command {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: Policy::Required,
            action: StepAction::Shell(command.into()),
        }
    }

    pub fn artifact(artifact: ConfigArtifact) -> Self {
        Self {
            name: format!("write {}", artifact.name),
            policy: Policy::Required,
            action: StepAction::Artifact(artifact),
        }
    }

    /// Downgrade this step: its failure is logged but does not abort.
    pub fn best_effort(mut self) -> Self {
        self.policy = Policy::BestEffort;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

pub struct Pipeline {
    name: String,
    steps: Vec<Step>,
    state: State,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            state: State::NotStarted,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Execute every step in order against `runner`.
    pub fn run(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        self.state = State::Running;
        let total = self.steps.len();

        for (idx, step) in self.steps.iter().enumerate() {
            tracing::info!(pipeline = %self.name, step = %step.name, "step {}/{}", idx + 1, total);
            Output::step(format!("[{}/{}] {}", idx + 1, total, step.name));

            let result: Result<()> = match &step.action {
                StepAction::Command { program, args } => {
                    let args: Vec<&str> = args.iter().map(String::as_str).collect();
                    runner.run(program, &args).map_err(Into::into)
                }
                StepAction::Shell(command) => runner.shell(command).map_err(Into::into),
                StepAction::Artifact(artifact) => artifact.write(runner),
            };

            if let Err(err) = result {
                match step.policy {
                    Policy::BestEffort => {
                        tracing::warn!(pipeline = %self.name, step = %step.name, error = %err, "best-effort step failed, continuing");
                        Output::warning(format!("{} failed (ignored): {err:#}", step.name));
                    }
                    Policy::Required => {
                        self.state = State::Aborted;
                        return Err(err).with_context(|| {
                            format!("pipeline '{}' aborted at step '{}'", self.name, step.name)
                        });
                    }
                }
            }
        }

        self.state = State::Completed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::MockRunner;

    fn five_steps() -> Vec<Step> {
        (1..=5)
            .map(|i| Step::cmd(format!("step {i}"), "prog", &[&i.to_string()]))
            .collect()
    }

    #[test]
    fn test_all_steps_run_in_order() {
        let mock = MockRunner::new();
        let mut pipeline = Pipeline::new("ok", five_steps());
        pipeline.run(&mock).unwrap();
        assert_eq!(pipeline.state(), State::Completed);
        assert_eq!(
            mock.calls(),
            vec!["prog 1", "prog 2", "prog 3", "prog 4", "prog 5"]
        );
    }

    #[test]
    fn test_required_failure_aborts_remaining_steps() {
        let mock = MockRunner::new().fail_from(3);
        let mut pipeline = Pipeline::new("abort", five_steps());
        let err = pipeline.run(&mock).unwrap_err();

        assert_eq!(pipeline.state(), State::Aborted);
        // Steps 4 and 5 never ran.
        assert_eq!(mock.call_count(), 3);
        assert!(err.to_string().contains("aborted at step 'step 3'"));
    }

    #[test]
    fn test_best_effort_failure_is_skipped() {
        let mock = MockRunner::new().fail_only(2);
        let mut steps = five_steps();
        steps[1] = steps[1].clone().best_effort();

        let mut pipeline = Pipeline::new("skip", steps);
        pipeline.run(&mock).unwrap();

        assert_eq!(pipeline.state(), State::Completed);
        assert_eq!(mock.call_count(), 5);
    }

    #[test]
    fn test_state_starts_not_started() {
        let pipeline = Pipeline::new("idle", Vec::new());
        assert_eq!(pipeline.state(), State::NotStarted);
    }

    #[test]
    fn test_shell_steps_route_through_bash() {
        let mock = MockRunner::new();
        let mut pipeline = Pipeline::new(
            "shell",
            vec![Step::shell("pipe", "echo a | grep a")],
        );
        pipeline.run(&mock).unwrap();
        assert_eq!(mock.calls(), vec!["/bin/bash -c echo a | grep a"]);
    }
}
