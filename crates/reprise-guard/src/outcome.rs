//! Merging the outcomes of repeated executions into one reported result

use crate::host::{Failure, Outcome};
use reprise_scope::{MaxRepeatCount, MaxRepeatKind};

/// Reported outcome of a family of executions
///
/// - single execution: its own outcome
/// - repeated: successful, or failed with a count summary and each failing
///   execution attached
/// - stopped by a limit: a synthetic summary, aborted when nothing failed,
///   unless repetition was disabled outright
/// - stopped by an inconsistency: failed with the cause
#[must_use]
pub fn merge_executions(executions: &[Outcome], stop: Option<&MaxRepeatCount>) -> Outcome {
    let failures = failing(executions);

    match stop {
        Some(stop) if stop.is_repetition_disabled() => last_or_success(executions),
        Some(stop) if stop.kind == MaxRepeatKind::Inconsistent => {
            Outcome::Failed(attach(Failure::new(stop.to_string()), failures))
        }
        Some(stop) if failures.is_empty() => Outcome::Aborted(Failure::new(stop.to_string())),
        Some(stop) => Outcome::Failed(attach(Failure::new(stop.to_string()), failures)),
        None if executions.len() <= 1 => last_or_success(executions),
        None if failures.is_empty() => Outcome::Successful,
        None => {
            let summary = format!("{} tests failed (total {})", failures.len(), executions.len());
            Outcome::Failed(attach(Failure::new(summary), failures))
        }
    }
}

/// Merge failures raised by the coordinator itself into `outcome`
///
/// They become the reported failure only if nothing else failed.
#[must_use]
pub fn with_internal_failures(outcome: Outcome, failures: Vec<Failure>) -> Outcome {
    let mut failures = failures.into_iter();
    match outcome {
        Outcome::Successful => match failures.next() {
            None => Outcome::Successful,
            Some(first) => Outcome::Failed(attach(first, failures.collect())),
        },
        Outcome::Aborted(primary) => Outcome::Aborted(attach(primary, failures.collect())),
        Outcome::Failed(primary) => Outcome::Failed(attach(primary, failures.collect())),
    }
}

fn failing(executions: &[Outcome]) -> Vec<Failure> {
    executions.iter().filter_map(Outcome::failure).cloned().collect()
}

fn last_or_success(executions: &[Outcome]) -> Outcome {
    executions.last().cloned().unwrap_or(Outcome::Successful)
}

fn attach(mut primary: Failure, failures: Vec<Failure>) -> Failure {
    primary.suppress_all(failures);
    primary
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn failed(message: &str) -> Outcome {
        Outcome::Failed(Failure::new(message))
    }

    #[test]
    fn single_execution_is_reported_unchanged() {
        assert_eq!(merge_executions(&[failed("boom")], None), failed("boom"));
        assert_eq!(merge_executions(&[], None), Outcome::Successful);
    }

    #[test]
    fn repeated_failures_are_summarized() {
        let executions = [failed("a"), Outcome::Successful, failed("b")];
        let Outcome::Failed(summary) = merge_executions(&executions, None) else {
            panic!("expected failure");
        };
        assert_eq!(summary.message(), "2 tests failed (total 3)");
        assert_eq!(summary.suppressed(), &[Failure::new("a"), Failure::new("b")]);
    }

    #[test]
    fn repeated_successes_succeed() {
        let executions = [Outcome::Successful, Outcome::Successful];
        assert_eq!(merge_executions(&executions, None), Outcome::Successful);
    }

    #[test]
    fn internal_failure_only_surfaces_alone() {
        let merged = with_internal_failures(Outcome::Successful, vec![Failure::new("cleanup")]);
        assert_eq!(merged, failed("cleanup"));

        let merged = with_internal_failures(failed("test"), vec![Failure::new("cleanup")]);
        let failure = merged.failure().unwrap();
        assert_eq!(failure.message(), "test");
        assert_eq!(failure.suppressed(), &[Failure::new("cleanup")]);
    }
}
