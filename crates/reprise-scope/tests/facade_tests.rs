use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use reprise_scope::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Engine answering from a fixed script, recording every call
#[derive(Default)]
struct ScriptEngine {
    answers: Mutex<VecDeque<Result<bool, InconsistentCombination>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptEngine {
    fn new(answers: impl IntoIterator<Item = Result<bool, InconsistentCombination>>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into_iter().collect()),
            calls: Mutex::default(),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl CombinatorialEngine for ScriptEngine {
    fn has_pending_combination(
        &self,
        _session: SessionId,
        succeeded: bool,
    ) -> Result<bool, InconsistentCombination> {
        self.calls.lock().push(format!("pending?({succeeded})"));
        self.answers.lock().pop_front().unwrap_or(Ok(false))
    }

    fn start_new_combination(&self, _session: SessionId) {
        self.calls.lock().push("start".to_string());
    }

    fn mark_non_repeatable(&self, _session: SessionId) {
        self.calls.lock().push("non-repeatable".to_string());
    }
}

fn counting_plan(counter: &Arc<AtomicUsize>) -> RetirementPlan {
    let counter = Arc::clone(counter);
    RetirementPlan::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// Run one execution in a fresh scope, continuing `previous`
fn run_once(
    facade: &ScopeLifecycleFacade,
    previous: Option<&Arc<String>>,
    session: SessionId,
    succeeded: bool,
) -> (Arc<String>, Result<bool, MaxRepeatCount>) {
    let scope = Arc::new(String::from("execution"));
    if let Some(previous) = previous {
        facade.hand_over_repeat(previous, &scope);
    }
    assert!(facade.open_scope(&scope));
    let config = facade.current_configuration();
    if config.session().is_none() {
        config.bind_session(session).unwrap();
    }
    let result = facade.close_scope(&scope, succeeded);
    (scope, result)
}

#[test]
fn reopen_then_close_retires_once() {
    let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
    let scope = Arc::new("A");
    let fired = Arc::new(AtomicUsize::new(0));

    assert!(facade.open_scope(&scope));
    facade
        .current_configuration()
        .set_scoped_item("k1", Arc::new(1_u32), counting_plan(&fired));
    assert!(!facade.open_scope(&scope));
    assert_eq!(facade.close_scope(&scope, true), Ok(true));

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn double_close_is_idempotent() {
    let engine = ScriptEngine::new([Ok(true)]);
    let facade = ScopeLifecycleFacade::new(engine.clone());
    let scope = Arc::new("A");
    let fired = Arc::new(AtomicUsize::new(0));

    facade.open_scope(&scope);
    let config = facade.current_configuration();
    config.bind_session(SessionId::new()).unwrap();
    config.set_scoped_item("k", Arc::new(()), counting_plan(&fired));

    assert_eq!(facade.close_scope(&scope, true), Ok(false));
    assert_eq!(facade.close_scope(&scope, true), Ok(true));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(engine.calls(), vec!["pending?(true)"]);
}

#[test]
fn three_failing_repeats_then_done() {
    let engine = ScriptEngine::new([Ok(true), Ok(true), Ok(true), Ok(false)]);
    let config = RepeatConfig::new()
        .with_max_total_count(10)
        .with_max_failure_count(5);
    let facade = ScopeLifecycleFacade::with_config(engine.clone(), &config).unwrap();
    let session = SessionId::new();

    let mut previous: Option<Arc<String>> = None;
    let mut decisions = Vec::new();
    for succeeded in [false, false, false, true] {
        let (scope, result) = run_once(&facade, previous.as_ref(), session, succeeded);
        decisions.push(result.unwrap());
        previous = Some(scope);
    }

    assert_eq!(decisions, vec![false, false, false, true]);
    let last = previous.unwrap();
    let summary = facade.repeat_summary(&last).unwrap();
    assert_eq!(summary.message.as_deref(), Some("3 tests failed (total 4)"));
    assert_eq!(summary.total_count, 4);
    assert_eq!(
        engine.calls().iter().filter(|call| *call == "start").count(),
        3
    );
}

#[test]
fn max_total_at_one_disables_repetition() {
    let engine = ScriptEngine::new([Ok(true)]);
    let facade = ScopeLifecycleFacade::new(engine.clone());
    facade.root().set_max_total_count(1).unwrap();

    let (_, result) = run_once(&facade, None, SessionId::new(), false);
    let err = result.unwrap_err();
    assert_eq!(err.kind, MaxRepeatKind::TotalCount);
    assert!(err.reached_max_total_count_at_one);
    assert_eq!(engine.calls().last().map(String::as_str), Some("non-repeatable"));
}

#[test]
fn max_failure_count_stops_session() {
    let engine = ScriptEngine::new([Ok(true), Ok(true), Ok(true)]);
    let facade = ScopeLifecycleFacade::with_config(
        engine,
        &RepeatConfig::new().with_max_failure_count(2),
    )
    .unwrap();
    let session = SessionId::new();

    let (first, result) = run_once(&facade, None, session, false);
    assert_eq!(result, Ok(false));
    let (_, result) = run_once(&facade, Some(&first), session, false);

    let err = result.unwrap_err();
    assert_eq!(err.kind, MaxRepeatKind::FailureCount);
    assert_eq!(err.summary, "2 tests failed (total 2)");
}

#[test]
fn max_total_count_reached_later() {
    let engine = ScriptEngine::new([Ok(true), Ok(true), Ok(true)]);
    let facade = ScopeLifecycleFacade::with_config(
        engine,
        &RepeatConfig::new().with_max_total_count(2),
    )
    .unwrap();
    let session = SessionId::new();

    let (first, _) = run_once(&facade, None, session, true);
    let (_, result) = run_once(&facade, Some(&first), session, true);

    let err = result.unwrap_err();
    assert_eq!(err.kind, MaxRepeatKind::TotalCount);
    assert!(!err.is_repetition_disabled());
    assert_eq!(err.summary, "0 tests failed (total 2)");
}

#[test]
fn inconsistency_becomes_cause() {
    let engine = ScriptEngine::new([Err(InconsistentCombination::new("x changed"))]);
    let facade = ScopeLifecycleFacade::new(engine.clone());

    let (_, result) = run_once(&facade, None, SessionId::new(), true);
    let err = result.unwrap_err();
    assert_eq!(err.kind, MaxRepeatKind::Inconsistent);
    assert_eq!(err.cause, Some(InconsistentCombination::new("x changed")));
    assert!(engine.calls().contains(&"non-repeatable".to_string()));
}

#[test]
fn non_repeatable_scope_never_repeats() {
    let engine = ScriptEngine::new([Ok(true)]);
    let facade = ScopeLifecycleFacade::new(engine.clone());
    let scope = Arc::new(());

    facade.open_scope(&scope);
    facade.current_configuration().bind_session(SessionId::new()).unwrap();
    facade.mark_non_repeatable(&scope);

    assert_eq!(facade.close_scope(&scope, true), Ok(true));
    assert_eq!(engine.calls(), vec!["non-repeatable"]);
}

#[test]
fn hand_over_without_pending_is_refused() {
    let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
    let from = Arc::new(1);
    let to = Arc::new(2);
    facade.open_scope(&from);
    facade.close_scope(&from, true).unwrap();

    assert!(!facade.hand_over_repeat(&from, &to));
}

#[test]
fn retirement_failures_are_reported_per_scope() {
    let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
    let scope = Arc::new(());
    facade.open_scope(&scope);
    facade.current_configuration().set_scoped_item(
        "resource",
        Arc::new(()),
        RetirementPlan::new(|| anyhow::bail!("close failed")),
    );

    assert_eq!(facade.close_scope(&scope, true), Ok(true));
    let failures = facade.retirement_failures(&scope);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "resource");
}

#[test]
fn retirement_failure_counts_as_failed_execution() {
    let engine = ScriptEngine::new([Ok(true)]);
    let config = RepeatConfig::new().with_max_failure_count(1);
    let facade = ScopeLifecycleFacade::with_config(engine.clone(), &config).unwrap();
    let scope = Arc::new(());
    facade.open_scope(&scope);
    let current = facade.current_configuration();
    current.bind_session(SessionId::new()).unwrap();
    current.set_scoped_item(
        "socket",
        Arc::new(()),
        RetirementPlan::new(|| anyhow::bail!("close failed")),
    );

    let stop = facade.close_scope(&scope, true).unwrap_err();
    assert_eq!(stop.kind, MaxRepeatKind::FailureCount);
    assert_eq!((stop.total_count, stop.failure_count), (1, 1));
    assert_eq!(engine.calls(), vec!["pending?(false)", "non-repeatable"]);
}

#[test]
fn abandoned_repeat_ends_the_session() {
    let engine = ScriptEngine::new([Ok(true)]);
    let facade = ScopeLifecycleFacade::new(engine.clone());
    let session = SessionId::new();

    let (first, result) = run_once(&facade, None, session, true);
    assert_eq!(result, Ok(false));
    assert_eq!(facade.active_sessions(), 1);

    let next = Arc::new(String::from("next"));
    assert!(facade.hand_over_repeat(&first, &next));
    assert_eq!(facade.abandon_repeat(&next), Some(session));
    assert_eq!(facade.abandon_repeat(&next), None);
    assert_eq!(facade.active_sessions(), 0);

    facade.open_scope(&next);
    assert_eq!(facade.current_configuration().session(), None);
    assert_eq!(engine.calls(), vec!["pending?(true)", "non-repeatable"]);
}

#[test]
fn concurrent_opens_create_one_configuration() {
    let facade = Arc::new(ScopeLifecycleFacade::new(Arc::new(NoCombinations)));
    let scope = Arc::new("shared");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let facade = Arc::clone(&facade);
            let scope = Arc::clone(&scope);
            std::thread::spawn(move || facade.open_scope(&scope))
        })
        .collect();
    let created = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|created| *created)
        .count();

    assert_eq!(created, 1);
}

#[test]
fn worker_thread_inherits_scope() {
    let facade = Arc::new(ScopeLifecycleFacade::new(Arc::new(NoCombinations)));
    let scope = Arc::new(());
    facade.open_scope(&scope);
    let expected = facade.configuration(&scope).unwrap();

    let worker_facade = Arc::clone(&facade);
    let seen = spawn_inheriting("worker", move || worker_facade.current_configuration())
        .unwrap()
        .join()
        .unwrap();
    let plain_facade = Arc::clone(&facade);
    let plain = std::thread::spawn(move || plain_facade.current_configuration())
        .join()
        .unwrap();

    assert!(Arc::ptr_eq(&seen, &expected));
    assert!(Arc::ptr_eq(&plain, facade.root()));
}

#[test]
fn dropped_scope_is_forgotten() {
    let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
    let scope = Arc::new(());
    facade.open_scope(&scope);
    let config = facade.configuration(&scope).unwrap();
    facade.close_scope(&scope, true).unwrap();
    drop(scope);

    let other = Arc::new(());
    facade.open_scope(&other);
    assert_eq!(Arc::strong_count(&config), 1);
}

proptest! {
    #[test]
    fn prop_retirement_fires_once(attempts in 1usize..10, items in 1usize..6) {
        let facade = ScopeLifecycleFacade::new(Arc::new(NoCombinations));
        let scope = Arc::new(());
        let fired = Arc::new(AtomicUsize::new(0));

        facade.open_scope(&scope);
        let config = facade.current_configuration();
        for i in 0..items {
            config.set_scoped_item(format!("item-{i}"), Arc::new(i), counting_plan(&fired));
        }
        for _ in 0..attempts {
            facade.close_scope(&scope, true).unwrap();
            config.retire("extra");
        }

        prop_assert_eq!(fired.load(Ordering::SeqCst), items);
    }

    #[test]
    fn prop_counts_match_outcomes(outcomes in proptest::collection::vec(any::<bool>(), 1..20)) {
        let mut answers: Vec<_> = outcomes.iter().map(|_| Ok(true)).collect();
        if let Some(last) = answers.last_mut() {
            *last = Ok(false);
        }
        let facade = ScopeLifecycleFacade::new(ScriptEngine::new(answers));
        let session = SessionId::new();

        let mut previous: Option<Arc<String>> = None;
        for (i, succeeded) in outcomes.iter().enumerate() {
            let (scope, result) = run_once(&facade, previous.as_ref(), session, *succeeded);
            prop_assert_eq!(result, Ok(i + 1 == outcomes.len()));
            previous = Some(scope);
        }

        let summary = facade.repeat_summary(&previous.unwrap()).unwrap();
        let failures = outcomes.iter().filter(|succeeded| !**succeeded).count() as u64;
        prop_assert_eq!(summary.total_count, outcomes.len() as u64);
        prop_assert_eq!(summary.failure_count, failures);
    }
}
