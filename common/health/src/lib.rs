use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod check;
mod status;

pub use check::{CheckError, Checkable, HealthCheck};
pub use status::{CheckState, CheckStatus, HealthStatus, OverallStatus};

/// Health supervision for the dependencies of the service.
///
/// The service can only do useful work while its database, API clients and
/// DALs are reachable. Each of them is registered as a [`HealthCheck`] and,
/// once the registry is started, polled on its own interval by its own task:
///   - every poll runs as a separate task bounded by the check's interval, so
///     a hanging check never delays other checks or its own next poll
///   - a failing fatal check makes the process unhealthy, a failing non-fatal
///     check only degrades it, until a later poll of that check succeeds
///   - errors, timeouts and panics of a check are recorded as failures, they
///     never propagate to readers of the status
///
/// The set of checks is closed once the registry starts. The registry is a
/// cheap handle: clones share the same state.

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HealthError {
    #[error("health checks cannot be added or started once the registry is running")]
    AlreadyStarted,
    #[error("a health check named {0} is already registered")]
    DuplicateCheck(String),
    #[error("health check {0} needs a non-zero interval")]
    InvalidInterval(String),
    #[error("no health checks registered")]
    NoChecks,
    #[error("the health registry was stopped")]
    Stopped,
}

#[derive(Default)]
struct Registration {
    checks: Vec<HealthCheck>,
    started: bool,
}

struct Inner {
    registration: Mutex<Registration>,
    components: RwLock<BTreeMap<String, CheckState>>,
    status: watch::Sender<HealthStatus>,
    shutdown: CancellationToken,
    schedulers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    inner: Arc<Inner>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (status, _) = watch::channel(HealthStatus::default());

        Self {
            name: name.to_owned(),
            inner: Arc::new(Inner {
                registration: Mutex::default(),
                components: RwLock::default(),
                status,
                shutdown: CancellationToken::new(),
                schedulers: Mutex::default(),
            }),
        }
    }

    /// Add checks to be polled once the registry starts. Either all of them
    /// are added or, on error, none.
    pub fn add_checks<I>(&self, checks: I) -> Result<(), HealthError>
    where
        I: IntoIterator<Item = HealthCheck>,
    {
        let mut registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registration.started {
            return Err(HealthError::AlreadyStarted);
        }

        let checks: Vec<HealthCheck> = checks.into_iter().collect();
        {
            let mut names: HashSet<&str> = registration
                .checks
                .iter()
                .map(|check| check.name.as_str())
                .collect();
            for check in &checks {
                if check.interval.is_zero() {
                    return Err(HealthError::InvalidInterval(check.name.clone()));
                }
                if !names.insert(check.name.as_str()) {
                    return Err(HealthError::DuplicateCheck(check.name.clone()));
                }
            }
        }

        for check in &checks {
            debug!(
                check = %check.name,
                interval_secs = check.interval.as_secs_f64(),
                fatal = check.fatal,
                "{} health check registered",
                self.name
            );
        }
        registration.checks.extend(checks);
        Ok(())
    }

    /// Start polling every registered check. Must be called from within a
    /// tokio runtime, only once, and not after [`HealthRegistry::stop`].
    pub fn start(&self) -> Result<(), HealthError> {
        let mut registration = self
            .inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registration.started {
            return Err(HealthError::AlreadyStarted);
        }
        // Schedulers would exit on their first tick
        if self.inner.shutdown.is_cancelled() {
            return Err(HealthError::Stopped);
        }
        if registration.checks.is_empty() {
            return Err(HealthError::NoChecks);
        }
        registration.started = true;

        let schedulers: Vec<JoinHandle<()>> = registration
            .checks
            .iter()
            .map(|check| tokio::spawn(schedule(self.inner.clone(), check.clone())))
            .collect();

        info!(
            checks = schedulers.len(),
            "{} health registry started", self.name
        );
        self.inner
            .schedulers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(schedulers);
        Ok(())
    }

    /// Stop polling and wait for the schedulers to exit. In-flight polls are
    /// cancelled and their results discarded.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let schedulers = std::mem::take(
            &mut *self
                .inner
                .schedulers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for scheduler in schedulers {
            if let Err(err) = scheduler.await {
                warn!("health check scheduler ended abnormally: {}", err);
            }
        }
        info!("{} health registry stopped", self.name);
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .started
    }

    /// Names of the registered checks, in registration order.
    pub fn check_names(&self) -> Vec<String> {
        self.inner
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .checks
            .iter()
            .map(|check| check.name.clone())
            .collect()
    }

    /// Returns the overall process status, computed from the last observed
    /// state of every polled check.
    pub fn get_status(&self) -> HealthStatus {
        let status = self.inner.snapshot();
        match status.status {
            OverallStatus::Ok => debug!("{} health check ok", self.name),
            _ => warn!(
                "{} health check {:?}: {:?}",
                self.name,
                status.status,
                status
                    .details
                    .iter()
                    .filter(|(_, state)| state.is_failed())
                    .map(|(name, _)| name)
                    .collect::<Vec<_>>()
            ),
        }
        status
    }

    /// Receive a new status every time a poll is recorded.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.inner.status.subscribe()
    }
}

impl Inner {
    fn snapshot(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        HealthStatus::from_states(components.clone())
    }

    /// Store the outcome of poll number `poll` of `check`, unless a later
    /// poll of the same check was already recorded.
    fn record(
        &self,
        check: &HealthCheck,
        poll: u64,
        outcome: Result<serde_json::Value, CheckError>,
    ) {
        let now = OffsetDateTime::now_utc();
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = components.get(&check.name);

        if previous.is_some_and(|previous| previous.poll > poll) {
            debug!(check = %check.name, poll, "discarding outdated health check result");
            return;
        }
        let was_failing = previous.is_some_and(CheckState::is_failed);

        let state = match outcome {
            Ok(details) => {
                if was_failing {
                    info!(check = %check.name, "health check recovered");
                }
                CheckState {
                    status: CheckStatus::Ok,
                    details,
                    error: None,
                    fatal: check.fatal,
                    checked_at: now,
                    contiguous_failures: 0,
                    first_failure_at: None,
                    poll,
                }
            }
            Err(error) => {
                if !was_failing {
                    warn!(
                        check = %check.name,
                        fatal = check.fatal,
                        "health check failed: {}",
                        error
                    );
                }
                metrics::counter!("health_check_failures_total", "check" => check.name.clone())
                    .increment(1);
                CheckState {
                    status: CheckStatus::Failed,
                    details: error.details.unwrap_or_default(),
                    error: Some(error.message),
                    fatal: check.fatal,
                    checked_at: now,
                    contiguous_failures: previous.map_or(0, |p| p.contiguous_failures) + 1,
                    first_failure_at: Some(
                        previous.and_then(|p| p.first_failure_at).unwrap_or(now),
                    ),
                    poll,
                }
            }
        };

        components.insert(check.name.clone(), state);
        let status = HealthStatus::from_states(components.clone());
        drop(components);

        self.status.send_replace(status);
    }
}

/// Tick at the check's interval, the first tick immediately, and spawn one
/// poll per tick until shutdown.
async fn schedule(inner: Arc<Inner>, check: HealthCheck) {
    let mut ticker = tokio::time::interval(check.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = 0;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        poll += 1;
        tokio::spawn(run_check(inner.clone(), check.clone(), poll));
    }
    debug!(check = %check.name, "health check scheduler stopped");
}

async fn run_check(inner: Arc<Inner>, check: HealthCheck, poll: u64) {
    if inner.shutdown.is_cancelled() {
        return;
    }
    let checker = check.checker.clone();
    // Own task, so a panicking check is reported as a failure
    let mut poll_task = tokio::spawn(async move { checker.status().await });

    let result = tokio::select! {
        _ = inner.shutdown.cancelled() => None,
        result = tokio::time::timeout(check.interval, &mut poll_task) => Some(result),
    };

    let outcome = match result {
        None => {
            poll_task.abort();
            return;
        }
        Some(Ok(Ok(outcome))) => outcome,
        Some(Ok(Err(err))) => Err(CheckError::new(format!("health check panicked: {err}"))),
        Some(Err(_)) => {
            poll_task.abort();
            Err(CheckError::new(format!(
                "health check timed out after {:?}",
                check.interval
            )))
        }
    };

    inner.record(&check, poll, outcome);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    /// Replays scripted results, then reports healthy.
    #[derive(Default)]
    struct ScriptedCheck {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<Value, CheckError>>>,
    }

    impl ScriptedCheck {
        fn new(script: Vec<Result<Value, CheckError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
            })
        }

        fn healthy() -> Arc<Self> {
            Self::new(vec![])
        }

        fn failing(message: &str) -> Arc<Self> {
            Self::new(vec![Err(CheckError::new(message)); 100])
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Checkable for ScriptedCheck {
        async fn status(&self) -> Result<Value, CheckError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"status": "ok"})))
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl Checkable for HangingCheck {
        async fn status(&self) -> Result<Value, CheckError> {
            std::future::pending().await
        }
    }

    struct PanickingCheck;

    #[async_trait]
    impl Checkable for PanickingCheck {
        async fn status(&self) -> Result<Value, CheckError> {
            panic!("check exploded")
        }
    }

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<HealthStatus>, check: F) -> HealthStatus
    where
        F: Fn(&HealthStatus) -> bool,
    {
        let wait = async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if check(&status) {
                        return status.clone();
                    }
                }
                rx.changed().await.expect("registry dropped");
            }
        };
        tokio::time::timeout(secs(60), wait)
            .await
            .expect("condition not reached in time")
    }

    fn failed(status: &HealthStatus, name: &str) -> bool {
        status.details.get(name).is_some_and(CheckState::is_failed)
    }

    fn ok(status: &HealthStatus, name: &str) -> bool {
        status
            .details
            .get(name)
            .is_some_and(|state| !state.is_failed())
    }

    #[tokio::test]
    async fn defaults_to_ok_and_empty() {
        let registry = HealthRegistry::new("liveness");
        let status = registry.get_status();

        assert_eq!(status.status, OverallStatus::Ok);
        assert!(status.details.is_empty());
        assert!(!registry.is_started());
    }

    #[tokio::test]
    async fn rejects_invalid_registrations() {
        let registry = HealthRegistry::new("liveness");
        let check = HealthCheck::new("db", ScriptedCheck::healthy(), secs(1));

        registry.add_checks(vec![check.clone()]).unwrap();
        assert_eq!(
            registry.add_checks(vec![check]),
            Err(HealthError::DuplicateCheck("db".to_owned()))
        );
        assert_eq!(
            registry.add_checks(vec![HealthCheck::new(
                "api",
                ScriptedCheck::healthy(),
                Duration::ZERO
            )]),
            Err(HealthError::InvalidInterval("api".to_owned()))
        );

        // A rejected batch leaves nothing behind
        assert_eq!(
            registry.add_checks(vec![
                HealthCheck::new("one", ScriptedCheck::healthy(), secs(1)),
                HealthCheck::new("one", ScriptedCheck::healthy(), secs(1)),
            ]),
            Err(HealthError::DuplicateCheck("one".to_owned()))
        );
        assert_eq!(registry.check_names(), vec!["db".to_owned()]);
    }

    #[tokio::test]
    async fn start_requires_checks() {
        let registry = HealthRegistry::new("liveness");
        assert_eq!(registry.start(), Err(HealthError::NoChecks));
        assert!(!registry.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn checks_are_closed_after_start() {
        let registry = HealthRegistry::new("liveness");
        registry
            .add_checks(vec![HealthCheck::new("db", ScriptedCheck::healthy(), secs(1))])
            .unwrap();
        registry.start().unwrap();

        assert!(registry.is_started());
        assert_eq!(registry.start(), Err(HealthError::AlreadyStarted));
        assert_eq!(
            registry.add_checks(vec![HealthCheck::new(
                "api",
                ScriptedCheck::healthy(),
                secs(1)
            )]),
            Err(HealthError::AlreadyStarted)
        );
        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![
                HealthCheck::new("a", ScriptedCheck::failing("down"), secs(1)).fatal(),
                HealthCheck::new("b", ScriptedCheck::healthy(), secs(1)),
                HealthCheck::new("c", ScriptedCheck::healthy(), secs(1)),
            ])
            .unwrap();
        registry.start().unwrap();

        let status = wait_for(&mut rx, |s| s.details.len() == 3).await;
        assert_eq!(status.status, OverallStatus::Unhealthy);
        assert!(!status.is_healthy());
        assert_eq!(registry.get_status().status, OverallStatus::Unhealthy);
        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn non_fatal_failure_is_degraded() {
        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![
                HealthCheck::new("a", ScriptedCheck::healthy(), secs(1)).fatal(),
                HealthCheck::new("b", ScriptedCheck::failing("slow"), secs(1)),
                HealthCheck::new("c", ScriptedCheck::healthy(), secs(1)),
            ])
            .unwrap();
        registry.start().unwrap();

        let status = wait_for(&mut rx, |s| s.details.len() == 3).await;
        assert_eq!(status.status, OverallStatus::Degraded);
        assert!(status.is_healthy());
        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_check_fails_then_recovers() {
        let db = ScriptedCheck::new(vec![
            Ok(json!({"status": "ok"})),
            Ok(json!({"status": "ok"})),
            Err(CheckError::new("timeout")),
            Ok(json!({"status": "ok"})),
        ]);
        let api = ScriptedCheck::healthy();

        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![
                HealthCheck::new("db", db.clone(), secs(1)).fatal(),
                HealthCheck::new("api", api.clone(), secs(2)),
            ])
            .unwrap();
        registry.start().unwrap();

        let status = wait_for(&mut rx, |s| failed(s, "db")).await;
        assert_eq!(db.calls(), 3);
        assert_eq!(status.status, OverallStatus::Unhealthy);
        assert_eq!(status.details["db"].error.as_deref(), Some("timeout"));
        assert_eq!(status.details["db"].contiguous_failures, 1);
        assert!(ok(&status, "api"));

        let status = wait_for(&mut rx, |s| ok(s, "db")).await;
        assert_eq!(db.calls(), 4);
        assert_eq!(status.status, OverallStatus::Ok);
        assert_eq!(status.details["db"].contiguous_failures, 0);
        assert_eq!(status.details["db"].first_failure_at, None);
        assert!(ok(&status, "api"));

        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_times_out_without_blocking_others() {
        let fast = ScriptedCheck::healthy();
        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![
                HealthCheck::new("slow", Arc::new(HangingCheck), secs(5)),
                HealthCheck::new("fast", fast.clone(), secs(1)),
            ])
            .unwrap();
        registry.start().unwrap();

        // The fast check keeps being polled while the slow one hangs
        wait_for(&mut rx, |_| fast.calls() >= 3).await;
        assert!(!registry.get_status().details.contains_key("slow"));

        let status = wait_for(&mut rx, |s| failed(s, "slow")).await;
        let error = status.details["slow"].error.clone().unwrap();
        assert!(error.contains("timed out"), "unexpected error: {error}");
        assert_eq!(status.status, OverallStatus::Degraded);
        assert!(fast.calls() >= 5);

        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_check_is_recorded_as_failed() {
        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![
                HealthCheck::new("boom", Arc::new(PanickingCheck), secs(1)).fatal(),
            ])
            .unwrap();
        registry.start().unwrap();

        let status = wait_for(&mut rx, |s| failed(s, "boom")).await;
        assert!(status.details["boom"]
            .error
            .as_deref()
            .unwrap()
            .contains("panicked"));
        assert_eq!(status.status, OverallStatus::Unhealthy);

        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_are_counted() {
        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![HealthCheck::new(
                "api",
                ScriptedCheck::failing("refused"),
                secs(1),
            )])
            .unwrap();
        registry.start().unwrap();

        let first = wait_for(&mut rx, |s| failed(s, "api")).await;
        let third = wait_for(&mut rx, |s| {
            s.details
                .get("api")
                .is_some_and(|state| state.contiguous_failures == 3)
        })
        .await;
        assert_eq!(
            first.details["api"].first_failure_at,
            third.details["api"].first_failure_at
        );

        registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cannot_start_once_stopped() {
        let check = ScriptedCheck::healthy();
        let registry = HealthRegistry::new("liveness");
        registry
            .add_checks(vec![HealthCheck::new("db", check.clone(), secs(1)).fatal()])
            .unwrap();

        registry.stop().await;
        assert_eq!(registry.start(), Err(HealthError::Stopped));
        assert!(!registry.is_started());

        tokio::time::sleep(secs(10)).await;
        assert_eq!(check.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_polling() {
        let check = ScriptedCheck::healthy();
        let registry = HealthRegistry::new("liveness");
        let mut rx = registry.subscribe();
        registry
            .add_checks(vec![HealthCheck::new("db", check.clone(), secs(1))])
            .unwrap();
        registry.start().unwrap();

        wait_for(&mut rx, |_| check.calls() >= 2).await;
        registry.stop().await;
        let calls = check.calls();

        tokio::time::sleep(secs(10)).await;
        assert_eq!(check.calls(), calls);
    }

    #[test]
    fn outdated_results_are_discarded() {
        let registry = HealthRegistry::new("liveness");
        let check = HealthCheck::new("db", ScriptedCheck::healthy(), secs(1)).fatal();

        registry.inner.record(&check, 2, Ok(json!({"status": "ok"})));
        registry
            .inner
            .record(&check, 1, Err(CheckError::new("timed out")));

        let status = registry.get_status();
        assert_eq!(status.status, OverallStatus::Ok);
        assert_eq!(status.details["db"].poll, 2);
    }

    #[test]
    fn failure_details_are_kept() {
        let registry = HealthRegistry::new("liveness");
        let check = HealthCheck::new("db", ScriptedCheck::healthy(), secs(1));

        registry.inner.record(
            &check,
            1,
            Err(CheckError::new("refused").with_details(json!({"status": "refused"}))),
        );

        let status = registry.get_status();
        assert_eq!(status.status, OverallStatus::Degraded);
        assert_eq!(status.details["db"].details, json!({"status": "refused"}));
    }
}
