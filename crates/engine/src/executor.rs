//! Test step executor
//!
//! Runs one test's steps against a provisioned constellation and turns
//! whatever happens into a [`RunStatus`]. Each step runs in its own task so
//! a panicking body is contained and recorded as errored.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use feditest_common::config::TimeoutConfig;
use feditest_common::{
    AccountHandle, AccountProfile, AccountSpec, Action, AssertionFailure, Capability, Error,
    InteropLevel, NodeInstance, NodeState, Observation, Result, ResultHandle, SpecLevel,
};
use feditest_listener::{ExpectationHandle, InboundMessage, Matcher, RunPartition, TestIdentity};

use crate::driver::AppDriver;
use crate::report::{EventKind, FailureDetail, RunStatus, StepEvent};
use crate::test_def::{TestDefinition, TestStep};

/// Fail with an [`AssertionFailure`] unless `condition` holds
pub fn assert_that(condition: bool, message: impl Into<String>) -> Result<()> {
    assert_that_at(condition, message, SpecLevel::default(), InteropLevel::default())
}

/// Like [`assert_that`], classifying the violation
pub fn assert_that_at(
    condition: bool,
    message: impl Into<String>,
    spec_level: SpecLevel,
    interop_level: InteropLevel,
) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(AssertionFailure::new(message)
            .with_levels(spec_level, interop_level)
            .into())
    }
}

/// End the run as skipped
pub fn skip(reason: impl Into<String>) -> Result<()> {
    Err(Error::Skip(reason.into()))
}

/// Run status a body error maps to
pub fn classify(err: &Error) -> RunStatus {
    match err {
        Error::Assertion(_) => RunStatus::Failed,
        Error::Skip(_) | Error::Unsupported { .. } => RunStatus::Skipped,
        _ => RunStatus::Errored,
    }
}

/// Per-run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        self.status().is_some()
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self {
            RunState::Passed => Some(RunStatus::Passed),
            RunState::Failed => Some(RunStatus::Failed),
            RunState::Errored => Some(RunStatus::Errored),
            RunState::Skipped => Some(RunStatus::Skipped),
            RunState::NotStarted | RunState::Running => None,
        }
    }

    /// Move to `to`; skipping is the only way out of `NotStarted` besides running
    pub fn transition(&mut self, to: RunState) -> Result<()> {
        let allowed = match (*self, to) {
            (RunState::NotStarted, RunState::Running) => true,
            (RunState::NotStarted, RunState::Skipped) => true,
            (RunState::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidStateTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", to),
            });
        }
        *self = to;
        Ok(())
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Passed => RunState::Passed,
            RunStatus::Failed => RunState::Failed,
            RunStatus::Errored => RunState::Errored,
            RunStatus::Skipped => RunState::Skipped,
        }
    }
}

/// Ordered event log of one run
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<StepEvent>>>);

impl EventLog {
    pub fn push(&self, kind: EventKind) {
        self.0.lock().push(StepEvent {
            at: Utc::now(),
            kind,
        });
    }

    pub fn snapshot(&self) -> Vec<StepEvent> {
        self.0.lock().clone()
    }
}

#[derive(Debug, Default)]
struct AccountPool {
    configured: Vec<AccountSpec>,
    non_existing: Vec<AccountSpec>,
    assigned: BTreeMap<String, AccountHandle>,
    assigned_non_existing: BTreeMap<String, AccountHandle>,
    used: BTreeSet<String>,
    provisioned: Vec<AccountHandle>,
}

impl AccountPool {
    fn take(specs: &[AccountSpec], used: &BTreeSet<String>, role: &str) -> Option<AccountHandle> {
        specs
            .iter()
            .find(|s| s.role.as_deref() == Some(role) && !used.contains(&s.uri))
            .or_else(|| specs.iter().find(|s| s.role.is_none() && !used.contains(&s.uri)))
            .map(|spec| {
                let mut handle = AccountHandle::from(spec);
                handle.role = Some(role.to_string());
                handle
            })
    }
}

/// Test code's handle on one role's node
#[derive(Clone)]
pub struct NodeHandle {
    role: String,
    instance: Arc<Mutex<NodeInstance>>,
    driver: Arc<dyn AppDriver>,
    accounts: Arc<tokio::sync::Mutex<AccountPool>>,
    events: EventLog,
    timeouts: TimeoutConfig,
    cancel: CancellationToken,
}

impl NodeHandle {
    pub(crate) fn new(
        instance: NodeInstance,
        driver: Arc<dyn AppDriver>,
        events: EventLog,
        timeouts: TimeoutConfig,
        cancel: CancellationToken,
    ) -> Self {
        let accounts = AccountPool {
            configured: instance.accounts.clone(),
            non_existing: instance.non_existing_accounts.clone(),
            ..AccountPool::default()
        };
        Self {
            role: instance.role.clone(),
            instance: Arc::new(Mutex::new(instance)),
            driver,
            accounts: Arc::new(tokio::sync::Mutex::new(accounts)),
            events,
            timeouts,
            cancel,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Snapshot of the node
    pub fn instance(&self) -> NodeInstance {
        self.instance.lock().clone()
    }

    pub fn hostname(&self) -> String {
        self.instance.lock().hostname.clone()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.instance.lock().supports(capability)
    }

    async fn call<T, F>(
        &self,
        operation: &str,
        capability: Option<Capability>,
        cancellable: bool,
        budget: Duration,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        if let Some(capability) = capability {
            if !self.supports(capability) {
                return Err(Error::unsupported(
                    format!("{} on {}", self.driver.name(), self.hostname()),
                    operation,
                ));
            }
        }

        let started = Instant::now();
        debug!(role = %self.role, driver = self.driver.name(), operation, "Driver call");

        let bounded = async {
            if self.driver.interactive() {
                call.await
            } else {
                match tokio::time::timeout(budget, call).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(operation, budget)),
                }
            }
        };
        let result = if cancellable {
            tokio::select! {
                result = bounded => result,
                _ = self.cancel.cancelled() => Err(Error::timeout(
                    format!("{} (aborted)", operation),
                    started.elapsed(),
                )),
            }
        } else {
            bounded.await
        };

        self.events.push(EventKind::DriverCall {
            role: self.role.clone(),
            driver: self.driver.name().to_string(),
            operation: operation.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Run an observation; side-effect-free and safe to poll
    pub async fn observe(&self, observation: Observation) -> Result<Value> {
        let instance = self.instance();
        self.call(
            observation.name(),
            Some(observation.capability()),
            true,
            self.timeouts.operation(),
            self.driver.observe(&instance, &observation),
        )
        .await
    }

    /// Run an action against the real system
    pub async fn control(&self, action: Action) -> Result<ResultHandle> {
        let instance = self.instance();
        self.call(
            action.name(),
            Some(action.capability()),
            true,
            self.timeouts.operation(),
            self.driver.control(&instance, &action),
        )
        .await
    }

    async fn observe_bool(&self, observation: Observation) -> Result<bool> {
        let operation = observation.name();
        match self.observe(observation).await? {
            Value::Bool(b) => Ok(b),
            other => Err(Error::action(
                operation,
                format!("expected a boolean observation, got {}", other),
            )),
        }
    }

    pub async fn create_post(
        &self,
        author: &AccountHandle,
        content: &str,
        deliver_to: Vec<String>,
    ) -> Result<ResultHandle> {
        self.control(Action::CreatePost {
            author: author.uri.clone(),
            content: content.to_string(),
            deliver_to,
        })
        .await
    }

    pub async fn delete_post(&self, post_id: &str) -> Result<()> {
        self.control(Action::DeletePost {
            post_id: post_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn follow(&self, follower: &AccountHandle, followee: &str) -> Result<()> {
        self.control(Action::Follow {
            follower: follower.uri.clone(),
            followee: followee.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn block(&self, actor: &AccountHandle, target: &str) -> Result<()> {
        self.control(Action::Block {
            actor: actor.uri.clone(),
            target: target.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn has_post(&self, post_id: &str) -> Result<bool> {
        self.observe_bool(Observation::HasPost {
            post_id: post_id.to_string(),
        })
        .await
    }

    pub async fn is_following(&self, follower: &str, followee: &str) -> Result<bool> {
        self.observe_bool(Observation::IsFollowing {
            follower: follower.to_string(),
            followee: followee.to_string(),
        })
        .await
    }

    pub async fn is_blocked(&self, actor: &str, by: &str) -> Result<bool> {
        self.observe_bool(Observation::IsBlocked {
            actor: actor.to_string(),
            by: by.to_string(),
        })
        .await
    }

    /// The account for an account role; the same role always gets the same account
    pub async fn account(&self, role: &str) -> Result<AccountHandle> {
        let mut pool = self.accounts.lock().await;
        if let Some(account) = pool.assigned.get(role) {
            return Ok(account.clone());
        }

        let account = match AccountPool::take(&pool.configured, &pool.used, role) {
            Some(account) => account,
            None => {
                let profile = AccountProfile {
                    role: Some(role.to_string()),
                    ..AccountProfile::default()
                };
                let instance = self.instance();
                self.call(
                    "provision-account",
                    Some(Capability::ProvisionAccount),
                    true,
                    self.timeouts.provision(),
                    self.driver.provision_account(&instance, &profile),
                )
                .await?
            }
        };

        pool.used.insert(account.uri.clone());
        if account.provisioned {
            pool.provisioned.push(account.clone());
        }
        pool.assigned.insert(role.to_string(), account.clone());
        Ok(account)
    }

    /// An account known not to exist on this node
    pub async fn non_existing_account(&self, role: &str) -> Result<AccountHandle> {
        let mut pool = self.accounts.lock().await;
        if let Some(account) = pool.assigned_non_existing.get(role) {
            return Ok(account.clone());
        }
        let account = AccountPool::take(&pool.non_existing, &pool.used, role).ok_or_else(|| {
            Error::unsupported(
                format!("{} on {}", self.driver.name(), self.hostname()),
                "non-existing-account",
            )
        })?;
        pool.used.insert(account.uri.clone());
        pool.assigned_non_existing
            .insert(role.to_string(), account.clone());
        Ok(account)
    }

    /// Remove accounts the driver created for this run
    pub(crate) async fn release_accounts(&self) -> Vec<Error> {
        let provisioned = std::mem::take(&mut self.accounts.lock().await.provisioned);
        let instance = self.instance();
        let mut errors = Vec::new();
        for account in provisioned.iter().rev() {
            let released = self
                .call(
                    "deprovision-account",
                    None,
                    false,
                    self.timeouts.provision(),
                    self.driver.deprovision_account(&instance, account),
                )
                .await;
            if let Err(e) = released {
                errors.push(e);
            }
        }
        errors
    }

    /// Tear the node down; a second call is a no-op
    pub async fn deprovision(&self) -> Result<()> {
        let instance = {
            let instance = self.instance.lock();
            if instance.state == NodeState::Deprovisioned {
                return Ok(());
            }
            instance.clone()
        };

        if !instance.externally_managed {
            self.call(
                "deprovision",
                None,
                false,
                self.timeouts.provision(),
                self.driver.deprovision(&instance),
            )
            .await?;
        }

        self.instance.lock().state = NodeState::Deprovisioned;
        Ok(())
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("role", &self.role)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Everything a test step can reach
#[derive(Clone)]
pub struct TestContext {
    run_id: String,
    test: String,
    constellation: String,
    nodes: Arc<BTreeMap<String, NodeHandle>>,
    partition: Arc<RunPartition>,
    events: EventLog,
    scratch: Arc<Mutex<HashMap<String, Value>>>,
    timeouts: TimeoutConfig,
}

impl TestContext {
    pub(crate) fn new(
        test: &TestDefinition,
        constellation: &str,
        nodes: BTreeMap<String, NodeHandle>,
        partition: RunPartition,
        events: EventLog,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            run_id: partition.run_id().to_string(),
            test: test.qualified_name(),
            constellation: constellation.to_string(),
            nodes: Arc::new(nodes),
            partition: Arc::new(partition),
            events,
            scratch: Arc::new(Mutex::new(HashMap::new())),
            timeouts,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn test_name(&self) -> &str {
        &self.test
    }

    pub fn constellation(&self) -> &str {
        &self.constellation
    }

    /// The node bound to `role`
    pub fn node(&self, role: &str) -> Result<NodeHandle> {
        self.nodes.get(role).cloned().ok_or_else(|| {
            Error::Other(anyhow::anyhow!("test has no role named {}", role))
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.values()
    }

    /// This run's partition of the embedded listener
    pub fn listener(&self) -> &RunPartition {
        &self.partition
    }

    /// New identity served by the embedded listener for this run
    pub fn create_identity(&self, label: &str) -> TestIdentity {
        self.partition.create_identity(label)
    }

    /// Register an expectation with the default await budget
    pub fn expect(&self, recipient: &TestIdentity, matcher: Matcher) -> Result<ExpectationHandle> {
        self.partition
            .register_expectation(&recipient.name, matcher, self.timeouts.await_inbound())
    }

    pub async fn await_message(&self, handle: ExpectationHandle) -> Result<InboundMessage> {
        let recipient = handle.recipient().to_string();
        let matcher = handle.description().to_string();
        let started = Instant::now();

        let result = self.partition.await_message(handle).await;
        self.events.push(EventKind::InboundAwaited {
            recipient,
            matcher,
            duration_ms: started.elapsed().as_millis() as u64,
            matched: result.is_ok(),
        });
        result
    }

    /// Register and wait in one call
    pub async fn receive(&self, recipient: &TestIdentity, matcher: Matcher) -> Result<InboundMessage> {
        let handle = self.expect(recipient, matcher)?;
        self.await_message(handle).await
    }

    pub async fn receive_within(
        &self,
        recipient: &TestIdentity,
        matcher: Matcher,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        let handle = self
            .partition
            .register_expectation(&recipient.name, matcher, timeout)?;
        self.await_message(handle).await
    }

    /// Store a value for later steps of this run
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.scratch.lock().insert(key.to_string(), value);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = self.scratch.lock().get(key).cloned();
        match value {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub fn assert_that(&self, condition: bool, message: impl Into<String>) -> Result<()> {
        self.assert_that_at(condition, message, SpecLevel::default(), InteropLevel::default())
    }

    pub fn assert_that_at(
        &self,
        condition: bool,
        message: impl Into<String>,
        spec_level: SpecLevel,
        interop_level: InteropLevel,
    ) -> Result<()> {
        let message = message.into();
        self.events.push(EventKind::Assertion {
            message: message.clone(),
            passed: condition,
            spec_level,
            interop_level,
        });
        assert_that_at(condition, message, spec_level, interop_level)
    }

    pub fn skip(&self, reason: impl Into<String>) -> Result<()> {
        skip(reason)
    }
}

/// Status and failure of one executed test
#[derive(Debug)]
pub struct Execution {
    pub status: RunStatus,
    pub failure: Option<FailureDetail>,
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_step(step: &TestStep, ctx: TestContext, deadline: Option<(Instant, Duration)>) -> Result<()> {
    let mut task = tokio::spawn(step.run(ctx));

    let joined = match deadline {
        Some((at, budget)) => match tokio::time::timeout_at(at, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(Error::timeout(format!("run budget at step {}", step.name), budget));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::Other(anyhow::anyhow!(
            "step {} panicked: {}",
            step.name,
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(Error::Other(anyhow::anyhow!("step {} did not complete: {}", step.name, e))),
    }
}

/// Run every step in order; the first step that does not pass ends the run
pub async fn execute(test: &TestDefinition, ctx: TestContext, run_budget: Option<Duration>) -> Execution {
    let mut state = RunState::NotStarted;
    if let Err(e) = state.transition(RunState::Running) {
        return Execution {
            status: RunStatus::Errored,
            failure: Some(FailureDetail::from_error(&e, None)),
        };
    }
    info!(run_id = %ctx.run_id, test = %ctx.test, constellation = %ctx.constellation, "Running test");

    let run_started = Instant::now();
    let deadline = run_budget.map(|budget| (run_started + budget, budget));
    let mut outcome = Execution {
        status: RunStatus::Passed,
        failure: None,
    };

    for step in &test.steps {
        ctx.events.push(EventKind::StepStarted {
            step: step.name.clone(),
        });
        let started = Instant::now();
        let result = run_step(step, ctx.clone(), deadline).await;
        let status = match &result {
            Ok(()) => RunStatus::Passed,
            Err(e) => classify(e),
        };
        ctx.events.push(EventKind::StepFinished {
            step: step.name.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            status,
        });

        if let Err(err) = result {
            debug!(step = %step.name, error = %err, "Step did not pass");
            outcome = Execution {
                status,
                failure: Some(FailureDetail::from_error(&err, Some(&step.name))),
            };
            break;
        }
    }

    // A step that swallowed the abort still ran against an aborted run
    if outcome.status == RunStatus::Passed && ctx.partition.is_aborted() {
        let err = Error::timeout(format!("run {} (aborted)", ctx.run_id), run_started.elapsed());
        outcome = Execution {
            status: RunStatus::Errored,
            failure: Some(FailureDetail::from_error(&err, None)),
        };
    }

    if let Err(e) = state.transition(outcome.status.into()) {
        return Execution {
            status: RunStatus::Errored,
            failure: Some(FailureDetail::from_error(&e, None)),
        };
    }
    info!(run_id = %ctx.run_id, status = %outcome.status, "Test finished");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Error::from(AssertionFailure::new("x")) => RunStatus::Failed ; "assertion")]
    #[test_case(Error::Skip("later".to_string()) => RunStatus::Skipped ; "skip")]
    #[test_case(Error::unsupported("d", "block") => RunStatus::Skipped ; "unsupported")]
    #[test_case(Error::action("follow", "HTTP 500") => RunStatus::Errored ; "action")]
    #[test_case(Error::timeout("await", Duration::from_secs(1)) => RunStatus::Errored ; "timeout")]
    #[test_case(Error::Protocol("bad".to_string()) => RunStatus::Errored ; "protocol")]
    fn test_classify(err: Error) -> RunStatus {
        classify(&err)
    }

    #[test]
    fn test_state_machine() {
        let mut state = RunState::NotStarted;
        assert!(state.transition(RunState::Passed).is_err());
        state.transition(RunState::Running).unwrap();
        state.transition(RunState::Failed).unwrap();
        assert!(state.is_terminal());
        assert!(state.transition(RunState::Running).is_err());

        let mut skipped = RunState::NotStarted;
        skipped.transition(RunState::Skipped).unwrap();
        assert_eq!(skipped.status(), Some(RunStatus::Skipped));
    }

    #[test]
    fn test_assertion_helpers() {
        assert!(assert_that(true, "fine").is_ok());
        let err = assert_that_at(false, "must follow", SpecLevel::Must, InteropLevel::Problem)
            .unwrap_err();
        let failure = err.assertion().unwrap();
        assert_eq!(failure.spec_level, SpecLevel::Must);
        assert_eq!(failure.interop_level, InteropLevel::Problem);
        assert!(matches!(skip("no"), Err(Error::Skip(_))));
    }

    #[test]
    fn test_account_pool_prefers_role_match() {
        let specs = vec![
            AccountSpec {
                uri: "acct:any@x".to_string(),
                role: None,
                actor_uri: None,
            },
            AccountSpec {
                uri: "acct:sender@x".to_string(),
                role: Some("sender".to_string()),
                actor_uri: None,
            },
        ];
        let mut used = BTreeSet::new();
        let sender = AccountPool::take(&specs, &used, "sender").unwrap();
        assert_eq!(sender.uri, "acct:sender@x");
        used.insert(sender.uri);

        let other = AccountPool::take(&specs, &used, "receiver").unwrap();
        assert_eq!(other.uri, "acct:any@x");
        assert_eq!(other.role.as_deref(), Some("receiver"));
        used.insert(other.uri);
        assert!(AccountPool::take(&specs, &used, "third").is_none());
    }
}
