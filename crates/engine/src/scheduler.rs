//! Test run scheduler
//!
//! Plans (test, constellation) runs in declaration order, provisions each
//! run's nodes, executes the test and tears everything down again. A run
//! that cannot start is recorded as skipped and scheduling continues.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use feditest_common::{
    ConstellationConfig, EngineConfig, Error, Result, SessionConfig,
};
use feditest_listener::Inbox;

use crate::driver::DriverRegistry;
use crate::executor::{self, EventLog, NodeHandle, RunState, TestContext};
use crate::filter::RunFilter;
use crate::report::{
    report_id, EventKind, FailureDetail, NodeSummary, ReportMetadata, RunStatus, TestRunReport,
    TestRunResult,
};
use crate::resolver::{self, ResolvedBinding};
use crate::test_def::{TestCatalog, TestDefinition};

/// Operator-initiated abort of a running session
#[derive(Debug, Clone)]
pub struct AbortHandle(CancellationToken);

impl AbortHandle {
    pub fn abort(&self) {
        warn!("Abort requested");
        self.0.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// One planned run: positions into the test and constellation lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRun {
    pub test: usize,
    pub constellation: usize,
}

pub struct Scheduler {
    config: EngineConfig,
    registry: Arc<DriverRegistry>,
    inbox: Arc<Inbox>,
    abort: CancellationToken,
}

impl Scheduler {
    pub fn new(config: EngineConfig, registry: Arc<DriverRegistry>, inbox: Arc<Inbox>) -> Self {
        Self {
            config,
            registry,
            inbox,
            abort: CancellationToken::new(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.abort.clone())
    }

    /// Selected runs, tests first, then constellations, both in declaration order
    pub fn plan(
        &self,
        tests: &[Arc<TestDefinition>],
        constellations: &[ConstellationConfig],
        filter: &RunFilter,
    ) -> Vec<PlannedRun> {
        let mut planned = Vec::new();
        for (t, test) in tests.iter().enumerate() {
            for (c, constellation) in constellations.iter().enumerate() {
                if filter.matches(test, constellation) {
                    planned.push(PlannedRun {
                        test: t,
                        constellation: c,
                    });
                }
            }
        }
        planned
    }

    /// Run a session file's tests against its constellations
    pub async fn run_session(
        &self,
        catalog: &TestCatalog,
        session: &SessionConfig,
        filter: &RunFilter,
    ) -> Result<TestRunReport> {
        let tests = catalog.select(&session.tests)?;
        let mut report = self.run(&tests, &session.constellations, filter).await;
        report.session = session.name.clone();
        Ok(report)
    }

    pub async fn run(
        &self,
        tests: &[Arc<TestDefinition>],
        constellations: &[ConstellationConfig],
        filter: &RunFilter,
    ) -> TestRunReport {
        let started_at = Utc::now();
        let planned = self.plan(tests, constellations, filter);
        info!(
            "Scheduling {} runs ({} tests x {} constellations)",
            planned.len(),
            tests.len(),
            constellations.len()
        );

        let mut results: Vec<(usize, TestRunResult)> = if self.config.scheduler.parallel {
            let mut groups: BTreeMap<usize, Vec<(usize, PlannedRun)>> = BTreeMap::new();
            for (position, run) in planned.iter().enumerate() {
                groups
                    .entry(run.constellation)
                    .or_default()
                    .push((position, *run));
            }

            stream::iter(groups.into_values())
                .map(|group| async move {
                    let mut done = Vec::with_capacity(group.len());
                    for (position, run) in group {
                        let result = self
                            .run_one(&tests[run.test], &constellations[run.constellation])
                            .await;
                        done.push((position, result));
                    }
                    done
                })
                .buffer_unordered(self.config.scheduler.max_parallel.max(1))
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .flatten()
                .collect()
        } else {
            let mut done = Vec::with_capacity(planned.len());
            for (position, run) in planned.iter().enumerate() {
                let result = self
                    .run_one(&tests[run.test], &constellations[run.constellation])
                    .await;
                done.push((position, result));
            }
            done
        };
        results.sort_by_key(|(position, _)| *position);

        let report = TestRunReport {
            id: report_id(started_at),
            session: None,
            started_at,
            ended_at: Utc::now(),
            metadata: ReportMetadata::collect(),
            runs: results.into_iter().map(|(_, result)| result).collect(),
        };
        let summary = report.summary();
        info!(
            "Session finished: {} passed, {} failed, {} errored, {} skipped",
            summary.passed, summary.failed, summary.errored, summary.skipped
        );
        report
    }

    async fn run_one(&self, test: &TestDefinition, constellation: &ConstellationConfig) -> TestRunResult {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let events = EventLog::default();
        let mut state = RunState::NotStarted;

        let mut result = TestRunResult {
            run_id: run_id.clone(),
            test: test.name.clone(),
            package: test.package.clone(),
            constellation: constellation.name.clone(),
            status: RunStatus::Skipped,
            expected_status: test.expected_status,
            started_at,
            ended_at: started_at,
            nodes: Vec::new(),
            events: Vec::new(),
            failure: None,
        };

        let skipped = |mut result: TestRunResult, state: &mut RunState, err: &Error| {
            if let Err(e) = state.transition(RunState::Skipped) {
                warn!("{}", e);
            }
            result.status = RunStatus::Skipped;
            result.failure = Some(FailureDetail::from_error(err, None));
            result.events = events.snapshot();
            result.ended_at = Utc::now();
            result
        };

        if self.abort.is_cancelled() {
            let err = Error::Skip("session aborted before this run started".to_string());
            return skipped(result, &mut state, &err);
        }

        let resolved = match resolver::resolve(test, constellation, &self.registry) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(test = %test.qualified_name(), constellation = %constellation.name, "Cannot resolve: {}", e);
                return skipped(result, &mut state, &e);
            }
        };

        let run_cancel = self.abort.child_token();
        let mut nodes: BTreeMap<String, NodeHandle> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        for binding in &resolved.bindings {
            match self.provision(binding, &events, &run_cancel).await {
                Ok(node) => {
                    order.push(binding.role.name.clone());
                    result.nodes.push(NodeSummary::from(&node.instance()));
                    nodes.insert(binding.role.name.clone(), node);
                }
                Err(e) => {
                    warn!(role = %binding.role.name, "Provisioning failed: {}", e);
                    self.teardown(&nodes, &order, &events).await;
                    if !run_cancel.is_cancelled() {
                        return skipped(result, &mut state, &e);
                    }

                    // Abort reached an in-flight provision: the run had started
                    for next in [RunState::Running, RunState::Errored] {
                        if let Err(e) = state.transition(next) {
                            warn!("{}", e);
                        }
                    }
                    result.status = RunStatus::Errored;
                    result.failure = Some(FailureDetail::from_error(&e, None));
                    result.events = events.snapshot();
                    result.ended_at = Utc::now();
                    return result;
                }
            }
        }

        let partition = self.inbox.partition(run_id.clone(), run_cancel.clone());
        let ctx = TestContext::new(
            test,
            &constellation.name,
            nodes.clone(),
            partition,
            events.clone(),
            self.config.timeouts.clone(),
        );

        if let Err(e) = state.transition(RunState::Running) {
            warn!("{}", e);
        }
        let execution = executor::execute(test, ctx, self.config.timeouts.run()).await;
        if let Err(e) = state.transition(execution.status.into()) {
            warn!("{}", e);
        }

        self.teardown(&nodes, &order, &events).await;

        result.status = execution.status;
        result.failure = execution.failure;
        result.events = events.snapshot();
        result.ended_at = Utc::now();
        if result.is_unexpected() {
            warn!(
                test = %test.qualified_name(),
                "Expected {:?}, got {}",
                result.expected_status,
                result.status
            );
        }
        result
    }

    async fn provision(
        &self,
        binding: &ResolvedBinding,
        events: &EventLog,
        cancel: &CancellationToken,
    ) -> Result<NodeHandle> {
        let role = binding.role.name.as_str();
        let driver = binding.driver.clone();
        let budget = self.config.timeouts.provision();
        let started = Instant::now();
        info!(role, driver = driver.name(), "Provisioning node");

        let provisioning = async {
            if driver.interactive() {
                driver.provision(role, &binding.node).await
            } else {
                match tokio::time::timeout(budget, driver.provision(role, &binding.node)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!("provision {}", role), budget)),
                }
            }
        };
        let mut instance = tokio::select! {
            result = provisioning => result?,
            _ = cancel.cancelled() => {
                return Err(Error::timeout(
                    format!("provision {} (aborted)", role),
                    started.elapsed(),
                ));
            }
        };

        if let Some(limit) = &binding.capability_limit {
            instance.capabilities = instance.capabilities.intersection(limit);
        }
        events.push(EventKind::Provisioned {
            role: role.to_string(),
            driver: driver.name().to_string(),
            hostname: instance.hostname.clone(),
        });

        Ok(NodeHandle::new(
            instance,
            driver,
            events.clone(),
            self.config.timeouts.clone(),
            cancel.clone(),
        ))
    }

    /// Best-effort teardown in reverse provisioning order; failures are logged and recorded
    async fn teardown(&self, nodes: &BTreeMap<String, NodeHandle>, order: &[String], events: &EventLog) {
        for role in order.iter().rev() {
            let Some(node) = nodes.get(role) else {
                continue;
            };

            for e in node.release_accounts().await {
                warn!(role = %role, "Account cleanup failed: {}", e);
            }

            let outcome = node.deprovision().await;
            if let Err(e) = &outcome {
                warn!(role = %role, "Deprovisioning failed: {}", e);
            } else {
                info!(role = %role, driver = node.driver_name(), "Node deprovisioned");
            }
            events.push(EventKind::Deprovisioned {
                role: role.clone(),
                driver: node.driver_name().to_string(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feditest_common::{BindingConfig, Capability, ListenerConfig};
    use url::Url;

    fn scheduler() -> Scheduler {
        Scheduler::new(
            EngineConfig::default(),
            Arc::new(DriverRegistry::new()),
            Inbox::new(&ListenerConfig::default(), Url::parse("http://127.0.0.1:9").unwrap()),
        )
    }

    fn named(name: &str) -> Arc<TestDefinition> {
        Arc::new(
            TestDefinition::builder("pkg", name)
                .role("server", [Capability::CreatePost])
                .body(|_ctx| async { Ok(()) })
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_plan_order_is_tests_then_constellations() {
        let tests = vec![named("a"), named("b")];
        let constellations = vec![
            ConstellationConfig::new("x").bind("server", BindingConfig::new("one")),
            ConstellationConfig::new("y").bind("server", BindingConfig::new("two")),
        ];

        let planned = scheduler().plan(&tests, &constellations, &RunFilter::all());
        let pairs: Vec<_> = planned.iter().map(|p| (p.test, p.constellation)).collect();
        assert_eq!(pairs, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        let only_two = RunFilter::all().with_driver("two");
        let planned = scheduler().plan(&tests, &constellations, &only_two);
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|p| p.constellation == 1));
    }

    #[tokio::test]
    async fn test_unresolvable_run_is_skipped() {
        let tests = vec![named("a")];
        let constellations = vec![ConstellationConfig::new("empty")];

        let report = scheduler().run(&tests, &constellations, &RunFilter::all()).await;
        assert_eq!(report.runs.len(), 1);
        let run = &report.runs[0];
        assert_eq!(run.status, RunStatus::Skipped);
        let failure = run.failure.as_ref().unwrap();
        assert_eq!(failure.unsatisfied_roles[0].role, "server");
        assert!(run.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_aborted_session_skips_remaining_runs() {
        let scheduler = scheduler();
        scheduler.abort_handle().abort();

        let report = scheduler
            .run(&[named("a")], &[ConstellationConfig::new("x")], &RunFilter::all())
            .await;
        assert_eq!(report.runs[0].status, RunStatus::Skipped);
        assert!(report.runs[0]
            .failure
            .as_ref()
            .unwrap()
            .message
            .contains("aborted"));
    }
}
