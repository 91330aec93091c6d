//! Test definitions and the catalog they are registered in

use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use feditest_common::{CapabilitySet, Error, Result, RoleSpec};

use crate::executor::TestContext;
use crate::report::RunStatus;

pub type StepFuture = BoxFuture<'static, Result<()>>;
pub type StepFn = Arc<dyn Fn(TestContext) -> StepFuture + Send + Sync>;

/// One named step of a test body
#[derive(Clone)]
pub struct TestStep {
    pub name: String,
    body: StepFn,
}

impl TestStep {
    pub fn run(&self, ctx: TestContext) -> StepFuture {
        (self.body)(ctx)
    }
}

impl std::fmt::Debug for TestStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStep").field("name", &self.name).finish()
    }
}

/// An immutable test: roles it needs and the steps it runs
#[derive(Debug, Clone)]
pub struct TestDefinition {
    pub name: String,
    /// Owning package, e.g. "fediverse"
    pub package: String,
    pub description: Option<String>,
    pub roles: Vec<RoleSpec>,
    pub steps: Vec<TestStep>,
    /// Known outcome, e.g. a documented failure
    pub expected_status: Option<RunStatus>,
}

impl TestDefinition {
    pub fn builder(package: impl Into<String>, name: impl Into<String>) -> TestDefinitionBuilder {
        TestDefinitionBuilder {
            name: name.into(),
            package: package.into(),
            description: None,
            roles: Vec::new(),
            steps: Vec::new(),
            expected_status: None,
        }
    }

    /// `package::name`, the key used by sessions and filters
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.package, self.name)
    }

    pub fn role(&self, name: &str) -> Option<&RoleSpec> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Single-app tests need exactly one role
    pub fn is_single_app(&self) -> bool {
        self.roles.len() == 1
    }
}

pub struct TestDefinitionBuilder {
    name: String,
    package: String,
    description: Option<String>,
    roles: Vec<RoleSpec>,
    steps: Vec<TestStep>,
    expected_status: Option<RunStatus>,
}

impl TestDefinitionBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn role(mut self, name: impl Into<String>, capabilities: impl Into<CapabilitySet>) -> Self {
        self.roles.push(RoleSpec::new(name, capabilities));
        self
    }

    /// Append a step; steps run in the order they are added
    pub fn step<F, Fut>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let body: StepFn = Arc::new(move |ctx| -> StepFuture { Box::pin(body(ctx)) });
        self.steps.push(TestStep {
            name: name.into(),
            body,
        });
        self
    }

    /// Single-function test
    pub fn body<F, Fut>(self, body: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.step("body", body)
    }

    pub fn expect_status(mut self, status: RunStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn build(self) -> Result<TestDefinition> {
        if self.steps.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "Test {}::{} has no steps",
                self.package, self.name
            )));
        }
        let mut seen = HashSet::new();
        for role in &self.roles {
            if !seen.insert(role.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Test {}::{} declares role {} twice",
                    self.package, self.name, role.name
                )));
            }
        }

        Ok(TestDefinition {
            name: self.name,
            package: self.package,
            description: self.description,
            roles: self.roles,
            steps: self.steps,
            expected_status: self.expected_status,
        })
    }
}

/// Ordered registry of known tests
#[derive(Debug, Default, Clone)]
pub struct TestCatalog {
    tests: Vec<Arc<TestDefinition>>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, test: TestDefinition) -> Result<()> {
        let name = test.qualified_name();
        if self.get(&name).is_some() {
            return Err(Error::InvalidConfig(format!("Duplicate test name: {}", name)));
        }
        self.tests.push(Arc::new(test));
        Ok(())
    }

    pub fn get(&self, qualified_name: &str) -> Option<Arc<TestDefinition>> {
        self.tests
            .iter()
            .find(|t| t.qualified_name() == qualified_name)
            .cloned()
    }

    pub fn tests(&self) -> &[Arc<TestDefinition>] {
        &self.tests
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Tests grouped by package, in registration order within each package
    pub fn packages(&self) -> BTreeMap<String, Vec<Arc<TestDefinition>>> {
        let mut packages: BTreeMap<String, Vec<Arc<TestDefinition>>> = BTreeMap::new();
        for test in &self.tests {
            packages
                .entry(test.package.clone())
                .or_default()
                .push(test.clone());
        }
        packages
    }

    /// Look up tests by qualified name, keeping the requested order; no names means all
    pub fn select(&self, names: &[String]) -> Result<Vec<Arc<TestDefinition>>> {
        if names.is_empty() {
            return Ok(self.tests.clone());
        }
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| Error::InvalidConfig(format!("Unknown test: {}", name)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feditest_common::Capability;

    fn noop(package: &str, name: &str) -> TestDefinition {
        TestDefinition::builder(package, name)
            .role("server", [Capability::CreatePost])
            .body(|_ctx| async { Ok(()) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_validates() {
        assert!(TestDefinition::builder("p", "empty").build().is_err());
        assert!(TestDefinition::builder("p", "twice")
            .role("a", CapabilitySet::new())
            .role("a", CapabilitySet::new())
            .body(|_ctx| async { Ok(()) })
            .build()
            .is_err());

        let test = TestDefinition::builder("p", "steps")
            .role("a", [Capability::Follow])
            .step("one", |_ctx| async { Ok(()) })
            .step("two", |_ctx| async { Ok(()) })
            .expect_status(RunStatus::Failed)
            .build()
            .unwrap();
        let names: Vec<_> = test.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert_eq!(test.qualified_name(), "p::steps");
        assert!(test.is_single_app());
    }

    #[test]
    fn test_catalog() {
        let mut catalog = TestCatalog::new();
        catalog.register(noop("webfinger", "jrd")).unwrap();
        catalog.register(noop("fediverse", "follow")).unwrap();
        catalog.register(noop("webfinger", "aliases")).unwrap();
        assert!(catalog.register(noop("fediverse", "follow")).is_err());

        let packages = catalog.packages();
        let webfinger: Vec<_> = packages["webfinger"].iter().map(|t| t.name.as_str()).collect();
        assert_eq!(webfinger, vec!["jrd", "aliases"]);

        let selected = catalog
            .select(&["fediverse::follow".to_string(), "webfinger::jrd".to_string()])
            .unwrap();
        assert_eq!(selected[0].name, "follow");
        assert_eq!(catalog.select(&[]).unwrap().len(), 3);
        assert!(catalog.select(&["nope::x".to_string()]).is_err());
    }
}
