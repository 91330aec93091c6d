//! FediTest Engine
//!
//! Drives interoperability tests: binds each test's roles to app drivers,
//! provisions the constellation, runs the test steps against it and the
//! embedded listener, tears everything down and reports the outcome.

pub mod driver;
pub mod executor;
pub mod filter;
pub mod manual;
pub mod report;
pub mod resolver;
pub mod saas;
pub mod scheduler;
pub mod test_def;

use std::sync::Arc;

pub use driver::{AppDriver, DriverRegistry};
pub use executor::{assert_that, assert_that_at, classify, skip, NodeHandle, RunState, TestContext};
pub use filter::RunFilter;
pub use manual::{ConsolePrompter, ManualDriver, Prompter, ScriptedPrompter, MANUAL_DRIVER};
pub use report::{
    FailureDetail, RunStatus, RunSummary, StepEvent, TestRunReport, TestRunResult,
};
pub use resolver::{resolve, ResolvedBinding, ResolvedConstellation};
pub use saas::{SaasDriver, SAAS_DRIVER};
pub use scheduler::{AbortHandle, PlannedRun, Scheduler};
pub use test_def::{TestCatalog, TestDefinition, TestDefinitionBuilder};

/// Registry with the built-in manual and SaaS drivers; manual is the fallback
pub fn default_registry(
    prompter: Arc<dyn Prompter>,
    max_attempts: u32,
) -> feditest_common::Result<DriverRegistry> {
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(ManualDriver::new(prompter.clone(), max_attempts)))?;
    registry.register(Arc::new(SaasDriver::new(prompter, max_attempts)))?;
    registry.set_fallback(MANUAL_DRIVER)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = default_registry(Arc::new(ScriptedPrompter::new(Vec::<String>::new())), 3).unwrap();
        assert_eq!(registry.names(), vec![MANUAL_DRIVER, SAAS_DRIVER]);
        assert_eq!(registry.fallback().unwrap().name(), MANUAL_DRIVER);
    }
}
