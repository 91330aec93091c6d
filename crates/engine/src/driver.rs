//! App driver abstraction
//!
//! Every participant, automated or operator-driven, is reached through
//! [`AppDriver`]. Optional operations default to [`Error::Unsupported`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use feditest_common::{
    AccountHandle, AccountProfile, Action, CapabilitySet, Error, NodeConfig, NodeInstance,
    Observation, Result, ResultHandle,
};

/// Provisioning, observability and controllability for one external application
#[async_trait]
pub trait AppDriver: Send + Sync {
    /// Registered name, referenced by constellation bindings
    fn name(&self) -> &str;

    /// Everything this driver can do in principle
    fn capabilities(&self) -> CapabilitySet;

    /// Operations block on a human; no automatic timeout applies
    fn interactive(&self) -> bool {
        false
    }

    /// Stand up or address the node for `role`
    async fn provision(&self, role: &str, config: &NodeConfig) -> Result<NodeInstance>;

    /// Tear down a node this driver provisioned
    async fn deprovision(&self, node: &NodeInstance) -> Result<()>;

    async fn provision_account(
        &self,
        node: &NodeInstance,
        _profile: &AccountProfile,
    ) -> Result<AccountHandle> {
        Err(Error::unsupported(
            format!("{} on {}", self.name(), node.hostname),
            "provision-account",
        ))
    }

    async fn deprovision_account(&self, node: &NodeInstance, _account: &AccountHandle) -> Result<()> {
        Err(Error::unsupported(
            format!("{} on {}", self.name(), node.hostname),
            "deprovision-account",
        ))
    }

    /// Side-effect-free query; safe to retry
    async fn observe(&self, node: &NodeInstance, observation: &Observation) -> Result<Value> {
        Err(Error::unsupported(
            format!("{} on {}", self.name(), node.hostname),
            observation.name(),
        ))
    }

    /// State-changing call against the real system
    async fn control(&self, node: &NodeInstance, action: &Action) -> Result<ResultHandle> {
        Err(Error::unsupported(
            format!("{} on {}", self.name(), node.hostname),
            action.name(),
        ))
    }
}

/// Registered drivers, in registration order
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn AppDriver>>,
    fallback: Option<String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn AppDriver>) -> Result<()> {
        if self.get(driver.name()).is_some() {
            return Err(Error::InvalidConfig(format!(
                "Driver already registered: {}",
                driver.name()
            )));
        }
        self.drivers.push(driver);
        Ok(())
    }

    pub fn with_driver(mut self, driver: Arc<dyn AppDriver>) -> Result<Self> {
        self.register(driver)?;
        Ok(self)
    }

    /// Designate the driver used for roles without a binding
    pub fn set_fallback(&mut self, name: &str) -> Result<()> {
        if self.get(name).is_none() {
            return Err(Error::InvalidConfig(format!(
                "Fallback driver is not registered: {}",
                name
            )));
        }
        self.fallback = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AppDriver>> {
        self.drivers.iter().find(|d| d.name() == name).cloned()
    }

    pub fn fallback(&self) -> Option<Arc<dyn AppDriver>> {
        self.fallback.as_deref().and_then(|name| self.get(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .field("fallback", &self.fallback)
            .finish()
    }
}
