//! Driver for pre-existing, externally managed instances
//!
//! The node already exists and belongs to someone else: it is addressed by
//! its root URL and never torn down. Everything beyond provisioning is
//! delegated to the operator.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use feditest_common::{
    param, uri, AccountHandle, AccountProfile, Action, CapabilitySet, Error, NodeConfig,
    NodeInstance, Observation, Result, ResultHandle,
};

use crate::driver::AppDriver;
use crate::manual::{ManualDriver, Prompter};

pub const SAAS_DRIVER: &str = "saas";

pub struct SaasDriver {
    operator: ManualDriver,
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl SaasDriver {
    pub fn new(prompter: Arc<dyn Prompter>, max_attempts: u32) -> Self {
        Self {
            operator: ManualDriver::named(SAAS_DRIVER, prompter, max_attempts),
            client: reqwest::Client::new(),
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    async fn probe(&self, root_url: &Url) -> Result<()> {
        debug!("Probing {}", root_url);
        let response = self
            .client
            .get(root_url.clone())
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Error::provision(SAAS_DRIVER, format!("{} is not reachable: {}", root_url, e)))?;

        if response.status().is_server_error() {
            return Err(Error::provision(
                SAAS_DRIVER,
                format!("{} answered {}", root_url, response.status()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AppDriver for SaasDriver {
    fn name(&self) -> &str {
        SAAS_DRIVER
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::all()
    }

    fn interactive(&self) -> bool {
        true
    }

    async fn provision(&self, role: &str, config: &NodeConfig) -> Result<NodeInstance> {
        let root = config.root_url().ok_or_else(|| {
            Error::provision(SAAS_DRIVER, format!("role {} needs a root_url", role))
        })?;
        let root_url = uri::http_https_root_uri(root).ok_or_else(|| {
            Error::provision(SAAS_DRIVER, format!("invalid root_url: {}", root))
        })?;
        let hostname = root_url
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| Error::provision(SAAS_DRIVER, format!("root_url has no host: {}", root)))?;

        if config.bool_param(param::PROBE).unwrap_or(false) {
            self.probe(&root_url).await?;
        }

        info!("Using externally managed node {} for role {}", root_url, role);
        Ok(NodeInstance::new(role, SAAS_DRIVER, hostname)
            .with_config(config)
            .with_capabilities(self.capabilities())
            .externally_managed())
    }

    async fn deprovision(&self, node: &NodeInstance) -> Result<()> {
        debug!("Leaving externally managed node {} in place", node.hostname);
        Ok(())
    }

    async fn provision_account(
        &self,
        node: &NodeInstance,
        profile: &AccountProfile,
    ) -> Result<AccountHandle> {
        self.operator.provision_account(node, profile).await
    }

    async fn deprovision_account(&self, node: &NodeInstance, account: &AccountHandle) -> Result<()> {
        self.operator.deprovision_account(node, account).await
    }

    async fn observe(&self, node: &NodeInstance, observation: &Observation) -> Result<Value> {
        self.operator.observe(node, observation).await
    }

    async fn control(&self, node: &NodeInstance, action: &Action) -> Result<ResultHandle> {
        self.operator.control(node, action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manual::ScriptedPrompter;
    use feditest_common::ListenerConfig;
    use feditest_listener::Listener;

    fn saas() -> SaasDriver {
        SaasDriver::new(Arc::new(ScriptedPrompter::default()), 3)
            .with_probe_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_root_url_is_required() {
        let err = saas().provision("leader", &NodeConfig::new()).await.unwrap_err();
        assert!(matches!(err, Error::Provision { .. }));

        let config = NodeConfig::new().with_param(param::ROOT_URL, "https://x.example/some/path");
        let err = saas().provision("leader", &config).await.unwrap_err();
        assert!(matches!(err, Error::Provision { .. }));
    }

    #[tokio::test]
    async fn test_externally_managed() {
        let config = NodeConfig::new()
            .with_param(param::ROOT_URL, "https://social.example")
            .with_param(param::APP, "Mastodon");
        let node = saas().provision("leader", &config).await.unwrap();

        assert!(node.externally_managed);
        assert_eq!(node.hostname, "social.example");
        assert_eq!(node.app.as_deref(), Some("Mastodon"));
        assert!(saas().deprovision(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_reachability_check() {
        let listener = Listener::start(&ListenerConfig::default()).await.unwrap();
        let config = NodeConfig::new()
            .with_param(param::ROOT_URL, listener.base_url().as_str())
            .with_param(param::PROBE, true);
        assert!(saas().provision("leader", &config).await.is_ok());
        listener.shutdown().await.unwrap();

        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);
        let config = NodeConfig::new()
            .with_param(param::ROOT_URL, format!("http://{}", addr))
            .with_param(param::PROBE, true);
        let err = saas().provision("leader", &config).await.unwrap_err();
        assert!(matches!(err, Error::Provision { .. }));
    }
}
