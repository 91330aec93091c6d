//! Core types for FediTest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::capability::{Capability, CapabilitySet};
use crate::error::{Error, Result};

/// A named slot within a test, with the capabilities it demands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default)]
    pub capabilities: CapabilitySet,
}

impl RoleSpec {
    pub fn new(name: impl Into<String>, capabilities: impl Into<CapabilitySet>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into(),
        }
    }
}

/// A pre-existing account on a node, as known from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSpec {
    /// acct:, http or https URI identifying the account
    pub uri: String,
    /// Account role the account is reserved for, if any
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub actor_uri: Option<String>,
}

/// Driver parameters for one role binding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<AccountSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_existing_accounts: Vec<AccountSpec>,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_account(mut self, account: AccountSpec) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(|v| v.as_bool())
    }

    pub fn u64_param(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    pub fn root_url(&self) -> Option<&str> {
        self.str_param(param::ROOT_URL)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.str_param(param::HOSTNAME)
    }

    /// Capabilities this binding is restricted to, if configured
    pub fn capability_limit(&self) -> Result<Option<CapabilitySet>> {
        match self.params.get(param::CAPABILITIES) {
            None => Ok(None),
            Some(serde_json::Value::Array(names)) => {
                let names = names
                    .iter()
                    .map(|n| {
                        n.as_str().ok_or_else(|| {
                            Error::InvalidConfig("capabilities must be strings".to_string())
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                CapabilitySet::parse(names).map(Some)
            }
            Some(other) => Err(Error::InvalidConfig(format!(
                "capabilities must be a list, got {}",
                other
            ))),
        }
    }
}

/// Recognized binding parameter names
pub mod param {
    pub const ROOT_URL: &str = "root_url";
    pub const HOSTNAME: &str = "hostname";
    pub const APP: &str = "app";
    pub const APP_VERSION: &str = "app_version";
    pub const ACCOUNT_COUNT: &str = "account_count";
    pub const SEED_PROFILE: &str = "seed_profile";
    pub const CAPABILITIES: &str = "capabilities";
    pub const PROBE: &str = "probe";
}

/// Lifecycle of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Active,
    Deprovisioned,
}

/// One provisioned or addressed participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub role: String,
    pub driver: String,
    pub hostname: String,
    pub root_url: Option<String>,
    pub app: Option<String>,
    pub app_version: Option<String>,
    /// Capabilities available at runtime, possibly narrower than the driver's
    pub capabilities: CapabilitySet,
    #[serde(default)]
    pub accounts: Vec<AccountSpec>,
    #[serde(default)]
    pub non_existing_accounts: Vec<AccountSpec>,
    /// Pre-existing instance that FediTest must never tear down
    pub externally_managed: bool,
    pub state: NodeState,
    pub provisioned_at: DateTime<Utc>,
}

impl NodeInstance {
    pub fn new(role: impl Into<String>, driver: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            driver: driver.into(),
            hostname: hostname.into(),
            root_url: None,
            app: None,
            app_version: None,
            capabilities: CapabilitySet::new(),
            accounts: Vec::new(),
            non_existing_accounts: Vec::new(),
            externally_managed: false,
            state: NodeState::Active,
            provisioned_at: Utc::now(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Copy app metadata and accounts from the binding parameters
    pub fn with_config(mut self, config: &NodeConfig) -> Self {
        self.root_url = config.root_url().map(str::to_string);
        self.app = config.str_param(param::APP).map(str::to_string);
        self.app_version = config.str_param(param::APP_VERSION).map(str::to_string);
        self.accounts = config.accounts.clone();
        self.non_existing_accounts = config.non_existing_accounts.clone();
        self
    }

    pub fn externally_managed(mut self) -> Self {
        self.externally_managed = true;
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Requested shape of a newly provisioned account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    /// Account role within the test, e.g. "sender"
    pub role: Option<String>,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

/// An account usable by test code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountHandle {
    pub role: Option<String>,
    pub uri: String,
    pub actor_uri: Option<String>,
    /// Whether FediTest created it and should remove it again
    pub provisioned: bool,
}

impl From<&AccountSpec> for AccountHandle {
    fn from(spec: &AccountSpec) -> Self {
        Self {
            role: spec.role.clone(),
            uri: spec.uri.clone(),
            actor_uri: spec.actor_uri.clone(),
            provisioned: false,
        }
    }
}

/// Side-effect-free, retriable queries against a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "observe", rename_all = "snake_case")]
pub enum Observation {
    HasPost { post_id: String },
    IsFollowing { follower: String, followee: String },
    IsBlocked { actor: String, by: String },
    InboxContains { actor: String, object_id: String },
}

impl Observation {
    pub fn capability(&self) -> Capability {
        match self {
            Observation::HasPost { .. } => Capability::ObservePost,
            Observation::IsFollowing { .. } => Capability::ObserveFollow,
            Observation::IsBlocked { .. } => Capability::ObserveBlock,
            Observation::InboxContains { .. } => Capability::ObserveInbox,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Observation::HasPost { .. } => "has-post",
            Observation::IsFollowing { .. } => "is-following",
            Observation::IsBlocked { .. } => "is-blocked",
            Observation::InboxContains { .. } => "inbox-contains",
        }
    }
}

/// State-changing operations against a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreatePost {
        author: String,
        content: String,
        #[serde(default)]
        deliver_to: Vec<String>,
    },
    DeletePost { post_id: String },
    Reply { author: String, in_reply_to: String, content: String },
    Announce { actor: String, object_id: String },
    Follow { follower: String, followee: String },
    Unfollow { follower: String, followee: String },
    Block { actor: String, target: String },
}

impl Action {
    pub fn capability(&self) -> Capability {
        match self {
            Action::CreatePost { .. } => Capability::CreatePost,
            Action::DeletePost { .. } => Capability::DeletePost,
            Action::Reply { .. } => Capability::Reply,
            Action::Announce { .. } => Capability::Announce,
            Action::Follow { .. } => Capability::Follow,
            Action::Unfollow { .. } => Capability::Unfollow,
            Action::Block { .. } => Capability::Block,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::CreatePost { .. } => "create-post",
            Action::DeletePost { .. } => "delete-post",
            Action::Reply { .. } => "reply",
            Action::Announce { .. } => "announce",
            Action::Follow { .. } => "follow",
            Action::Unfollow { .. } => "unfollow",
            Action::Block { .. } => "block",
        }
    }
}

/// What a controllability call produced on the external system
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHandle {
    /// URI of the created object, when the action creates one
    pub uri: Option<String>,
}

impl ResultHandle {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
        }
    }
}
