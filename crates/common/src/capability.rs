//! Capability registry
//!
//! The closed vocabulary of operations a driver may support, and the subset
//! check used to decide whether a driver can fill a role.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::Error;

/// A named operation a driver may or may not support
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "can-provision-account")]
    ProvisionAccount,
    #[serde(rename = "can-create-post")]
    CreatePost,
    #[serde(rename = "can-delete-post")]
    DeletePost,
    #[serde(rename = "can-reply")]
    Reply,
    #[serde(rename = "can-announce")]
    Announce,
    #[serde(rename = "can-follow")]
    Follow,
    #[serde(rename = "can-unfollow")]
    Unfollow,
    #[serde(rename = "can-block")]
    Block,
    #[serde(rename = "can-observe-post")]
    ObservePost,
    #[serde(rename = "can-observe-follow")]
    ObserveFollow,
    #[serde(rename = "can-observe-block")]
    ObserveBlock,
    #[serde(rename = "can-observe-inbox")]
    ObserveInbox,
}

impl Capability {
    pub const ALL: [Capability; 12] = [
        Capability::ProvisionAccount,
        Capability::CreatePost,
        Capability::DeletePost,
        Capability::Reply,
        Capability::Announce,
        Capability::Follow,
        Capability::Unfollow,
        Capability::Block,
        Capability::ObservePost,
        Capability::ObserveFollow,
        Capability::ObserveBlock,
        Capability::ObserveInbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ProvisionAccount => "can-provision-account",
            Capability::CreatePost => "can-create-post",
            Capability::DeletePost => "can-delete-post",
            Capability::Reply => "can-reply",
            Capability::Announce => "can-announce",
            Capability::Follow => "can-follow",
            Capability::Unfollow => "can-unfollow",
            Capability::Block => "can-block",
            Capability::ObservePost => "can-observe-post",
            Capability::ObserveFollow => "can-observe-follow",
            Capability::ObserveBlock => "can-observe-block",
            Capability::ObserveInbox => "can-observe-inbox",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidConfig(format!("Unknown capability: {}", s)))
    }
}

/// An ordered set of capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Capabilities present in both sets
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        self.0.intersection(&other.0).copied().collect()
    }

    /// Capabilities in `required` that this set lacks, in vocabulary order
    pub fn missing(&self, required: &CapabilitySet) -> Vec<Capability> {
        required.0.difference(&self.0).copied().collect()
    }

    /// Parse a list of capability names, rejecting unknown ones
    pub fn parse<I, S>(names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

/// True iff every capability the role demands is offered by the driver
pub fn supports(driver_caps: &CapabilitySet, role_caps: &CapabilitySet) -> bool {
    role_caps.0.is_subset(&driver_caps.0)
}
