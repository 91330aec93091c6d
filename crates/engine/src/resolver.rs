//! Constellation resolver
//!
//! Binds each role a test declares to a driver. Explicit bindings come from
//! configuration; roles without one fall back to the registry's fallback
//! driver. Every role that cannot be satisfied is reported in one error.

use std::sync::Arc;
use tracing::debug;

use feditest_common::{
    supports, CapabilitySet, ConstellationConfig, Error, NodeConfig, Result, RoleProblem, RoleSpec,
    UnsatisfiedRole,
};

use crate::driver::{AppDriver, DriverRegistry};
use crate::test_def::TestDefinition;

/// A role bound to a driver, ready to provision
#[derive(Clone)]
pub struct ResolvedBinding {
    pub role: RoleSpec,
    pub driver: Arc<dyn AppDriver>,
    pub node: NodeConfig,
    /// Configured narrowing of the driver's capabilities
    pub capability_limit: Option<CapabilitySet>,
    /// Bound through the fallback driver rather than configuration
    pub fallback: bool,
}

impl std::fmt::Debug for ResolvedBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedBinding")
            .field("role", &self.role.name)
            .field("driver", &self.driver.name())
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Bindings for every role of one test, in the test's role order
#[derive(Debug, Clone)]
pub struct ResolvedConstellation {
    pub name: String,
    pub bindings: Vec<ResolvedBinding>,
}

pub fn resolve(
    test: &TestDefinition,
    constellation: &ConstellationConfig,
    registry: &DriverRegistry,
) -> Result<ResolvedConstellation> {
    let mut bindings = Vec::with_capacity(test.roles.len());
    let mut unsatisfied = Vec::new();

    for role in &test.roles {
        let (driver, node, fallback) = match constellation.roles.get(&role.name) {
            Some(binding) => match registry.get(&binding.driver) {
                Some(driver) => (driver, binding.node.clone(), false),
                None => {
                    unsatisfied.push(UnsatisfiedRole {
                        role: role.name.clone(),
                        problem: RoleProblem::UnknownDriver {
                            driver: binding.driver.clone(),
                        },
                    });
                    continue;
                }
            },
            None => match registry.fallback() {
                Some(driver) => (driver, NodeConfig::default(), true),
                None => {
                    unsatisfied.push(UnsatisfiedRole {
                        role: role.name.clone(),
                        problem: RoleProblem::NoBinding,
                    });
                    continue;
                }
            },
        };

        let capability_limit = match node.capability_limit() {
            Ok(limit) => limit,
            Err(e) => {
                let message = match e {
                    Error::InvalidConfig(message) => message,
                    other => other.to_string(),
                };
                unsatisfied.push(UnsatisfiedRole {
                    role: role.name.clone(),
                    problem: RoleProblem::InvalidCapabilities { message },
                });
                continue;
            }
        };
        let offered = match &capability_limit {
            Some(limit) => driver.capabilities().intersection(limit),
            None => driver.capabilities(),
        };
        if !supports(&offered, &role.capabilities) {
            unsatisfied.push(UnsatisfiedRole {
                role: role.name.clone(),
                problem: RoleProblem::MissingCapabilities {
                    driver: driver.name().to_string(),
                    missing: offered
                        .missing(&role.capabilities)
                        .iter()
                        .map(ToString::to_string)
                        .collect(),
                },
            });
            continue;
        }

        debug!(role = %role.name, driver = driver.name(), fallback, "Role bound");
        bindings.push(ResolvedBinding {
            role: role.clone(),
            driver,
            node,
            capability_limit,
            fallback,
        });
    }

    if !unsatisfied.is_empty() {
        return Err(Error::UnsatisfiableRole { roles: unsatisfied });
    }

    Ok(ResolvedConstellation {
        name: constellation.name.clone(),
        bindings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use feditest_common::{param, BindingConfig, Capability, NodeInstance};

    struct Fixed {
        name: &'static str,
        caps: CapabilitySet,
    }

    #[async_trait]
    impl AppDriver for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn capabilities(&self) -> CapabilitySet {
            self.caps.clone()
        }

        async fn provision(&self, role: &str, _config: &NodeConfig) -> Result<NodeInstance> {
            Ok(NodeInstance::new(role, self.name, "fixed.example"))
        }

        async fn deprovision(&self, _node: &NodeInstance) -> Result<()> {
            Ok(())
        }
    }

    fn registry(with_fallback: bool) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry
            .register(Arc::new(Fixed {
                name: "poster",
                caps: CapabilitySet::from([Capability::CreatePost, Capability::Follow]),
            }))
            .unwrap();
        registry
            .register(Arc::new(Fixed {
                name: "everything",
                caps: CapabilitySet::all(),
            }))
            .unwrap();
        if with_fallback {
            registry.set_fallback("everything").unwrap();
        }
        registry
    }

    fn follow_test() -> TestDefinition {
        TestDefinition::builder("fediverse", "block")
            .role("leader", [Capability::CreatePost])
            .role("follower", [Capability::Follow, Capability::ObserveBlock])
            .body(|_ctx| async { Ok(()) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_capability_names_role() {
        let constellation = ConstellationConfig::new("c")
            .bind("leader", BindingConfig::new("poster"))
            .bind("follower", BindingConfig::new("poster"));

        let err = resolve(&follow_test(), &constellation, &registry(true)).unwrap_err();
        match err {
            Error::UnsatisfiableRole { roles } => {
                assert_eq!(roles.len(), 1);
                assert_eq!(roles[0].role, "follower");
                assert_eq!(
                    roles[0].problem,
                    RoleProblem::MissingCapabilities {
                        driver: "poster".to_string(),
                        missing: vec!["can-observe-block".to_string()],
                    }
                );
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_all_unsatisfied_roles_reported() {
        let constellation = ConstellationConfig::new("c")
            .bind("leader", BindingConfig::new("nonexistent"))
            .bind("follower", BindingConfig::new("poster"));

        let err = resolve(&follow_test(), &constellation, &registry(false)).unwrap_err();
        let Error::UnsatisfiableRole { roles } = err else {
            panic!("expected unsatisfiable roles");
        };
        let names: Vec<_> = roles.iter().map(|r| r.role.as_str()).collect();
        assert_eq!(names, vec!["leader", "follower"]);
    }

    #[test]
    fn test_fallback_for_unbound_roles() {
        let constellation =
            ConstellationConfig::new("c").bind("leader", BindingConfig::new("poster"));

        let resolved = resolve(&follow_test(), &constellation, &registry(true)).unwrap();
        assert_eq!(resolved.bindings.len(), 2);
        assert_eq!(resolved.bindings[0].driver.name(), "poster");
        assert!(!resolved.bindings[0].fallback);
        assert_eq!(resolved.bindings[1].driver.name(), "everything");
        assert!(resolved.bindings[1].fallback);

        let err = resolve(&follow_test(), &constellation, &registry(false)).unwrap_err();
        assert!(err.to_string().contains("no binding"));
    }

    #[test]
    fn test_capability_limit_narrows() {
        let limited = BindingConfig::new("everything").with_node(
            NodeConfig::new().with_param(param::CAPABILITIES, serde_json::json!(["can-follow"])),
        );
        let constellation = ConstellationConfig::new("c")
            .bind("leader", BindingConfig::new("poster"))
            .bind("follower", limited);

        let err = resolve(&follow_test(), &constellation, &registry(true)).unwrap_err();
        assert_eq!(err.kind(), feditest_common::ErrorKind::UnsatisfiableRole);
    }

    #[test]
    fn test_invalid_limit_reported_with_other_roles() {
        let teleporting = BindingConfig::new("everything").with_node(
            NodeConfig::new().with_param(param::CAPABILITIES, serde_json::json!(["can-teleport"])),
        );
        let constellation = ConstellationConfig::new("c")
            .bind("leader", teleporting)
            .bind("follower", BindingConfig::new("poster"));

        let Error::UnsatisfiableRole { roles } =
            resolve(&follow_test(), &constellation, &registry(true)).unwrap_err()
        else {
            panic!("expected unsatisfiable roles");
        };
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].role, "leader");
        assert_eq!(
            roles[0].problem,
            RoleProblem::InvalidCapabilities {
                message: "Unknown capability: can-teleport".to_string(),
            }
        );
        assert_eq!(roles[1].role, "follower");
        assert!(matches!(
            roles[1].problem,
            RoleProblem::MissingCapabilities { .. }
        ));
    }
}
