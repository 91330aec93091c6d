//! Operator selection of (test, constellation) runs

use regex::Regex;

use feditest_common::{ConstellationConfig, Error, Result};

use crate::test_def::TestDefinition;

/// Which runs to schedule; the default selects everything
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    name: Option<Regex>,
    package: Option<String>,
    role: Option<String>,
    driver: Option<String>,
}

impl RunFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Regex searched in `package::name`
    pub fn with_name_pattern(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::InvalidConfig(format!("Invalid test name pattern: {}", e)))?;
        self.name = Some(regex);
        Ok(self)
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    /// Only tests declaring this role
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Only constellations binding one of the test's roles to this driver
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn is_all(&self) -> bool {
        self.name.is_none() && self.package.is_none() && self.role.is_none() && self.driver.is_none()
    }

    pub fn matches(&self, test: &TestDefinition, constellation: &ConstellationConfig) -> bool {
        if let Some(name) = &self.name {
            if !name.is_match(&test.qualified_name()) {
                return false;
            }
        }
        if let Some(package) = &self.package {
            if &test.package != package {
                return false;
            }
        }
        if let Some(role) = &self.role {
            if test.role(role).is_none() {
                return false;
            }
        }
        if let Some(driver) = &self.driver {
            let binds_driver = test.roles.iter().any(|r| {
                constellation
                    .roles
                    .get(&r.name)
                    .map(|b| &b.driver == driver)
                    .unwrap_or(false)
            });
            if !binds_driver {
                return false;
            }
        }
        true
    }
}
