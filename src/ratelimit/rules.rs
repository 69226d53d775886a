//! Rate limit rules configuration.
//!
//! This module handles loading the rule set (named classes, route prefixes and
//! dynamic path prefixes) from YAML and turning it into an [`EndpointClassifier`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::class::RateLimitClass;
use super::classifier::{EndpointClassifier, RouteClass};
use crate::error::{BouncerError, Result};

/// A complete rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Name of the class applied when no route matches
    pub default_class: String,
    /// Prefixes followed by a dynamic segment (e.g. a username)
    #[serde(default)]
    pub dynamic_prefixes: Vec<String>,
    /// All declared classes
    #[serde(default)]
    pub classes: Vec<RateLimitClass>,
    /// Route prefixes, in declaration order
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// Binding of a path prefix to a named class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix to match
    pub prefix: String,
    /// Name of a class declared in `classes`
    pub class: String,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            default_class: "default".to_string(),
            dynamic_prefixes: vec!["/api/v1/".to_string()],
            classes: vec![
                RateLimitClass::new("default", 100, 60),
                RateLimitClass::new("login", 12, 300),
                RateLimitClass::new("email", 5, 3600),
                RateLimitClass::new("appearance", 30, 300),
                RateLimitClass::new("links", 60, 60),
            ],
            routes: vec![
                RouteRule {
                    prefix: "/api/appearance".to_string(),
                    class: "appearance".to_string(),
                },
                RouteRule {
                    prefix: "/api/v1/links".to_string(),
                    class: "links".to_string(),
                },
            ],
        }
    }
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string. The result is validated.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RulesConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BouncerError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check that classes are well formed and every reference resolves.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for class in &self.classes {
            class.validate()?;
            if !names.insert(class.name.as_str()) {
                return Err(BouncerError::Config(format!(
                    "class '{}' is declared more than once",
                    class.name
                )));
            }
        }

        if !names.contains(self.default_class.as_str()) {
            return Err(BouncerError::Config(format!(
                "default class '{}' is not declared",
                self.default_class
            )));
        }

        for route in &self.routes {
            if route.prefix.is_empty() {
                return Err(BouncerError::Config("route prefix is empty".to_string()));
            }
            if !names.contains(route.class.as_str()) {
                return Err(BouncerError::Config(format!(
                    "route '{}' refers to undeclared class '{}'",
                    route.prefix, route.class
                )));
            }
        }

        if self.dynamic_prefixes.iter().any(|p| p.is_empty()) {
            return Err(BouncerError::Config("dynamic prefix is empty".to_string()));
        }

        Ok(())
    }

    /// Get a declared class by name.
    pub fn class(&self, name: &str) -> Option<&RateLimitClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Build the classifier for this rule set.
    pub fn into_classifier(self) -> Result<EndpointClassifier> {
        self.validate()?;

        let default = self
            .class(&self.default_class)
            .cloned()
            .ok_or_else(|| BouncerError::Config("default class is not declared".to_string()))?;

        let routes = self
            .routes
            .iter()
            .map(|r| {
                self.class(&r.class)
                    .cloned()
                    .map(|class| RouteClass {
                        prefix: r.prefix.clone(),
                        class,
                    })
                    .ok_or_else(|| {
                        BouncerError::Config(format!("undeclared class '{}'", r.class))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EndpointClassifier::new(default, routes, self.dynamic_prefixes)
            .with_named_classes(self.classes))
    }
}
