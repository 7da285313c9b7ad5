//! The environment a job's steps run with.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::publisher::JobPublisher;

const SECURE_MASK: &str = "********";
const EMBEDDED_SECURE_MASK: &str = "******";

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
    /// Secure values never appear on the console.
    pub secure: bool,
}

impl EnvironmentVariable {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure: false,
        }
    }

    pub fn secure(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure: true,
        }
    }
}

/// Ordered set of environment variables; later assignments override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    vars: Vec<EnvironmentVariable>,
}

impl EnvironmentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }

    /// Set a variable, returning true if it replaced an existing one.
    pub fn set(&mut self, var: EnvironmentVariable) -> bool {
        match self.vars.iter_mut().find(|v| v.name == var.name) {
            Some(existing) => {
                *existing = var;
                true
            }
            None => {
                self.vars.push(var);
                false
            }
        }
    }

    /// Set a variable and describe the assignment on the console.
    pub fn set_reported(&mut self, var: EnvironmentVariable, publisher: &dyn JobPublisher) {
        let name = var.name.clone();
        let overridden = self.set(var);
        let shown = self.masked_value(&name);
        if overridden {
            publisher.report_action(&format!(
                "overriding environment variable '{}' with value '{}'",
                name, shown
            ));
        } else {
            publisher.report_action(&format!(
                "setting environment variable '{}' to value '{}'",
                name, shown
            ));
        }
    }

    /// Apply every variable of `other` in order, reporting each one.
    pub fn apply_reported(&mut self, other: &EnvironmentContext, publisher: &dyn JobPublisher) {
        for var in &other.vars {
            self.set_reported(var.clone(), publisher);
        }
    }

    /// Value of `name` as it may be shown on the console.
    pub fn masked_value(&self, name: &str) -> String {
        match self.vars.iter().find(|v| v.name == name) {
            Some(var) if var.secure => SECURE_MASK.to_string(),
            Some(var) => self.mask(&var.value),
            None => String::new(),
        }
    }

    /// Replace every secure value occurring in `text`.
    pub fn mask(&self, text: &str) -> String {
        self.secrets().mask(text)
    }

    /// The secure values of this context, detached so step output can be masked.
    pub fn secrets(&self) -> SecretMask {
        let mut values: Vec<String> = self
            .vars
            .iter()
            .filter(|v| v.secure && !v.value.is_empty())
            .map(|v| v.value.clone())
            .collect();
        // Longest first, so a secret containing another is masked whole.
        values.sort_by(|a, b| b.len().cmp(&a.len()));
        values.dedup();
        SecretMask(Arc::new(values))
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.vars
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }
}

/// Secure values that must not reach the console.
#[derive(Debug, Clone, Default)]
pub struct SecretMask(Arc<Vec<String>>);

impl SecretMask {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        self.0
            .iter()
            .fold(text.to_string(), |acc, secret| {
                acc.replace(secret.as_str(), EMBEDDED_SECURE_MASK)
            })
    }
}
