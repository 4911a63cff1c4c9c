//! Authorization scopes and access evaluation.
//!
//! A schema element declares the scopes that grant access to it; a caller
//! holds a [`FilterScope`]. Holding any one of the declared scopes is
//! sufficient. Evaluation is three-state so that "nothing declared" is an
//! explicit outcome instead of the truthiness of an empty set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Scopes granted to the caller of the current request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterScope {
    granted: BTreeSet<String>,
}

impl FilterScope {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted: scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// Caller without any granted scope
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn has(&self, scope: &str) -> bool {
        self.granted.contains(scope)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.granted.iter().map(String::as_str)
    }
}

/// Outcome of checking a requirement against a caller's scopes
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Access {
    /// The element declares no scope
    NotRequired,
    /// A declared scope is held by the caller
    Granted,
    /// Scopes are declared and none is held
    Denied,
}

impl Access {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Access::Denied)
    }
}

/// Scopes declared on a dataset, table or field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeRequirement {
    any_of: BTreeSet<String>,
}

impl ScopeRequirement {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn any_of<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            any_of: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_required(&self) -> bool {
        !self.any_of.is_empty()
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.any_of.iter().map(String::as_str)
    }

    pub fn evaluate(&self, scope: &FilterScope) -> Access {
        if self.any_of.is_empty() {
            Access::NotRequired
        } else if self.any_of.iter().any(|s| scope.has(s)) {
            Access::Granted
        } else {
            Access::Denied
        }
    }
}

impl fmt::Display for ScopeRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any_of.is_empty() {
            write!(f, "<none>")
        } else {
            let list: Vec<&str> = self.scopes().collect();
            write!(f, "{}", list.join(" | "))
        }
    }
}
