//! Engine configuration

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};

pub const ENV_DEFAULT_PAGE_SIZE: &str = "DSO_DEFAULT_PAGE_SIZE";
pub const ENV_MAX_PAGE_SIZE: &str = "DSO_MAX_PAGE_SIZE";
pub const ENV_VALID_ON_DIMENSION: &str = "DSO_VALID_ON_DIMENSION";
pub const ENV_MAX_EMBEDDED_IDS: &str = "DSO_MAX_EMBEDDED_IDS";

/// Settings of the query engine.
/// All fields have defaults so partial documents are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Temporal dimension preferred when a request names none
    pub valid_on_dimension: String,
    /// Upper bound of ids fetched in one embedded query; larger sets are batched
    pub max_embedded_ids: usize,
    pub params: ParamNames,
}

/// Names of the reserved request parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParamNames {
    pub page: String,
    pub page_size: String,
    pub sort: String,
    pub expand: String,
    pub expand_scope: String,
    pub format: String,
    pub fields: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 10_000,
            valid_on_dimension: "geldigOp".to_string(),
            max_embedded_ids: 1_000,
            params: ParamNames::default(),
        }
    }
}

impl Default for ParamNames {
    fn default() -> Self {
        Self {
            page: "page".to_string(),
            page_size: "_pageSize".to_string(),
            sort: "_sort".to_string(),
            expand: "_expand".to_string(),
            expand_scope: "_expandScope".to_string(),
            format: "_format".to_string(),
            fields: "_fields".to_string(),
        }
    }
}

impl ParamNames {
    /// Whether `key` is consumed by paging, sorting, expansion or rendering
    pub fn is_reserved(&self, key: &str) -> bool {
        [
            &self.page,
            &self.page_size,
            &self.sort,
            &self.expand,
            &self.expand_scope,
            &self.format,
            &self.fields,
        ]
        .iter()
        .any(|name| name.as_str() == key)
    }
}

impl QueryConfig {
    pub fn from_yaml(document: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `DSO_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup, e.g. the process environment
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEFAULT_PAGE_SIZE) {
            self.default_page_size = parse_size(ENV_DEFAULT_PAGE_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_PAGE_SIZE) {
            self.max_page_size = parse_size(ENV_MAX_PAGE_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_EMBEDDED_IDS) {
            self.max_embedded_ids = parse_size(ENV_MAX_EMBEDDED_IDS, &value)?;
        }
        if let Some(value) = lookup(ENV_VALID_ON_DIMENSION) {
            self.valid_on_dimension = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(QueryError::InvalidConfiguration(
                "page sizes must be at least 1".to_string(),
            ));
        }
        if self.default_page_size > self.max_page_size {
            return Err(QueryError::InvalidConfiguration(format!(
                "default_page_size {} exceeds max_page_size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        if self.max_embedded_ids == 0 {
            return Err(QueryError::InvalidConfiguration(
                "max_embedded_ids must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        QueryError::InvalidConfiguration(format!("{} must be a positive integer, got '{}'", key, value))
    })
}
