use crate::error::{QueryError, Result};

/// Request parameters as an ordered multimap; repeated keys are kept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `application/x-www-form-urlencoded` query string
    pub fn parse(query: &str) -> Result<Self> {
        let query = query.strip_prefix('?').unwrap_or(query);
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query)
            .map_err(|e| QueryError::validation("query", e.to_string()))?;
        Ok(Self { pairs })
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in request order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Distinct keys in first-seen order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (k, _) in &self.pairs {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_repeated_keys() {
        let params =
            QueryParams::parse("?naam[not]=a&naam[not]=b&geldigOp=2020-01-01&ligtInWijk.naam=Centrum")
                .unwrap();
        assert_eq!(params.get_all("naam[not]"), vec!["a", "b"]);
        assert_eq!(params.get("geldigOp"), Some("2020-01-01"));
        assert_eq!(
            params.keys(),
            vec!["naam[not]", "geldigOp", "ligtInWijk.naam"]
        );
    }

    #[test]
    fn test_parse_decodes_values() {
        let params = QueryParams::parse("naam%5Blike%5D=Dam%2A&x=a+b").unwrap();
        assert_eq!(params.get("naam[like]"), Some("Dam*"));
        assert_eq!(params.get("x"), Some("a b"));
    }
}
