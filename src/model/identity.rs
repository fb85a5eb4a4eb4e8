//! Conference identity metadata (RTCP SDES items such as `cname`)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CNAME: &str = "cname";
pub const TOOL: &str = "tool";

/// Key/value identity fields. Updates build a new value; the original is never
/// modified, so a snapshot handed out earlier stays valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    fields: BTreeMap<String, String>,
}

impl Identity {
    /// Defaults every conference starts with.
    pub fn defaults() -> Identity {
        Identity::default()
            .with_value(CNAME, "user@localhost")
            .with_value(TOOL, concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
    }

    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Identity {
        let mut next = self.clone();
        next.fields.insert(key.into(), value.into());
        next
    }

    pub fn with_fields<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> Identity
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut next = self.clone();
        next.fields
            .extend(fields.into_iter().map(|(k, v)| (k.into(), v.into())));
        next
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn cname(&self) -> Option<&str> {
        self.get(CNAME)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
