//! Build report model.
//!
//! The builder writes a JSON object keyed by package name:
//!
//! ```json
//! { "glog": { "url": "https://...", "success": true, "message": "Built successfully" } }
//! ```
//!
//! Entry order follows the document. Unknown fields (such as `url`) are ignored.

use serde::{Deserialize, Serialize};

/// Outcome of one package in a build report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    /// `None` when the report omitted the field.
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PackageResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            success: Some(true),
            detail: Some(detail.into()),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            detail: Some(detail.into()),
        }
    }

    /// Only an explicit `true` counts as passed.
    pub fn passed(&self) -> bool {
        self.success == Some(true)
    }
}

/// Per-package results of one build, in report order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    entries: Vec<(String, PackageResult)>,
}

impl BuildReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON document written by the builder.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut report = Self::new();
        for (name, value) in map {
            let result: PackageResult = serde_json::from_value(value)?;
            report.insert(name, result);
        }
        Ok(report)
    }

    /// Render as a JSON object in entry order.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        let mut map = serde_json::Map::new();
        for (name, result) in &self.entries {
            map.insert(name.clone(), serde_json::to_value(result)?);
        }
        serde_json::to_string_pretty(&serde_json::Value::Object(map))
    }

    /// Insert or replace a package result. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, result: PackageResult) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = result,
            None => self.entries.push((name, result)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PackageResult> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PackageResult)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, PackageResult)> for BuildReport {
    fn from_iter<I: IntoIterator<Item = (S, PackageResult)>>(iter: I) -> Self {
        let mut report = Self::new();
        for (name, result) in iter {
            report.insert(name, result);
        }
        report
    }
}
