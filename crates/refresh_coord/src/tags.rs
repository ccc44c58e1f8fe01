//! Static mapping from deployment context to the shared-resource tags its
//! refresh workflows must hold.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoordinationError, CoordinationResult};

/// Tag carried by workflows that write to the production search cluster.
pub const PRODUCTION_ES_CONCURRENCY: &str = "production_elasticsearch_concurrency";
/// Tag carried by workflows that write to the staging search cluster.
pub const STAGING_ES_CONCURRENCY: &str = "staging_elasticsearch_concurrency";

/// Immutable `context -> tags` table, built once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTagRegistry {
    contexts: BTreeMap<String, Vec<String>>,
}

impl ResourceTagRegistry {
    /// Builds a registry, dropping duplicate tags within a context.
    pub fn new<I, C, T>(entries: I) -> CoordinationResult<Self>
    where
        I: IntoIterator<Item = (C, Vec<T>)>,
        C: Into<String>,
        T: Into<String>,
    {
        let mut contexts = BTreeMap::new();
        for (context, tags) in entries {
            let context = context.into();
            if context.trim().is_empty() {
                return Err(CoordinationError::Registry("empty context name".into()));
            }
            let mut seen = BTreeSet::new();
            let mut ordered = Vec::new();
            for tag in tags {
                let tag = tag.into();
                if tag.trim().is_empty() {
                    return Err(CoordinationError::Registry(format!(
                        "context `{context}` has an empty tag"
                    )));
                }
                if seen.insert(tag.clone()) {
                    ordered.push(tag);
                }
            }
            if contexts.insert(context.clone(), ordered).is_some() {
                return Err(CoordinationError::Registry(format!(
                    "context `{context}` listed twice"
                )));
            }
        }
        Ok(Self { contexts })
    }

    /// Production and staging search clusters, each with its own tag.
    pub fn elasticsearch() -> Self {
        let contexts = [
            ("production", PRODUCTION_ES_CONCURRENCY),
            ("staging", STAGING_ES_CONCURRENCY),
        ]
        .into_iter()
        .map(|(context, tag)| (context.to_string(), vec![tag.to_string()]))
        .collect();
        Self { contexts }
    }

    /// Parses `{"context": ["tag", ...], ...}`.
    pub fn from_json(raw: &str) -> CoordinationResult<Self> {
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(raw)
            .map_err(|err| CoordinationError::Registry(format!("parse tag registry: {err}")))?;
        Self::new(parsed)
    }

    /// Tags for `context`; unknown contexts hold no tags.
    pub fn tags_for(&self, context: &str) -> &[String] {
        self.contexts
            .get(context)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// True when the two contexts contend for at least one resource.
    pub fn shares_resource(&self, a: &str, b: &str) -> bool {
        let theirs = self.tags_for(b);
        self.tags_for(a).iter().any(|tag| theirs.contains(tag))
    }

    pub fn contexts(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }
}
