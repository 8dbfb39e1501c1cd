//! Interfaces to the collaborators the engine consumes but does not own:
//! open documents, the template syntax tree, and region feature flags.

use std::collections::BTreeSet;
use std::sync::Arc;

use lsp_types::Range;

/// Template encoding of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentType {
    Json,
    Yaml,
}

/// A resolved template document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDocument {
    pub body: String,
    pub doc_type: DocumentType,
}

/// Resolves a document uri to its current template text.
pub trait DocumentStore: Send + Sync {
    fn get(&self, uri: &str) -> Option<TemplateDocument>;
}

/// A parsed template that can map a key path to a source span.
pub trait SyntaxTree: Send + Sync {
    /// Resolve a path such as `["Resources", "Bucket", "Properties"]`.
    fn resolve_path(&self, segments: &[&str]) -> Option<Range>;
}

/// Hands out syntax trees for open documents.
pub trait SyntaxTreeProvider: Send + Sync {
    fn tree(&self, uri: &str) -> Option<Arc<dyn SyntaxTree>>;
}

/// Gates the enhanced-diagnostics fetch per region.
pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, region: &str) -> bool;
}

/// Feature flag enabled for a fixed set of regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionFeatureFlags {
    regions: BTreeSet<String>,
}

impl RegionFeatureFlags {
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            regions: regions.into_iter().map(Into::into).collect(),
        }
    }
}

impl FeatureFlags for RegionFeatureFlags {
    fn is_enabled(&self, region: &str) -> bool {
        self.regions.contains(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_flags_match_exact_region() {
        let flags = RegionFeatureFlags::new(["us-east-1", "eu-west-1"]);
        assert!(flags.is_enabled("us-east-1"));
        assert!(!flags.is_enabled("us-west-2"));
        assert!(!RegionFeatureFlags::default().is_enabled("us-east-1"));
    }
}
