//! Parsing of user supplied feature references of the form `[namespace/]feature[:version]`.
//!
//! The feature part may be qualified with the owning feature view as `view.feature`.

use crate::error::{FeastError, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeatureReference {
    pub namespace: String,
    pub feature_view: Option<String>,
    pub name: String,
    /// `0` means latest.
    pub version: u32,
}

impl FeatureReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            feature_view: None,
            name: name.into(),
            version: 0,
        }
    }

    pub fn with_feature_view(mut self, feature_view: impl Into<String>) -> Self {
        self.feature_view = Some(feature_view.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// `view.feature` when qualified, the bare feature name otherwise.
    pub fn feature_path(&self) -> String {
        match &self.feature_view {
            Some(view) => format!("{}.{}", view, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for FeatureReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.feature_path())?;
        if self.version != 0 {
            write!(f, ":{}", self.version)?;
        }
        Ok(())
    }
}

impl FromStr for FeatureReference {
    type Err = FeastError;

    /// Parses a fully qualified reference; a missing namespace is an error.
    fn from_str(s: &str) -> Result<Self> {
        parse_reference(s, None)
    }
}

fn parse_version(reference: &str, version: &str) -> Result<u32> {
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FeastError::malformed_reference(
            reference,
            format!("version '{}' is not a non-negative integer", version),
        ));
    }
    version.parse::<u32>().map_err(|e| {
        FeastError::malformed_reference(reference, format!("version '{}': {}", version, e))
    })
}

pub fn parse_reference(reference: &str, default_namespace: Option<&str>) -> Result<FeatureReference> {
    if reference.matches('/').count() > 1 {
        return Err(FeastError::malformed_reference(reference, "more than one '/'"));
    }
    let (namespace, feature_path) = match reference.split_once('/') {
        Some((namespace, feature_path)) => {
            if namespace.is_empty() {
                return Err(FeastError::malformed_reference(reference, "empty namespace"));
            }
            (namespace, feature_path)
        }
        None => match default_namespace {
            None => {
                return Err(FeastError::MissingNamespace {
                    reference: reference.to_string(),
                });
            }
            Some("") => {
                return Err(FeastError::malformed_reference(
                    reference,
                    "empty default namespace",
                ));
            }
            Some(namespace) => (namespace, reference),
        },
    };

    if feature_path.matches(':').count() > 1 {
        return Err(FeastError::malformed_reference(reference, "more than one ':'"));
    }
    let (path, version) = match feature_path.split_once(':') {
        Some((path, version)) => (path, parse_version(reference, version)?),
        None => (feature_path, 0),
    };
    if path.is_empty() {
        return Err(FeastError::malformed_reference(reference, "empty feature name"));
    }

    let (feature_view, name) = match path.split_once('.') {
        Some((view, name)) => {
            if view.is_empty() || name.is_empty() {
                return Err(FeastError::malformed_reference(
                    reference,
                    "expected 'view.feature'",
                ));
            }
            (Some(view.to_string()), name)
        }
        None => (None, path),
    };

    Ok(FeatureReference {
        namespace: namespace.to_string(),
        feature_view,
        name: name.to_string(),
        version,
    })
}

/// Parses every reference, preserving input order. The first failure aborts the whole list.
pub fn parse_references<S: AsRef<str>>(
    references: &[S],
    default_namespace: Option<&str>,
) -> Result<Vec<FeatureReference>> {
    references
        .iter()
        .map(|r| parse_reference(r.as_ref(), default_namespace))
        .collect()
}

/// Reference parser bound to the project used as the default namespace.
#[derive(Debug, Clone, Default)]
pub struct FeatureReferenceResolver {
    default_namespace: Option<String>,
}

impl FeatureReferenceResolver {
    pub fn new(default_namespace: Option<String>) -> Self {
        Self { default_namespace }
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.default_namespace.as_deref()
    }

    pub fn parse(&self, reference: &str) -> Result<FeatureReference> {
        parse_reference(reference, self.default_namespace())
    }

    pub fn parse_all<S: AsRef<str>>(&self, references: &[S]) -> Result<Vec<FeatureReference>> {
        parse_references(references, self.default_namespace())
    }
}
