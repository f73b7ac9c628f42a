use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::schema::PolicyDocument;

/// Load one [`PolicyDocument`] from a YAML file on disk.
///
/// Only the document shape is checked here; rule semantics are validated by
/// [`crate::compile`].
pub fn load_policy(path: impl AsRef<Path>) -> Result<PolicyDocument> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    load_policy_from_str(&contents)
        .with_context(|| format!("failed to parse policy file: {}", path.display()))
}

/// Parse a [`PolicyDocument`] from a YAML string.
pub fn load_policy_from_str(yaml: &str) -> Result<PolicyDocument> {
    let doc: PolicyDocument = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    if doc.name.trim().is_empty() {
        bail!("policy name must not be empty");
    }
    Ok(doc)
}

/// Load every `*.yaml` / `*.yml` file in `dir`, in file-name order.
///
/// Two files declaring the same policy name are an error: the second would
/// otherwise silently replace the first.
pub fn load_policy_dir(dir: impl AsRef<Path>) -> Result<Vec<PolicyDocument>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read policy directory: {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list policy directory: {}", dir.display()))?
            .path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = HashSet::new();
    let mut docs = Vec::with_capacity(paths.len());
    for path in paths {
        let doc = load_policy(&path)?;
        if !seen.insert(doc.name.clone()) {
            bail!(
                "duplicate policy name '{}' in {}",
                doc.name,
                path.display()
            );
        }
        tracing::debug!(policy = %doc.name, file = %path.display(), "loaded policy document");
        docs.push(doc);
    }
    Ok(docs)
}
