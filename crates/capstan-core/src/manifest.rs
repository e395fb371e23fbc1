//! Manifest stream handling
//!
//! A rendered chart arrives as one UTF-8 YAML stream with documents
//! separated by `---` at line start. Each document must decode to a mapping
//! carrying `apiVersion` and `kind`; everything else, including fields this
//! engine knows nothing about, is preserved as-is.

use crate::error::{CoreError, Result};

/// Split a YAML stream into its documents
///
/// Splits only on separator lines (`---` at line start), never on `---`
/// embedded in a value. Empty and comment-only documents are dropped.
pub fn split_manifests(stream: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();

    for line in stream.lines() {
        if is_document_separator(line) {
            push_document(&mut documents, &current);
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    push_document(&mut documents, &current);

    documents
}

/// Decode one manifest document, checking the fields every resource must have
///
/// Returns the decoded value with unknown fields intact.
pub fn parse_document(document: &str) -> Result<serde_yaml::Value> {
    let value: serde_yaml::Value = serde_yaml::from_str(document)
        .map_err(|err| CoreError::ManifestMalformed(format!("decode document: {}", err)))?;

    if !value.is_mapping() {
        return Err(CoreError::ManifestMalformed(
            "document is not a mapping".to_string(),
        ));
    }

    for field in ["apiVersion", "kind"] {
        let present = value
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !present {
            return Err(CoreError::ManifestMalformed(format!(
                "document is missing {}",
                field
            )));
        }
    }

    Ok(value)
}

fn is_document_separator(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed == "---" || trimmed.starts_with("--- ") || trimmed.starts_with("---\t")
}

fn push_document(documents: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }

    // Documents that are nothing but comments carry no resource
    if trimmed
        .lines()
        .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
    {
        return;
    }

    documents.push(trimmed.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multiple_documents() {
        let stream = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
";
        let docs = split_manifests(stream);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("ConfigMap"));
        assert!(docs[1].contains("Deployment"));
    }

    #[test]
    fn test_split_ignores_embedded_dashes() {
        let stream = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: cfg
data:
  banner: \"----------\"
  inline: \"a --- b\"
";
        let docs = split_manifests(stream);
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains("a --- b"));
    }

    #[test]
    fn test_split_drops_empty_and_comment_documents() {
        let stream = "\
---
# just a comment
---

---
apiVersion: v1
kind: Secret
metadata:
  name: creds
";
        let docs = split_manifests(stream);
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains("Secret"));
    }

    #[test]
    fn test_split_leading_separator() {
        let stream = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        assert_eq!(split_manifests(stream).len(), 1);
    }

    #[test]
    fn test_parse_document_valid() {
        let doc = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 2\n";
        let value = parse_document(doc).unwrap();
        assert_eq!(value["kind"].as_str(), Some("Deployment"));
        // Unknown fields survive the decode
        assert_eq!(value["spec"]["replicas"].as_u64(), Some(2));
    }

    #[test]
    fn test_parse_document_missing_kind() {
        let doc = "apiVersion: v1\nmetadata:\n  name: web\n";
        let err = parse_document(doc).unwrap_err();
        assert!(err.to_string().contains("missing kind"));
    }

    #[test]
    fn test_parse_document_missing_api_version() {
        let doc = "kind: ConfigMap\nmetadata:\n  name: cfg\n";
        let err = parse_document(doc).unwrap_err();
        assert!(err.to_string().contains("missing apiVersion"));
    }

    #[test]
    fn test_parse_document_scalar_is_rejected() {
        assert!(parse_document("just a string").is_err());
    }
}
