//! Manifest generation for application deployments
//!
//! A template holds a multi-document YAML manifest. An application carries
//! parameter documents that are merged over it, after which every namespaced
//! object is pinned to the application's namespace and labelled as ours.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};

/// Longest valid DNS-1123 label
const MAX_NAMESPACE_LEN: usize = 63;

/// Kinds that must never receive a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "PriorityClass",
    "RuntimeClass",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "APIService",
];

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_OWNER: &str = "appconsole.io/owner";
pub const LABEL_APPLICATION: &str = "appconsole.io/application";
pub const MANAGED_BY_VALUE: &str = "appconsole";

/// Labels attached to everything created for an application
pub fn application_labels(owner: &str, name: &str) -> BTreeMap<String, String> {
    [
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_OWNER.to_string(), sanitize_label_value(owner)),
        (LABEL_APPLICATION.to_string(), sanitize_label_value(name)),
    ]
    .into_iter()
    .collect()
}

/// DNS-1123 namespace name for an application
///
/// The readable head is followed by a hash of the exact `owner/name`, so keys
/// that sanitize to the same label still get distinct namespaces.
pub fn namespace_for(prefix: &str, owner: &str, name: &str) -> String {
    let label = dns_label(&format!("{}-{}-{}", prefix, owner, name));
    let suffix = format!("{:08x}", fnv1a(format!("{}/{}", owner, name).as_bytes()));

    let keep = MAX_NAMESPACE_LEN - suffix.len() - 1;
    let head = if label.len() > keep { &label[..keep] } else { &label[..] };
    let head = head.trim_end_matches('-');
    if head.is_empty() {
        return suffix;
    }
    format!("{}-{}", head, suffix)
}

/// Whether `existing` carries every label in `expected` with the same value
pub fn is_owned_by(
    existing: Option<&BTreeMap<String, String>>,
    expected: &BTreeMap<String, String>,
) -> bool {
    let Some(existing) = existing else {
        return false;
    };
    expected.iter().all(|(key, value)| existing.get(key) == Some(value))
}

fn dns_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    out.trim_end_matches('-').to_string()
}

fn sanitize_label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_NAMESPACE_LEN)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Parse a YAML stream into its mapping documents, skipping empty ones
pub fn split_documents(yaml: &str) -> AppResult<Vec<Value>> {
    let mut documents = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = Value::deserialize(document)?;
        match value {
            Value::Null => continue,
            Value::Mapping(_) => documents.push(value),
            _ => {
                return Err(AppError::BadRequest(format!(
                    "manifest document {} is not a mapping",
                    index
                )))
            }
        }
    }

    Ok(documents)
}

/// Kind and metadata.name of a manifest document
pub fn document_identity(document: &Value) -> Option<(&str, &str)> {
    let kind = document.get("kind")?.as_str()?;
    let name = document.get("metadata")?.get("name")?.as_str()?;
    Some((kind, name))
}

/// Names of the Deployments in a rendered manifest, in document order
pub fn deployment_names(manifest: &str) -> AppResult<Vec<String>> {
    Ok(split_documents(manifest)?
        .iter()
        .filter_map(document_identity)
        .filter(|(kind, _)| *kind == "Deployment")
        .map(|(_, name)| name.to_string())
        .collect())
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Recursive merge: maps merge key by key, null deletes, anything else replaces
pub fn merge_values(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    base_map.remove(&key);
                } else if let Some(existing) = base_map.get_mut(&key) {
                    merge_values(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Render the final manifest of an application
pub fn render(
    template_manifest: &str,
    parameters: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> AppResult<String> {
    let mut documents = split_documents(template_manifest)?;

    for patch in split_documents(parameters)? {
        let (kind, name) = document_identity(&patch)
            .map(|(k, n)| (k.to_string(), n.to_string()))
            .ok_or_else(|| {
                AppError::bad_request("parameter document needs kind and metadata.name")
            })?;

        let target = documents
            .iter_mut()
            .find(|doc| document_identity(doc) == Some((kind.as_str(), name.as_str())));

        match target {
            Some(doc) => merge_values(doc, patch),
            None => documents.push(patch),
        }
    }

    let mut rendered = Vec::with_capacity(documents.len());
    for mut doc in documents {
        let kind = doc
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::bad_request("manifest document without kind"))?
            .to_string();

        let map = doc
            .as_mapping_mut()
            .ok_or_else(|| AppError::bad_request("manifest document is not a mapping"))?;
        let metadata = ensure_mapping_in(map, "metadata");
        if !is_cluster_scoped(&kind) {
            metadata.insert(
                Value::String("namespace".to_string()),
                Value::String(namespace.to_string()),
            );
        }

        let doc_labels = ensure_mapping_in(metadata, "labels");
        for (key, value) in labels {
            doc_labels.insert(Value::String(key.clone()), Value::String(value.clone()));
        }

        rendered.push(serde_yaml::to_string(&doc)?);
    }

    Ok(rendered.join("---\n"))
}

fn ensure_mapping_in<'a>(map: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let key = Value::String(key.to_string());
    let entry = map.entry(key).or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    match entry {
        Value::Mapping(inner) => inner,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: web
          image: nginx:1.25
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: somewhere-else
spec:
  type: NodePort
  ports:
    - port: 80
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: web-reader
"#;

    fn labels() -> BTreeMap<String, String> {
        application_labels("admin", "blog")
    }

    #[test]
    fn test_namespace_for_is_dns_safe() {
        let ns = namespace_for("appconsole", "Admin", "My_Blog");
        assert!(ns.starts_with("appconsole-admin-my-blog-"));
        assert_eq!(ns.len(), "appconsole-admin-my-blog-".len() + 8);
        assert!(ns
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));

        let ns = namespace_for("appconsole", "a", "--x--");
        assert!(ns.starts_with("appconsole-a-x-"));
    }

    #[test]
    fn test_namespace_for_keeps_similar_keys_apart() {
        // Both pairs sanitize to the same readable label
        assert_ne!(
            namespace_for("appconsole", "a-b", "c"),
            namespace_for("appconsole", "a", "b-c")
        );
        assert_ne!(
            namespace_for("appconsole", "Admin", "blog"),
            namespace_for("appconsole", "admin", "blog")
        );
        assert_eq!(
            namespace_for("appconsole", "admin", "blog"),
            namespace_for("appconsole", "admin", "blog")
        );
    }

    #[test]
    fn test_namespace_for_truncates_with_stable_suffix() {
        let long = "x".repeat(80);
        let a = namespace_for("appconsole", "admin", &long);
        let b = namespace_for("appconsole", "admin", &format!("{}y", long));

        assert_eq!(a.len(), MAX_NAMESPACE_LEN);
        assert_eq!(a, namespace_for("appconsole", "admin", &long));
        assert_ne!(a, b);
        assert!(!a.starts_with('-') && !a.ends_with('-'));
    }

    #[test]
    fn test_is_owned_by() {
        let ours = labels();
        assert!(is_owned_by(Some(&ours), &ours));

        let mut extra = ours.clone();
        extra.insert("team".to_string(), "web".to_string());
        assert!(is_owned_by(Some(&extra), &ours));

        assert!(!is_owned_by(Some(&application_labels("admin", "shop")), &ours));
        assert!(!is_owned_by(Some(&BTreeMap::new()), &ours));
        assert!(!is_owned_by(None, &ours));
    }

    #[test]
    fn test_deployment_names() {
        let out = render(TEMPLATE, "", "ns", &labels()).unwrap();
        assert_eq!(deployment_names(&out).unwrap(), vec!["web".to_string()]);
        assert!(deployment_names("kind: Service\nmetadata:\n  name: web\n")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_split_documents_skips_empty() {
        let docs = split_documents("---\n---\nkind: A\n---\n\n").unwrap();
        assert_eq!(docs.len(), 1);
        assert!(split_documents("").unwrap().is_empty());
    }

    #[test]
    fn test_split_documents_rejects_scalars() {
        let err = split_documents("kind: A\n---\n- a\n- b\n").unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_merge_values() {
        let mut base: Value = serde_yaml::from_str("a: 1\nb:\n  c: 2\n  d: 3\nl: [1, 2]").unwrap();
        let patch: Value = serde_yaml::from_str("b:\n  c: 20\n  d: null\nl: [9]\ne: new").unwrap();
        merge_values(&mut base, patch);

        assert_eq!(base["a"].as_i64(), Some(1));
        assert_eq!(base["b"]["c"].as_i64(), Some(20));
        assert!(base["b"].get("d").is_none());
        assert_eq!(base["l"], serde_yaml::from_str::<Value>("[9]").unwrap());
        assert_eq!(base["e"].as_str(), Some("new"));
    }

    #[test]
    fn test_render_sets_namespace_and_labels() {
        let out = render(TEMPLATE, "", "appconsole-admin-blog", &labels()).unwrap();
        let docs = split_documents(&out).unwrap();
        assert_eq!(docs.len(), 3);

        for doc in &docs[..2] {
            assert_eq!(doc["metadata"]["namespace"].as_str(), Some("appconsole-admin-blog"));
            assert_eq!(doc["metadata"]["labels"][LABEL_APPLICATION].as_str(), Some("blog"));
        }
        // Cluster-scoped objects keep no namespace
        assert!(docs[2]["metadata"].get("namespace").is_none());
        assert_eq!(docs[2]["metadata"]["labels"][LABEL_MANAGED_BY].as_str(), Some("appconsole"));
    }

    #[test]
    fn test_render_applies_parameters() {
        let parameters = r#"
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: extra
data:
  key: value
"#;
        let out = render(TEMPLATE, parameters, "ns", &labels()).unwrap();
        let docs = split_documents(&out).unwrap();

        assert_eq!(docs.len(), 4);
        assert_eq!(docs[0]["spec"]["replicas"].as_i64(), Some(3));
        // Untouched keys survive the merge
        assert_eq!(
            docs[0]["spec"]["template"]["spec"]["containers"][0]["image"].as_str(),
            Some("nginx:1.25")
        );
        assert_eq!(document_identity(&docs[3]), Some(("ConfigMap", "extra")));
        assert_eq!(docs[3]["metadata"]["namespace"].as_str(), Some("ns"));
    }

    #[test]
    fn test_render_rejects_anonymous_parameters() {
        let err = render(TEMPLATE, "spec:\n  replicas: 2\n", "ns", &labels()).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = render(TEMPLATE, "", "ns", &labels()).unwrap();
        let b = render(TEMPLATE, "", "ns", &labels()).unwrap();
        assert_eq!(a, b);
    }
}
