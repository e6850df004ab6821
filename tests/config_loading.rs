use inflight::{ConfigError, FilterConfig, PriorityBand, RuleField};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fresh directory under the system temp dir, removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(tag: &str) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "inflight-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.0.join(name);
        fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

const BUCKETS: &str = r#"
- name: system
  reservedQuota: 2
  sharedQuota: 4
  weight: 2
  priority: 0
- name: batch
  sharedQuota: 6
  priority: 4
"#;

const BINDINGS: &str = r#"
bindings:
  - rules:
      - field: user.name
        values: ["admin", "root"]
    bucketRef:
      name: system
  - rules:
      - field: namespace
        values: ["jobs"]
      - field: verb
        values: ["DELETE"]
    bucketRef:
      name: batch
"#;

#[test]
fn loads_bucket_and_binding_documents_from_a_directory() {
    let dir = ScratchDir::new("dir");
    dir.write("buckets.yaml", BUCKETS);
    dir.write("bindings.yaml", BINDINGS);

    let config = FilterConfig::from_dir(&dir.0).unwrap();
    assert_eq!(config.buckets().len(), 2);
    assert_eq!(config.buckets()[0].priority(), PriorityBand::Top);
    assert_eq!(config.buckets()[0].weight_value(), 2.0);
    assert_eq!(config.bindings().len(), 2);
    assert_eq!(config.bindings()[1].rules[1].field, RuleField::Verb);
    assert_eq!(config.max_waiting(), 4 + 6 + config.extra_shared_quota());
}

#[test]
fn missing_bindings_document_means_no_bindings() {
    let dir = ScratchDir::new("nobind");
    dir.write("buckets.yaml", BUCKETS);

    let config = FilterConfig::from_dir(&dir.0).unwrap();
    assert!(config.bindings().is_empty());
}

#[test]
fn missing_buckets_document_is_an_io_error() {
    let dir = ScratchDir::new("empty");
    match FilterConfig::from_dir(&dir.0) {
        Err(ConfigError::Io { path, .. }) => assert!(path.ends_with("buckets.yaml")),
        other => panic!("expected Io error, got {:?}", other),
    }
}

#[test]
fn bindings_to_unknown_buckets_are_rejected() {
    let dir = ScratchDir::new("unknown");
    dir.write("buckets.yaml", "- name: only\n  sharedQuota: 1\n  priority: 3\n");
    dir.write("bindings.yaml", BINDINGS);

    assert!(matches!(
        FilterConfig::from_dir(&dir.0),
        Err(ConfigError::UnknownBucket { index: 0, .. })
    ));
}

#[test]
fn single_file_loading_picks_the_format_by_extension() {
    let dir = ScratchDir::new("file");
    let json = dir.write(
        "filter.json",
        r#"{"buckets":[{"name":"a","sharedQuota":2,"priority":1}],"idleBackoffMs":5}"#,
    );
    let yaml = dir.write(
        "filter.yml",
        "buckets:\n  - name: a\n    sharedQuota: 2\n    priority: 1\nadmissionTimeoutMs: 250\n",
    );

    let from_json = FilterConfig::from_path(&json).unwrap();
    assert_eq!(from_json.idle_backoff(), Duration::from_millis(5));

    let from_yaml = FilterConfig::from_path(&yaml).unwrap();
    assert_eq!(from_yaml.admission_timeout(), Duration::from_millis(250));
    assert_eq!(from_yaml.buckets(), from_json.buckets());
}

#[test]
fn assigning_the_lowest_band_is_refused() {
    let err = FilterConfig::from_yaml_str("buckets:\n  - name: bg\n    priority: 5\n").unwrap_err();
    assert!(matches!(err, ConfigError::LowestBandAssigned(name) if name == "bg"));
}
