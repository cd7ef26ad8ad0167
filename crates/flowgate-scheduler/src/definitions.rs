//! Workflow definitions: the workflows folder, built-in examples, and
//! syncing both into the store.
//!
//! A definition file is TOML; the id defaults to the file stem:
//!
//! ```toml
//! description = "Nightly billing export"
//! schedule = "@daily"
//! tags = ["billing"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use flowgate_core::config::CoreSettings;
use flowgate_store::{MetaStore, Timestamp, WorkflowDefinition};

use crate::error::{SchedulerError, SchedulerResult};

static WORKFLOW_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,249}$").expect("workflow id pattern compiles")
});

/// Whether `id` is usable as a workflow id.
pub fn is_valid_id(id: &str) -> bool {
    WORKFLOW_ID.is_match(id)
}

/// On-disk shape of a workflow file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowFile {
    id: Option<String>,
    #[serde(default)]
    description: String,
    schedule: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Parse one definition file.
pub fn load_file(path: &Path, now: Timestamp) -> SchedulerResult<WorkflowDefinition> {
    let invalid = |reason: String| SchedulerError::InvalidDefinition {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let file: WorkflowFile = toml::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    let id = match file.id {
        Some(id) => id,
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| invalid("file name is not valid UTF-8".into()))?,
    };
    if !is_valid_id(&id) {
        return Err(invalid(format!("invalid workflow id {id:?}")));
    }

    Ok(WorkflowDefinition {
        id,
        description: file.description,
        schedule: file.schedule,
        tags: file.tags,
        is_example: false,
        is_paused: true,
        source: Some(path.display().to_string()),
        created_at: now,
        updated_at: now,
    })
}

/// Every `*.toml` under `folder`, recursively. Broken files are logged and
/// skipped; an unreadable folder is an error.
pub fn load_folder(folder: &Path, now: Timestamp) -> SchedulerResult<Vec<WorkflowDefinition>> {
    if !folder.is_dir() {
        return Err(SchedulerError::Folder {
            path: folder.to_path_buf(),
            reason: "not a directory".into(),
        });
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(folder).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry in workflows folder");
                continue;
            }
        };
        let is_toml = entry.path().extension().is_some_and(|ext| ext == "toml");
        if entry.file_type().is_file() && is_toml {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    let mut seen = HashSet::new();
    let mut defs = Vec::with_capacity(paths.len());
    for path in paths {
        match load_file(&path, now) {
            Ok(def) if seen.insert(def.id.clone()) => defs.push(def),
            Ok(def) => warn!(id = %def.id, path = %path.display(), "duplicate workflow id, skipping"),
            Err(e) => warn!(error = %e, "skipping workflow file"),
        }
    }
    debug!(folder = %folder.display(), count = defs.len(), "workflow files loaded");
    Ok(defs)
}

/// Workflows shipped with the platform.
pub fn example_definitions(now: Timestamp) -> Vec<WorkflowDefinition> {
    let example = |id: &str, description: &str, schedule: &str, tags: &[&str]| WorkflowDefinition {
        id: id.to_string(),
        description: description.to_string(),
        schedule: Some(schedule.to_string()),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        is_example: true,
        is_paused: true,
        source: None,
        created_at: now,
        updated_at: now,
    };
    vec![
        example(
            "example_bash_operator",
            "Runs a few shell commands in sequence",
            "@daily",
            &["example", "bash"],
        ),
        example(
            "example_hourly_report",
            "Builds an hourly summary report",
            "@hourly",
            &["example"],
        ),
        example(
            "example_setup_once",
            "One-time environment setup",
            "@once",
            &["example", "setup"],
        ),
        example(
            "example_short_interval",
            "Polls an upstream source every 30 minutes",
            "30m",
            &["example"],
        ),
    ]
}

/// What one sync pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: usize,
    pub removed: Vec<String>,
}

/// Bring stored definitions in line with the folder and example setting.
///
/// New definitions start paused when `workflows_paused_at_creation` is set;
/// definitions already in the store keep their pause state. Examples are
/// deleted when examples are disabled, and file-backed definitions whose
/// file is gone are deleted too.
pub async fn sync_definitions(
    store: &MetaStore,
    core: &CoreSettings,
    now: Timestamp,
) -> SchedulerResult<SyncReport> {
    // File-backed definitions are only pruned after a successful folder read.
    let (mut desired, folder_read) = match &core.workflows_folder {
        Some(folder) => match load_folder(folder, now) {
            Ok(defs) => (defs, true),
            Err(e) => {
                warn!(error = %e, "workflows folder unavailable");
                (Vec::new(), false)
            }
        },
        None => (Vec::new(), true),
    };
    if core.load_examples {
        let local: HashSet<String> = desired.iter().map(|d| d.id.clone()).collect();
        desired.extend(
            example_definitions(now)
                .into_iter()
                .filter(|d| !local.contains(&d.id)),
        );
    }

    let mut report = SyncReport::default();
    for mut def in desired.iter().cloned() {
        def.is_paused = core.workflows_paused_at_creation;
        if store.register_workflow(&def).await? {
            info!(id = %def.id, paused = def.is_paused, example = def.is_example, "workflow registered");
            report.created.push(def.id);
        } else {
            report.updated += 1;
        }
    }

    let wanted: HashSet<&str> = desired.iter().map(|d| d.id.as_str()).collect();
    for stored in store.list_workflows().await? {
        if wanted.contains(stored.id.as_str()) {
            continue;
        }
        let stale_example = stored.is_example;
        let stale_file = folder_read && !stored.is_example && stored.source.is_some();
        if (stale_example || stale_file) && store.delete_workflow(&stored.id).await? {
            info!(id = %stored.id, example = stored.is_example, "workflow removed");
            report.removed.push(stored.id);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    async fn migrated_store() -> MetaStore {
        let store = MetaStore::in_memory().unwrap();
        for m in flowgate_store::MIGRATIONS {
            store.apply_migration(m).await.unwrap();
        }
        store
    }

    #[test]
    fn id_rules() {
        assert!(is_valid_id("billing_export"));
        assert!(is_valid_id("team.etl-v2"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("a:b"));
        assert!(!is_valid_id(".hidden"));
    }

    #[test]
    fn file_id_defaults_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "billing.toml", "schedule = \"@daily\"\ntags = [\"x\"]\n");
        let def = load_file(&path, 10).unwrap();
        assert_eq!(def.id, "billing");
        assert_eq!(def.schedule.as_deref(), Some("@daily"));
        assert!(!def.is_example);
        assert_eq!(def.source, Some(path.display().to_string()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.toml", "shedule = \"@daily\"\n");
        assert!(matches!(
            load_file(&path, 0),
            Err(SchedulerError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn folder_walk_skips_broken_and_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", "schedule = \"@hourly\"\n");
        write(dir.path(), "broken.toml", "schedule = [\n");
        write(dir.path(), "notes.txt", "not a workflow");
        std::fs::create_dir(dir.path().join("team")).unwrap();
        write(&dir.path().join("team"), "b.toml", "id = \"team_b\"\n");

        let defs = load_folder(dir.path(), 0).unwrap();
        let ids: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "team_b"]);
    }

    #[test]
    fn missing_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_folder(&dir.path().join("nope"), 0),
            Err(SchedulerError::Folder { .. })
        ));
    }

    #[test]
    fn examples_are_flagged() {
        let examples = example_definitions(0);
        assert!(!examples.is_empty());
        assert!(examples.iter().all(|d| d.is_example && is_valid_id(&d.id)));
    }

    #[tokio::test]
    async fn disabling_examples_removes_them() {
        let store = migrated_store().await;
        let mut core = CoreSettings::default();

        let report = sync_definitions(&store, &core, 100).await.unwrap();
        assert_eq!(report.created.len(), example_definitions(0).len());

        core.load_examples = false;
        let report = sync_definitions(&store, &core, 200).await.unwrap();
        assert_eq!(report.removed.len(), example_definitions(0).len());
        assert!(store.list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_state_survives_resync() {
        let store = migrated_store().await;
        let core = CoreSettings::default();
        sync_definitions(&store, &core, 100).await.unwrap();

        store.set_workflow_paused("example_hourly_report", false).await.unwrap();
        let report = sync_definitions(&store, &core, 200).await.unwrap();
        assert!(report.created.is_empty());

        let def = store.get_workflow("example_hourly_report").await.unwrap().unwrap();
        assert!(!def.is_paused);
    }

    #[tokio::test]
    async fn new_definitions_follow_paused_at_creation() {
        let store = migrated_store().await;
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "etl.toml", "schedule = \"6h\"\n");
        let core = CoreSettings {
            load_examples: false,
            workflows_paused_at_creation: false,
            workflows_folder: Some(dir.path().to_path_buf()),
            ..CoreSettings::default()
        };
        sync_definitions(&store, &core, 100).await.unwrap();
        assert!(!store.get_workflow("etl").await.unwrap().unwrap().is_paused);
    }

    #[tokio::test]
    async fn deleted_file_removes_definition() {
        let store = migrated_store().await;
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "etl.toml", "schedule = \"6h\"\n");
        let core = CoreSettings {
            load_examples: false,
            workflows_folder: Some(dir.path().to_path_buf()),
            ..CoreSettings::default()
        };
        sync_definitions(&store, &core, 100).await.unwrap();
        std::fs::remove_file(path).unwrap();

        let report = sync_definitions(&store, &core, 200).await.unwrap();
        assert_eq!(report.removed, vec!["etl".to_string()]);
    }
}
