// Integration tests for borg_core::db — round-trip laws from spec.md §8.

use tempfile::TempDir;

use borg_core::db::Db;
use borg_core::types::{IntegrationType, PhaseConfig, PhaseType, PipelineMode};

fn open_db(dir: &TempDir) -> Db {
    let path = dir.path().join("borg.sqlite3");
    let mut db = Db::open(path.to_str().unwrap()).expect("open db");
    db.migrate().expect("migrate schema");
    db
}

fn trivial_mode(name: &str) -> PipelineMode {
    PipelineMode {
        name: name.into(),
        label: name.into(),
        category: "Test".into(),
        initial_status: "backlog".into(),
        uses_git_worktrees: false,
        uses_docker: false,
        uses_test_cmd: false,
        integration: IntegrationType::None,
        default_max_attempts: 1,
        phases: vec![PhaseConfig {
            name: "backlog".into(),
            label: "Backlog".into(),
            phase_type: PhaseType::Setup,
            next: "done".into(),
            ..Default::default()
        }],
        seed_modes: vec![],
    }
}

// ── register_group / get_all_groups round-trip (spec.md §8) ────────────────

#[test]
fn register_group_roundtrips_all_five_fields() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.register_group("chat:123", "Ops Team", "!borg", true)
        .expect("register_group");

    let groups = db.get_all_groups().expect("get_all_groups");
    assert_eq!(groups.len(), 1);
    let (chat_key, label, trigger_pattern, requires_trigger, registered_at) = &groups[0];
    assert_eq!(chat_key, "chat:123");
    assert_eq!(label, "Ops Team");
    assert_eq!(trigger_pattern, "!borg");
    assert!(*requires_trigger);
    assert!(!registered_at.is_empty());
}

#[test]
fn register_group_roundtrips_unicode_and_empty_strings() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.register_group("chat:ünïcödé-🤖", "チーム", "", false)
        .expect("register_group");

    let groups = db.get_all_groups().expect("get_all_groups");
    assert_eq!(groups.len(), 1);
    let (chat_key, label, trigger_pattern, requires_trigger, _) = &groups[0];
    assert_eq!(chat_key, "chat:ünïcödé-🤖");
    assert_eq!(label, "チーム");
    assert_eq!(trigger_pattern, "");
    assert!(!*requires_trigger);
}

#[test]
fn register_group_upsert_overwrites_by_chat_key() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.register_group("chat:1", "Original", "!a", false)
        .expect("first register");
    db.register_group("chat:1", "Renamed", "!b", true)
        .expect("second register");

    let groups = db.get_all_groups().expect("get_all_groups");
    assert_eq!(groups.len(), 1);
    let (_, label, trigger_pattern, requires_trigger, _) = &groups[0];
    assert_eq!(label, "Renamed");
    assert_eq!(trigger_pattern, "!b");
    assert!(*requires_trigger);
}

// ── custom_modes CRUD round-trip ────────────────────────────────────────────

#[test]
fn custom_mode_upsert_and_list_roundtrips() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let mode = trivial_mode("custom_one");
    db.upsert_custom_mode(&mode).expect("upsert_custom_mode");

    let stored = db.list_custom_modes().expect("list_custom_modes");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "custom_one");
    assert_eq!(stored[0].phases.len(), mode.phases.len());
}

#[test]
fn custom_mode_upsert_replaces_existing_definition() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let mut mode = trivial_mode("custom_two");
    db.upsert_custom_mode(&mode).expect("first upsert");

    mode.label = "Updated Label".into();
    db.upsert_custom_mode(&mode).expect("second upsert");

    let stored = db.list_custom_modes().expect("list_custom_modes");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].label, "Updated Label");
}

#[test]
fn custom_mode_delete_removes_it() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.upsert_custom_mode(&trivial_mode("custom_three"))
        .expect("upsert_custom_mode");
    db.delete_custom_mode("custom_three")
        .expect("delete_custom_mode");

    let stored = db.list_custom_modes().expect("list_custom_modes");
    assert!(stored.is_empty());
}
