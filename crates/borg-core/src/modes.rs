//! Mode registry (§4.D): a mode is a function-free declaration interpreted by
//! the pipeline engine. Built-in modes are registered once at startup;
//! user-defined modes are overlaid from the Store afterwards. Both paths run
//! the same `PipelineMode::validate()` checks — an invalid mode is logged and
//! dropped rather than poisoning the registry.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::warn;

use crate::types::PipelineMode;

static REGISTRY: OnceLock<Mutex<HashMap<String, PipelineMode>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, PipelineMode>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register the built-in modes at startup. Call once; a mode that fails
/// `validate()` is logged and skipped rather than registered.
pub fn register_modes(modes: Vec<PipelineMode>) {
    let mut reg = registry().lock().unwrap_or_else(|e| e.into_inner());
    for mode in modes {
        if let Err(e) = mode.validate() {
            warn!("skipping invalid built-in mode {}: {e}", mode.name);
            continue;
        }
        reg.insert(mode.name.clone(), mode);
    }
}

/// Overlay a single user-defined mode from the Store on top of the built-ins.
/// A mode with the same name as a built-in replaces it for this process.
pub fn overlay_mode(mode: PipelineMode) -> Result<(), String> {
    mode.validate()?;
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(mode.name.clone(), mode);
    Ok(())
}

/// Remove a mode from the in-memory registry (used when a custom mode is
/// deleted from the Store; built-ins are re-registered on next restart).
pub fn remove_mode(name: &str) {
    registry().lock().unwrap_or_else(|e| e.into_inner()).remove(name);
}

/// Look up a mode by name (with the `swe` backward-compat alias).
pub fn get_mode(name: &str) -> Option<PipelineMode> {
    match name {
        "swe" => get_mode("sweborg"),
        _ => registry().lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned(),
    }
}

/// All currently registered modes, built-in and user-defined.
pub fn all_modes() -> Vec<PipelineMode> {
    registry().lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PhaseConfig, PhaseType};

    fn trivial_mode(name: &str) -> PipelineMode {
        PipelineMode {
            name: name.into(),
            label: name.into(),
            category: "Test".into(),
            initial_status: "backlog".into(),
            uses_git_worktrees: false,
            uses_docker: false,
            uses_test_cmd: false,
            integration: crate::types::IntegrationType::None,
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

    #[test]
    fn register_and_lookup_roundtrips() {
        register_modes(vec![trivial_mode("t_register_and_lookup")]);
        let mode = get_mode("t_register_and_lookup").expect("registered mode found");
        assert_eq!(mode.name, "t_register_and_lookup");
    }

    #[test]
    fn mode_serialize_reload_reserialize_is_byte_equal() {
        let mode = trivial_mode("t_serde_roundtrip");
        let first = serde_json::to_string(&mode).expect("serialize");
        let reloaded: PipelineMode = serde_json::from_str(&first).expect("deserialize");
        let second = serde_json::to_string(&reloaded).expect("reserialize");
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_mode_is_skipped() {
        let mut bad = trivial_mode("t_invalid");
        bad.phases[0].next = "nowhere".into();
        register_modes(vec![bad]);
        assert!(get_mode("t_invalid").is_none());
    }

    #[test]
    fn overlay_replaces_existing_mode() {
        register_modes(vec![trivial_mode("t_overlay")]);
        let mut overlay = trivial_mode("t_overlay");
        overlay.label = "Overlaid".into();
        overlay_mode(overlay).expect("overlay validates");
        assert_eq!(get_mode("t_overlay").unwrap().label, "Overlaid");
    }

    #[test]
    fn remove_mode_drops_it() {
        register_modes(vec![trivial_mode("t_remove")]);
        remove_mode("t_remove");
        assert!(get_mode("t_remove").is_none());
    }
}
