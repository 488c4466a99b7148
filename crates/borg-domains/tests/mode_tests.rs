use borg_core::types::PhaseType;

#[test]
fn test_swe_mode_has_implement_validate_flow() {
    let mode = borg_domains::swe::swe_mode();
    assert_eq!(mode.name, "sweborg");
    let names: Vec<&str> = mode.phases.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, &["backlog", "implement", "validate", "lint_fix", "rebase"]);
}

#[test]
fn test_swe_implement_has_full_tools() {
    let mode = borg_domains::swe::swe_mode();
    let implement = mode.get_phase("implement").unwrap();
    assert!(implement.allowed_tools.contains("Bash"));
    assert!(implement.allowed_tools.contains("Edit"));
    assert!(implement.include_task_context);
    assert!(implement.commits);
    assert!(implement.use_docker);
    assert!(implement.runs_tests);
    assert!(implement.has_qa_fix_routing);
}

#[test]
fn test_swe_validate_is_fresh_session_and_loops_to_lint_fix() {
    let mode = borg_domains::swe::swe_mode();
    let validate = mode.get_phase("validate").unwrap();
    assert_eq!(validate.phase_type, PhaseType::Agent);
    assert!(validate.fresh_session);
    assert!(validate.runs_tests);
    assert_eq!(validate.next, "lint_fix");
}

#[test]
fn test_swe_mode_passes_registration_validation() {
    let mode = borg_domains::swe::swe_mode();
    assert!(mode.validate().is_ok(), "sweborg must pass §4.D registration checks");
}

#[test]
fn test_swe_mode_has_single_rebase_phase() {
    let mode = borg_domains::swe::swe_mode();
    let rebase_count = mode.phases.iter().filter(|p| p.phase_type == PhaseType::Rebase).count();
    assert_eq!(rebase_count, 1);
}

#[test]
fn test_all_modes_have_backlog_first() {
    for mode in borg_domains::all_modes() {
        let first = &mode.phases[0];
        assert_eq!(first.name, "backlog", "mode {} must start with backlog", mode.name);
        assert_eq!(first.phase_type, PhaseType::Setup);
    }
}

#[test]
fn test_all_modes_first_agent_phase_has_task_context() {
    for mode in borg_domains::all_modes() {
        let first_agent = mode.phases.iter()
            .find(|p| p.phase_type == PhaseType::Agent)
            .unwrap_or_else(|| panic!("mode {} has no agent phase", mode.name));
        assert!(first_agent.include_task_context, "mode {} first agent phase must include task context", mode.name);
    }
}

#[test]
fn test_no_mode_uses_old_spec_qa_impl_phases() {
    for mode in borg_domains::all_modes() {
        for phase in &mode.phases {
            assert_ne!(phase.name, "spec", "mode {} still has spec phase", mode.name);
            assert_ne!(phase.name, "qa", "mode {} still has qa phase", mode.name);
            assert_ne!(phase.name, "qa_fix", "mode {} still has qa_fix phase", mode.name);
            assert_ne!(phase.name, "impl", "mode {} still has impl phase", mode.name);
        }
    }
}

#[test]
fn test_swe_signal_instructions_in_prompt() {
    let mode = borg_domains::swe::swe_mode();
    let implement = mode.get_phase("implement").unwrap();
    assert!(implement.instruction.contains("signal.json"));
    assert!(implement.instruction.contains("blocked"));
    assert!(implement.instruction.contains("abandon"));
}
