use abc_core::errors::{AbcError, ErrorInfo};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("generation", 3)
        .with_context("model", "gauss")
}

#[test]
fn simulation_error_surface() {
    let err = AbcError::Simulation(sample_info("SIM001", "simulator crashed"));
    assert_eq!(err.info().code, "SIM001");
    assert_eq!(err.family(), "simulation");
    assert!(err.info().context.contains_key("model"));
}

#[test]
fn acceptance_error_surface() {
    let err = AbcError::Acceptance(sample_info("ACC001", "proposal cap reached"));
    assert_eq!(err.info().code, "ACC001");
    assert_eq!(err.info().context["generation"], "3");
}

#[test]
fn schedule_error_surface() {
    let err = AbcError::Schedule(sample_info("SCH001", "epsilon is NaN"));
    assert_eq!(err.family(), "schedule");
}

#[test]
fn persistence_error_surface() {
    let err = AbcError::Persistence(sample_info("P001", "append failed"));
    assert_eq!(err.info().code, "P001");
}

#[test]
fn display_includes_context_and_hint() {
    let err = AbcError::Config(
        ErrorInfo::new("population_size", "must be positive")
            .with_context("value", 0)
            .with_hint("set population_size >= 1"),
    );
    let rendered = err.to_string();
    assert!(rendered.starts_with("config error: must be positive"));
    assert!(rendered.contains("value=0"));
    assert!(rendered.contains("hint: set population_size >= 1"));
}

#[test]
fn errors_round_trip_through_json() {
    let err = AbcError::Schedule(sample_info("SCH002", "negative epsilon"));
    let json = serde_json::to_string(&err).expect("serialize");
    assert!(json.contains("\"family\":\"Schedule\""));
    let decoded: AbcError = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded, err);
}
