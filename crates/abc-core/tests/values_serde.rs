use abc_core::{Parameter, SumStats};

#[test]
fn parameter_is_order_insensitive_and_transparent() {
    let a = Parameter::new().with("b", 2.0).with("a", 1.0);
    let b: Parameter = [("a", 1.0), ("b", 2.0)].into_iter().collect();
    assert_eq!(a, b);
    let json = serde_json::to_string(&a).expect("serialize");
    assert_eq!(json, r#"{"a":1.0,"b":2.0}"#);
    let keys: Vec<&str> = a.keys().collect();
    assert_eq!(keys, vec!["a", "b"]);
}

#[test]
fn sum_stats_round_trip() {
    let stats = SumStats::new().with("mean", 0.5).with("var", 1.25);
    let json = serde_json::to_string(&stats).expect("serialize");
    let decoded: SumStats = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded, stats);
    assert_eq!(decoded.get("var"), Some(1.25));
    assert_eq!(decoded.get("missing"), None);
}
