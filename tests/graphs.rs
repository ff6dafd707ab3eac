use flowsmith::graph::DependencyGraph;
use rustc_hash::FxHashSet;

fn graph(edges: &[(&str, &str)]) -> DependencyGraph<String> {
    DependencyGraph::from_edges(
        edges
            .iter()
            .map(|(node, dep)| ((*node).to_string(), (*dep).to_string())),
    )
}

#[test]
fn self_loop_reports_its_own_path() {
    let err = graph(&[("a", "a")]).validate().unwrap_err();
    assert_eq!(err.path, "a -> a");
}

#[test]
fn long_cycle_is_detected_through_intermediates() {
    let g = graph(&[
        ("b", "a"),
        ("c", "b"),
        ("d", "c"),
        ("e", "d"),
        ("a", "e"),
    ]);
    let err = g.validate().unwrap_err();
    // The reported path is closed on itself.
    let parts: Vec<&str> = err.path.split(" -> ").collect();
    assert!(parts.len() >= 3);
    assert_eq!(parts.first(), parts.last());
}

#[test]
fn deep_chain_validates_without_overflowing() {
    let mut g: DependencyGraph<u32> = DependencyGraph::new();
    for i in 1..20_000u32 {
        g.add_dependency(i, i - 1);
    }
    assert!(g.validate().is_ok());
}

#[test]
fn frontier_excludes_started_nodes() {
    let g = graph(&[("b", "a")]);
    let completed: FxHashSet<String> = ["a".to_string()].into_iter().collect();
    let started: FxHashSet<String> = ["b".to_string()].into_iter().collect();
    assert!(g.ready_frontier(&completed, &started).is_empty());
}

#[test]
fn dependents_do_not_include_self() {
    let g = graph(&[("b", "a"), ("c", "b")]);
    let deps = g.transitive_dependents(&"a".to_string());
    assert!(!deps.contains("a"));
    assert_eq!(deps.len(), 2);
}
