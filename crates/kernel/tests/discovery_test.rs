//! Integration tests for module discovery, manifests and load ordering.

use modhub_kernel::module::{
    LoaderConfig, MAX_MANIFEST_BYTES, Manifest, ModuleLoader, ModuleRegistry, resolve_load_order,
};
use modhub_kernel::{ModuleError, module::DependencyGraph};
use modhub_test_utils::{ModuleTree, init_tracing, manifest_toml};

fn loader_for(tree: &ModuleTree) -> ModuleLoader {
    ModuleLoader::new(LoaderConfig::with_paths(vec![tree.path().to_path_buf()]))
}

#[test]
fn discovery_includes_valid_names_only() {
    init_tracing();
    let tree = ModuleTree::new();
    for name in ["crm", "Sales", "hr_base", "x9"] {
        tree.add_module(name, "1.0", &[]);
    }
    for name in ["9lives", "_hidden", "crm-old", "Kernel"] {
        tree.add_module(name, "1.0", &[]);
    }

    let found = loader_for(&tree).discover(false);
    let names: Vec<&str> = found.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["Sales", "crm", "hr_base", "x9"]);
}

#[test]
fn invalid_name_is_excluded_even_with_valid_manifest() {
    let tree = ModuleTree::new();
    tree.add_raw("bad-name", &manifest_toml("bad_name", "1.0", &[]));

    assert!(loader_for(&tree).discover(false).is_empty());
}

#[test]
fn directories_without_both_files_are_skipped() {
    let tree = ModuleTree::new();
    tree.add_module("crm", "1.0", &[]);
    std::fs::create_dir_all(tree.path().join("notes")).unwrap();
    std::fs::write(
        tree.path().join("notes").join("manifest.toml"),
        manifest_toml("notes", "1.0", &[]),
    )
    .unwrap();

    let found = loader_for(&tree).discover(false);
    assert!(found.contains_key("crm"));
    assert!(!found.contains_key("notes"));
}

#[test]
fn earlier_root_wins_duplicates() {
    let first = ModuleTree::new();
    let second = ModuleTree::new();
    first.add_module("crm", "1.0", &[]);
    second.add_module("crm", "2.0", &[]);
    second.add_module("sales", "1.0", &["crm"]);

    let loader = ModuleLoader::new(LoaderConfig::with_paths(vec![
        first.path().to_path_buf(),
        second.path().to_path_buf(),
    ]));
    let registry = ModuleRegistry::new();
    let order = loader.register_all(&registry).unwrap();

    assert_eq!(order, vec!["crm", "sales"]);
    assert_eq!(registry.get("crm").unwrap().version(), "1.0");
}

#[test]
fn manifest_round_trip_preserves_dependency_order() {
    let text = manifest_toml("sales", "2.1", &["crm", "accounting", "base"]);
    let manifest = Manifest::parse_str(&text, "sales", MAX_MANIFEST_BYTES).unwrap();

    let written = manifest.to_toml_string().unwrap();
    let reparsed = Manifest::parse_str(&written, "sales", MAX_MANIFEST_BYTES).unwrap();

    assert_eq!(reparsed.name, "sales");
    assert_eq!(reparsed.version, "2.1");
    assert_eq!(reparsed.depends, vec!["crm", "accounting", "base"]);
    assert_eq!(reparsed, manifest);
}

#[test]
fn oversized_manifest_is_rejected_at_load() {
    let tree = ModuleTree::new();
    let padding = "x".repeat(200 * 1024);
    let text = format!(
        "{}description = \"{padding}\"\n",
        manifest_toml("bulky", "1.0", &[])
    );
    let dir = tree.add_raw("bulky", &text);

    let loader = loader_for(&tree);
    let err = loader.load_manifest(&dir).unwrap_err();
    assert!(matches!(err, ModuleError::InvalidModule { .. }));

    let registry = ModuleRegistry::new();
    loader.register_all(&registry).unwrap();
    assert!(!registry.contains("bulky"));
}

#[test]
fn chain_loads_leaf_first() {
    let tree = ModuleTree::new();
    tree.add_module("a", "1.0", &["b"]);
    tree.add_module("b", "1.0", &["c"]);
    tree.add_module("c", "1.0", &[]);

    let registry = ModuleRegistry::new();
    let order = loader_for(&tree).register_all(&registry).unwrap();
    assert_eq!(order, vec!["c", "b", "a"]);

    let names: Vec<String> = registry.all().into_iter().map(|info| info.name).collect();
    assert_eq!(names, order);
}

#[test]
fn cycle_fails_without_partial_order() {
    let mut graph = DependencyGraph::new();
    graph.insert("a".into(), vec!["b".into()]);
    graph.insert("b".into(), vec!["a".into()]);
    graph.insert("c".into(), vec![]);

    match resolve_load_order(&graph) {
        Err(ModuleError::DependencyCycle { modules }) => assert_eq!(modules, "a, b"),
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn cycle_on_disk_fails_registration() {
    let tree = ModuleTree::new();
    tree.add_module("a", "1.0", &["b"]);
    tree.add_module("b", "1.0", &["a"]);

    let registry = ModuleRegistry::new();
    let err = loader_for(&tree).register_all(&registry).unwrap_err();
    assert!(matches!(err, ModuleError::DependencyCycle { .. }));
}
