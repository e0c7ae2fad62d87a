use shade_forge::{ClosureField, ClosureLayout, ErrorKind, FieldType, INVALID_CLOSURE_ID, ShadingSystem};

fn lambert() -> ClosureLayout {
    ClosureLayout::new()
        .field("base_color", FieldType::Float3)
        .field("center", FieldType::Float3)
        .field("flip_normal", FieldType::Bool)
}

#[test]
fn registering_the_same_layout_twice_returns_the_same_id() {
    let system = ShadingSystem::new();
    let first = system.register_closure_layout("lambert", lambert()).unwrap();
    let second = system.register_closure_layout("lambert", lambert()).unwrap();
    assert_eq!(first, second);
    assert_ne!(first, INVALID_CLOSURE_ID);
    assert_eq!(system.closure_registry().len(), 1);
}

#[test]
fn same_name_with_different_fields_is_a_name_conflict() {
    let system = ShadingSystem::new();
    system.register_closure_layout("lambert", lambert()).unwrap();
    let err = system
        .register_closure_layout("lambert", ClosureLayout::new().field("base_color", FieldType::Float3))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
    assert_eq!(system.closure_registry().len(), 1);
}

#[test]
fn explicit_fields_are_validated() {
    let system = ShadingSystem::new();
    let overlapping = vec![
        ClosureField::new("a", FieldType::Float3, 0),
        ClosureField::new("b", FieldType::Float, 8),
    ];
    let err = system.register_closure_type("bad", overlapping, 16).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);

    let ok = vec![
        ClosureField::new("a", FieldType::Float3, 0),
        ClosureField::new("b", FieldType::Float, 12),
    ];
    let id = system.register_closure_type("good", ok, 16).unwrap();
    let descriptor = system.closure_registry().descriptor(id).unwrap();
    assert_eq!(descriptor.name, "good");
    assert_eq!(descriptor.size, 16);
}

#[test]
fn ids_are_distinct_and_stable_under_concurrent_registration() {
    let system = ShadingSystem::new();
    let names: Vec<String> = (0..16).map(|i| format!("closure_{i}")).collect();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let system = &system;
            let names = &names;
            s.spawn(move || {
                for name in names {
                    system.register_closure_layout(name, lambert()).unwrap();
                }
            });
        }
    });

    let registry = system.closure_registry();
    assert_eq!(registry.len(), names.len());
    let mut ids: Vec<_> = names.iter().map(|n| registry.lookup(n).unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), names.len());
}
