use std::sync::Arc;

use parking_lot::Mutex;
use shade_forge::{
    ArgDescriptor, ClosureArena, ClosureLayout, ClosureNode, ClosureSlot, DebugLevel, ErrorKind,
    FieldType, Float3, GlobalBlock, GlobalLayout, ShaderTemplate, ShadingContext, ShadingError,
    ShadingSystem, ShadingSystemInterface, TextureHandle, Value, ValueType,
};

fn compile(ctx: &mut ShadingContext, name: &str, source: &str) -> ShaderTemplate {
    let mut unit = ctx.begin_shader_unit_template(name).unwrap();
    ctx.compile_shader_unit_template(&mut unit, source).unwrap();
    ctx.end_shader_unit_template(&mut unit).unwrap();
    unit.into()
}

fn lambert_system() -> ShadingSystem {
    let system = ShadingSystem::new();
    system.register_globals(
        GlobalLayout::from_vars([
            ("base_color", ValueType::Float3),
            ("center", ValueType::Float3),
            ("flip_normal", ValueType::Bool),
        ])
        .unwrap(),
    );
    system
        .register_closure_layout(
            "lambert",
            ClosureLayout::new()
                .field("base_color", FieldType::Float3)
                .field("center", FieldType::Float3)
                .field("flip_normal", FieldType::Bool),
        )
        .unwrap();
    system
}

const LAMBERT: &str = "
shader lambert_surface(out closure bsdf) {
    bsdf = make_closure<lambert>(
        global_value<base_color>,
        global_value<center>,
        global_value<flip_normal>);
}
";

#[test]
fn lambert_closure_carries_globals_unchanged() {
    let system = lambert_system();
    let lambert_id = system.closure_registry().lookup("lambert").unwrap();
    let mut ctx = system.make_shading_context();
    let template = compile(&mut ctx, "lambert_surface", LAMBERT);

    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();
    assert!(instance.is_resolved());

    let mut globals = GlobalBlock::new(&system.global_layout());
    globals.set("base_color", Float3::new(1.0, 0.0, 0.0)).unwrap();
    globals.set("center", Float3::ZERO).unwrap();
    globals.set("flip_normal", false).unwrap();

    let mut arena = ClosureArena::new();
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &globals);

    let Some(ClosureNode::Leaf(leaf)) = slot.root_node() else {
        panic!("expected a single closure leaf");
    };
    assert_eq!(leaf.id, lambert_id);
    let record = leaf.record(system.closure_registry()).unwrap();
    assert_eq!(record.get("base_color").unwrap(), Value::Float3(Float3::new(1.0, 0.0, 0.0)));
    assert_eq!(record.get("center").unwrap(), Value::Float3(Float3::ZERO));
    assert_eq!(record.get("flip_normal").unwrap(), Value::Bool(false));
}

#[test]
fn resolving_twice_returns_the_same_entry_point() {
    let system = lambert_system();
    let mut ctx = system.make_shading_context();
    let template = compile(&mut ctx, "lambert_surface", LAMBERT);
    let mut instance = ctx.make_shader_instance(&template);
    let first = ctx.resolve_shader_instance(&mut instance).unwrap();
    let second = ctx.resolve_shader_instance(&mut instance).unwrap();
    assert_eq!(first.name(), second.name());
    assert_eq!(first.params(), second.params());
    assert!(Arc::ptr_eq(first.global_layout(), second.global_layout()));
}

#[test]
fn unbound_input_in_a_two_unit_group_names_the_parameter() {
    let system = ShadingSystem::new();
    system
        .register_closure_layout("diffuse", ClosureLayout::new().field("albedo", FieldType::Float3))
        .unwrap();
    let mut ctx = system.make_shading_context();
    let tint = compile(&mut ctx, "tint", "shader tint(out color c) { c = float3(1, 0, 0); }");
    let surface = compile(
        &mut ctx,
        "surface",
        "shader surface(color base, float roughness, out closure bsdf) {
            bsdf = make_closure<diffuse>(base * roughness);
        }",
    );

    let mut group = ctx.begin_shader_group_template("tinted").unwrap();
    group.add_unit("A", tint, false).unwrap();
    group.add_unit("B", surface, true).unwrap();
    group.connect("A", "c", "B", "base").unwrap();
    group
        .expose_argument("B", "bsdf", ArgDescriptor::output("bsdf", ValueType::Closure))
        .unwrap();

    let err = ctx.end_shader_group_template(&mut group).unwrap_err();
    assert_eq!(
        err,
        ShadingError::UnboundInput {
            group: "tinted".into(),
            unit: "B".into(),
            param: "roughness".into(),
        }
    );

    // Supplying the default makes the same group freezable.
    group.init_input_default("B", "roughness", 0.5f32).unwrap();
    ctx.end_shader_group_template(&mut group).unwrap();
    assert_eq!(group.evaluation_order(), vec!["A", "B"]);

    let template = ShaderTemplate::from(group);
    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();

    let mut arena = ClosureArena::new();
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &GlobalBlock::new(&system.global_layout()));
    let leaves = slot.weighted_leaves();
    assert_eq!(leaves.len(), 1);
    let record = leaves[0].1.record(system.closure_registry()).unwrap();
    assert_eq!(record.get("albedo").unwrap(), Value::Float3(Float3::new(0.5, 0.0, 0.0)));
}

#[test]
fn failed_compile_never_yields_an_entry_point() {
    let system = ShadingSystem::new();
    let mut ctx = system.make_shading_context();
    let mut unit = ctx.begin_shader_unit_template("broken").unwrap();
    let err = ctx
        .compile_shader_unit_template(&mut unit, "shader broken(out float o) { o = nope; }")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert_eq!(unit.diagnostics().len(), 1);

    let template = ShaderTemplate::from(unit);
    let mut instance = ctx.make_shader_instance(&template);
    let err = ctx.resolve_shader_instance(&mut instance).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert!(instance.function().is_none());

    let mut group = ctx.begin_shader_group_template("wraps_broken").unwrap();
    let err = group.add_unit("b", template.clone(), true).unwrap_err();
    assert!(matches!(err, ShadingError::Compile { .. }));
}

#[test]
fn unregistered_closure_fails_resolution_with_a_type_error() {
    let system = ShadingSystem::new();
    let mut ctx = system.make_shading_context();
    let template = compile(
        &mut ctx,
        "ghost",
        "shader ghost(out closure c) { c = make_closure<phantom>(1.0); }",
    );
    let mut instance = ctx.make_shader_instance(&template);
    let err = ctx.resolve_shader_instance(&mut instance).unwrap_err();
    assert_eq!(err, ShadingError::UnknownClosureType("phantom".into()));
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn closure_arguments_must_match_the_registered_fields() {
    let system = lambert_system();
    let mut ctx = system.make_shading_context();
    let template = compile(
        &mut ctx,
        "short",
        "shader short(out closure c) { c = make_closure<lambert>(global_value<base_color>); }",
    );
    let mut instance = ctx.make_shader_instance(&template);
    let err = ctx.resolve_shader_instance(&mut instance).unwrap_err();
    assert!(matches!(err, ShadingError::ClosureArgumentMismatch { .. }));
}

#[derive(Default)]
struct Host {
    reports: Mutex<Vec<(DebugLevel, String)>>,
}

const ALBEDO: TextureHandle = TextureHandle(7);

impl ShadingSystemInterface for Host {
    fn report(&self, level: DebugLevel, message: &str) {
        self.reports.lock().push((level, message.to_string()));
    }

    fn sample_2d(&self, texture: TextureHandle, u: f32, v: f32) -> Float3 {
        if texture == ALBEDO {
            Float3::new(u, v, 0.5)
        } else {
            Float3::ZERO
        }
    }

    fn sample_alpha_2d(&self, texture: TextureHandle, _u: f32, _v: f32) -> f32 {
        if texture == ALBEDO { 0.25 } else { 0.0 }
    }
}

#[test]
fn layered_closures_and_textures_go_through_the_host() {
    let host = Arc::new(Host::default());
    let system = ShadingSystem::with_interface(host.clone());
    system
        .register_closure_layout("diffuse", ClosureLayout::new().field("albedo", FieldType::Float3))
        .unwrap();

    let mut ctx = system.make_shading_context();
    let mut unit = ctx.begin_shader_unit_template("layered").unwrap();
    unit.register_texture("albedo", ALBEDO).unwrap();
    ctx.compile_shader_unit_template(
        &mut unit,
        "shader layered(float w = 0.25, out closure c) {
            color tex = texture2d_sample<albedo>(0.5, 0.75);
            float a = texture2d_sample_alpha<albedo>(0, 0);
            closure d = make_closure<diffuse>(tex);
            c = d * w + make_closure<diffuse>(float3(a)) * 0.5;
        }",
    )
    .unwrap();
    ctx.end_shader_unit_template(&mut unit).unwrap();
    assert!(unit.register_texture("late", TextureHandle(1)).is_err());
    let template = ShaderTemplate::from(unit);

    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();
    let mut arena = ClosureArena::new();
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &GlobalBlock::new(&system.global_layout()));

    assert!(matches!(slot.root_node(), Some(ClosureNode::Add { .. })));
    let leaves = slot.weighted_leaves();
    assert_eq!(leaves.len(), 2);
    let registry = system.closure_registry();
    assert_eq!(leaves[0].0, 0.25);
    assert_eq!(
        leaves[0].1.record(registry).unwrap().get("albedo").unwrap(),
        Value::Float3(Float3::new(0.5, 0.75, 0.5))
    );
    assert_eq!(leaves[1].0, 0.5);
    assert_eq!(
        leaves[1].1.record(registry).unwrap().get("albedo").unwrap(),
        Value::Float3(Float3::splat(0.25))
    );
    assert!(host.reports.lock().is_empty());
}

#[test]
fn mismatched_global_block_is_reported_and_leaves_the_slot_empty() {
    let host = Arc::new(Host::default());
    let system = ShadingSystem::with_interface(host.clone());
    system.register_globals(
        GlobalLayout::from_vars([
            ("base_color", ValueType::Float3),
            ("center", ValueType::Float3),
            ("flip_normal", ValueType::Bool),
        ])
        .unwrap(),
    );
    system
        .register_closure_layout(
            "lambert",
            ClosureLayout::new()
                .field("base_color", FieldType::Float3)
                .field("center", FieldType::Float3)
                .field("flip_normal", FieldType::Bool),
        )
        .unwrap();
    let mut ctx = system.make_shading_context();
    let template = compile(&mut ctx, "lambert_surface", LAMBERT);
    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();

    let mut arena = ClosureArena::new();
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &GlobalBlock::empty());
    assert_eq!(slot.root(), None);

    let reports = host.reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, DebugLevel::Error);
}

#[test]
fn exhausted_arena_is_reported_not_fatal() {
    let host = Arc::new(Host::default());
    let system = ShadingSystem::with_interface(host.clone());
    system
        .register_closure_layout("diffuse", ClosureLayout::new().field("albedo", FieldType::Float3))
        .unwrap();
    let mut ctx = system.make_shading_context();
    let template = compile(
        &mut ctx,
        "plain",
        "shader plain(out closure c) { c = make_closure<diffuse>(float3(1)); }",
    );
    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();

    let mut arena = ClosureArena::with_limit(4);
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &GlobalBlock::new(&system.global_layout()));
    assert_eq!(slot.root(), None);
    assert!(host.reports.lock().iter().any(|(l, m)| *l == DebugLevel::Error && m.contains("plain")));
}

#[test]
fn groups_nest_inside_groups() {
    let system = ShadingSystem::new();
    system
        .register_closure_layout("diffuse", ClosureLayout::new().field("albedo", FieldType::Float3))
        .unwrap();
    let mut ctx = system.make_shading_context();
    let scale = compile(
        &mut ctx,
        "scale",
        "shader scale(color c = float3(1), float k = 2, out color o) { o = c * k; }",
    );
    let surface = compile(
        &mut ctx,
        "surface",
        "shader surface(color base, out closure bsdf) { bsdf = make_closure<diffuse>(base); }",
    );

    let mut inner = ctx.begin_shader_group_template("double").unwrap();
    inner.add_unit("s1", scale.clone(), false).unwrap();
    inner.add_unit("s2", scale.clone(), true).unwrap();
    inner.connect("s1", "o", "s2", "c").unwrap();
    inner
        .expose_argument("s1", "c", ArgDescriptor::input("color", ValueType::Float3))
        .unwrap();
    inner
        .expose_argument("s2", "o", ArgDescriptor::output("out", ValueType::Float3))
        .unwrap();
    ctx.end_shader_group_template(&mut inner).unwrap();
    assert_eq!(inner.params().len(), 2);

    let mut outer = ctx.begin_shader_group_template("quadrupled").unwrap();
    outer.add_unit("x4", inner, false).unwrap();
    outer.add_unit("surf", surface, true).unwrap();
    outer.connect("x4", "out", "surf", "base").unwrap();
    outer
        .init_input_default("x4", "color", Float3::new(0.25, 0.5, 1.0))
        .unwrap();
    outer
        .expose_argument("surf", "bsdf", ArgDescriptor::output("bsdf", ValueType::Closure))
        .unwrap();
    ctx.end_shader_group_template(&mut outer).unwrap();

    let template = ShaderTemplate::from(outer);
    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();

    let mut arena = ClosureArena::new();
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &GlobalBlock::new(&system.global_layout()));
    let leaves = slot.weighted_leaves();
    assert_eq!(leaves.len(), 1);
    assert_eq!(
        leaves[0].1.record(system.closure_registry()).unwrap().get("albedo").unwrap(),
        Value::Float3(Float3::new(1.0, 2.0, 4.0))
    );
}

#[test]
fn many_layered_closures_all_reach_the_host() {
    let system = ShadingSystem::new();
    system
        .register_closure_layout("diffuse", ClosureLayout::new().field("albedo", FieldType::Float3))
        .unwrap();
    let mut ctx = system.make_shading_context();

    let mut source = String::from("shader deep(out closure c) {\n    c = make_closure<diffuse>(float3(0));\n");
    for i in 1..80 {
        source.push_str(&format!("    c = c + make_closure<diffuse>(float3({i}));\n"));
    }
    source.push('}');
    let template = compile(&mut ctx, "deep", &source);

    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();
    let mut arena = ClosureArena::new();
    let mut slot = ClosureSlot::new(&mut arena);
    function.invoke(&mut slot, &GlobalBlock::new(&system.global_layout()));

    let leaves = slot.weighted_leaves();
    assert_eq!(leaves.len(), 80);
    let last = leaves[79].1.record(system.closure_registry()).unwrap();
    assert_eq!(last.get("albedo").unwrap(), Value::Float3(Float3::new(79.0, 79.0, 79.0)));
}

#[test]
fn runaway_nesting_is_a_compile_error() {
    let system = ShadingSystem::new();
    let mut ctx = system.make_shading_context();
    let mut unit = ctx.begin_shader_unit_template("nested").unwrap();
    let source = format!(
        "shader nested(out float o) {{ o = {}1.0{}; }}",
        "(".repeat(2000),
        ")".repeat(2000)
    );
    let err = ctx.compile_shader_unit_template(&mut unit, &source).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert!(unit.diagnostics()[0].message.contains("nests too deeply"));
}
