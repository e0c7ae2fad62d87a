use std::thread;

use shade_forge::{
    ClosureArena, ClosureLayout, ClosureNode, ClosureSlot, FieldType, Float3, GlobalBlock, GlobalLayout,
    ShaderTemplate, ShadingSystem, Value, ValueType,
};

const THREADS: usize = 8;
const POINTS_PER_THREAD: usize = 64;

#[test]
fn one_entry_point_serves_many_threads() {
    let system = ShadingSystem::builder()
        .globals(GlobalLayout::from_vars([("base_color", ValueType::Float3), ("weight", ValueType::Float)]).unwrap())
        .build();
    system
        .register_closure_layout("diffuse", ClosureLayout::new().field("albedo", FieldType::Float3))
        .unwrap();

    let mut ctx = system.make_shading_context();
    let mut unit = ctx.begin_shader_unit_template("weighted").unwrap();
    ctx.compile_shader_unit_template(
        &mut unit,
        "shader weighted(out closure c) {
            c = make_closure<diffuse>(global_value<base_color>) * global_value<weight>;
        }",
    )
    .unwrap();
    ctx.end_shader_unit_template(&mut unit).unwrap();
    let template = ShaderTemplate::from(unit);
    let mut instance = ctx.make_shader_instance(&template);
    // Resolve before publishing the entry point to the workers.
    let function = ctx.resolve_shader_instance(&mut instance).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded::<(usize, usize, f32, Value)>();
    let layout = system.global_layout();
    thread::scope(|s| {
        for worker in 0..THREADS {
            let function = function.clone();
            let layout = layout.clone();
            let tx = tx.clone();
            let system = &system;
            s.spawn(move || {
                let mut arena = ClosureArena::new();
                let mut globals = GlobalBlock::new(&layout);
                for point in 0..POINTS_PER_THREAD {
                    arena.reset();
                    let color = Float3::new(worker as f32, point as f32, 1.0);
                    globals.set("base_color", color).unwrap();
                    globals.set("weight", 1.0 / (point as f32 + 1.0)).unwrap();

                    let mut slot = ClosureSlot::new(&mut arena);
                    function.invoke(&mut slot, &globals);
                    let Some(ClosureNode::Mul { weight, child }) = slot.root_node() else {
                        panic!("expected a weighted closure");
                    };
                    let Some(ClosureNode::Leaf(leaf)) = slot.node(child) else {
                        panic!("expected a leaf under the weight");
                    };
                    let albedo = leaf.record(system.closure_registry()).unwrap().get("albedo").unwrap();
                    tx.send((worker, point, weight, albedo)).unwrap();
                }
            });
        }
    });
    drop(tx);

    let results: Vec<_> = rx.iter().collect();
    assert_eq!(results.len(), THREADS * POINTS_PER_THREAD);
    for (worker, point, weight, albedo) in results {
        assert_eq!(weight, 1.0 / (point as f32 + 1.0));
        assert_eq!(albedo, Value::Float3(Float3::new(worker as f32, point as f32, 1.0)));
    }
}

#[test]
fn contexts_on_separate_threads_build_independently() {
    let system = ShadingSystem::new();
    system
        .register_closure_layout("emission", ClosureLayout::new().field("power", FieldType::Float))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let system = system.clone();
            thread::spawn(move || {
                let mut ctx = system.make_shading_context();
                // Every context may reuse the same template name.
                let mut unit = ctx.begin_shader_unit_template("glow").unwrap();
                let source = format!("shader glow(out closure c) {{ c = make_closure<emission>({i}.0); }}");
                ctx.compile_shader_unit_template(&mut unit, &source).unwrap();
                ctx.end_shader_unit_template(&mut unit).unwrap();
                let template = ShaderTemplate::from(unit);
                let mut instance = ctx.make_shader_instance(&template);
                let function = ctx.resolve_shader_instance(&mut instance).unwrap();

                let mut arena = ClosureArena::new();
                let mut slot = ClosureSlot::new(&mut arena);
                function.invoke(&mut slot, &GlobalBlock::new(&system.global_layout()));
                let leaves = slot.weighted_leaves();
                leaves[0].1.record(system.closure_registry()).unwrap().get("power").unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Value::Float(i as f32));
    }
    assert_eq!(system.context_count(), 4);
}
