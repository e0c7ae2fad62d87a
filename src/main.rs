use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use shade_forge::{
    ClosureLayout, FieldType, ShaderTemplate, ShadingContext, ShadingError, ShadingSystem, ShadingSystemConfig, dsl,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default, Clone)]
struct Cli {
    check: Option<PathBuf>,
    group_json: Option<PathBuf>,
    shader_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    closures: Option<PathBuf>,
}

/// One field of a closure type in a `--closures` file:
/// `{ "diffuse": [{ "name": "albedo", "type": "float3" }] }`.
#[derive(Debug, Deserialize)]
struct FieldDecl {
    name: String,
    #[serde(rename = "type")]
    ty: FieldType,
}

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--check" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --check"));
                };
                cli.check = Some(PathBuf::from(v));
                i += 2;
            }
            "--group-json" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --group-json"));
                };
                cli.group_json = Some(PathBuf::from(v));
                i += 2;
            }
            "--shader-dir" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --shader-dir"));
                };
                cli.shader_dir = Some(PathBuf::from(v));
                i += 2;
            }
            "--config" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --config"));
                };
                cli.config = Some(PathBuf::from(v));
                i += 2;
            }
            "--closures" => {
                let Some(v) = args.get(i + 1) else {
                    return Err(anyhow!("missing value for --closures"));
                };
                cli.closures = Some(PathBuf::from(v));
                i += 2;
            }
            other => {
                return Err(anyhow!(
                    "unknown argument: {other} (supported: --check <shader.tsl>, --group-json <group.json>, --shader-dir <dir>, --closures <closures.json>, --config <config.json>)"
                ));
            }
        }
    }
    Ok(cli)
}

fn template_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a template name from {}", path.display()))
}

fn compile_file(ctx: &mut ShadingContext, path: &Path) -> Result<ShaderTemplate> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read shader source {}", path.display()))?;
    let name = template_name(path)?;
    let mut unit = ctx.begin_shader_unit_template(&name)?;
    ctx.compile_shader_unit_template(&mut unit, &source)
        .with_context(|| format!("failed to compile {}", path.display()))?;
    ctx.end_shader_unit_template(&mut unit)?;
    Ok(ShaderTemplate::from(unit))
}

fn register_closures(system: &ShadingSystem, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read closure declarations at {}", path.display()))?;
    let decls: HashMap<String, Vec<FieldDecl>> = serde_json::from_str(&text)
        .with_context(|| format!("invalid closure declarations in {}", path.display()))?;
    let mut names: Vec<&String> = decls.keys().collect();
    names.sort();
    for name in names {
        let layout = decls[name]
            .iter()
            .fold(ClosureLayout::new(), |layout, f| layout.field(f.name.as_str(), f.ty));
        system
            .register_closure_layout(name, layout)
            .with_context(|| format!("failed to register closure type '{name}'"))?;
    }
    Ok(())
}

fn run_check(system: &ShadingSystem, path: &Path) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read shader source {}", path.display()))?;
    let mut ctx = system.make_shading_context();
    let mut unit = ctx.begin_shader_unit_template(&template_name(path)?)?;
    match ctx.compile_shader_unit_template(&mut unit, &source) {
        Ok(()) => {}
        Err(ShadingError::Compile { diagnostics, .. }) => {
            for d in &diagnostics {
                println!("{}:{d}", path.display());
            }
            bail!("{} failed to compile ({} errors)", path.display(), diagnostics.len());
        }
        Err(other) => return Err(other.into()),
    }
    println!("[check] {} ok", unit.name());
    for p in unit.params() {
        println!("  {} {} {}", p.direction, p.ty, p.name);
    }
    Ok(())
}

fn load_library(ctx: &mut ShadingContext, dir: &Path) -> Result<HashMap<String, ShaderTemplate>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list shader dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "tsl"))
        .collect();
    paths.sort();

    let mut library = HashMap::new();
    for path in paths {
        let template = compile_file(ctx, &path)?;
        library.insert(template.name().to_string(), template);
    }
    Ok(library)
}

fn run_group(system: &ShadingSystem, group_path: &Path, shader_dir: &Path) -> Result<()> {
    let desc = dsl::load_group_from_path(group_path)?;
    let mut ctx = system.make_shading_context();
    let library = load_library(&mut ctx, shader_dir)?;
    let group = ctx.build_shader_group(&desc, &library)?;
    println!("[group] {} order: {}", group.name(), group.evaluation_order().join(" -> "));
    if !group.pruned_units().is_empty() {
        println!("[group] pruned: {}", group.pruned_units().join(", "));
    }

    let template = ShaderTemplate::from(group);
    let mut instance = ctx.make_shader_instance(&template);
    let function = ctx.resolve_shader_instance(&mut instance)?;
    println!("[group] resolved {}", function.name());
    for p in function.params() {
        println!("  {} {} {}", p.direction, p.ty, p.name);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&args)?;

    let config = match &cli.config {
        Some(path) => ShadingSystemConfig::load_from_path(path)?,
        None => ShadingSystemConfig::default(),
    };
    let system = ShadingSystem::builder().config(config).build();
    if let Some(path) = &cli.closures {
        register_closures(&system, path)?;
    }

    if let Some(path) = &cli.check {
        return run_check(&system, path);
    }
    if let Some(group_path) = &cli.group_json {
        let shader_dir = cli
            .shader_dir
            .as_deref()
            .ok_or_else(|| anyhow!("--group-json requires --shader-dir <dir>"))?;
        return run_group(&system, group_path, shader_dir);
    }
    Err(anyhow!("nothing to do (use --check <shader.tsl> or --group-json <group.json> --shader-dir <dir>)"))
}
