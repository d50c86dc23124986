use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kestrel_edge::format::{Graph, Model, SCHEMA_VERSION};
use kestrel_edge::ops::{OpCode, DEPLOYMENT_OPS};
use kestrel_edge::plan::MemoryPlan;
use kestrel_edge::PipelineConfig;

const BANNER: &str = r#"
 _  _______ ____ _____ ____  _____ _
| |/ / ____/ ___|_   _|  _ \| ____| |
| ' /|  _| \___ \ | | | |_) |  _| | |
| . \| |___ ___) || | |  _ <| |___| |___
|_|\_\_____|____/ |_| |_| \_\_____|_____|"#;

#[derive(Parser)]
#[command(
    name = "kestrel",
    about = "Kestrel edge vision inference tools",
    long_about = "Inspect .kstl models and size their tensor arena before flashing.\n\nThe device firmware embeds the model and a fixed arena; these commands\ncheck ahead of time that the two fit together.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show schema version, tensors and operators of a model
    Inspect {
        /// Path to a .kstl model
        model: PathBuf,
    },
    /// Plan the tensor arena for a model and check it against the configuration
    Plan {
        /// Path to a .kstl model
        model: PathBuf,
        /// Pipeline configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the total arena size in bytes
        #[arg(long)]
        arena_bytes: Option<usize>,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Pipeline configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { model } => cmd_inspect(&model),
        Commands::Plan { model, config, arena_bytes } => cmd_plan(&model, config.as_deref(), arena_bytes),
        Commands::Config { config } => cmd_config(config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(p) => PipelineConfig::from_file(p)?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn read_model(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading model {}", path.display()))
}

fn parse_graph(model: &Model<'_>) -> Result<Graph> {
    if !model.is_supported() {
        bail!(
            "model is schema version {} not equal to supported version {}",
            model.version(),
            SCHEMA_VERSION
        );
    }
    Ok(model.graph()?)
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let bytes = read_model(path)?;
    let model = Model::from_bytes(&bytes)?;

    println!("{}", BANNER);
    println!("  v{}  -  model inspector\n", env!("CARGO_PKG_VERSION"));
    println!("File:    {} ({} bytes)", path.display(), model.len());
    println!("Schema:  v{} (supported: v{})", model.version(), SCHEMA_VERSION);
    println!("Blob:    {} bytes", model.blob().len());

    let graph = parse_graph(&model)?;
    println!("Graph:   {}", if graph.name.is_empty() { "<unnamed>" } else { &graph.name });

    println!("\nTensors ({})", graph.tensors.len());
    for (i, t) in graph.tensors.iter().enumerate() {
        let role = if graph.inputs.contains(&i) {
            "input"
        } else if graph.outputs.contains(&i) {
            "output"
        } else if t.is_constant() {
            "const"
        } else {
            ""
        };
        let quant = t
            .quant
            .map(|q| format!("scale={} zp={}", q.scale, q.zero_point))
            .unwrap_or_default();
        println!(
            "  {:>3} {:<24} {:<4} {:<18} {:>8}B {:<6} {}",
            i,
            t.name,
            t.dtype,
            format!("{:?}", t.shape.as_slice()),
            t.nbytes(),
            role,
            quant
        );
    }

    println!("\nOperators ({} ops)", graph.ops.len());
    for name in graph.operator_names() {
        let count = graph.ops.iter().filter(|n| n.op == name).count();
        let known = if OpCode::from_str(name).is_some() { "" } else { "  (unknown)" };
        println!("  {:<20} x{}{}", name, count, known);
    }

    let plan = MemoryPlan::compute(&graph);
    println!("\nArena:   {} bytes required ({:.1} KiB)", plan.required_bytes(), plan.required_kib());
    Ok(())
}

fn cmd_plan(path: &Path, config_path: Option<&Path>, arena_bytes: Option<usize>) -> Result<()> {
    let config = load_config(config_path)?;
    let capacity = arena_bytes.unwrap_or_else(|| config.arena.total_bytes());

    let bytes = read_model(path)?;
    let model = Model::from_bytes(&bytes)?;
    let graph = parse_graph(&model)?;
    let plan = MemoryPlan::compute(&graph);

    println!("=== Kestrel Arena Plan ===");
    println!("Model:     {}", path.display());
    println!("Arena:     {} bytes (base {} + scratch {})", capacity, config.arena.base_bytes, config.arena.scratch_bytes);
    println!("Required:  {} bytes in {} tensors", plan.required_bytes(), plan.num_planned());
    println!();

    println!("{:<4} {:<24} {:>8} {:>8} {:>10}", "#", "Tensor", "Offset", "Bytes", "Live");
    println!("{}", "-".repeat(58));
    for (i, t) in graph.tensors.iter().enumerate() {
        if let Some(p) = plan.placement(i) {
            println!(
                "{:<4} {:<24} {:>8} {:>8} {:>10}",
                i,
                t.name,
                p.offset,
                p.size,
                format!("{}..={}", p.first_use, p.last_use)
            );
        }
    }
    println!();

    let missing: Vec<&str> = graph
        .operator_names()
        .into_iter()
        .filter(|name| !OpCode::from_str(name).is_some_and(|op| DEPLOYMENT_OPS.contains(&op)))
        .collect();

    let fits = plan.fits(capacity);
    match &fits {
        Ok(()) => println!(
            "Fits: {} bytes spare for kernel scratch",
            capacity.saturating_sub(plan.scratch_offset())
        ),
        Err(e) => println!("Does not fit: {}", e),
    }
    if missing.is_empty() {
        println!("Operators: all covered by the deployment registry");
    } else {
        println!("Operators: not in the deployment registry: {}", missing.join(", "));
    }

    fits?;
    if !missing.is_empty() {
        bail!("{} operator(s) would fail with UnsupportedOperator", missing.len());
    }
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
