//! Schema Split CLI
//!
//! Splits a monolithic Avro schema into referenced subjects, registers them,
//! and inspects what the registry hands back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use schema_refs::registry::RegistryClient;
use schema_refs::split::{write_parts, MAX_SCHEMA_BYTES};
use schema_refs::{
    reassemble, HttpRegistryClient, ReferenceResolver, Registrar, SchemaGraph, SchemaRefsConfig, SplitOptions,
    SplitReport, Splitter, VersionSelector, WireCodec,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-split")]
#[command(about = "Split Avro schemas into referenced subjects and resolve them back")]
struct Cli {
    /// Config file (defaults to schema-refs.toml lookup)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Registry URL, overriding config and SCHEMA_REGISTRY_URL
    #[arg(long, global = true)]
    registry: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SplitArgs {
    /// Monolithic .avsc file
    #[arg(short, long)]
    file: PathBuf,

    /// Extract every named type, not only shared ones
    #[arg(long)]
    all: bool,

    /// Always extract this type (fullname or unambiguous short name)
    #[arg(long = "extract", value_name = "NAME")]
    extract: Vec<String>,

    /// Keep unmarked types smaller than this many bytes inline
    #[arg(long)]
    min_size: Option<usize>,

    /// Subject prefix for extracted types
    #[arg(long)]
    subject_prefix: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a schema would be split
    Analyze {
        #[command(flatten)]
        split: SplitArgs,

        /// Print the reference graph as DOT instead
        #[arg(long)]
        dot: bool,
    },

    /// Write the split parts and a manifest to a directory
    Extract {
        #[command(flatten)]
        split: SplitArgs,

        #[arg(short, long, default_value = "schemas")]
        output_dir: PathBuf,
    },

    /// Register the split parts, dependencies first
    Register {
        #[command(flatten)]
        split: SplitArgs,

        /// Subject for the root schema
        #[arg(short, long)]
        subject: Option<String>,

        /// Print the registration plan without contacting the registry
        #[arg(long)]
        dry_run: bool,
    },

    /// Fetch a schema with all its references resolved
    Resolve {
        /// Global schema id
        #[arg(long, conflicts_with = "subject", required_unless_present = "subject")]
        id: Option<u32>,

        #[arg(long)]
        subject: Option<String>,

        /// Version of --subject ("latest" or a number)
        #[arg(long, default_value = "latest")]
        version: String,
    },

    /// Decode a framed message file and print it as JSON
    Decode {
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = SchemaRefsConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.registry {
        config.registry.url = url;
    }

    match cli.command {
        Commands::Analyze { split, dot } => {
            let (graph, original_size) = split_file(&split, &config.split)?;
            if dot {
                println!("{}", graph.to_dot());
                return Ok(());
            }
            print_report(&graph, original_size);
            Ok(())
        }

        Commands::Extract { split, output_dir } => {
            let (graph, _) = split_file(&split, &config.split)?;
            let written = write_parts(&graph, &output_dir)?;
            for path in &written {
                println!("  {}", path.display());
            }
            println!("✅ Wrote {} file(s) to {}", written.len(), output_dir.display());
            Ok(())
        }

        Commands::Register { split, subject, dry_run } => {
            let mut options = config.split.clone();
            if subject.is_some() {
                options.root_subject = subject;
            }
            let (mut graph, _) = split_file(&split, &options)?;

            let client = Arc::new(HttpRegistryClient::new(&config.registry)?);
            let registrar = Registrar::new(client);

            if dry_run {
                let plan = registrar.plan(&graph)?;
                println!("Registration plan ({} subjects):", plan.len());
                for (position, step) in plan.steps.iter().enumerate() {
                    println!(
                        "  {}. {} -> {} ({} bytes, refs: [{}])",
                        position + 1,
                        step.fullname,
                        step.subject,
                        step.size,
                        step.references.join(", ")
                    );
                }
                return Ok(());
            }

            let registration = registrar.register_graph(&mut graph).await?;
            for node in registration.in_order() {
                println!(
                    "  ✅ {} -> {} v{} (id {})",
                    node.fullname, node.subject, node.version, node.id
                );
            }
            if let Some(id) = registration.root_id() {
                println!("Root schema id: {}", id);
            }
            Ok(())
        }

        Commands::Resolve { id, subject, version } => {
            let client: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::new(&config.registry)?);
            let resolver = ReferenceResolver::from_config(client, &config.resolver);
            let resolved = match (id, subject) {
                (Some(id), _) => resolver.resolve(id).await?,
                (None, Some(subject)) => resolver.resolve_subject(&subject, parse_version(&version)?).await?,
                (None, None) => anyhow::bail!("either --id or --subject is required"),
            };
            println!("{}", serde_json::to_string_pretty(&resolved.document)?);
            eprintln!(
                "schema id {} compiled from {} referenced schema(s)",
                resolved.id,
                resolved.dependencies.len()
            );
            Ok(())
        }

        Commands::Decode { input } => {
            let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let client: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::new(&config.registry)?);
            let codec = WireCodec::new(ReferenceResolver::from_config(client, &config.resolver));
            let decoded = codec.decode(&bytes).await?;
            let json = serde_json::Value::try_from(decoded.value).context("converting record to JSON")?;
            eprintln!("schema id {}", decoded.schema_id);
            println!("{}", serde_json::to_string_pretty(&json)?);
            Ok(())
        }
    }
}

fn split_file(args: &SplitArgs, defaults: &SplitOptions) -> anyhow::Result<(SchemaGraph, usize)> {
    let text = std::fs::read_to_string(&args.file).with_context(|| format!("reading {}", args.file.display()))?;

    let mut options = defaults.clone();
    if args.all {
        options.policy = schema_refs::ExtractionPolicy::All;
    }
    options.extract.extend(args.extract.iter().cloned());
    if let Some(min_size) = args.min_size {
        options.min_size = min_size;
    }
    if args.subject_prefix.is_some() {
        options.subject_prefix = args.subject_prefix.clone();
    }

    let graph = Splitter::new(options)
        .split_str(&text)
        .with_context(|| format!("splitting {}", args.file.display()))?;
    let original_size = reassemble(&graph)?.to_string().len();
    Ok((graph, original_size))
}

fn parse_version(version: &str) -> anyhow::Result<VersionSelector> {
    if version == "latest" {
        return Ok(VersionSelector::Latest);
    }
    let number = version
        .parse::<i32>()
        .with_context(|| format!("invalid version {:?}", version))?;
    Ok(VersionSelector::Number(number))
}

fn print_report(graph: &SchemaGraph, original_size: usize) {
    let report = SplitReport::from_graph(graph, original_size);
    println!("📊 {} -> {} part(s)", report.root, report.parts.len());
    println!("  original size: {} bytes, split total: {} bytes", report.original_size, report.total_size());
    println!();
    println!("  {:<4} {:<40} {:<40} {:>10}  {}", "#", "fullname", "subject", "bytes", "references");
    for part in &report.parts {
        let marker = if part.is_root { " (root)" } else { "" };
        println!(
            "  {:<4} {:<40} {:<40} {:>10}  {}{}",
            part.order,
            part.fullname,
            part.subject,
            part.size,
            part.references.join(", "),
            marker
        );
    }

    if let Some(largest) = report.largest() {
        println!();
        println!("  largest part: {} ({} bytes)", largest.fullname, largest.size);
    }
    for part in report.oversized(MAX_SCHEMA_BYTES) {
        println!(
            "  ⚠️  {} is {} bytes, over the {} byte registry limit",
            part.fullname, part.size, MAX_SCHEMA_BYTES
        );
    }
}
