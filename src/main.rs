// Command-line entry point for Haystack.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use haystack::api::server::Server;
use haystack::application::VisualizationService;
use haystack::config::HaystackConfig;
use haystack::domain::analysis::AnalysisParams;
use haystack::domain::hierarchy::HierarchyLevel;
use haystack::domain::view::ViewOptions;
use haystack::infrastructure::concurrency::CancellationToken;
use haystack::infrastructure::{FsGraphStore, GeneratorOptions, GeneratorRunner};
use haystack::logging;
use haystack::ports::{GenerationRequest, RenderFormat};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ./haystack.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Graph store directory
    #[arg(long, global = true, env = "HAYSTACK_GRAPH_DIR")]
    graph_dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `haystack=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the visualization service on a TCP port
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:8050
        #[arg(long, env = "HAYSTACK_BIND")]
        bind: Option<String>,

        /// Connection worker threads
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List the graphs in the store
    List,
    /// Show metadata and size of a graph
    Describe { id: String },
    /// Analyze a graph and render it
    Render {
        id: String,

        /// Output format (json, cytoscape, dot)
        #[arg(short, long, default_value = "json", value_parser = parse_format)]
        format: RenderFormat,

        /// View at a coarser level (package, type_def, method)
        #[arg(long, value_parser = parse_hierarchy)]
        hierarchy: Option<HierarchyLevel>,

        /// Community-balanced sample size
        #[arg(long)]
        max_nodes: Option<usize>,

        /// Centre the view on this node
        #[arg(long)]
        focus: Option<String>,

        #[arg(long, default_value_t = 0.85)]
        damping: f64,

        #[arg(long, default_value_t = 1.0)]
        resolution: f64,

        /// Leave edges out of the view
        #[arg(long)]
        no_edges: bool,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the call-graph generator once
    Generate {
        /// Folder or jar with the program to analyze
        #[arg(short, long)]
        input: PathBuf,

        /// Identifier of the graph to produce
        #[arg(short, long)]
        output: String,

        /// Fully qualified entry class
        #[arg(short, long)]
        main_class: Option<String>,

        /// Drop edges mentioning these words
        #[arg(long, num_args = 1..)]
        edge_filter: Vec<String>,

        /// Skip jars whose name contains these words
        #[arg(long, num_args = 1..)]
        jar_filter: Vec<String>,

        /// Regenerate even if the graph exists
        #[arg(long)]
        force: bool,
    },
}

fn parse_format(s: &str) -> Result<RenderFormat, String> {
    RenderFormat::parse(s).ok_or_else(|| format!("unknown format '{}' (json, cytoscape, dot)", s))
}

fn parse_hierarchy(s: &str) -> Result<HierarchyLevel, String> {
    HierarchyLevel::parse(s)
        .ok_or_else(|| format!("unknown hierarchy '{}' (package, type_def, method)", s))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = HaystackConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.graph_dir {
        config.store.graph_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.log_json {
        config.logging.json = true;
    }
    if let Commands::Serve { bind, workers } = &cli.command {
        if let Some(bind) = bind {
            config.server.bind = bind.clone();
        }
        if workers.is_some() {
            config.server.workers = *workers;
        }
    }
    logging::init(&config.logging)?;

    let store = FsGraphStore::open(&config.store.graph_dir)?;
    let generator = GeneratorRunner::new(store.clone(), GeneratorOptions::from(&config.generator));
    let service = Arc::new(VisualizationService::start(Arc::new(store), Arc::new(generator))?);

    match cli.command {
        Commands::Serve { .. } => {
            let server = Server::bind(
                &config.server.bind,
                Some(config.server.worker_count()),
                Arc::clone(&service),
            )?
            .with_max_connections(config.server.max_connections);
            server.run()
        }
        Commands::List => {
            for id in service.available() {
                println!("{}", id);
            }
            Ok(())
        }
        Commands::Describe { id } => {
            let summary = service.describe(&id)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::Render {
            id,
            format,
            hierarchy,
            max_nodes,
            focus,
            damping,
            resolution,
            no_edges,
            output,
        } => {
            let options = ViewOptions {
                analysis: AnalysisParams {
                    hierarchy,
                    damping,
                    resolution,
                    ..AnalysisParams::default()
                },
                max_nodes,
                include_edges: !no_edges,
                focus,
            };
            let view = service.view(&id, &options)?;
            let exporter = format.exporter();
            match output {
                Some(path) => {
                    exporter.export(&view, &path)?;
                    eprintln!(
                        "Rendered {} of {} nodes to {}",
                        view.nodes.len(),
                        view.total_nodes,
                        path.display()
                    );
                }
                None => println!("{}", exporter.render(&view)?),
            }
            Ok(())
        }
        Commands::Generate {
            input,
            output,
            main_class,
            edge_filter,
            jar_filter,
            force,
        } => {
            let request = GenerationRequest {
                input,
                output,
                main_class,
                edge_filter,
                jar_filter,
                force,
            };
            let summary = service
                .generate(&request, &CancellationToken::new())
                .with_context(|| format!("Generating graph '{}' failed", request.output))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}
