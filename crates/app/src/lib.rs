use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use img2tensor_core::config::{config_path, LoggingConfig, PluginConfig, DEFAULT_LOG_FILTER};
use img2tensor_core::descriptor::describe_kernels;
use img2tensor_core::graph::{Context, DataRef, Graph, NodeHandle};
use img2tensor_core::kernels::image_to_tensor::{convert_image_to_tensor_node, PARAM_FLAGS};
use img2tensor_core::logging::{self, FileSinkPlan, LoggingInitOptions};
use img2tensor_core::node::Target;
use img2tensor_core::types::{DataType, ImageDescriptor, PixelFormat, ScalarValue, TensorDescriptor};

#[derive(Parser)]
#[command(
    name = "img2tensor",
    about = "Synthesize and run the image-to-tensor conversion kernel"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Path to the TOML config file")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the published kernel descriptors as JSON
    Describe,
    /// Verify a one-node graph and print the generated OpenCL program
    Codegen(CodegenArgs),
    /// Convert a raw interleaved RGB file on the host
    Convert(ConvertArgs),
}

#[derive(Args, Debug, Clone)]
struct ShapeArgs {
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long, default_value_t = 3)]
    channels: usize,
    #[arg(long, default_value_t = 0, help = "Conversion flags (bit 0 reverses channel order)")]
    flags: u32,
}

#[derive(Args, Debug, Clone)]
struct CodegenArgs {
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(long, default_value = "rgb")]
    format: String,
    #[arg(long, help = "Print geometry and invocation arguments as JSON")]
    json: bool,
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct ConvertArgs {
    #[arg(short = 'i', long, help = "Raw interleaved 3-byte-per-pixel image")]
    input: PathBuf,
    #[command(flatten)]
    shape: ShapeArgs,
    #[arg(short = 'o', long, help = "Destination for little-endian f32 planar data")]
    output: PathBuf,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let cfg_path = config_path(cli.config.as_deref());
    let loaded = PluginConfig::load_from_path(&cfg_path);
    let logging_config = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    init_logging(&logging_config, cli.verbose, cli.log_filter.as_deref());

    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            PluginConfig::default()
        }
    };
    info!(
        pid = std::process::id(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        Commands::Describe => run_describe(&config, &mut out),
        Commands::Codegen(args) => run_codegen(&config, &args, &mut out),
        Commands::Convert(args) => {
            let elements = run_convert(&config, &args)?;
            writeln!(out, "wrote {elements} f32 values to {}", args.output.display())?;
            Ok(())
        }
    }
}

fn init_logging(config: &LoggingConfig, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..LoggingInitOptions::from_config(config)
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            debug!(log_dir = %ready.log_dir.display(), "File logging enabled");
        }
        FileSinkPlan::Fallback(fallback) => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            // No configured dir is the normal CLI case.
            if let Some(attempted_log_dir) = fallback.attempted_log_dir {
                warn!(
                    attempted_log_dir = %attempted_log_dir.display(),
                    reason = %fallback.reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn run_describe(config: &PluginConfig, out: &mut dyn Write) -> Result<()> {
    let context = Context::with_published_kernels(config.clone())?;
    let summaries = describe_kernels(context.registry())?;
    serde_json::to_writer_pretty(&mut *out, &summaries).context("failed to encode kernel summary")?;
    writeln!(out)?;
    Ok(())
}

struct ConversionGraph {
    graph: Graph,
    node: NodeHandle,
    tensor: DataRef,
}

/// One conversion node bound to `image`, a `[w, h, c, 1]` float tensor and
/// the flag scalar.
fn build_conversion_graph(
    context: &Context,
    shape: &ShapeArgs,
    image: impl FnOnce(&mut Graph) -> Result<DataRef>,
) -> Result<ConversionGraph> {
    let mut graph = context.create_graph();
    let image = image(&mut graph)?;
    let tensor = graph.create_tensor(TensorDescriptor::new(
        [shape.width as usize, shape.height as usize, shape.channels, 1],
        DataType::Float32,
    ));
    let flags = graph.create_scalar(ScalarValue::Uint32(shape.flags));

    let node = convert_image_to_tensor_node(&mut graph, image, tensor)?;
    graph.set_parameter(node, PARAM_FLAGS, flags)?;

    Ok(ConversionGraph {
        graph,
        node,
        tensor,
    })
}

fn run_codegen(config: &PluginConfig, args: &CodegenArgs, out: &mut dyn Write) -> Result<()> {
    let format = PixelFormat::parse(&args.format)
        .with_context(|| format!("unknown pixel format '{}'", args.format))?;
    let context = Context::with_published_kernels(config.clone())?;
    let descriptor = ImageDescriptor::new(args.shape.width, args.shape.height, format);

    let mut built = build_conversion_graph(&context, &args.shape, |graph| {
        Ok(graph.create_image(descriptor))
    })?;
    built.graph.set_preferred_target(Target::Gpu);
    built.graph.verify().context("graph verification failed")?;

    let program = built.graph.program(built.node)?;
    let rendered = if args.json {
        let mut text = serde_json::to_string_pretty(&program).context("failed to encode program")?;
        text.push('\n');
        text
    } else {
        program.output.source.clone()
    };

    match &args.output {
        Some(path) => write_output(path, rendered.as_bytes()),
        None => {
            out.write_all(rendered.as_bytes())?;
            Ok(())
        }
    }
}

/// Host conversion of a raw file; returns the number of values written.
fn run_convert(config: &PluginConfig, args: &ConvertArgs) -> Result<usize> {
    let mut config = config.clone();
    config.host.fallback = true;
    config.graph.preferred_target = Target::Cpu;

    let data = fs::read(&args.input)
        .with_context(|| format!("failed to read input image: {}", args.input.display()))?;
    let context = Context::with_published_kernels(config)?;
    let descriptor = ImageDescriptor::new(args.shape.width, args.shape.height, PixelFormat::Rgb);

    let mut built = build_conversion_graph(&context, &args.shape, |graph| {
        Ok(graph.create_image_with_data(descriptor, data)?)
    })?;
    built.graph.process().context("host conversion failed")?;

    let tensor = built
        .graph
        .tensor(built.tensor)
        .and_then(|tensor| tensor.data.as_ref())
        .context("conversion produced no tensor data")?;

    let mut bytes = Vec::with_capacity(tensor.len() * std::mem::size_of::<f32>());
    for value in tensor.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    write_output(&args.output, &bytes)?;

    info!(
        elements = tensor.len(),
        output = %args.output.display(),
        "Host conversion finished"
    );
    Ok(tensor.len())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write output: {}", path.display()))
}
