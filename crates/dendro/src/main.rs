use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, CellAlignment, ContentArrangement, Table};
use dendro_core::config::Settings;
use dendro_core::estimator::CommandEstimatorFactory;
use dendro_core::jobs::{JobClient, JobDefinition, JobRequiredResources, JobSubmission, SpoolJobClient};
use dendro_core::object_store::ObjectStore;
use dendro_core::photon_flux::{run_photon_flux_job, PhotonFluxParams};
use dendro_core::processors::{
    find_processor, registry_json, PHOTON_FLUX_APP, PHOTON_FLUX_PROCESSOR, VOLUSEG_APP,
    VOLUSEG_PROCESSOR,
};
use dendro_core::series::SeriesIndex;
use dendro_core::voluseg::{run_segmentation, CommandSegmentationBackend, VolusegParams};
use dendro_nwb::LindiFile;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dendro imaging processors", long_about = None)]
struct Cli {
    /// TOML settings file; DENDRO_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate photon flux for the imaging series of an NWB (LINDI) file
    PhotonFlux(PhotonFluxArgs),
    /// Run voluseg volumetric segmentation on an NWB file
    Voluseg(VolusegArgs),
    /// List the imaging series found in an NWB (LINDI) file
    ListSeries(ListSeriesArgs),
    /// Print the app and processor registry as JSON
    Spec,
    /// Validate a job definition and submit it to the job spool
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct ProcessorInput {
    /// http(s) URL, file:// URL or path of the input file
    #[arg(long)]
    input: String,

    /// JSON object with processor parameters
    #[arg(long)]
    context: Option<PathBuf>,

    /// Parameter override as name=value, value parsed as JSON when possible
    #[arg(long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,
}

#[derive(Args, Debug)]
struct PhotonFluxArgs {
    #[command(flatten)]
    input: ProcessorInput,

    /// Path of the imaging series to process
    #[arg(long)]
    series_path: Option<String>,

    /// Comma-separated frame indices used for estimation
    #[arg(long, value_delimiter = ',')]
    subset_frames: Option<Vec<usize>>,

    /// Pixels cropped from each edge: top,bottom,left,right
    #[arg(long, value_delimiter = ',')]
    crop_edges: Option<Vec<usize>>,

    /// Process every imaging series when no series path is given
    #[arg(long)]
    all_series: bool,

    /// File base name of the uploaded output
    #[arg(long, default_value = "output.json")]
    output_name: String,

    /// Job identifier used in the upload key
    #[arg(long, default_value = "local")]
    job_id: String,
}

#[derive(Args, Debug)]
struct VolusegArgs {
    #[command(flatten)]
    input: ProcessorInput,
}

#[derive(Args, Debug)]
struct ListSeriesArgs {
    /// URL or path of the input file
    #[arg(long)]
    input: String,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// JSON job definition (appName, processorName, inputFiles, outputFiles, parameters)
    #[arg(long)]
    definition: PathBuf,

    /// Service receiving the job; defaults to the configured service name
    #[arg(long)]
    service_name: Option<String>,

    #[arg(long, default_value_t = 2)]
    num_cpus: u32,

    #[arg(long, default_value_t = 0)]
    num_gpus: u32,

    #[arg(long, default_value_t = 4.0)]
    memory_gb: f64,

    #[arg(long, default_value_t = 3600.0)]
    time_sec: f64,

    /// Compute client allowed to run the job (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Run even when a cached result exists
    #[arg(long)]
    skip_cache: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Command::PhotonFlux(args) => photon_flux(&settings, args),
        Command::Voluseg(args) => voluseg(&settings, args),
        Command::ListSeries(args) => list_series(&args.input),
        Command::Spec => {
            println!("{}", serde_json::to_string_pretty(&registry_json())?);
            Ok(())
        }
        Command::Submit(args) => submit(&settings, args),
    }
}

fn photon_flux(settings: &Settings, args: PhotonFluxArgs) -> Result<()> {
    let mut parameters = args.input.parameters()?;
    if let Some(path) = args.series_path {
        parameters.insert("series_path".to_string(), Value::from(path));
    }
    if let Some(frames) = args.subset_frames {
        parameters.insert("subset_frames".to_string(), Value::from(frames));
    }
    if let Some(crop) = args.crop_edges {
        parameters.insert("crop_edges".to_string(), Value::from(crop));
    }
    if args.all_series {
        parameters.insert("process_all_series".to_string(), Value::Bool(true));
    }

    let processor = find_processor(PHOTON_FLUX_APP, PHOTON_FLUX_PROCESSOR)?;
    let resolved = processor.resolve_parameters(parameters.iter().map(|(k, v)| (k.as_str(), v)))?;
    let params = PhotonFluxParams::from_parameters(&resolved)?;

    let factory = CommandEstimatorFactory::from_command(
        &settings.estimator_command,
        settings.work_dir.clone(),
    )
    .ok_or_else(|| {
        anyhow!("no estimator configured; set estimator_command or DENDRO_ESTIMATOR_COMMAND")
    })?;
    let store = ObjectStore::from_output_dir(settings.output_dir.as_deref());
    let key = ObjectStore::output_key(&args.job_id, &args.output_name);

    let output = {
        let file = open_input(&args.input.input)?;
        run_photon_flux_job(&file, &params, &factory, settings, &store, &key)?
    };

    for failure in &output.failures {
        warn!(series = %failure.series_path, message = %failure.message, "series skipped");
    }
    info!(
        path = %output.path.display(),
        key = %output.receipt.key,
        blake3 = %output.receipt.blake3,
        stored = output.receipt.stored,
        "photon flux output written"
    );
    Ok(())
}

fn voluseg(settings: &Settings, args: VolusegArgs) -> Result<()> {
    let parameters = args.input.parameters()?;
    let processor = find_processor(VOLUSEG_APP, VOLUSEG_PROCESSOR)?;
    let resolved = processor.resolve_parameters(parameters.iter().map(|(k, v)| (k.as_str(), v)))?;
    let params = VolusegParams::from_parameters(&resolved)?;

    let mut backend = CommandSegmentationBackend::from_command(
        &settings.segmentation_command,
        settings.voluseg_output_dir.clone(),
    )
    .ok_or_else(|| {
        anyhow!(
            "no segmentation command configured; set segmentation_command or DENDRO_SEGMENTATION_COMMAND"
        )
    })?;

    let report = run_segmentation(
        &mut backend,
        &params,
        &args.input.input,
        &settings.dir_ants,
        &settings.voluseg_output_dir,
    )?;
    info!(steps = report.completed_steps.len(), "voluseg finished");
    Ok(())
}

fn list_series(input: &str) -> Result<()> {
    let file = open_input(input)?;
    let index = SeriesIndex::build(&file);
    if index.is_empty() {
        warn!(input, "no imaging series found");
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Type", "Frames", "Width", "Height", "Rate (Hz)"]);
    for series in index.iter() {
        let [frames, width, height] = series.shape;
        table.add_row(vec![
            Cell::new(&series.path),
            Cell::new(&series.neurodata_type),
            Cell::new(frames).set_alignment(CellAlignment::Right),
            Cell::new(width).set_alignment(CellAlignment::Right),
            Cell::new(height).set_alignment(CellAlignment::Right),
            Cell::new(
                series
                    .rate
                    .map(|rate| format!("{rate:.3}"))
                    .unwrap_or_else(|| "-".to_string()),
            )
            .set_alignment(CellAlignment::Right),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn submit(settings: &Settings, args: SubmitArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.definition)
        .with_context(|| format!("failed to read {}", args.definition.display()))?;
    let job_definition: JobDefinition = serde_json::from_str(&text)
        .with_context(|| format!("invalid job definition {}", args.definition.display()))?;

    let submission = JobSubmission {
        service_name: args.service_name.unwrap_or_else(|| settings.service_name.clone()),
        job_definition,
        required_resources: JobRequiredResources {
            num_cpus: args.num_cpus,
            num_gpus: args.num_gpus,
            memory_gb: args.memory_gb,
            time_sec: args.time_sec,
        },
        target_compute_client_ids: args.targets,
        tags: args.tags,
        skip_cache: args.skip_cache,
    };

    let client = SpoolJobClient::new(&settings.job_spool_dir, &settings.job_base_url);
    let handle = client.submit(&submission)?;
    println!("{} {}", handle.job_url, serde_json::to_string(&handle.status)?.trim_matches('"'));
    Ok(())
}

fn open_input(input: &str) -> Result<LindiFile> {
    LindiFile::open(input).with_context(|| format!("failed to open {input}"))
}

impl ProcessorInput {
    /// Context file parameters with `--param` overrides applied.
    fn parameters(&self) -> Result<Map<String, Value>> {
        let mut parameters = match &self.context {
            Some(path) => read_context(path)?,
            None => Map::new(),
        };
        for entry in &self.params {
            let (name, raw) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("parameter '{entry}' must look like name=value"))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw));
            parameters.insert(name.trim().to_string(), value);
        }
        Ok(parameters)
    }
}

fn read_context(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read context {}", path.display()))?;
    match serde_json::from_str::<Value>(&text)
        .with_context(|| format!("invalid context {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("context {} must be a JSON object", path.display()),
    }
}
