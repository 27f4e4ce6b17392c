use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use deid_core::config::default_max_date;
use deid_core::constants::{ANNOTATIONS_SUFFIX, DEFAULT_ID_PREFIX, MODIFIED_EDF_SUFFIX};
use deid_core::{
    write_classification_report, AnnotationShifter, AnnotationStripper, CoreConfig, DeidError,
    DeidResult, EdfShifter, IdentifierSource, OffsetTable, ResultLedger, TimeMode,
};
use deid_files::{OutputService, MODIFIED_XML_DIR_NAME};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "deid")]
#[command(about = "Date-shift de-identification for EDF recordings and annotation sidecars")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shift the start date of one EDF file
    ShiftEdf {
        /// Offset table CSV (patient_identifier, random_number)
        offsets: PathBuf,
        /// EDF file to shift
        input: PathBuf,
        /// Output path (default: <input>_modified.edf next to the input)
        output: Option<PathBuf>,
        /// Print the result as one JSON line on stdout
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        header: HeaderArgs,
    },
    /// Shift createTime values of annotation sidecars by the offsets applied to their recordings
    ShiftXml {
        /// Report CSV written by the EDF stage
        #[arg(value_name = "REPORT_CSV")]
        results: PathBuf,
        /// Directory holding *-annotations.xml files
        xml_dir: PathBuf,
        /// Output directory (default: <xml_dir>/modified_xml)
        output_dir: Option<PathBuf>,
        /// Write a per-file results CSV
        #[arg(long = "report", value_name = "CSV")]
        summary_csv: Option<PathBuf>,
        #[command(flatten)]
        ids: IdentifierArgs,
    },
    /// Remove identifying attributes from annotation sidecars and classify their annotators
    StripXml {
        /// Directory holding *-annotations.xml files
        #[arg(long)]
        input_dir: PathBuf,
        /// Report CSV written by the EDF stage
        #[arg(long)]
        report_csv: PathBuf,
        /// Output directory for stripped files
        #[arg(long)]
        output_dir: PathBuf,
        /// Classification CSV (patient_identifier, annotator, creatorId, more_than_one_layer)
        #[arg(long)]
        output_csv: PathBuf,
        #[command(flatten)]
        ids: IdentifierArgs,
    },
}

#[derive(Args, Debug)]
struct IdentifierArgs {
    /// Structured identifier prefix (PREFIX-<site>-<id>-<suffix>)
    #[arg(long, default_value = DEFAULT_ID_PREFIX)]
    id_prefix: String,
}

#[derive(Args, Debug)]
struct HeaderArgs {
    /// Latest allowed new start date, YYYY-MM-DD (default: 2085-01-01)
    #[arg(long)]
    max_date: Option<NaiveDate>,
    /// preserve | shift-with-date
    #[arg(long, default_value = "preserve")]
    time_mode: TimeMode,
    /// header | filename
    #[arg(long, default_value = "header")]
    id_source: IdentifierSource,
    /// Rewrite the recording identification field as "Startdate DD-MMM-YYYY"
    #[arg(long)]
    rewrite_startdate_field: bool,
    #[command(flatten)]
    ids: IdentifierArgs,
}

impl HeaderArgs {
    fn core_config(&self) -> DeidResult<CoreConfig> {
        CoreConfig::new(
            self.max_date.unwrap_or_else(default_max_date),
            self.time_mode,
            self.id_source,
            &self.ids.id_prefix,
            self.rewrite_startdate_field,
        )
    }
}

impl IdentifierArgs {
    fn core_config(&self) -> DeidResult<CoreConfig> {
        CoreConfig::new(
            default_max_date(),
            TimeMode::default(),
            IdentifierSource::default(),
            &self.id_prefix,
            false,
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("deid=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn run(command: Commands) -> DeidResult<ExitCode> {
    match command {
        Commands::ShiftEdf {
            offsets,
            input,
            output,
            json,
            header,
        } => shift_edf(&offsets, &input, output, json, &header),
        Commands::ShiftXml {
            results,
            xml_dir,
            output_dir,
            summary_csv,
            ids,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| xml_dir.join(MODIFIED_XML_DIR_NAME));
            shift_xml(&results, &xml_dir, &output_dir, summary_csv.as_deref(), &ids)
        }
        Commands::StripXml {
            input_dir,
            report_csv,
            output_dir,
            output_csv,
            ids,
        } => strip_xml(&input_dir, &report_csv, &output_dir, &output_csv, &ids),
    }
}

fn shift_edf(
    offsets: &Path,
    input: &Path,
    output: Option<PathBuf>,
    json: bool,
    header: &HeaderArgs,
) -> DeidResult<ExitCode> {
    let cfg = header.core_config()?;
    let offsets = OffsetTable::from_csv_path(offsets)?;
    let destination = output.unwrap_or_else(|| default_output_path(input));

    let shifter = EdfShifter::new(Arc::new(cfg), Arc::new(offsets))?;
    let result = shifter.shift_to(input, &destination);

    if json {
        let line = serde_json::to_string(&result)
            .map_err(|e| DeidError::Format(format!("cannot serialise result: {e}")))?;
        println!("{}", line);
    } else {
        println!("File: {}", result.file);
        println!("Status: {}", result.status);
        if let (Some(original), Some(new)) = (result.original_date, result.new_date) {
            println!("Start date: {} -> {}", original, new);
        }
        if let Some(message) = &result.error_message {
            println!("Message: {}", message);
        }
        if let Some(path) = &result.output_path {
            println!("Output: {}", path.display());
        }
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn shift_xml(
    results: &Path,
    xml_dir: &Path,
    output_dir: &Path,
    summary_csv: Option<&Path>,
    ids: &IdentifierArgs,
) -> DeidResult<ExitCode> {
    let cfg = ids.core_config()?;
    let realized = ResultLedger::read_report(results)?.realized_shifts();
    tracing::info!("loaded {} successful EDF shifts from {}", realized.len(), results.display());

    let inputs = deid_files::list_inputs(xml_dir, ANNOTATIONS_SUFFIX, &[])?;
    if inputs.is_empty() {
        tracing::error!("no annotation files found in {}", xml_dir.display());
        return Ok(ExitCode::FAILURE);
    }
    let output = OutputService::new(output_dir)?;
    let shifter = AnnotationShifter::new(&cfg, Arc::new(realized))?;

    let mut ledger = ResultLedger::new();
    for (i, input) in inputs.iter().enumerate() {
        tracing::info!("processing {}/{}: {}", i + 1, inputs.len(), input.display());
        ledger.record(shifter.process_file(input, &output));
    }

    tracing::info!("annotation shift: {}", ledger.summary());
    tracing::info!("modified files saved to {}", output.output_directory().display());
    if let Some(path) = summary_csv {
        ledger.write_report(path)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn strip_xml(
    input_dir: &Path,
    report_csv: &Path,
    output_dir: &Path,
    output_csv: &Path,
    ids: &IdentifierArgs,
) -> DeidResult<ExitCode> {
    let cfg = ids.core_config()?;
    let ledger = Arc::new(ResultLedger::read_report(report_csv)?);
    tracing::info!("loaded {} report rows from {}", ledger.len(), report_csv.display());

    let inputs = deid_files::list_inputs(input_dir, ANNOTATIONS_SUFFIX, &[])?;
    if inputs.is_empty() {
        tracing::warn!("no annotation files found in {}", input_dir.display());
    }
    let output = OutputService::new(output_dir)?;
    let stripper = AnnotationStripper::new(&cfg, Arc::clone(&ledger))?;

    let mut classifications = HashMap::new();
    let mut skipped = 0usize;
    for input in &inputs {
        match stripper.process_file(input, &output) {
            Ok(outcome) => {
                classifications
                    .entry(outcome.identifier)
                    .or_insert(outcome.classification);
            }
            Err(e) => {
                tracing::warn!("{}: {} ({})", input.display(), e, e.status());
                skipped += 1;
            }
        }
    }
    tracing::info!(
        "identifier removal: {} files, {} processed, {} skipped",
        inputs.len(),
        inputs.len() - skipped,
        skipped
    );

    let rows = ledger.merge_classifications(&classifications);
    write_classification_report(&rows, output_csv)?;
    Ok(ExitCode::SUCCESS)
}

/// `<dir>/<stem>_modified.edf`
fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{stem}{MODIFIED_EDF_SUFFIX}"))
}
