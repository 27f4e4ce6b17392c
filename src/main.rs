use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deid_core::config::{
    flag_from_env_value, identifier_source_from_env_value, max_date_from_env_value,
    time_mode_from_env_value,
};
use deid_core::constants::{
    DEFAULT_ID_PREFIX, DEFAULT_REPORT_FILENAME, EDF_EXTENSION, MODIFIED_EDF_SUFFIX,
    SUBPROCESS_TIMEOUT_SECS,
};
use deid_core::{CoreConfig, DeidError, OffsetTable, ResultLedger, ShiftResult};
use deid_files::{FilesError, MODIFIED_EDF_DIR_NAME, OutputService};

/// Batch settings resolved from the environment.
#[derive(Debug)]
struct RunConfig {
    offsets_csv: PathBuf,
    edf_dir: PathBuf,
    report_csv: PathBuf,
    deid_bin: PathBuf,
    core: CoreConfig,
}

impl RunConfig {
    /// Resolve settings through `lookup`, normally `std::env::var`.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .with_context(|| format!("{name} must be set"))
        };
        let offsets_csv = required("DEID_OFFSETS_CSV")?;
        let edf_dir = required("DEID_EDF_DIR")?;
        let report_csv = lookup("DEID_REPORT_CSV")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_FILENAME));
        let deid_bin = match lookup("DEID_BIN").filter(|v| !v.trim().is_empty()) {
            Some(bin) => PathBuf::from(bin),
            None => sibling_deid_binary()?,
        };

        let core = CoreConfig::new(
            max_date_from_env_value(lookup("DEID_MAX_DATE"))?,
            time_mode_from_env_value(lookup("DEID_TIME_MODE"))?,
            identifier_source_from_env_value(lookup("DEID_ID_SOURCE"))?,
            lookup("DEID_ID_PREFIX")
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_ID_PREFIX),
            flag_from_env_value(lookup("DEID_REWRITE_STARTDATE"))?,
        )?;

        Ok(Self {
            offsets_csv,
            edf_dir,
            report_csv,
            deid_bin,
            core,
        })
    }

    /// Options forwarded to every `deid shift-edf` child.
    fn child_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--max-date".to_string(),
            self.core.max_date().to_string(),
            "--time-mode".to_string(),
            self.core.time_mode().as_str().to_string(),
            "--id-source".to_string(),
            self.core.identifier_source().as_str().to_string(),
            "--id-prefix".to_string(),
            self.core.identifier_prefix().to_string(),
        ];
        if self.core.rewrite_startdate_field() {
            flags.push("--rewrite-startdate-field".to_string());
        }
        flags
    }
}

fn sibling_deid_binary() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    let dir = exe
        .parent()
        .context("running executable has no parent directory")?;
    Ok(dir.join(format!("deid{}", std::env::consts::EXE_SUFFIX)))
}

/// Main entry point for the batch EDF date shift
///
/// Every `.edf` file in `DEID_EDF_DIR` (except earlier `_modified.edf` outputs) is shifted
/// by an isolated `deid shift-edf` process, in lexicographic order, each bounded by a fixed
/// timeout. Shifted files land in `<DEID_EDF_DIR>/modified_files` and one row per file is
/// written to the report CSV.
///
/// # Environment Variables
/// - `DEID_OFFSETS_CSV`: offset table CSV (required)
/// - `DEID_EDF_DIR`: directory of EDF recordings (required)
/// - `DEID_REPORT_CSV`: report path (default: "batch_processing_results.csv")
/// - `DEID_BIN`: `deid` binary (default: next to this executable)
/// - `DEID_MAX_DATE`, `DEID_TIME_MODE`, `DEID_ID_SOURCE`, `DEID_ID_PREFIX`,
///   `DEID_REWRITE_STARTDATE`: forwarded to each child
///
/// # Returns
/// * `Ok(())` - If the batch ran, whatever the per-file outcomes
/// * `Err(anyhow::Error)` - On configuration errors, before any file is processed
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("deid=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let run = RunConfig::from_lookup(|name| std::env::var(name).ok())?;

    // Fails the whole run on a missing file or column, before any recording is touched.
    let offsets = OffsetTable::from_csv_path(&run.offsets_csv)?;

    let inputs = deid_files::list_inputs(&run.edf_dir, EDF_EXTENSION, &[MODIFIED_EDF_SUFFIX])?;
    if inputs.is_empty() {
        bail!("no EDF files found in {}", run.edf_dir.display());
    }
    let output = OutputService::new(&run.edf_dir.join(MODIFIED_EDF_DIR_NAME))?;

    tracing::info!("++ Offsets: {} ({} subjects)", run.offsets_csv.display(), offsets.len());
    tracing::info!("++ EDF directory: {}", run.edf_dir.display());
    tracing::info!("++ Output directory: {}", output.output_directory().display());
    tracing::info!("++ Found {} EDF files to process", inputs.len());

    let flags = run.child_flags();
    let mut ledger = ResultLedger::new();
    for (i, input) in inputs.iter().enumerate() {
        tracing::info!("processing {}/{}: {}", i + 1, inputs.len(), input.display());
        let result = shift_in_subprocess(&run, &flags, input, &output).await;
        tracing::info!("  status: {}", result.status);
        ledger.record(result);
    }

    ledger.write_report(&run.report_csv)?;
    tracing::info!("++ Summary: {}", ledger.summary());
    tracing::info!("++ Results saved to {}", run.report_csv.display());
    Ok(())
}

async fn shift_in_subprocess(
    run: &RunConfig,
    flags: &[String],
    input: &Path,
    output: &OutputService,
) -> ShiftResult {
    let destination = match output.output_path_for(input) {
        Ok(path) => path,
        Err(e) => return ShiftResult::from_error(input, &e.into()),
    };

    let child = Command::new(&run.deid_bin)
        .arg("shift-edf")
        .arg(&run.offsets_csv)
        .arg(input)
        .arg(&destination)
        .arg("--json")
        .args(flags)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("failed to spawn {}: {}", run.deid_bin.display(), e);
            return ShiftResult::from_error(input, &FilesError::from(e).into());
        }
    };

    let budget = Duration::from_secs(SUBPROCESS_TIMEOUT_SECS);
    match timeout(budget, child.wait_with_output()).await {
        Ok(Ok(out)) => result_from_child_output(input, &out.stdout, &out.stderr),
        Ok(Err(e)) => ShiftResult::from_error(input, &FilesError::from(e).into()),
        Err(_) => {
            tracing::warn!("{}: timed out after {} seconds", input.display(), budget.as_secs());
            ShiftResult::timeout(input, SUBPROCESS_TIMEOUT_SECS)
        }
    }
}

/// The child's JSON result line, or a failure carrying its last diagnostic line.
fn result_from_child_output(input: &Path, stdout: &[u8], stderr: &[u8]) -> ShiftResult {
    let stdout = String::from_utf8_lossy(stdout);
    let parsed = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<ShiftResult>);

    match parsed {
        Some(Ok(result)) => result,
        Some(Err(e)) => ShiftResult::from_error(
            input,
            &DeidError::Format(format!("unreadable result from deid: {e}")),
        ),
        None => {
            let stderr = String::from_utf8_lossy(stderr);
            let detail = stderr
                .lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("no output");
            ShiftResult::from_error(
                input,
                &DeidError::Format(format!("deid produced no result: {detail}")),
            )
        }
    }
}
