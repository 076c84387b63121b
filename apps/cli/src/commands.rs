//! CLI command implementations

use crate::output::{format_bytes, print_output, print_summary};
use crate::progress::JobProgressView;
use crate::{JobArgs, OutputFormat};
use anyhow::{anyhow, Context, Result};
use console::style;
use futures::{pin_mut, StreamExt};
use modelfetch_core::FetchCore;
use modelfetch_types::{BatchStrategy, FileInfo, JobOptions, JobSummary, Model, SearchParams};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

// ============================================================================
// Catalog Commands
// ============================================================================

pub async fn search(
    core: &FetchCore,
    params: SearchParams,
    max_results: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let models = match max_results {
        Some(max) => {
            let stream = core.api().search_all(params, Some(max));
            pin_mut!(stream);

            let mut models = Vec::new();
            while let Some(model) = stream.next().await {
                models.push(model?);
            }
            models
        }
        None => core.search(&params, None).await?.items,
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ModelRow {
                id: u64,
                name: String,
                kind: String,
                creator: String,
                versions: usize,
            }

            let rows: Vec<ModelRow> = models
                .iter()
                .map(|m| ModelRow {
                    id: m.id,
                    name: truncate(&m.name, 40),
                    kind: m.model_type.clone().unwrap_or_default(),
                    creator: m
                        .creator
                        .as_ref()
                        .map(|c| c.username.clone())
                        .unwrap_or_default(),
                    versions: m.model_versions.len(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if models.is_empty() {
                println!("{}", style("No models found").dim());
                return Ok(());
            }

            for model in &models {
                println!(
                    "{}  {} {}",
                    style(model.id).dim(),
                    style(&model.name).cyan(),
                    style(model.model_type.as_deref().unwrap_or("")).yellow()
                );
            }
            println!();
            println!("{} model(s)", style(models.len()).bold());
        }
    }

    Ok(())
}

pub async fn show_model(core: &FetchCore, id: u64, format: OutputFormat) -> Result<()> {
    let model = core.model(id).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&model)?);
        }
        OutputFormat::Human | OutputFormat::Table => print_model(&model),
    }

    Ok(())
}

fn print_model(model: &Model) {
    println!("{} {}", style(&model.name).cyan().bold(), style(model.id).dim());
    if let Some(kind) = &model.model_type {
        println!("  Type: {}", kind);
    }
    if let Some(creator) = &model.creator {
        println!("  Creator: {}", creator.username);
    }
    if !model.tags.is_empty() {
        println!("  Tags: {}", model.tags.join(", "));
    }

    for version in &model.model_versions {
        println!();
        println!(
            "  {} {}{}",
            style("Version").bold(),
            version.name,
            style(format!(" ({})", version.id)).dim()
        );
        for file in &version.files {
            let size = file
                .size_kb
                .map(|kb| format_bytes((kb * 1024.0) as u64))
                .unwrap_or_else(|| "?".to_string());
            let marker = if file.primary { "*" } else { " " };
            println!("    {} {} {}", marker, file.name, style(size).dim());
        }
    }
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn fetch_model(
    core: &FetchCore,
    model_id: u64,
    version: Option<u64>,
    primary_only: bool,
    job: JobArgs,
    format: OutputFormat,
) -> Result<()> {
    let mut files = core.model_files(model_id, version).await?;
    if primary_only {
        let model = core.model(model_id).await?;
        let primary: Vec<String> = model
            .model_versions
            .iter()
            .flat_map(|v| v.files.iter())
            .filter(|f| f.primary)
            .map(|f| f.id.to_string())
            .collect();
        files.retain(|f| primary.contains(&f.id));
    }
    if files.is_empty() {
        return Err(anyhow!("Model {} has no files to download", model_id));
    }

    let name = format!("model-{}", model_id);
    run_files(core, name, files, job, format).await
}

pub async fn run_manifest(
    core: &FetchCore,
    file: PathBuf,
    name: Option<String>,
    job: JobArgs,
    format: OutputFormat,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading manifest {}", file.display()))?;
    let files: Vec<FileInfo> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing manifest {}", file.display()))?;

    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "manifest".to_string())
    });
    run_files(core, name, files, job, format).await
}

fn job_options(args: &JobArgs) -> JobOptions {
    let options = JobOptions::new(args.max_concurrent)
        .fail_fast(args.fail_fast)
        .skip_downloaded(args.skip_downloaded);

    match BatchStrategy::from(args.strategy) {
        BatchStrategy::Adaptive => options.with_adaptive(args.baseline, args.max_concurrent),
        _ => options,
    }
}

async fn run_files(
    core: &FetchCore,
    name: String,
    files: Vec<FileInfo>,
    args: JobArgs,
    format: OutputFormat,
) -> Result<()> {
    let job_id = core
        .create_job(name, files, args.strategy.into(), job_options(&args))
        .await?;

    let summary = run_with_progress(core, job_id, format).await?;
    print_output(&summary, format)?;
    print_summary(&summary, format);

    if !summary.failed.is_empty() {
        return Err(anyhow!("{} file(s) failed", summary.failed.len()));
    }
    Ok(())
}

/// Start a job and render its events until it finishes; Ctrl-C cancels it
async fn run_with_progress(
    core: &FetchCore,
    job_id: Uuid,
    format: OutputFormat,
) -> Result<JobSummary> {
    let orchestrator = core.orchestrator();
    let view = JobProgressView::new(format == OutputFormat::Human);
    for task in core.engine().tasks(&orchestrator.job(job_id)?.task_ids) {
        view.add_task(&task).await;
    }

    let mut events = core.subscribe();
    orchestrator.start_job(job_id)?;

    let finished = orchestrator.wait_job(job_id);
    tokio::pin!(finished);
    let mut interrupted = false;

    loop {
        tokio::select! {
            summary = &mut finished => {
                view.clear().await;
                return Ok(summary?);
            }
            event = events.recv() => match event {
                Ok(event) => view.handle_event(&event).await,
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    let summary = finished.await;
                    view.clear().await;
                    return Ok(summary?);
                }
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("{} Cancelling...", style("!").yellow().bold());
                core.cancel_job(job_id)?;
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}
