//! Command implementations for tabledger CLI

use crate::archive::ArchiveManager;
use crate::cli::{Commands, OutputFormat};
use crate::config::LedgerConfig;
use crate::error::{Result, TabledgerError};
use crate::ledger::{self, Ledger, RunOptions};
use crate::output::{JsonFormatter, PrettyPrinter};
use crate::progress::ProgressReporter;
use crate::state::{self, StateImage};
use crate::workspace::LedgerWorkspace;
use std::path::{Path, PathBuf};

/// Execute a command
pub fn execute_command(command: Commands, workspace_path: Option<&Path>) -> Result<()> {
    match command {
        Commands::Init { force, config } => init_command(workspace_path, force, config.as_deref()),
        Commands::Run {
            inputs,
            dry_run,
            actor,
            source,
            notes,
            no_image,
            materialize,
            format,
        } => {
            let opts = RunOptions {
                actor,
                source_name: source,
                file_name: None,
                create_image: no_image.then_some(false),
                materialize: materialize.then_some(true),
                notes,
            };
            run_command(workspace_path, &inputs, dry_run, opts, &format)
        }
        Commands::Events { limit, format } => events_command(workspace_path, limit, &format),
        Commands::Show { event, format } => show_command(workspace_path, &event, &format),
        Commands::Diff {
            event,
            column,
            entity,
            page,
            page_size,
            all,
            summary,
            format,
        } => {
            let request = DiffRequest {
                column,
                entity,
                page,
                page_size,
                all,
                summary,
            };
            diff_command(workspace_path, &event, request, &format)
        }
        Commands::Conflicts { event, format } => conflicts_command(workspace_path, event.as_deref(), &format),
        Commands::Resolve { conflict, resolution } => resolve_command(workspace_path, &conflict, &resolution),
        Commands::Rollback {
            event,
            actor,
            notes,
            format,
        } => {
            let opts = RunOptions {
                actor,
                notes,
                ..RunOptions::default()
            };
            rollback_command(workspace_path, &event, opts, &format)
        }
        Commands::RollbackTo {
            event,
            dry_run,
            force,
            actor,
            notes,
            format,
        } => {
            let opts = RunOptions {
                actor,
                notes,
                ..RunOptions::default()
            };
            rollback_to_command(workspace_path, &event, dry_run, force, opts, &format)
        }
        Commands::Image {
            reference,
            show,
            materialize,
            format,
        } => image_command(workspace_path, &reference, show, materialize, &format),
        Commands::History { format } => history_command(workspace_path, &format),
        Commands::Staging { entity, limit, format } => staging_command(workspace_path, &entity, limit, &format),
        Commands::Verify { format } => verify_command(workspace_path, &format),
        Commands::Stats { format } => stats_command(workspace_path, &format),
    }
}

fn output_format(format: &str) -> Result<OutputFormat> {
    OutputFormat::parse(format).map_err(TabledgerError::invalid_input)
}

fn open_ledger(workspace_path: Option<&Path>) -> Result<(LedgerWorkspace, Ledger)> {
    let workspace = LedgerWorkspace::find(workspace_path)?;
    let ledger = Ledger::open(&workspace)?;
    Ok((workspace, ledger))
}

/// Initialize a ledger workspace
fn init_command(workspace_path: Option<&Path>, force: bool, config_path: Option<&Path>) -> Result<()> {
    let current_dir = std::env::current_dir()?;
    let root = workspace_path.unwrap_or(&current_dir);

    let config = match config_path {
        Some(path) => Some(LedgerConfig::load(path)?),
        None => None,
    };

    let workspace = if force {
        let workspace = LedgerWorkspace::from_root(root.to_path_buf());
        std::fs::create_dir_all(&workspace.images_dir)?;
        workspace.write_config(config.unwrap_or_default(), true)?;
        workspace.ensure_gitignore()?;
        workspace
    } else {
        // Always create in the given directory, never in a parent
        LedgerWorkspace::create_new(root.to_path_buf(), config)?
    };

    // Opening the ledger creates the database and staging tables
    let ledger = Ledger::open(&workspace)?;

    println!("✅ Initialized ledger workspace at: {}", workspace.root.display());
    println!("📁 Ledger directory: {}", workspace.ledger_dir.display());
    println!("📋 Entities: {}", ledger.config().entity_names().join(", "));
    Ok(())
}

/// Merge source files into staging
fn run_command(
    workspace_path: Option<&Path>,
    inputs: &[(String, PathBuf)],
    dry_run: bool,
    mut opts: RunOptions,
    format: &str,
) -> Result<()> {
    let format = output_format(format)?;
    let (workspace, mut ledger) = open_ledger(workspace_path)?;

    let inputs: Vec<(String, PathBuf)> = inputs
        .iter()
        .map(|(entity, path)| {
            let path = if path.is_absolute() { path.clone() } else { workspace.root.join(path) };
            (entity.clone(), path)
        })
        .collect();
    for (_, path) in &inputs {
        if !path.exists() {
            return Err(TabledgerError::invalid_input(format!(
                "Input file does not exist: {}",
                path.display()
            )));
        }
    }

    let mut reporter = match format {
        OutputFormat::Pretty => ProgressReporter::new_for_run(),
        OutputFormat::Json => ProgressReporter::new_minimal(),
    };
    let (batches, names) = ledger::load_inputs(&inputs)?;
    let rows: usize = batches.iter().map(|(_, rows)| rows.len()).sum();
    reporter.finish_loading(&format!("Loaded {} row(s) from {} file(s)", rows, names.len()));

    if dry_run {
        let preview = ledger.preview(&batches)?;
        match format {
            OutputFormat::Json => println!("{}", JsonFormatter::format(&preview)?),
            OutputFormat::Pretty => PrettyPrinter::print_preview(&preview),
        }
        return Ok(());
    }

    opts.file_name = Some(names.join(", "));
    if opts.source_name.is_none() {
        opts.source_name = Some("file".to_string());
    }
    ledger.set_progress(reporter.row_callback());
    let result = ledger.run_batches(batches, &opts);
    reporter.finish_rows("Merge complete");
    let result = result?;

    log::debug!("Run finished in {:?}", reporter.elapsed());
    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&result)?),
        OutputFormat::Pretty => PrettyPrinter::print_run_result(&result),
    }
    Ok(())
}

fn events_command(workspace_path: Option<&Path>, limit: Option<usize>, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let events = ledger.events(limit)?;

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&events)?),
        OutputFormat::Pretty => PrettyPrinter::print_events(&events),
    }
    Ok(())
}

fn show_command(workspace_path: Option<&Path>, reference: &str, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let event = ledger.resolve_event(reference)?;
    let image = state::image_for_event(ledger.connection(), &event.id)?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "event": event, "state_image": image });
            println!("{}", JsonFormatter::format(&json)?);
        }
        OutputFormat::Pretty => PrettyPrinter::print_event(&event, image.as_ref()),
    }
    Ok(())
}

struct DiffRequest {
    column: Option<String>,
    entity: Option<String>,
    page: usize,
    page_size: Option<usize>,
    all: bool,
    summary: bool,
}

fn diff_command(workspace_path: Option<&Path>, reference: &str, request: DiffRequest, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let event = ledger.resolve_event(reference)?;

    if request.summary {
        let summary = ledger.diff_summary(&event.id)?;
        match format {
            OutputFormat::Json => println!("{}", JsonFormatter::format(&summary)?),
            OutputFormat::Pretty => PrettyPrinter::print_diff_summary(&summary),
        }
        return Ok(());
    }

    if let (Some(column), Some(entity)) = (&request.column, &request.entity) {
        let pager = ledger.diff_column(&event.id, entity, column, request.page_size)?;
        let pages: Vec<_> = if request.all {
            pager.collect::<Result<Vec<_>>>()?
        } else {
            pager.skip(request.page - 1).take(1).collect::<Result<Vec<_>>>()?
        };
        let first_page = if request.all { 1 } else { request.page };
        match format {
            OutputFormat::Json => println!("{}", JsonFormatter::format(&pages)?),
            OutputFormat::Pretty if pages.is_empty() => println!("No changes to '{}' on this page.", column),
            OutputFormat::Pretty => {
                for (i, diffs) in pages.iter().enumerate() {
                    PrettyPrinter::print_column_diffs(column, first_page + i, diffs);
                }
            }
        }
        return Ok(());
    }

    let mut pager = ledger.diff(&event.id, request.page_size)?;
    let pages = if request.all {
        pager.by_ref().collect::<Result<Vec<_>>>()?
    } else {
        pager.seek_page(request.page)?.into_iter().collect()
    };
    let first_page = if request.all { 1 } else { request.page };

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&pages)?),
        OutputFormat::Pretty if pages.is_empty() => println!("No row changes on page {}.", request.page),
        OutputFormat::Pretty => {
            for (i, changes) in pages.iter().enumerate() {
                PrettyPrinter::print_diff_page(first_page + i, changes);
            }
        }
    }
    Ok(())
}

fn conflicts_command(workspace_path: Option<&Path>, event: Option<&str>, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let event_id = match event {
        Some(reference) => Some(ledger.resolve_event(reference)?.id),
        None => None,
    };
    let conflicts = ledger.conflicts(event_id.as_deref())?;

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&conflicts)?),
        OutputFormat::Pretty => PrettyPrinter::print_conflicts(&conflicts),
    }
    Ok(())
}

fn resolve_command(workspace_path: Option<&Path>, conflict_id: &str, resolution: &str) -> Result<()> {
    let (_, ledger) = open_ledger(workspace_path)?;
    let conflict = ledger.resolve_conflict(conflict_id, resolution)?;
    println!("✅ Resolved conflict {} on {}/{}", conflict.id, conflict.entity, conflict.pk);
    Ok(())
}

fn rollback_command(workspace_path: Option<&Path>, reference: &str, opts: RunOptions, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, mut ledger) = open_ledger(workspace_path)?;
    let result = ledger.rollback_event(reference, &opts)?;

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&result)?),
        OutputFormat::Pretty => PrettyPrinter::print_run_result(&result),
    }
    Ok(())
}

fn rollback_to_command(
    workspace_path: Option<&Path>,
    reference: &str,
    dry_run: bool,
    force: bool,
    opts: RunOptions,
    format: &str,
) -> Result<()> {
    let format = output_format(format)?;
    let (_, mut ledger) = open_ledger(workspace_path)?;
    let plan = ledger.plan_rollback_to(reference)?;

    if dry_run {
        match format {
            OutputFormat::Json => println!("{}", JsonFormatter::format(&plan)?),
            OutputFormat::Pretty => {
                PrettyPrinter::print_rollback_plan(&plan);
                println!("\n💡 Re-run without --dry-run to apply");
            }
        }
        return Ok(());
    }

    if plan.events.is_empty() {
        println!("✅ Nothing newer than {}. No rollback needed.", plan.target);
        return Ok(());
    }

    if !force {
        PrettyPrinter::print_rollback_plan(&plan);
        println!("\n⚠️  This will reverse {} event(s). Continue? (y/N)", plan.events.len());
        let mut user_input = String::new();
        std::io::stdin().read_line(&mut user_input)?;

        if !user_input.trim().to_lowercase().starts_with('y') {
            println!("❌ Rollback cancelled.");
            return Ok(());
        }
    }

    let result = ledger.rollback_to(&plan.target, &opts)?;
    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&result)?),
        OutputFormat::Pretty => PrettyPrinter::print_run_result(&result),
    }
    Ok(())
}

fn image_command(
    workspace_path: Option<&Path>,
    reference: &str,
    show: bool,
    materialize: bool,
    format: &str,
) -> Result<()> {
    let format = output_format(format)?;
    let (workspace, mut ledger) = open_ledger(workspace_path)?;

    let image: StateImage = if show {
        ledger.image(reference)?
    } else {
        let event = ledger.resolve_event(reference)?;
        ledger.create_state_image(&event.id, materialize.then_some(true))?
    };

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&image)?),
        OutputFormat::Pretty => {
            PrettyPrinter::print_image(&image);
            if let (true, Some(name)) = (show, image.archive_path.as_deref()) {
                let stats = ArchiveManager::get_archive_stats(&workspace.image_path(name))?;
                let archive = ledger.image_archive(&image)?;
                PrettyPrinter::print_archive(&stats, &archive);
            }
        }
    }
    Ok(())
}

fn history_command(workspace_path: Option<&Path>, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let head = ledger.head()?;
    let images = ledger.history()?.collect::<Result<Vec<_>>>()?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({ "head": head.state_image_id, "images": images });
            println!("{}", JsonFormatter::format(&json)?);
        }
        OutputFormat::Pretty => PrettyPrinter::print_history(&head, &images),
    }
    Ok(())
}

fn staging_command(workspace_path: Option<&Path>, entity: &str, limit: Option<usize>, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let mut rows = ledger.staging_rows(entity)?;
    if let Some(limit) = limit {
        rows.truncate(limit);
    }

    match format {
        OutputFormat::Json => {
            let schema = ledger.config().entity(entity)?;
            let docs: Vec<serde_json::Value> = rows.iter().map(|row| row.to_document(schema)).collect();
            println!("{}", JsonFormatter::format(&docs)?);
        }
        OutputFormat::Pretty => PrettyPrinter::print_staging(entity, &rows),
    }
    Ok(())
}

fn verify_command(workspace_path: Option<&Path>, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (_, ledger) = open_ledger(workspace_path)?;
    let report = ledger.verify()?;

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format(&report)?),
        OutputFormat::Pretty => PrettyPrinter::print_verify_report(&report),
    }

    if report.is_ok() {
        Ok(())
    } else {
        Err(TabledgerError::integrity(format!(
            "{} verification issue(s) found",
            report.issues.len()
        )))
    }
}

fn stats_command(workspace_path: Option<&Path>, format: &str) -> Result<()> {
    let format = output_format(format)?;
    let (workspace, ledger) = open_ledger(workspace_path)?;
    let stats = workspace.stats()?;
    let events = ledger.events(None)?.len();
    let images = state::all_images(ledger.connection())?.len();

    match format {
        OutputFormat::Json => println!("{}", JsonFormatter::format_workspace_stats(&stats, events, images)?),
        OutputFormat::Pretty => PrettyPrinter::print_workspace_stats(&stats, events, images),
    }
    Ok(())
}
