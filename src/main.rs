use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::AppConfig;
use stepwise_core::error::StepwiseError;
use stepwise_core::traits::DurationStats;
use stepwise_core::types::{ButtonClick, StepId, WorkflowId};
use stepwise_core::FieldObject;

use stepwise_engine::graph::convergence::{closest_common_next_step, merge_point};
use stepwise_engine::{render_mermaid, render_workflow, Workflow, WorkflowEngine, WorkflowTemplate};
use stepwise_store::SqliteWorkflowStore;

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Drive persisted workflow step graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml")]
    config: PathBuf,

    /// JSON file with the business object the workflow is evaluated against
    #[arg(long, global = true)]
    object: Option<PathBuf>,

    /// Evaluate as of this RFC 3339 time instead of the wall clock
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow template for configuration errors
    Validate { template: PathBuf },
    /// Instantiate a template and run it until it has to wait
    Start { template: PathBuf },
    /// Re-execute the current step of a workflow
    Tick { id: String },
    /// Click a button offered by a workflow
    Click {
        id: String,
        button: String,
        /// Free-text input for buttons with a prompt
        #[arg(long)]
        input: Option<String>,
    },
    /// Apply an undo button
    Undo { id: String, button: String },
    /// Cancel a workflow
    Cancel { id: String },
    /// Show the state, buttons and history of a workflow
    Status {
        id: String,
        /// Also print the Mermaid diagram
        #[arg(long)]
        diagram: bool,
    },
    /// List stored workflows
    List,
    /// Tick every workflow whose execution schedule has passed
    RunDue,
    /// Print a template as a Mermaid flowchart
    Diagram { template: PathBuf },
    /// Nearest step reachable from both given steps
    Converge {
        template: PathBuf,
        from: String,
        other: String,
    },
    /// Where the two lanes of a choice step meet again
    Merge { template: PathBuf, choice: String },
    /// Average time spent in steps of a type
    Durations { step_type: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    let default_filter = config
        .log
        .filter
        .clone()
        .unwrap_or_else(|| "stepwise=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let now = cli.now.unwrap_or_else(Utc::now);
    let object = load_object(cli.object.as_deref())?;

    // Template-only commands need no database.
    match &cli.command {
        Commands::Validate { template } => {
            let template = WorkflowTemplate::load(template)?;
            template.validate()?;
            println!(
                "{}: ok ({} steps, first step '{}')",
                template.name,
                template.steps.len(),
                template.first_step
            );
            return Ok(());
        }
        Commands::Diagram { template } => {
            let template = WorkflowTemplate::load(template)?;
            let graph = template.graph()?;
            let text = render_mermaid(&graph, &template.first_step, template.last_step.as_ref())?;
            print!("{}", text);
            return Ok(());
        }
        Commands::Converge {
            template,
            from,
            other,
        } => {
            let graph = WorkflowTemplate::load(template)?.graph()?;
            let (from, other) = (StepId::from(from.as_str()), StepId::from(other.as_str()));
            match closest_common_next_step(&graph, &from, &other) {
                Some(common) => {
                    println!("{} ({} hops from {})", common.step, common.distance, from)
                }
                None => println!("{} and {} never converge", from, other),
            }
            return Ok(());
        }
        Commands::Merge { template, choice } => {
            let template = WorkflowTemplate::load(template)?;
            let merge = merge_point(
                &template.graph()?,
                &StepId::from(choice.as_str()),
                template.last_step.as_ref(),
            )?;
            println!("{}", serde_json::to_string_pretty(&merge)?);
            return Ok(());
        }
        _ => {}
    }

    let db_path = config.database_path();
    let store = SqliteWorkflowStore::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    let engine = WorkflowEngine::new(config.engine.clone());

    match cli.command {
        Commands::Start { template } => {
            let mut workflow = WorkflowTemplate::load(&template)?.instantiate()?;
            let report = engine.start(&mut workflow, &object, now)?;
            store.create(&workflow)?;
            info!(workflow_id = %workflow.id, "Workflow stored");
            println!("{}", workflow.id);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Tick { id } => {
            let report = update(&store, &id, |wf| engine.tick(wf, &object, now))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Click { id, button, input } => {
            let click = match input {
                Some(text) => ButtonClick::new(button).with_input(text),
                None => ButtonClick::new(button),
            };
            let outcome = update(&store, &id, |wf| engine.click(wf, &object, click, now))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Undo { id, button } => {
            let report = update(&store, &id, |wf| engine.undo(wf, &object, &button, now))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Cancel { id } => {
            update(&store, &id, |wf| engine.cancel(wf, now))?;
            println!("{} canceled", id);
        }
        Commands::Status { id, diagram } => {
            let stored = store
                .load(&WorkflowId::from_string(&id))?
                .ok_or_else(|| anyhow!("unknown workflow {}", id))?;
            print_status(&engine, &stored.workflow, &object, stored.version);
            if diagram {
                print!("{}", render_workflow(&stored.workflow)?);
            }
        }
        Commands::List => {
            for summary in store.list()? {
                let state = if summary.canceled {
                    "canceled".to_string()
                } else if summary.completed {
                    "completed".to_string()
                } else {
                    match summary.auto_execution_schedule {
                        Some(at) => format!("due {}", at.to_rfc3339()),
                        None => "waiting".to_string(),
                    }
                };
                println!("{}  v{}  {:<24} {}", summary.id, summary.version, summary.name, state);
            }
        }
        Commands::RunDue => {
            let due = store.due(now)?;
            info!(count = due.len(), "Running due workflows");
            for id in due {
                match update(&store, &id.0, |wf| engine.tick(wf, &object, now)) {
                    Ok(report) => println!("{}: {}", id, serde_json::to_string(&report.outcome)?),
                    Err(e) => warn!(workflow_id = %id, error = %e, "Due workflow skipped"),
                }
            }
        }
        Commands::Durations { step_type } => match store.average_duration(&step_type)? {
            Some(avg) => println!("{}: {}s on average", step_type, avg.num_seconds()),
            None => println!("{}: no completed traversals", step_type),
        },
        Commands::Validate { .. }
        | Commands::Diagram { .. }
        | Commands::Converge { .. }
        | Commands::Merge { .. } => {}
    }
    Ok(())
}

/// Load, mutate and save a workflow under optimistic concurrency.
fn update<T>(
    store: &SqliteWorkflowStore,
    id: &str,
    f: impl FnOnce(&mut Workflow) -> stepwise_core::Result<T>,
) -> anyhow::Result<T> {
    let id = WorkflowId::from_string(id);
    let stored = store
        .load(&id)?
        .ok_or_else(|| anyhow!("unknown workflow {}", id))?;
    let mut workflow = stored.workflow;
    let out = f(&mut workflow)?;
    match store.save(&workflow, stored.version) {
        Ok(_) => Ok(out),
        Err(e @ StepwiseError::Conflict { .. }) => {
            Err(anyhow!(e).context(format!("workflow {} changed concurrently, retry", id)))
        }
        Err(e) => Err(e.into()),
    }
}

fn load_object(path: Option<&Path>) -> anyhow::Result<FieldObject> {
    let Some(path) = path else {
        return Ok(FieldObject::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading object file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    FieldObject::from_json(&value)
        .ok_or_else(|| anyhow!("{} must contain a JSON object", path.display()))
}

fn print_status(engine: &WorkflowEngine, workflow: &Workflow, object: &FieldObject, version: i64) {
    println!("{} ({}) v{}", workflow.name, workflow.id, version);
    let state = if workflow.is_canceled() {
        "canceled"
    } else if workflow.is_completed() {
        "completed"
    } else if workflow.is_started() {
        "running"
    } else {
        "not started"
    };
    println!("  state: {}", state);

    let active = workflow.active_steps();
    if !active.is_empty() {
        let names: Vec<&str> = active.iter().map(|s| s.as_str()).collect();
        println!("  active: {}", names.join(", "));
    }
    if let Some(at) = workflow.auto_execution_schedule() {
        println!("  retry at: {}", at.to_rfc3339());
    }

    if !workflow.is_finished() && workflow.is_started() {
        match engine.offered_buttons(workflow, object) {
            Ok(buttons) => {
                for offered in buttons {
                    println!(
                        "  button: {} [{}] on {}",
                        offered.button.label, offered.button.id, offered.location.step
                    );
                }
            }
            Err(e) => println!("  buttons unavailable: {}", e),
        }
        for undo in engine.undo_buttons(workflow) {
            println!(
                "  undo: {} [{}] back to {}",
                undo.button.label, undo.button.id, undo.target
            );
        }
    }

    println!("  history:");
    for item in workflow.all_history() {
        let exited = item
            .exited_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "    {:<16} {:<22} {:<18} {} .. {}",
            item.step_id.as_str(),
            item.step_type,
            item.trigger.to_string(),
            item.entered_at.to_rfc3339(),
            exited
        );
    }
}
