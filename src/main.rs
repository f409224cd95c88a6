use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use runwarden::agent::CommandAgent;
use runwarden::config::Config;
use runwarden::hooks::HookRunner;
use runwarden::issues::{
    Automation, FileKnowledgeStore, IssueEngine, IssueQuery, NewSolution, Suggestion,
};
use runwarden::ledger::{Ledger, RunId};
use runwarden::logging;
use runwarden::plan::Plan;
use runwarden::supervisor::{
    ExecutionMode, RerunOptions, RunOutcome, StartOptions, Supervisor,
};
use runwarden::verify::{GitHubRecord, NoopVerifier, StepVerifier, Verifier};

const EXIT_ERROR: u8 = 1;
const EXIT_HALTED: u8 = 2;
const EXIT_AWAITING_FEEDBACK: u8 = 3;

#[derive(Parser)]
#[command(name = "runwarden")]
#[command(about = "Supervise agent-executed workflow plans")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run of a plan
    Run {
        /// Plan file (.json, .yaml or .yml)
        plan: PathBuf,

        /// Environment name for hook filtering
        #[arg(short, long)]
        env: Option<String>,

        /// Hand each phase to the agent in one batch
        #[arg(long)]
        batched: bool,

        /// Work item the run belongs to
        #[arg(long)]
        work_id: Option<String>,

        /// Run parameter (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Continue a halted run at an explicit position
    Resume {
        run_id: RunId,

        #[arg(long)]
        phase: String,

        /// 1-based step index within the phase
        #[arg(long)]
        step: usize,

        /// Plan file; defaults to the one the run was started from
        #[arg(long)]
        plan: Option<PathBuf>,
    },

    /// Start a new run linked to an earlier one
    Rerun {
        run_id: RunId,

        /// Record earlier phases as skipped
        #[arg(long)]
        from_phase: Option<String>,

        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        #[arg(long)]
        plan: Option<PathBuf>,
    },

    /// List recorded runs
    List,

    /// Show the current state of a run
    Status {
        run_id: RunId,

        /// Print the full state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a run's ledger
    Events { run_id: RunId },

    /// Cancel a run
    Cancel {
        run_id: RunId,

        #[arg(short, long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Answer a pending feedback request
    Feedback {
        run_id: RunId,
        request_id: String,
        response: String,

        #[arg(long, conflicts_with = "deny")]
        approve: bool,

        #[arg(long)]
        deny: bool,
    },

    /// Apply an automatable known fix to a halted run
    Fix {
        run_id: RunId,
        issue_id: String,
        solution_id: String,
    },

    /// Query and maintain the issue knowledge base
    Issues {
        #[command(subcommand)]
        command: IssuesCommand,
    },
}

#[derive(Subcommand)]
enum IssuesCommand {
    /// Find known solutions for an error message
    Search {
        message: String,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        resource_type: Option<String>,
        #[arg(long)]
        env: Option<String>,
    },

    /// Record an occurrence of an error
    Record {
        message: String,
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        resource_type: Option<String>,
        #[arg(long)]
        env: Option<String>,
    },

    /// Attach a solution to a known issue
    Solve {
        issue_id: String,
        description: String,

        #[arg(long, default_value = "")]
        category: String,

        /// Manual remediation step (repeatable)
        #[arg(long = "step")]
        steps: Vec<String>,

        /// Capability that automates the fix
        #[arg(long, requires = "operation")]
        capability: Option<String>,

        #[arg(long)]
        operation: Option<String>,
    },

    /// Knowledge base statistics
    Stats,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let _logging = match logging::init_logging(&config, cli.debug) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match dispatch(config, cli.command).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn dispatch(mut config: Config, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            plan,
            env,
            batched,
            work_id,
            params,
        } => {
            if let Some(env) = env {
                config.supervisor.environment = env;
            }
            if batched {
                config.supervisor.mode = ExecutionMode::Batched;
            }
            cmd_run(&config, plan, work_id, params).await
        }
        Commands::Resume {
            run_id,
            phase,
            step,
            plan,
        } => cmd_resume(&config, run_id, phase, step, plan).await,
        Commands::Rerun {
            run_id,
            from_phase,
            params,
            plan,
        } => cmd_rerun(&config, run_id, from_phase, params, plan).await,
        Commands::List => cmd_list(&config),
        Commands::Status { run_id, json } => cmd_status(&config, &run_id, json),
        Commands::Events { run_id } => cmd_events(&config, &run_id),
        Commands::Cancel { run_id, reason } => {
            build_supervisor(&config)?.cancel(&run_id, &reason)?;
            println!("Cancelled {run_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Feedback {
            run_id,
            request_id,
            response,
            approve,
            deny,
        } => {
            let approved = match (approve, deny) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let point = build_supervisor(&config)?.provide_feedback(
                &run_id,
                &request_id,
                &response,
                approved,
            )?;
            println!("Feedback recorded for {run_id}");
            println!(
                "Continue with: runwarden resume {run_id} --phase {} --step {}",
                point.phase, point.step_index
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Fix {
            run_id,
            issue_id,
            solution_id,
        } => cmd_fix(&config, run_id, issue_id, solution_id).await,
        Commands::Issues { command } => cmd_issues(&config, command),
    }
}

fn issue_engine(config: &Config) -> IssueEngine {
    IssueEngine::new(Arc::new(FileKnowledgeStore::new(config.knowledge_path())))
}

fn build_supervisor(config: &Config) -> Result<Supervisor> {
    let settings = config.supervisor_settings();
    let agent = CommandAgent::new(&config.agent.command, config.agent.args.clone())
        .with_working_dir(&settings.base_dir);
    let verifier: Arc<dyn StepVerifier> = if config.supervisor.verify {
        Arc::new(Verifier::new(Arc::new(GitHubRecord::new(&settings.base_dir))))
    } else {
        Arc::new(NoopVerifier)
    };

    let hooks = config.load_hooks()?;
    let capabilities = config.capability_registry();
    Config::check_capabilities(&hooks, &capabilities)?;

    let mut supervisor = Supervisor::new(Ledger::new(config.ledger_path()), Arc::new(agent), verifier)
        .with_hooks(hooks)
        .with_hook_runner(HookRunner::new(capabilities))
        .with_settings(settings);
    if config.knowledge.enabled {
        supervisor = supervisor.with_issue_engine(issue_engine(config));
    }
    Ok(supervisor)
}

/// Plan from `--plan`, falling back to the path recorded at run creation
fn plan_for(supervisor: &Supervisor, run_id: &RunId, explicit: Option<PathBuf>) -> Result<Plan> {
    let path = match explicit {
        Some(path) => path,
        None => supervisor
            .ledger()
            .read_metadata(run_id)?
            .plan_path
            .ok_or_else(|| anyhow!("run {run_id} has no recorded plan; pass --plan"))?,
    };
    Plan::load(&path).with_context(|| format!("Failed to load plan {}", path.display()))
}

async fn cmd_run(
    config: &Config,
    plan_path: PathBuf,
    work_id: Option<String>,
    params: Vec<(String, String)>,
) -> Result<ExitCode> {
    let plan = Plan::load(&plan_path)
        .with_context(|| format!("Failed to load plan {}", plan_path.display()))?;
    let supervisor = build_supervisor(config)?;
    let options = StartOptions {
        work_id,
        parameters: params.into_iter().collect(),
        plan_path: Some(std::fs::canonicalize(&plan_path).unwrap_or(plan_path)),
        ..StartOptions::default()
    };
    let outcome = supervisor.start(&plan, options).await?;
    Ok(report(&outcome))
}

async fn cmd_resume(
    config: &Config,
    run_id: RunId,
    phase: String,
    step: usize,
    plan: Option<PathBuf>,
) -> Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    let plan = plan_for(&supervisor, &run_id, plan)?;
    let outcome = supervisor.resume(&plan, &run_id, &phase, step).await?;
    Ok(report(&outcome))
}

async fn cmd_rerun(
    config: &Config,
    run_id: RunId,
    from_phase: Option<String>,
    params: Vec<(String, String)>,
    plan: Option<PathBuf>,
) -> Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    let plan = plan_for(&supervisor, &run_id, plan)?;
    let options = RerunOptions {
        from_phase,
        parameters: params.into_iter().collect::<BTreeMap<_, _>>(),
    };
    let outcome = supervisor.rerun(&plan, &run_id, options).await?;
    println!("Rerun of {run_id}");
    Ok(report(&outcome))
}

fn print_suggestion(label: &str, suggestion: &Suggestion) {
    let solution = &suggestion.solution;
    println!(
        "{label}: {} [{}] score {} success {:.0}% ({} attempts){}",
        solution.description,
        solution.solution_id,
        suggestion.score,
        solution.success_rate.percentage,
        solution.success_rate.attempts,
        if solution.is_automatable() {
            " automatable"
        } else {
            ""
        }
    );
    for step in &solution.remediation_steps {
        println!("    - {step}");
    }
}

fn report(outcome: &RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Completed { run_id } => {
            println!("Run {run_id} completed");
            ExitCode::SUCCESS
        }
        RunOutcome::AwaitingFeedback {
            run_id,
            request_id,
            prompt,
        } => {
            println!("Run {run_id} is waiting for feedback");
            println!("  Request: {request_id}");
            println!("  Prompt:  {prompt}");
            println!("Answer with: runwarden feedback {run_id} {request_id} <response>");
            ExitCode::from(EXIT_AWAITING_FEEDBACK)
        }
        RunOutcome::Cancelled { run_id } => {
            println!("Run {run_id} was cancelled while running");
            ExitCode::from(EXIT_HALTED)
        }
        RunOutcome::Halted(halt) => {
            println!("Run {} halted", halt.run_id);
            println!("{}", "─".repeat(60));
            println!("  Phase: {}", halt.phase);
            if let Some(step) = &halt.step {
                println!("  Step:  {} (#{})", step, halt.step_index);
            }
            println!("  Kind:  {}", halt.kind);
            println!("  Error: {}", halt.error);
            if let Some(issue_id) = &halt.issue_id {
                println!("  Issue: {issue_id}");
            }
            if let Some(suggestion) = &halt.suggestion {
                print_suggestion("  Suggested fix", suggestion);
                if suggestion.solution.is_automatable() {
                    println!(
                        "  Apply with: runwarden fix {} {} {}",
                        halt.run_id, suggestion.issue_id, suggestion.solution.solution_id
                    );
                }
            }
            println!();
            println!("Resume with: {}", halt.resume_command);
            ExitCode::from(EXIT_HALTED)
        }
    }
}

fn cmd_list(config: &Config) -> Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    let runs = supervisor.ledger().list_runs()?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(ExitCode::SUCCESS);
    }
    for run_id in runs {
        match supervisor.status(&run_id) {
            Ok(state) => println!(
                "{run_id}  {:<18} {}",
                state.status.to_string(),
                state.workflow_id.as_deref().unwrap_or("-")
            ),
            Err(e) => println!("{run_id}  unreadable: {e}"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(config: &Config, run_id: &RunId, json: bool) -> Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    let state = supervisor.status(run_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Run {run_id}: {}", state.status);
    if let Some(phase) = &state.current_phase {
        match state.current_step_index {
            Some(index) => println!("  Position: {phase} step {index}"),
            None => println!("  Position: {phase}"),
        }
    }
    for phase in &state.phases {
        println!("  {} [{}]", phase.name, phase.status);
        for step in state.steps_in_phase(&phase.name) {
            println!(
                "    {:>2}. {} [{}] attempts {}",
                step.index, step.step_id, step.status, step.attempts
            );
        }
    }
    if let Some(pending) = &state.pending_feedback {
        println!("  Waiting for feedback {}: {}", pending.request_id, pending.prompt);
    }
    if let Some(error) = state.last_step_failure() {
        println!("  Last error: {}", error.message);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_events(config: &Config, run_id: &RunId) -> Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    for event in supervisor.events(run_id)? {
        let position = match (&event.phase, event.step_index) {
            (Some(phase), Some(index)) => format!("{phase}#{index}"),
            (Some(phase), None) => phase.clone(),
            _ => String::new(),
        };
        println!(
            "{:06} {} {:<20} {:<16} {} {}",
            event.event_id,
            event.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            event.event_type.as_str(),
            position,
            event.source,
            event.message
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_fix(
    config: &Config,
    run_id: RunId,
    issue_id: String,
    solution_id: String,
) -> Result<ExitCode> {
    let supervisor = build_supervisor(config)?;
    let fix = supervisor.apply_fix(&run_id, &issue_id, &solution_id).await?;
    if fix.success {
        println!("Fix {} succeeded", fix.step.display_name());
    } else {
        println!(
            "Fix {} failed: {}",
            fix.step.display_name(),
            fix.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!(
        "Solution success rate: {:.0}% over {} attempts",
        fix.solution.success_rate.percentage, fix.solution.success_rate.attempts
    );
    if let Some(command) = &fix.resume_command {
        println!("Resume with: {command}");
    }
    Ok(if fix.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_HALTED)
    })
}

fn query(
    message: String,
    code: Option<String>,
    resource_type: Option<String>,
    env: Option<String>,
) -> IssueQuery {
    IssueQuery {
        message,
        code,
        resource_type,
        environment: env,
    }
}

fn cmd_issues(config: &Config, command: IssuesCommand) -> Result<ExitCode> {
    if !config.knowledge.enabled {
        bail!("The issue knowledge base is disabled in configuration");
    }
    let engine = issue_engine(config);
    match command {
        IssuesCommand::Search {
            message,
            code,
            resource_type,
            env,
        } => {
            let result = engine.search(&query(message, code, resource_type, env))?;
            let Some(top) = &result.top else {
                println!("No known solutions");
                return Ok(ExitCode::SUCCESS);
            };
            println!("Issue {}", top.issue_id);
            print_suggestion("Top", top);
            for alternate in &result.alternates {
                print_suggestion("Alternate", alternate);
            }
        }
        IssuesCommand::Record {
            message,
            code,
            resource_type,
            env,
        } => {
            let issue = engine.record_error(&query(message, code, resource_type, env))?;
            println!(
                "Issue {} ({}) seen {} times",
                issue.issue_id, issue.error.category, issue.occurrence_count
            );
        }
        IssuesCommand::Solve {
            issue_id,
            description,
            category,
            steps,
            capability,
            operation,
        } => {
            let automation = match (capability, operation) {
                (Some(capability), Some(operation)) => Some(Automation {
                    capability,
                    operation,
                    arguments: serde_json::Map::new(),
                }),
                _ => None,
            };
            let solution = engine.add_solution(
                &issue_id,
                NewSolution {
                    description,
                    category,
                    remediation_steps: steps,
                    automation,
                },
            )?;
            println!("Solution {} attached to {issue_id}", solution.solution_id);
        }
        IssuesCommand::Stats => {
            let stats = engine.statistics()?;
            println!("Issues:            {}", stats.total_issues);
            println!("Resolutions:       {}", stats.total_resolutions);
            if let Some(avg) = stats.avg_resolution_time {
                println!("Avg resolution:    {avg:.1}s");
            }
            println!("Automation rate:   {:.0}%", stats.automation_rate * 100.0);
            for category in &stats.most_common_categories {
                println!("  {:<16} {}", category.category, category.count);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
