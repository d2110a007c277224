#![forbid(unsafe_code)]

use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{self, Config};
use crate::core::clock;
use crate::hub::{NewTask, StatusUpdate, TaskDetails, TaskHub};
use crate::output::table::Table;
use crate::task::execution::ExecutionStatusInfo;
use crate::task::model::{Priority, TaskRecord, TaskStatus};
use crate::task::sync::SyncReport;

#[derive(Debug, Parser)]
#[command(
    name = "taskhub",
    version,
    about = "Markdown task index with tmux-backed task execution"
)]
pub struct Cli {
    /// Log debug output to stderr
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Task(TaskArgs),
    Exec(ExecArgs),
    Logs(LogsArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    Create(TaskCreateArgs),
    Index(TaskIndexArgs),
    List(TaskListArgs),
    Show(TaskShowArgs),
    Status(TaskStatusArgs),
    #[command(alias = "rm")]
    Delete(TaskDeleteArgs),
    Sync(TaskSyncArgs),
}

#[derive(Debug, Parser)]
pub struct TaskCreateArgs {
    /// Task title; also names the file
    pub title: String,
    /// Initial Markdown body
    #[arg(short = 'c', long = "content", default_value = "")]
    pub content: String,
    /// Sub-directory of the tasks directory
    #[arg(short = 'd', long = "dir")]
    pub directory: Option<String>,
    #[arg(short = 'p', long = "priority")]
    pub priority: Option<Priority>,
    #[arg(short = 'a', long = "assignee")]
    pub assignee: Option<String>,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskIndexArgs {
    /// Path of an existing task file, relative to the tasks directory
    pub file_path: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskListArgs {
    #[arg(short = 's', long = "status")]
    pub status: Option<TaskStatus>,
    #[arg(long = "json")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct TaskShowArgs {
    /// Task id or unique id prefix
    pub task: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskStatusArgs {
    /// Task id or unique id prefix
    pub task: String,
    pub status: TaskStatus,
    /// Output artifact; repeat for several
    #[arg(long = "artifact")]
    pub artifacts: Vec<String>,
    #[arg(short = 'p', long = "priority")]
    pub priority: Option<Priority>,
    #[arg(short = 'a', long = "assignee")]
    pub assignee: Option<String>,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskDeleteArgs {
    /// Task id or unique id prefix
    pub task: String,
    /// Also delete the Markdown file
    #[arg(long = "remove-file")]
    pub remove_file: bool,
}

#[derive(Debug, Parser)]
pub struct TaskSyncArgs {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ExecArgs {
    #[command(subcommand)]
    pub cmd: ExecCmd,
}

#[derive(Debug, Subcommand)]
pub enum ExecCmd {
    Run(ExecRunArgs),
    Status(ExecStatusArgs),
    Logs(ExecLogsArgs),
    Stop(ExecTaskArgs),
    Attach(ExecTaskArgs),
    /// List live sessions started by this hub
    Sessions,
}

#[derive(Debug, Parser)]
pub struct ExecRunArgs {
    /// Task id or unique id prefix
    pub task: String,
    /// Run this shell script instead of the task's execute.sh
    #[arg(long = "script", conflicts_with = "script_file")]
    pub script: Option<String>,
    /// Read the script to run from a file
    #[arg(long = "script-file")]
    pub script_file: Option<PathBuf>,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ExecStatusArgs {
    /// Task id or unique id prefix
    pub task: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ExecLogsArgs {
    /// Task id or unique id prefix
    pub task: String,
    /// Number of trailing lines; 0 or less prints everything
    #[arg(short = 'n', long = "tail", allow_negative_numbers = true)]
    pub tail: Option<i64>,
}

#[derive(Debug, Parser)]
pub struct ExecTaskArgs {
    /// Task id or unique id prefix
    pub task: String,
}

#[derive(Debug, Parser)]
pub struct LogsArgs {
    #[command(subcommand)]
    pub cmd: LogsCmd,
}

#[derive(Debug, Subcommand)]
pub enum LogsCmd {
    Clean(LogsCleanArgs),
}

#[derive(Debug, Parser)]
pub struct LogsCleanArgs {
    /// Retention in days; defaults to logs.retention_days
    #[arg(long = "days")]
    pub days: Option<u64>,
    /// Skip the confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli).await;
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "taskhub", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(args) => match args.cmd {
            ConfigCmd::List => {
                print!("{}", config::list_resolved_toml()?);
                Ok(ExitCode::SUCCESS)
            }
            ConfigCmd::Set(set) => {
                config::set_value_string(&set.key, &set.value)?;
                println!("Set {} = {}", set.key, set.value);
                Ok(ExitCode::SUCCESS)
            }
            ConfigCmd::Get(get) => {
                let val = config::get_value_string(&get.key)?;
                match val {
                    Some(v) => {
                        println!("{v}");
                        Ok(ExitCode::SUCCESS)
                    }
                    None => anyhow::bail!(
                        "configuration key '{}' not found - use 'taskhub config list' to see available keys",
                        get.key
                    ),
                }
            }
        },
        Commands::Version => Ok(cmd_version()),
        Commands::Task(args) => {
            let (cfg, hub) = open_hub().await?;
            let result = cmd_task(&cfg, &hub, args).await;
            hub.shutdown().await;
            result
        }
        Commands::Exec(args) => {
            let (cfg, hub) = open_hub().await?;
            let result = cmd_exec(&cfg, &hub, args).await;
            hub.shutdown().await;
            result
        }
        Commands::Logs(args) => {
            let (cfg, hub) = open_hub().await?;
            let result = match args.cmd {
                LogsCmd::Clean(clean) => logs_clean(&cfg, &hub, &clean),
            };
            hub.shutdown().await;
            result
        }
    }
}

async fn load_cfg() -> anyhow::Result<Config> {
    let cfg = tokio::task::spawn_blocking(|| -> anyhow::Result<Config> {
        let (cfg, _doc, _paths) = config::load()?;
        Ok(cfg)
    })
    .await??;
    Ok(cfg)
}

async fn open_hub() -> anyhow::Result<(Config, TaskHub)> {
    let cfg = load_cfg().await?;
    let hub = TaskHub::open(&cfg)?;
    Ok((cfg, hub))
}

async fn cmd_task(cfg: &Config, hub: &TaskHub, args: TaskArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        TaskCmd::Create(a) => {
            let record = hub.create_task(NewTask {
                title: a.title,
                content: a.content,
                directory: a.directory,
                priority: a.priority,
                assignee: a.assignee,
            })
            .await?;
            if a.json {
                print_json(&record)?;
            } else {
                println!("Created task {} ({})", record.id, record.file_path);
            }
        }
        TaskCmd::Index(a) => {
            let record = hub.index_task(&a.file_path).await?;
            if a.json {
                print_json(&record)?;
            } else {
                println!("Indexed {} as {}", record.file_path, record.id);
            }
        }
        TaskCmd::List(a) => task_list(hub, &a)?,
        TaskCmd::Show(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            let details = hub.task_details(&id)?;
            if a.json {
                print_json(&details)?;
            } else {
                print_task_details(cfg, &details);
            }
        }
        TaskCmd::Status(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            let record = hub.update_status(
                &id,
                StatusUpdate {
                    status: a.status,
                    artifacts: (!a.artifacts.is_empty()).then_some(a.artifacts),
                    priority: a.priority,
                    assignee: a.assignee,
                },
            )
            .await?;
            if a.json {
                print_json(&record)?;
            } else {
                println!("Task {} is now {}", record.id, record.status);
            }
        }
        TaskCmd::Delete(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            let record = hub.delete_task(&id, a.remove_file).await?;
            if a.remove_file {
                println!("Deleted task {} and {}", record.id, record.file_path);
            } else {
                println!("Deleted task {} (kept {})", record.id, record.file_path);
            }
        }
        TaskCmd::Sync(a) => {
            let report = hub.sync_from_files().await?;
            print_sync_report(&report, a.json)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn task_list(hub: &TaskHub, args: &TaskListArgs) -> anyhow::Result<()> {
    let tasks = hub.list_tasks(args.status);

    if args.json {
        return print_json(&tasks);
    }

    if args.csv {
        let mut t = Table::new([
            "id",
            "title",
            "status",
            "priority",
            "assignee",
            "file_path",
            "updated_at",
        ]);
        for task in &tasks {
            t.row([
                task.id.clone(),
                task.title.clone(),
                task.status.to_string(),
                task.priority.map(|p| p.to_string()).unwrap_or_default(),
                task.assignee.clone().unwrap_or_default(),
                task.file_path.clone(),
                clock::format(task.updated_at),
            ]);
        }
        t.write_csv()?;
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let mut t = Table::new(["ID", "TITLE", "STATUS", "PRIORITY", "ASSIGNEE", "FILE"]);
    for task in &tasks {
        t.row(task_row(task));
    }
    t.print()?;
    Ok(())
}

fn task_row(task: &TaskRecord) -> [String; 6] {
    [
        truncate_id(&task.id),
        truncate(&task.title, 40),
        format!("{} {}", task_status_icon(task.status), task.status),
        task.priority.map_or_else(|| "-".to_owned(), |p| p.to_string()),
        task.assignee.clone().unwrap_or_else(|| "-".to_owned()),
        task.file_path.clone(),
    ]
}

fn print_task_details(cfg: &Config, details: &TaskDetails) {
    let task = &details.task;
    println!("Task: {} (ID: {})", task.title, task.id);
    println!("Status: {}", task.status);
    if let Some(priority) = task.priority {
        println!("Priority: {priority}");
    }
    if let Some(assignee) = task.assignee.as_deref() {
        println!("Assignee: {assignee}");
    }
    println!("File: {}", task.file_path);
    if let Ok(layout) = cfg.layout() {
        let full = layout.tasks_dir.join(&task.file_path);
        println!("Path: {}", config::tilde_path(&full.to_string_lossy()));
    }
    if let Some(created) = details.created_at {
        println!("Created: {}", clock::format(created));
    }
    println!("Updated: {}", clock::format(task.updated_at));
    if !details.tags.is_empty() {
        println!("Tags: {}", details.tags.join(", "));
    }
    if !task.artifacts.is_empty() {
        println!("Artifacts:");
        for a in &task.artifacts {
            println!("- {a}");
        }
    }

    match details.content.as_deref() {
        Some(body) if !body.trim().is_empty() => println!("\n{body}"),
        Some(_) => {}
        None => println!("\n(backing file missing or unreadable)"),
    }
}

fn print_sync_report(report: &SyncReport, json: bool) -> anyhow::Result<()> {
    if json {
        let skipped: Vec<serde_json::Value> = report
            .skipped
            .iter()
            .map(|s| serde_json::json!({ "file_path": s.file_path, "reason": s.reason }))
            .collect();
        return print_json(&serde_json::json!({
            "synced": report.synced,
            "skipped": skipped,
        }));
    }

    println!("Synced {} tasks from files.", report.synced);
    if !report.skipped.is_empty() {
        println!("Skipped {} files:", report.skipped.len());
        for s in &report.skipped {
            println!("- {}: {}", s.file_path, s.reason);
        }
    }
    Ok(())
}

async fn cmd_exec(cfg: &Config, hub: &TaskHub, args: ExecArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ExecCmd::Run(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            let script = match (a.script, a.script_file.as_deref()) {
                (Some(s), _) => Some(s),
                (None, Some(path)) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read {}", path.display()))?,
                ),
                (None, None) => None,
            };
            let record = hub.execute_task(&id, script.as_deref()).await?;
            if a.json {
                print_json(&record)?;
            } else {
                println!("Started {} in session {}", record.task_id, record.session_name);
                println!("Log: {}", config::tilde_path(&record.log_file.to_string_lossy()));
                println!(
                    "Attach: {}",
                    hub.attach_command(&id)
                        .await
                        .unwrap_or_else(|_| "-".to_owned())
                );
            }
        }
        ExecCmd::Status(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            let info = hub.execution_status(&id).await?;
            if a.json {
                print_json(&info)?;
            } else {
                print_execution_status(&info);
            }
        }
        ExecCmd::Logs(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            let tail = a.tail.unwrap_or(cfg.logs.default_tail);
            for line in hub.execution_logs(&id, tail) {
                println!("{line}");
            }
        }
        ExecCmd::Stop(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            if hub.stop_task_execution(&id).await? {
                println!("Stopped execution of {id}; task moved to review.");
            } else {
                println!("No running execution for {id}.");
                return Ok(ExitCode::from(1));
            }
        }
        ExecCmd::Attach(a) => {
            let id = resolve_task_id(hub, &a.task)?;
            println!("{}", hub.attach_command(&id).await?);
        }
        ExecCmd::Sessions => {
            let sessions = hub.live_sessions().await?;
            if sessions.is_empty() {
                println!("No live sessions.");
            }
            for s in sessions {
                println!("{}", s.name);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_execution_status(info: &ExecutionStatusInfo) {
    println!("Task: {}", info.task_id);
    println!(
        "Status: {}{}",
        info.status_label(),
        if info.is_running { " (session alive)" } else { "" }
    );
    if let Some(exec) = info.execution.as_ref() {
        println!("Execution: {}", exec.execution_id);
        println!("Session: {}", exec.session_name);
        println!("Started: {}", clock::format(exec.started_at));
        if let Some(done) = exec.completed_at {
            println!("Completed: {} ({})", clock::format(done), format_duration(done - exec.started_at));
        }
        if let Some(stopped) = exec.stopped_at {
            println!("Stopped: {}", clock::format(stopped));
        }
        if let Some(code) = exec.exit_code {
            println!("Exit code: {code}");
        }
        println!("Log: {}", config::tilde_path(&exec.log_file.to_string_lossy()));
    }
    if let Some(msg) = info.message.as_deref() {
        println!("{msg}");
    }
}

fn logs_clean(cfg: &Config, hub: &TaskHub, args: &LogsCleanArgs) -> anyhow::Result<ExitCode> {
    let days = args.days.unwrap_or(cfg.logs.retention_days);
    if !args.yes {
        if !std::io::stdin().is_terminal() {
            anyhow::bail!("log cleanup needs confirmation; pass --yes when not on a TTY");
        }
        print!("Delete execution logs older than {days} days? [y/N]: ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let mut resp = String::new();
        let _ = std::io::stdin().read_line(&mut resp)?;
        if resp.trim().to_lowercase() != "y" {
            println!("Cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let removed = hub.cleanup_logs(days)?;
    if removed == 0 {
        println!("No old logs found to clean.");
    } else {
        println!("Cleaned {removed} files.");
    }
    Ok(ExitCode::SUCCESS)
}

/// Exact id, or a prefix matching exactly one indexed task.
fn resolve_task_id(hub: &TaskHub, pattern: &str) -> anyhow::Result<String> {
    let pattern = pattern.trim();
    if hub.get_task(pattern).is_ok() {
        return Ok(pattern.to_owned());
    }

    let mut matches: Vec<TaskRecord> = hub
        .list_tasks(None)
        .into_iter()
        .filter(|t| t.id.starts_with(pattern))
        .collect();

    if matches.is_empty() {
        anyhow::bail!("no task found matching: {pattern}");
    }
    if matches.len() > 1 {
        anyhow::bail!(
            "multiple tasks match '{pattern}': {} matches",
            matches.len()
        );
    }
    Ok(matches.remove(0).id)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let mut s = serde_json::to_string_pretty(value)?;
    s.push('\n');
    print!("{s}");
    Ok(())
}

fn task_status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "○",
        TaskStatus::InProgress => "●",
        TaskStatus::Review => "◐",
        TaskStatus::Done => "✓",
    }
}

fn format_duration(d: time::Duration) -> String {
    if d < time::Duration::minutes(1) {
        return format!("{}s", d.whole_seconds());
    }
    if d < time::Duration::hours(1) {
        return format!("{}m", d.whole_minutes());
    }
    let hours = d.whole_hours();
    let minutes = (d - time::Duration::hours(hours)).whole_minutes();
    format!("{hours}h {minutes}m")
}

fn cmd_version() -> ExitCode {
    println!("taskhub version {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("TASKHUB_GIT_COMMIT") {
        println!("  commit: {commit}");
    }
    if let Some(date) = option_env!("TASKHUB_BUILD_DATE") {
        println!("  built: {date}");
    }
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

fn truncate_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn truncate(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push_str("...");
    }
    out
}
