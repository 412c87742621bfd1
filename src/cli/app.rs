//! Main CLI application

use crate::config::{parse_config_auto, parse_config_file, validate_config, HostPolicy};
use crate::runner::scheduler::EXIT_CANCELLED;
use crate::runner::{JobOrchestrator, Project, RunContext, RunReport, Scheduler, TaskGraph, Verbosity};
use crate::ui;
use crate::utils::parse_duration;
use anyhow::Context as _;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use clap_complete::{generate, Shell};
use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// CLI application
pub struct App {
    /// Loaded definitions
    project: Project,
    /// Config file path
    config_path: PathBuf,
}

impl App {
    /// Load the project from an explicit file or by discovery
    pub fn load(file: Option<PathBuf>) -> anyhow::Result<Self> {
        let (config, config_path) = match file {
            Some(path) => {
                let config = parse_config_file(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                (config, path)
            }
            None => parse_config_auto().context("failed to load runbook")?,
        };
        validate_config(&config)
            .with_context(|| format!("invalid runbook {}", config_path.display()))?;

        let base_dir = base_dir_of(&config_path);
        debug!(path = %config_path.display(), base_dir = %base_dir.display(), "loaded config");
        let project = Project::from_config(&config, &base_dir)?;

        Ok(App {
            project,
            config_path,
        })
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Run the targets or job selected on the command line and return the
    /// process exit code
    pub async fn run(&self, matches: &ArgMatches) -> anyhow::Result<i32> {
        let verbosity = get_verbosity(matches);

        if matches.get_flag("list") {
            print!("{}", ui::render_task_list(&self.project));
            return Ok(0);
        }

        let targets: Vec<String> = matches
            .get_many::<String>("targets")
            .map(|values| values.cloned().collect())
            .unwrap_or_default();
        let job = matches.get_one::<String>("job");

        if targets.is_empty() && job.is_none() {
            build_command().print_help()?;
            println!();
            return Ok(0);
        }

        let ctx = RunContext::new(&self.project)
            .with_context(matches.get_one::<String>("context").cloned())
            .with_concurrency(matches.get_one::<usize>("concurrency").copied())
            .with_timeout(matches.get_one::<Duration>("timeout").copied())
            .with_host_policy(matches.get_one::<HostPolicy>("host_policy").copied())
            .with_ssh_multiplexing(!matches.get_flag("no_ssh_reuse"))
            .with_verbosity(verbosity);
        let context = ctx.context.clone();

        let cancel = CancellationToken::new();
        watch_interrupt(cancel.clone());
        let scheduler = Scheduler::new(ctx);

        let report = match job {
            Some(job) => {
                let downstream = matches.get_flag("downstream");
                let plan = JobOrchestrator::new(&self.project, context.as_deref())
                    .plan(job, downstream)
                    .with_context(|| format!("cannot plan job '{}'", job))?;
                let report = scheduler.run(&plan.graph, cancel).await;
                print_report(&report, verbosity);
                if verbosity > Verbosity::Silent {
                    eprint!("{}", ui::render_job_reports(&plan.report(&report)));
                }
                report
            }
            None => {
                let graph = TaskGraph::build(&self.project.tasks, context.as_deref(), &targets)
                    .context("cannot build task graph")?;
                let report = scheduler.run(&graph, cancel).await;
                print_report(&report, verbosity);
                report
            }
        };

        Ok(report.exit_code())
    }
}

fn print_report(report: &RunReport, verbosity: Verbosity) {
    if verbosity > Verbosity::Silent {
        eprint!("{}", ui::render_run_report(report, verbosity));
    }
}

/// Cancel the run on the first Ctrl-C and exit on the second
fn watch_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if handle_interrupts(tokio::signal::ctrl_c, cancel).await {
            ui::print_error("interrupted again, exiting");
            process::exit(EXIT_CANCELLED);
        }
    });
}

/// Cancel `cancel` on the first interrupt. Returns true once a second
/// interrupt arrives.
async fn handle_interrupts<F, Fut>(mut interrupt: F, cancel: CancellationToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(e) = interrupt().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        return false;
    }
    warn!("interrupted, cancelling run; press Ctrl-C again to exit");
    cancel.cancel();
    interrupt().await.is_ok()
}

/// Directory relative task paths resolve against
fn base_dir_of(config_path: &Path) -> PathBuf {
    let parent = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf())
}

/// Build the clap command
pub fn build_command() -> Command {
    Command::new("runbook")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Run YAML-defined tasks as a concurrent dependency graph")
        .arg(
            Arg::new("targets")
                .value_name("TARGET")
                .help("Tasks to run")
                .num_args(0..)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("FILE")
                .help("Path to runbook.yml config file")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("NAME")
                .help("Activate a context, preferring `task:NAME` overrides"),
        )
        .arg(
            Arg::new("job")
                .long("job")
                .value_name("NAME")
                .help("Run a job and the jobs it needs")
                .conflicts_with("targets"),
        )
        .arg(
            Arg::new("downstream")
                .long("downstream")
                .help("With --job, run the jobs that need it instead of the ones it needs")
                .action(ArgAction::SetTrue)
                .requires("job"),
        )
        .arg(
            Arg::new("concurrency")
                .short('j')
                .long("concurrency")
                .value_name("N")
                .help("Maximum number of tasks running at once")
                .value_parser(parse_concurrency),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("DURATION")
                .help("Timeout replacing every task's own, e.g. 30s or 5m")
                .value_parser(parse_duration),
        )
        .arg(
            Arg::new("host_policy")
                .long("host-policy")
                .value_name("POLICY")
                .help("Sessions per remote host: parallel or serial")
                .value_parser(parse_host_policy),
        )
        .arg(
            Arg::new("no_ssh_reuse")
                .long("no-ssh-reuse")
                .help("Open a fresh SSH connection for every remote session")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .help("List tasks and jobs")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("completions")
                .long("completions")
                .value_name("SHELL")
                .help("Print a shell completion script")
                .value_parser(value_parser!(Shell)),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only print command output and errors")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("silent")
                .short('s')
                .long("silent")
                .help("Print no output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Print verbose output")
                .action(ArgAction::SetTrue),
        )
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("concurrency must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_host_policy(s: &str) -> Result<HostPolicy, String> {
    s.parse()
}

/// Get verbosity level from matches
pub fn get_verbosity(matches: &ArgMatches) -> Verbosity {
    if matches.get_flag("silent") {
        Verbosity::Silent
    } else if matches.get_flag("quiet") {
        Verbosity::Quiet
    } else if matches.get_flag("verbose") {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    }
}

/// Install the stderr log subscriber; `RUST_LOG` overrides the level
/// derived from verbosity
pub fn init_logging(verbosity: Verbosity) {
    let default = match verbosity {
        Verbosity::Silent => "off",
        Verbosity::Quiet => "error",
        Verbosity::Normal => "warn",
        Verbosity::Verbose => "runbook=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Run the CLI application with the process arguments
pub async fn run() -> anyhow::Result<i32> {
    run_from(std::env::args_os()).await
}

/// Run the CLI application with provided arguments
pub async fn run_from<I, T>(args: I) -> anyhow::Result<i32>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut command = build_command();
    let matches = command.clone().get_matches_from(args);
    init_logging(get_verbosity(&matches));

    if let Some(shell) = matches.get_one::<Shell>("completions").copied() {
        generate(shell, &mut command, "runbook", &mut io::stdout());
        return Ok(0);
    }

    let app = App::load(matches.get_one::<PathBuf>("file").cloned())?;
    app.run(&matches).await
}
