mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::{EXIT_FAILURE, EXIT_LOCKED, EXIT_VALIDATION};
use railhead_core::{install_signal_handler, EngineConfig};
use railhead_schema::{Actor, LockBehaviour, TargetType};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "railhead",
    version,
    about = "GitOps release orchestration backed by a single git repository"
)]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local working directory of the manifest repository. Overrides
    /// `repository.path` from --config.
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Name recorded as the author of changes.
    #[arg(long, global = true)]
    author_name: Option<String>,

    /// Email recorded as the author of changes.
    #[arg(long, global = true)]
    author_email: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or reconfigure an environment.
    CreateEnvironment {
        name: String,
        /// Follow the newest release of every application.
        #[arg(long, conflicts_with = "upstream")]
        latest: bool,
        /// Promote from this environment with release trains.
        #[arg(long)]
        upstream: Option<String>,
        /// Environment group the environment belongs to.
        #[arg(long)]
        group: Option<String>,
        /// Read the whole environment configuration from a JSON file.
        #[arg(long, conflicts_with_all = ["latest", "upstream", "group"])]
        config_file: Option<PathBuf>,
    },
    /// Create a new release of an application.
    Release {
        application: String,
        /// Manifest per environment, as ENV=FILE. Repeatable.
        #[arg(long = "manifest", value_name = "ENV=FILE", required = true, value_parser = commands::release::parse_manifest_arg)]
        manifests: Vec<(String, PathBuf)>,
        /// Explicit release number; the next free one is used otherwise.
        #[arg(long)]
        version: Option<u64>,
        /// Team owning the application.
        #[arg(long)]
        team: Option<String>,
        /// Source repository commit the release was built from.
        #[arg(long)]
        source_commit: Option<String>,
        #[arg(long)]
        source_author: Option<String>,
        #[arg(long)]
        source_message: Option<String>,
        #[arg(long)]
        display_version: Option<String>,
    },
    /// Release an undeploy version of an application.
    Undeploy { application: String },
    /// Deploy an existing release into one environment.
    Deploy {
        environment: String,
        application: String,
        version: u64,
        /// What to do when a lock blocks the deploy: fail, queue or ignore.
        #[arg(long, default_value_t = LockBehaviour::Fail)]
        lock_behaviour: LockBehaviour,
        #[arg(long)]
        ci_link: Option<String>,
    },
    /// Create a lock.
    Lock {
        #[command(subcommand)]
        target: LockTarget,
    },
    /// Delete a lock.
    Unlock {
        #[command(subcommand)]
        target: UnlockTarget,
    },
    /// Promote what upstream environments run into an environment or group.
    ReleaseTrain {
        target: String,
        /// How to interpret TARGET; groups win over environments by default.
        #[arg(long, value_enum)]
        target_type: Option<TrainTargetType>,
        /// Only promote applications owned by this team.
        #[arg(long)]
        team: Option<String>,
        /// Take upstream versions from this manifest repository commit.
        #[arg(long)]
        commit: Option<String>,
        #[arg(long)]
        ci_link: Option<String>,
        /// Report what the train would do without writing anything.
        #[arg(long, default_value_t = false)]
        prognosis: bool,
    },
    /// Show deployed and queued versions and the locks of an environment.
    Status { environment: String },
    /// List mirrored requests, or the events recorded for a source commit.
    Events {
        /// Only requests after this event-sourcing version.
        #[arg(long, default_value_t = 0)]
        after: i64,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Show events of this source commit instead.
        #[arg(long)]
        commit: Option<String>,
    },
    /// Repack the local repository.
    Gc,
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum LockTarget {
    /// Lock an environment.
    Env {
        environment: String,
        lock_id: String,
        #[command(flatten)]
        details: LockDetails,
    },
    /// Lock one application in an environment.
    App {
        environment: String,
        application: String,
        lock_id: String,
        #[command(flatten)]
        details: LockDetails,
    },
    /// Lock every application of a team in an environment.
    Team {
        environment: String,
        team: String,
        lock_id: String,
        #[command(flatten)]
        details: LockDetails,
    },
    /// Lock every environment of a group.
    Group {
        group: String,
        lock_id: String,
        #[command(flatten)]
        details: LockDetails,
    },
}

#[derive(Debug, Subcommand)]
enum UnlockTarget {
    Env {
        environment: String,
        lock_id: String,
    },
    App {
        environment: String,
        application: String,
        lock_id: String,
    },
    Team {
        environment: String,
        team: String,
        lock_id: String,
    },
    Group {
        group: String,
        lock_id: String,
    },
}

#[derive(Debug, Clone, clap::Args)]
struct LockDetails {
    /// Why the lock exists.
    #[arg(short, long)]
    message: String,
    #[arg(long)]
    ci_link: Option<String>,
    /// How long the lock is expected to stay, e.g. "2d".
    #[arg(long)]
    lifetime: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TrainTargetType {
    Environment,
    Group,
}

impl From<TrainTargetType> for TargetType {
    fn from(t: TrainTargetType) -> Self {
        match t {
            TrainTargetType::Environment => TargetType::Environment,
            TrainTargetType::Group => TargetType::EnvironmentGroup,
        }
    }
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RAILHEAD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let json_output = cli.json;
    if let Commands::Completions { shell } = cli.command {
        return finish(commands::completions::run::<Cli>(shell));
    }

    let config = match load_config(cli.config.as_deref(), cli.repo.as_deref()) {
        Ok(config) => config,
        Err(msg) => return finish(Err(msg)),
    };
    let actor = actor(cli.author_name, cli.author_email);

    let result = match cli.command {
        Commands::CreateEnvironment {
            name,
            latest,
            upstream,
            group,
            config_file,
        } => commands::create_environment::run(
            config,
            actor,
            &name,
            commands::create_environment::Options {
                latest,
                upstream,
                group,
                config_file,
            },
            json_output,
        ),
        Commands::Release {
            application,
            manifests,
            version,
            team,
            source_commit,
            source_author,
            source_message,
            display_version,
        } => commands::release::run(
            config,
            actor,
            &application,
            &manifests,
            commands::release::Options {
                version,
                team,
                source_commit,
                source_author,
                source_message,
                display_version,
            },
            json_output,
        ),
        Commands::Undeploy { application } => {
            commands::release::undeploy(config, actor, &application, json_output)
        }
        Commands::Deploy {
            environment,
            application,
            version,
            lock_behaviour,
            ci_link,
        } => commands::deploy::run(
            config,
            actor,
            &environment,
            &application,
            version,
            lock_behaviour,
            ci_link,
            json_output,
        ),
        Commands::Lock { target } => {
            commands::lock::create(config, actor, lock_request(target), json_output)
        }
        Commands::Unlock { target } => {
            commands::lock::delete(config, actor, unlock_request(target), json_output)
        }
        Commands::ReleaseTrain {
            target,
            target_type,
            team,
            commit,
            ci_link,
            prognosis,
        } => commands::release_train::run(
            config,
            actor,
            commands::release_train::Options {
                target,
                target_type: target_type.map(TargetType::from),
                team,
                commit,
                ci_link,
                prognosis,
            },
            json_output,
        ),
        Commands::Status { environment } => {
            commands::status::run(config, &environment, json_output)
        }
        Commands::Events {
            after,
            limit,
            commit,
        } => commands::events::run(config, after, limit, commit.as_deref(), json_output),
        Commands::Gc => commands::gc::run(config, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    finish(result)
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("locked:") {
                EXIT_LOCKED
            } else if msg.starts_with("invalid request:")
                || msg.starts_with("invalid argument:")
            {
                EXIT_VALIDATION
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn load_config(path: Option<&std::path::Path>, repo: Option<&str>) -> Result<EngineConfig, String> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::for_local(expand_tilde(
            repo.unwrap_or("~/.local/share/railhead/repo"),
        )),
    };
    if let (Some(_), Some(repo)) = (path, repo) {
        config.repository.path = expand_tilde(repo);
    }
    Ok(config)
}

fn actor(name: Option<String>, email: Option<String>) -> Actor {
    let name = name
        .or_else(|| std::env::var("RAILHEAD_AUTHOR_NAME").ok())
        .unwrap_or_else(|| "railhead".to_owned());
    let email = email
        .or_else(|| std::env::var("RAILHEAD_AUTHOR_EMAIL").ok())
        .unwrap_or_else(|| "railhead@localhost".to_owned());
    Actor::new(name, email)
}

fn lock_request(target: LockTarget) -> commands::lock::LockRequest {
    use commands::lock::{LockRequest, LockScopeArg};
    let (scope, lock_id, details) = match target {
        LockTarget::Env {
            environment,
            lock_id,
            details,
        } => (LockScopeArg::Environment { environment }, lock_id, details),
        LockTarget::App {
            environment,
            application,
            lock_id,
            details,
        } => (
            LockScopeArg::Application {
                environment,
                application,
            },
            lock_id,
            details,
        ),
        LockTarget::Team {
            environment,
            team,
            lock_id,
            details,
        } => (LockScopeArg::Team { environment, team }, lock_id, details),
        LockTarget::Group {
            group,
            lock_id,
            details,
        } => (LockScopeArg::Group { group }, lock_id, details),
    };
    LockRequest {
        scope,
        lock_id,
        message: details.message,
        ci_link: details.ci_link,
        lifetime: details.lifetime,
    }
}

fn unlock_request(target: UnlockTarget) -> (commands::lock::LockScopeArg, String) {
    use commands::lock::LockScopeArg;
    match target {
        UnlockTarget::Env {
            environment,
            lock_id,
        } => (LockScopeArg::Environment { environment }, lock_id),
        UnlockTarget::App {
            environment,
            application,
            lock_id,
        } => (
            LockScopeArg::Application {
                environment,
                application,
            },
            lock_id,
        ),
        UnlockTarget::Team {
            environment,
            team,
            lock_id,
        } => (LockScopeArg::Team { environment, team }, lock_id),
        UnlockTarget::Group { group, lock_id } => (LockScopeArg::Group { group }, lock_id),
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
