pub mod completions;
pub mod create_environment;
pub mod deploy;
pub mod events;
pub mod gc;
pub mod lock;
pub mod release;
pub mod release_train;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use railhead_core::{shutdown_requested, CoreError, Engine, EngineConfig, Transformer};
use railhead_schema::Actor;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_LOCKED: u8 = 2;
pub const EXIT_VALIDATION: u8 = 3;

const READY_TIMEOUT: Duration = Duration::from_secs(120);

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize(word: &str) -> String {
    use console::Style;
    match word {
        "deployed" | "deploy" => Style::new().green().apply_to(word).to_string(),
        "queued" => Style::new().yellow().apply_to(word).to_string(),
        "locked" => Style::new().red().bold().apply_to(word).to_string(),
        "skipped" | "undeployed" => Style::new().dim().apply_to(word).to_string(),
        other => other.to_owned(),
    }
}

/// Render an engine error for the terminal. The prefix decides the exit code.
pub fn describe(e: &CoreError) -> String {
    match e {
        CoreError::Locked(locked) => format!("locked: {locked}"),
        CoreError::NestingTooDeep(_) => format!("invalid request: {e}"),
        _ => e.public_message(),
    }
}

pub fn open_engine(config: EngineConfig) -> Result<Engine, String> {
    let path = config.repository.path.clone();
    let engine = Engine::open(config).map_err(|e| describe(&e))?;
    if !engine.wait_ready_timeout(READY_TIMEOUT) {
        return Err(format!(
            "repository at {} not ready after {}s",
            path.display(),
            READY_TIMEOUT.as_secs()
        ));
    }
    Ok(engine)
}

/// Apply one request and report the resulting commit.
pub fn submit(
    config: EngineConfig,
    actor: Actor,
    transformers: Vec<Transformer>,
    json: bool,
) -> Result<u8, String> {
    let engine = open_engine(config)?;
    if shutdown_requested() {
        return Err("interrupted".to_owned());
    }
    let pb = (!json).then(|| spinner("applying..."));
    match engine.apply(actor, transformers) {
        Ok(outcome) => {
            if json {
                println!("{}", json_pretty(&outcome)?);
            } else {
                if let Some(pb) = &pb {
                    spin_ok(pb, &format!("committed {}", short(outcome.commit_id.as_str())));
                }
                println!("{}", outcome.message);
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "rejected");
            }
            if let (true, Some(locked)) = (json, e.as_locked()) {
                println!("{}", json_pretty(locked)?);
            }
            Err(describe(&e))
        }
    }
}

pub fn short(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use railhead_core::LockedError;
    use railhead_schema::{AppName, EnvName};
    use std::collections::BTreeMap;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_LOCKED);
        assert_ne!(EXIT_LOCKED, EXIT_VALIDATION);
    }

    #[test]
    fn locked_errors_are_prefixed() {
        let e = CoreError::from(LockedError {
            environment: EnvName::new("prod"),
            application: AppName::new("api"),
            environment_locks: BTreeMap::new(),
            application_locks: BTreeMap::new(),
            team_locks: BTreeMap::new(),
        });
        assert!(describe(&e).starts_with("locked: deploying \"api\" to \"prod\""));
    }

    #[test]
    fn validation_errors_keep_their_prefix() {
        let e = CoreError::Validation("bad name".to_owned());
        assert_eq!(describe(&e), "invalid request: bad name");
        assert!(describe(&CoreError::NestingTooDeep(16)).starts_with("invalid request:"));
    }

    #[test]
    fn internal_errors_are_opaque() {
        let e = CoreError::Io(std::io::Error::other("disk on fire"));
        assert_eq!(describe(&e), "internal error");
    }

    #[test]
    fn colorize_keeps_the_word() {
        assert!(colorize("deployed").contains("deployed"));
        assert!(colorize("locked").contains("locked"));
        assert_eq!(colorize("other"), "other");
    }

    #[test]
    fn short_truncates_commit_ids() {
        assert_eq!(short("0123456789abcdef0123"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
