use super::{colorize, describe, json_pretty, open_engine, submit, EXIT_SUCCESS};
use railhead_core::{EngineConfig, ReleaseTrain, ReleaseTrainPrognosis, Transformer};
use railhead_schema::{Actor, CommitId, TargetType, TeamName};

pub struct Options {
    pub target: String,
    pub target_type: Option<TargetType>,
    pub team: Option<String>,
    pub commit: Option<String>,
    pub ci_link: Option<String>,
    pub prognosis: bool,
}

pub fn run(config: EngineConfig, actor: Actor, options: Options, json: bool) -> Result<u8, String> {
    let train = ReleaseTrain {
        target_type: options.target_type,
        team: options.team.map(TeamName::new),
        commit_hash: options.commit.map(CommitId::new),
        write_commit_data: config.transformers.write_commit_data,
        ci_link: options.ci_link,
        ..ReleaseTrain::new(options.target)
    };
    if !options.prognosis {
        return submit(config, actor, vec![Transformer::ReleaseTrain(train)], json);
    }

    let engine = open_engine(config)?;
    let prognosis = engine
        .release_train_prognosis(&train, actor)
        .map_err(|e| describe(&e))?;
    if json {
        println!("{}", json_pretty(&prognosis)?);
    } else {
        print!("{}", render(&prognosis));
    }
    Ok(EXIT_SUCCESS)
}

fn render(prognosis: &ReleaseTrainPrognosis) -> String {
    let mut out = String::new();
    if prognosis.environments.is_empty() {
        out.push_str(&format!("no environments match '{}'\n", prognosis.target));
        return out;
    }
    for (env, p) in &prognosis.environments {
        if let Some(cause) = p.skip_cause {
            out.push_str(&format!("{env}: {} ({cause})\n", colorize("skipped")));
            continue;
        }
        out.push_str(&format!("{env}: from {}\n", p.source));
        for (app, a) in &p.apps {
            let version = a.version.map_or_else(|| "-".to_owned(), |v| v.to_string());
            match a.skip_cause {
                Some(cause) => out.push_str(&format!(
                    "  {app:<24} {version:>6} {} ({cause})\n",
                    colorize("skipped")
                )),
                None => out.push_str(&format!("  {app:<24} {version:>6} {}\n", colorize("deploy"))),
            }
        }
    }
    out
}
