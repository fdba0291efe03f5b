use super::{describe, json_pretty, open_engine, short, EXIT_SUCCESS};
use railhead_core::EngineConfig;
use railhead_schema::CommitId;
use railhead_store::{CommitEventRow, EslEvent};

fn esl_json(events: &[EslEvent]) -> Result<serde_json::Value, String> {
    events
        .iter()
        .map(|e| {
            let request: serde_json::Value = serde_json::from_str(&e.json)
                .map_err(|err| format!("event {} is not valid JSON: {err}", e.esl_version))?;
            Ok(serde_json::json!({
                "eslVersion": e.esl_version,
                "created": e.created,
                "eventType": e.event_type,
                "request": request,
            }))
        })
        .collect::<Result<Vec<_>, String>>()
        .map(serde_json::Value::Array)
}

fn commit_json(events: &[CommitEventRow]) -> Result<serde_json::Value, String> {
    events
        .iter()
        .map(|e| {
            let event: serde_json::Value = serde_json::from_str(&e.json)
                .map_err(|err| format!("event {} is not valid JSON: {err}", e.uuid))?;
            Ok(serde_json::json!({
                "uuid": e.uuid,
                "timestamp": e.timestamp,
                "commitHash": e.commit_hash,
                "eventType": e.event_type,
                "transformerEslVersion": e.transformer_esl_version,
                "event": event,
            }))
        })
        .collect::<Result<Vec<_>, String>>()
        .map(serde_json::Value::Array)
}

pub fn run(
    config: EngineConfig,
    after: i64,
    limit: u32,
    commit: Option<&str>,
    json: bool,
) -> Result<u8, String> {
    let commit = commit
        .map(|c| CommitId::parse(c).map_err(|e| format!("invalid argument: {e}")))
        .transpose()?;
    let engine = open_engine(config)?;

    if let Some(commit) = commit {
        let events = engine.commit_events(&commit).map_err(|e| describe(&e))?;
        if json {
            println!("{}", json_pretty(&commit_json(&events)?)?);
        } else if events.is_empty() {
            println!("no events for {}", short(commit.as_str()));
        } else {
            for e in &events {
                let esl = e
                    .transformer_esl_version
                    .map_or_else(|| "-".to_owned(), |v| v.to_string());
                println!("{:<28} {:<26} esl {esl:<6} {}", e.timestamp, e.event_type, e.json);
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let events = engine.esl_events(after, limit).map_err(|e| describe(&e))?;
    if json {
        println!("{}", json_pretty(&esl_json(&events)?)?);
    } else if events.is_empty() {
        println!("no events after {after}");
    } else {
        println!("{:>8} {:<28} TYPE", "ESL", "CREATED");
        for e in &events {
            println!("{:>8} {:<28} {}", e.esl_version, e.created, e.event_type);
        }
    }
    Ok(EXIT_SUCCESS)
}
