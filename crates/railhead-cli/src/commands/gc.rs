use super::{describe, json_pretty, open_engine, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use railhead_core::EngineConfig;

pub fn run(config: EngineConfig, json: bool) -> Result<u8, String> {
    let engine = open_engine(config)?;
    let pb = (!json).then(|| spinner("repacking..."));
    let report = match engine.gc() {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "repack failed");
            }
            return Err(describe(&e));
        }
    };
    if json {
        let payload = serde_json::json!({
            "loose_before": report.loose_before,
            "packs_before": report.packs_before,
            "loose_after": report.loose_after,
            "packs_after": report.packs_after,
            "elapsed_ms": report.elapsed.as_millis(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        if let Some(pb) = &pb {
            spin_ok(pb, "repacked");
        }
        println!(
            "gc: {} loose objects, {} packs -> {} loose objects, {} packs in {:.1}s",
            report.loose_before,
            report.packs_before,
            report.loose_after,
            report.packs_after,
            report.elapsed.as_secs_f64()
        );
    }
    Ok(EXIT_SUCCESS)
}
