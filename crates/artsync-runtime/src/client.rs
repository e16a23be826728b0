//! UDS JSON-RPC client for CLI subcommands.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use artsync_core::{EventLogEntry, render_text};

pub(crate) async fn rpc_call(socket_path: &str, method: &str, params: Value) -> anyhow::Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to daemon at {socket_path}: {e}"))?;

    let (reader, mut writer) = stream.into_split();

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Value = serde_json::from_str(line.trim())?;

    if let Some(error) = response.get("error") {
        anyhow::bail!(
            "RPC error {}: {}",
            error["code"],
            error["message"].as_str().unwrap_or("unknown")
        );
    }

    Ok(response["result"].clone())
}

fn pair_params(pair: Option<&str>) -> Value {
    match pair {
        Some(p) => serde_json::json!({ "pair": p }),
        None => serde_json::json!({}),
    }
}

/// `artsync status`: one block per pair.
pub async fn cmd_status(socket_path: &str, pair: Option<&str>, json: bool) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "status", pair_params(pair)).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    let blocks: Vec<String> = match result.as_array() {
        Some(all) => all.iter().map(format_status).collect(),
        None => vec![format_status(&result)],
    };
    if blocks.is_empty() {
        println!("No pairs running");
    } else {
        println!("{}", blocks.join("\n\n"));
    }
    Ok(())
}

/// Pure formatting of one status snapshot, separated for testability.
pub(crate) fn format_status(s: &Value) -> String {
    let text = |v: &Value| v.as_str().map_or_else(|| "-".to_string(), str::to_string);
    let secs = |v: &Value| v.as_u64().unwrap_or(0);

    let mut lines = vec![
        format!("{} [{}] {}", text(&s["pair"]), text(&s["health"]), text(&s["phase"])),
        format!(
            "  desired {}{}  actual {}",
            text(&s["desired"]),
            if s["advisory"].as_bool() == Some(true) { " (advisory)" } else { "" },
            text(&s["actual"]),
        ),
        format!(
            "  source {} / {}  link {}",
            text(&s["activity"]["playback"]),
            text(&s["activity"]["power"]),
            text(&s["connection"]),
        ),
        format!(
            "  window {}  presence {}",
            if s["in_window"].as_bool() == Some(true) { "active" } else { "night" },
            text(&s["presence"]),
        ),
    ];

    let mut flags = Vec::new();
    if s["enabled"].as_bool() == Some(false) {
        flags.push("disabled".to_string());
    }
    if s["dry_run"].as_bool() == Some(true) {
        flags.push("dry-run".to_string());
    }
    if s["override_active"].as_bool() == Some(true) {
        flags.push(format!("override {}s", secs(&s["override_remaining_secs"])));
    }
    if s["breaker_open"].as_bool() == Some(true) {
        flags.push(format!("breaker open {}s", secs(&s["breaker_remaining_secs"])));
    }
    if secs(&s["cooldown_remaining_secs"]) > 0 {
        flags.push(format!("cooldown {}s", secs(&s["cooldown_remaining_secs"])));
    }
    if secs(&s["backoff_remaining_secs"]) > 0 {
        flags.push(format!("backoff {}s", secs(&s["backoff_remaining_secs"])));
    }
    if s["return_pending"].as_bool() == Some(true) {
        flags.push("return pending".to_string());
    }
    if !flags.is_empty() {
        lines.push(format!("  {}", flags.join(", ")));
    }

    lines.push(format!(
        "  commands {}/5min  failures {}  drifts {} ({} total)",
        secs(&s["commands_in_window"]),
        secs(&s["consecutive_failures"]),
        secs(&s["consecutive_drifts"]),
        secs(&s["total_drifts"]),
    ));
    if let Some(action) = s["last_action"].as_str() {
        lines.push(format!(
            "  last {action}: {} ({})",
            text(&s["last_result"]),
            text(&s["last_trigger"]),
        ));
    }
    if let Some(err) = s["last_error"].as_str() {
        lines.push(format!("  error: {err}"));
    }
    lines.join("\n")
}

/// `artsync events`
pub async fn cmd_events(
    socket_path: &str,
    pair: Option<&str>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let mut params = pair_params(pair);
    params["limit"] = limit.into();
    let result = rpc_call(socket_path, "events", params).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    let entries: Vec<EventLogEntry> = serde_json::from_value(result)?;
    println!("{}", render_text(&entries));
    Ok(())
}

/// `artsync list-pairs`
pub async fn cmd_list_pairs(socket_path: &str) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "list_pairs", Value::Null).await?;
    let pairs = result.as_array().cloned().unwrap_or_default();
    if pairs.is_empty() {
        println!("No pairs running");
        return Ok(());
    }
    for p in &pairs {
        println!(
            "{:<20} {:<18} {:<10} {}",
            p["pair"].as_str().unwrap_or("?"),
            p["display"].as_str().unwrap_or("?"),
            p["health"].as_str().unwrap_or("?"),
            p["desired"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Control commands: force_*, resync, clear_*, repair_source.
pub async fn cmd_control(socket_path: &str, method: &str, pair: Option<&str>) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, method, pair_params(pair)).await?;
    println!("{}", format_outcome(&result));
    Ok(())
}

pub(crate) fn format_outcome(result: &Value) -> String {
    if let Some(outcome) = result["outcome"].as_str() {
        return match result["gate"]["gate"].as_str() {
            Some(gate) => format!("{outcome} ({gate})"),
            None => outcome.replace('_', " "),
        };
    }
    if let Some(was_open) = result["was_open"].as_bool() {
        return if was_open { "breaker cleared" } else { "breaker was not open" }.to_string();
    }
    if let Some(requested) = result["requested"].as_bool() {
        return if requested {
            "source reconnect requested"
        } else {
            "source is not waiting for re-pairing"
        }
        .to_string();
    }
    result.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status() -> Value {
        json!({
            "pair": "den",
            "phase": "idle",
            "health": "ok",
            "enabled": true,
            "dry_run": false,
            "desired": "art",
            "advisory": false,
            "actual": "on",
            "activity": { "active": false, "playback": "idle", "power": "on" },
            "connection": "connected",
            "in_window": true,
            "presence": "unknown",
            "override_active": false,
            "breaker_open": false,
            "cooldown_remaining_secs": 0,
            "backoff_remaining_secs": 0,
            "return_pending": false,
            "commands_in_window": 1,
            "consecutive_failures": 0,
            "consecutive_drifts": 0,
            "total_drifts": 2,
            "last_action": "art_on",
            "last_result": "success",
            "last_trigger": "resync",
            "last_error": null,
        })
    }

    #[test]
    fn format_status_basic() {
        let out = format_status(&status());
        assert!(out.starts_with("den [ok] idle"));
        assert!(out.contains("desired art  actual on"));
        assert!(out.contains("source idle / on  link connected"));
        assert!(out.contains("commands 1/5min"));
        assert!(out.contains("(2 total)"));
        assert!(out.contains("last art_on: success (resync)"));
        assert!(!out.contains("error:"));
    }

    #[test]
    fn format_status_flags() {
        let mut s = status();
        s["override_active"] = json!(true);
        s["override_remaining_secs"] = json!(1200);
        s["breaker_open"] = json!(true);
        s["breaker_remaining_secs"] = json!(90);
        s["dry_run"] = json!(true);
        s["advisory"] = json!(true);
        s["last_error"] = json!("display unreachable");
        let out = format_status(&s);
        assert!(out.contains("dry-run, override 1200s, breaker open 90s"));
        assert!(out.contains("(advisory)"));
        assert!(out.contains("error: display unreachable"));
    }

    #[test]
    fn format_outcome_variants() {
        assert_eq!(format_outcome(&json!({ "outcome": "already_correct" })), "already correct");
        assert_eq!(
            format_outcome(&json!({ "outcome": "blocked", "gate": { "gate": "cooldown" } })),
            "blocked (cooldown)"
        );
        assert_eq!(format_outcome(&json!({ "was_open": true })), "breaker cleared");
        assert_eq!(
            format_outcome(&json!({ "requested": false })),
            "source is not waiting for re-pairing"
        );
    }
}
