//! Info-port commands.

use anyhow::{Context, Result};

/// Ping every node.
pub async fn ping(client: &reqwest::Client, info_urls: &[String]) -> Result<()> {
    let mut down = 0;
    for url in info_urls {
        let target = format!("{}/ping", url.trim_end_matches('/'));
        match client.get(&target).send().await {
            Ok(resp) if resp.status().is_success() => println!("  {} -> up", url),
            Ok(resp) => {
                println!("  {} -> HTTP {}", url, resp.status());
                down += 1;
            }
            Err(e) => {
                println!("  {} -> unreachable: {}", url, e);
                down += 1;
            }
        }
    }

    if down > 0 {
        anyhow::bail!("{} of {} nodes not responding", down, info_urls.len());
    }
    Ok(())
}

/// Print a node's live and recent sessions.
pub async fn sessions(client: &reqwest::Client, info_url: &str) -> Result<()> {
    let url = format!("{}/sessions", info_url.trim_end_matches('/'));
    let sessions: Vec<serde_json::Value> = client
        .get(&url)
        .send()
        .await
        .context("Failed to connect to node")?
        .json()
        .await?;

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "{:<18} {:<8} {:<12} {:<6} {:>10}",
        "SESSION", "KIND", "STATE", "LIVE", "AGE (ms)"
    );
    for s in &sessions {
        let id = s["session_id"].as_str().unwrap_or("-");
        println!(
            "{:<18} {:<8} {:<12} {:<6} {:>10}",
            &id[..id.len().min(16)],
            s["kind"].as_str().unwrap_or("-"),
            s["state"].as_str().unwrap_or("-"),
            s["live"].as_bool().unwrap_or(false),
            s["age_ms"].as_u64().unwrap_or(0)
        );
    }
    Ok(())
}
