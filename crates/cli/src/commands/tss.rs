//! Keygen and keysign across every node.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    ErrorResponse, KeygenHttpRequest, KeygenHttpResponse, KeysignHttpRequest, KeysignHttpResponse,
};
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};

/// POST `body` to `path` on every node concurrently.
async fn fan_out<B, R>(
    client: &reqwest::Client,
    nodes: &[String],
    path: &str,
    body: &B,
) -> Vec<(String, Result<R>)>
where
    B: Serialize,
    R: DeserializeOwned,
{
    let requests = nodes.iter().map(|node| async move {
        let url = format!("{}{}", node.trim_end_matches('/'), path);
        let result = async {
            let response = client
                .post(&url)
                .json(body)
                .send()
                .await
                .with_context(|| format!("Failed to connect to {}", node))?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let detail = match serde_json::from_str::<ErrorResponse>(&text) {
                    Ok(err) => describe_error(&err),
                    Err(_) => text,
                };
                anyhow::bail!("HTTP {}: {}", status, detail);
            }
            Ok(response.json::<R>().await?)
        }
        .await;
        (node.clone(), result)
    });
    join_all(requests).await
}

fn describe_error(err: &ErrorResponse) -> String {
    let mut text = format!("{} ({})", err.error, err.status);
    if let Some(blame) = &err.blame {
        for entry in &blame.blamed {
            text.push_str(&format!("\n    blamed {} for {}", entry.party, entry.reason));
        }
        for party in &blame.unreachable {
            text.push_str(&format!("\n    unreachable {}", party));
        }
    }
    text
}

fn print_header(title: &str) {
    println!("===================================================================");
    println!("  {}", title);
    println!("===================================================================");
}

/// Run keygen on every node and check they agree on the pool key.
pub async fn keygen(client: &reqwest::Client, nodes: &[String], keys: Vec<String>) -> Result<()> {
    print_header("KEYGEN");
    println!("Participants: {}", keys.len());
    println!("Nodes:        {}", nodes.len());
    println!();

    let body = KeygenHttpRequest { keys };
    let results: Vec<(String, Result<KeygenHttpResponse>)> =
        fan_out(client, nodes, "/keygen", &body).await;

    let mut pool_keys = Vec::new();
    let mut failures = 0;
    for (node, result) in &results {
        match result {
            Ok(resp) => {
                println!("  {} -> {}", node, resp.pub_key);
                pool_keys.push(resp.pub_key.clone());
            }
            Err(e) => {
                println!("  {} -> FAILED: {}", node, e);
                failures += 1;
            }
        }
    }
    println!();

    if failures > 0 {
        anyhow::bail!("keygen failed on {} of {} nodes", failures, nodes.len());
    }
    if pool_keys.windows(2).any(|w| w[0] != w[1]) {
        anyhow::bail!("nodes returned different pool keys");
    }
    if let Some(key) = pool_keys.first() {
        println!("Pool public key: {}", key);
    }
    Ok(())
}

/// Run keysign on every node and check the signatures match.
pub async fn keysign(
    client: &reqwest::Client,
    nodes: &[String],
    pool_pub_key: String,
    message_hex: &str,
    signers: Vec<String>,
) -> Result<()> {
    let message = hex::decode(message_hex.trim_start_matches("0x"))
        .context("Message must be hex-encoded")?;

    print_header("KEYSIGN");
    println!("Pool key: {}", pool_pub_key);
    println!("Message:  {} bytes", message.len());
    println!("Signers:  {}", signers.len());
    println!();

    let body = KeysignHttpRequest {
        pool_pub_key,
        message: STANDARD.encode(&message),
        signer_pub_keys: signers,
    };
    let results: Vec<(String, Result<KeysignHttpResponse>)> =
        fan_out(client, nodes, "/keysign", &body).await;

    let mut signatures = Vec::new();
    let mut failures = 0;
    for (node, result) in &results {
        match result {
            Ok(resp) => {
                println!("  {} -> r={} s={} v={}", node, resp.r, resp.s, resp.recovery_id);
                signatures.push((resp.r.clone(), resp.s.clone(), resp.recovery_id));
            }
            Err(e) => {
                println!("  {} -> FAILED: {}", node, e);
                failures += 1;
            }
        }
    }
    println!();

    if failures > 0 {
        anyhow::bail!("keysign failed on {} of {} nodes", failures, nodes.len());
    }
    if signatures.windows(2).any(|w| w[0] != w[1]) {
        anyhow::bail!("nodes returned different signatures");
    }
    println!("All {} nodes agree on the signature.", signatures.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BlameReason, BlameRecord};

    #[test]
    fn test_describe_error_lists_blame() {
        let mut blame = BlameRecord::new();
        blame.blame("03ab".into(), BlameReason::Malformed, Some(1), None);
        blame.add_unreachable("02cd".into());
        let err = ErrorResponse {
            error: "message rejected".to_string(),
            status: "abort".to_string(),
            session_id: None,
            blame: Some(blame),
        };

        let text = describe_error(&err);
        assert!(text.starts_with("message rejected (abort)"));
        assert!(text.contains("blamed 03ab for malformed"));
        assert!(text.contains("unreachable 02cd"));
    }
}
