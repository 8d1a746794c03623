//! Start-up reachability check for the inference endpoint.
//!
//! Asks the OpenAI-compatible `/v1/models` route which models are served so
//! the operator learns about a missing model before the first tick aborts.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// List the model ids served at `base_url`.
pub async fn list_models(base_url: &str, api_key: Option<&str>) -> Result<Vec<String>, String> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let mut request = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(2));
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|e| format!("unreachable at {url}: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("HTTP {} from {url}", response.status()));
    }
    let body = response
        .text()
        .await
        .map_err(|e| format!("failed to read model list: {e}"))?;
    parse_models(&body)
}

fn parse_models(body: &str) -> Result<Vec<String>, String> {
    let list: ModelList =
        serde_json::from_str(body).map_err(|e| format!("failed to parse model list: {e}"))?;
    Ok(list.data.into_iter().map(|m| m.id).collect())
}

/// Whether `wanted` is among `served`, ignoring an implicit `:latest` tag.
pub fn serves(served: &[String], wanted: &str) -> bool {
    let base = |s: &str| s.strip_suffix(":latest").unwrap_or(s).to_string();
    served.iter().any(|m| base(m) == base(wanted))
}
