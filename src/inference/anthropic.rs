//! Production client for the Anthropic Message Batches API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{BatchPoll, BatchRequest, InferenceClient, ItemOutcome, ItemResult};
use crate::config::InferenceConfig;
use crate::domain::{BatchId, Item};
use crate::error::{Result, VolleyError};

/// Renders an item's payload into the user prompt sent for it.
pub type PromptFn = Arc<dyn Fn(&Item) -> String + Send + Sync>;

/// Default prompt: one `name: value` line per payload field.
pub fn default_prompt(item: &Item) -> String {
    item.payload
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Batch client backed by `reqwest`.
#[derive(Clone)]
pub struct AnthropicBatchClient {
    client: reqwest::Client,
    config: InferenceConfig,
    prompt: PromptFn,
}

#[derive(Debug, Deserialize)]
struct MessageBatch {
    id: String,
    processing_status: String,
    #[serde(default)]
    results_url: Option<String>,
    #[serde(default)]
    request_counts: RequestCounts,
}

#[derive(Debug, Default, Deserialize)]
struct RequestCounts {
    #[serde(default)]
    processing: u64,
    #[serde(default)]
    succeeded: u64,
    #[serde(default)]
    errored: u64,
    #[serde(default)]
    canceled: u64,
    #[serde(default)]
    expired: u64,
}

#[derive(Debug, Deserialize)]
struct ResultLine {
    custom_id: String,
    result: Value,
}

impl AnthropicBatchClient {
    /// Create a client from configuration. Fails if no API key is configured.
    pub fn new(config: InferenceConfig) -> Result<Self> {
        if config.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(VolleyError::Config(
                "inference.api_key is required for the Anthropic batch client".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            prompt: Arc::new(default_prompt),
        })
    }

    /// Replace the function that renders an item into its prompt.
    pub fn with_prompt(mut self, prompt: PromptFn) -> Self {
        self.prompt = prompt;
        self
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("x-api-key", self.config.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", &self.config.api_version)
    }

    fn batches_url(&self) -> String {
        format!(
            "{}/v1/messages/batches",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Build the JSON body for a create-batch call.
    fn build_body(&self, request: BatchRequest<'_>) -> Value {
        let system: Vec<Value> = request
            .context
            .iter()
            .map(|ctx| {
                let mut block = json!({ "type": "text", "text": ctx.content.as_str() });
                if self.config.enable_prompt_caching {
                    block["cache_control"] = json!({ "type": "ephemeral" });
                }
                block
            })
            .collect();

        let requests: Vec<Value> = request
            .unit
            .entries()
            .map(|(key, item)| {
                let mut params = json!({
                    "model": self.config.model,
                    "max_tokens": self.config.max_tokens,
                    "messages": [{ "role": "user", "content": (self.prompt)(item) }],
                });
                if !system.is_empty() {
                    params["system"] = Value::Array(system.clone());
                }
                json!({ "custom_id": key, "params": params })
            })
            .collect();

        json!({ "requests": requests })
    }

    async fn fetch_results(&self, results_url: &str) -> Result<Vec<ItemResult>> {
        let response = self.request(reqwest::Method::GET, results_url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("Fetching batch results failed with {status}: {body}").into());
        }
        parse_results(&body)
    }
}

/// Parse the JSONL results document into item results.
fn parse_results(body: &str) -> Result<Vec<ItemResult>> {
    let mut results = Vec::new();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let parsed: ResultLine = serde_json::from_str(line)?;
        results.push(ItemResult {
            correlation_key: parsed.custom_id,
            outcome: outcome_from_result(&parsed.result),
        });
    }
    Ok(results)
}

fn outcome_from_result(result: &Value) -> ItemOutcome {
    match result["type"].as_str() {
        Some("succeeded") => {
            let text: String = result["message"]["content"]
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|block| block["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            if text.is_empty() {
                ItemOutcome::Error("No text content in response".to_string())
            } else {
                ItemOutcome::Output(text)
            }
        }
        Some("errored") => {
            let error = &result["error"];
            let message = error["error"]["message"]
                .as_str()
                .or_else(|| error["message"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            ItemOutcome::Error(message)
        }
        Some("canceled") => ItemOutcome::Error("Request canceled".to_string()),
        Some("expired") => ItemOutcome::Error("Request expired".to_string()),
        _ => ItemOutcome::Error("Unknown result format".to_string()),
    }
}

#[async_trait]
impl InferenceClient for AnthropicBatchClient {
    #[tracing::instrument(skip(self, request), fields(source_id = %request.unit.source_id(), items = request.unit.len()))]
    async fn submit(&self, request: BatchRequest<'_>) -> Result<BatchId> {
        let body = self.build_body(request);
        let response = self
            .request(reqwest::Method::POST, &self.batches_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Batch create request failed");
                e
            })?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(VolleyError::Submission(format!("{status}: {text}")));
        }

        let batch: MessageBatch = serde_json::from_str(&text)?;
        tracing::debug!(batch_id = %batch.id, "Batch created");
        Ok(BatchId(batch.id))
    }

    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    async fn poll(&self, batch_id: &BatchId) -> Result<BatchPoll> {
        let url = format!("{}/{}", self.batches_url(), batch_id);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VolleyError::BatchNotFound(batch_id.clone()));
        }
        let text = response.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("Polling batch {batch_id} failed with {status}: {text}").into());
        }

        let batch: MessageBatch = serde_json::from_str(&text)?;
        tracing::trace!(
            processing_status = %batch.processing_status,
            processing = batch.request_counts.processing,
            "Polled batch"
        );

        if batch.processing_status != "ended" {
            return Ok(BatchPoll::in_progress());
        }

        let counts = &batch.request_counts;
        if counts.succeeded + counts.errored == 0 && counts.canceled + counts.expired > 0 {
            return Ok(BatchPoll::failed(format!(
                "batch ended without processing any request (canceled={}, expired={})",
                counts.canceled, counts.expired
            )));
        }

        let Some(results_url) = batch.results_url.as_deref() else {
            return Err(anyhow::anyhow!("Batch {batch_id} ended without a results_url").into());
        };
        Ok(BatchPoll::ended(self.fetch_results(results_url).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SourceId, SubmissionUnit};
    use crate::inference::SharedContext;

    fn client(enable_prompt_caching: bool) -> AnthropicBatchClient {
        AnthropicBatchClient::new(InferenceConfig {
            api_key: Some("test-key".to_string()),
            enable_prompt_caching,
            ..InferenceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_new_requires_api_key() {
        let result = AnthropicBatchClient::new(InferenceConfig::default());
        assert!(matches!(result, Err(VolleyError::Config(_))));
    }

    #[test]
    fn test_default_prompt_skips_blank_fields() {
        let item = Item::pending("s", "1", Some("YES"))
            .with_field("Ref", "1:3")
            .with_field("AT", "")
            .with_field("GLQuote", "in the beginning");
        assert_eq!(default_prompt(&item), "GLQuote: in the beginning\nRef: 1:3");
    }

    #[test]
    fn test_build_body_uses_correlation_keys_and_cached_context() {
        let unit = SubmissionUnit::new(
            SourceId::from("sheet-a"),
            vec![
                Item::pending("sheet-a", "4", Some("YES")).with_field("Ref", "1:1"),
                Item::pending("sheet-a", "5", Some("YES")).with_field("Ref", "1:2"),
            ],
            chrono::Utc::now(),
        );
        let context = vec![SharedContext {
            kind: "reference_text".into(),
            content: Arc::new("chapter text".to_string()),
        }];
        let body = client(true).build_body(BatchRequest {
            unit: &unit,
            context: &context,
        });

        let requests = body["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["custom_id"], "item_0_4");
        assert_eq!(requests[1]["custom_id"], "item_1_5");
        assert_eq!(requests[0]["params"]["system"][0]["text"], "chapter text");
        assert_eq!(
            requests[0]["params"]["system"][0]["cache_control"]["type"],
            "ephemeral"
        );
        assert_eq!(
            requests[1]["params"]["messages"][0]["content"],
            "Ref: 1:2"
        );
    }

    #[test]
    fn test_build_body_without_context_or_caching() {
        let unit = SubmissionUnit::new(
            SourceId::from("sheet-a"),
            vec![Item::pending("sheet-a", "4", Some("YES"))],
            chrono::Utc::now(),
        );
        let body = client(false).build_body(BatchRequest {
            unit: &unit,
            context: &[],
        });
        assert!(body["requests"][0]["params"].get("system").is_none());
    }

    #[test]
    fn test_parse_results_handles_each_result_type() {
        let body = concat!(
            r#"{"custom_id":"item_1_5","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"A note."}]}}}"#,
            "\n",
            r#"{"custom_id":"item_0_4","result":{"type":"errored","error":{"type":"error","error":{"type":"invalid_request_error","message":"prompt too long"}}}}"#,
            "\n\n",
            r#"{"custom_id":"item_2_6","result":{"type":"expired"}}"#,
            "\n"
        );
        let results = parse_results(body).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].correlation_key, "item_1_5");
        assert_eq!(results[0].outcome, ItemOutcome::Output("A note.".to_string()));
        assert_eq!(
            results[1].outcome,
            ItemOutcome::Error("prompt too long".to_string())
        );
        assert_eq!(
            results[2].outcome,
            ItemOutcome::Error("Request expired".to_string())
        );
    }

    #[test]
    fn test_succeeded_without_text_is_item_error() {
        let outcome = outcome_from_result(&json!({"type": "succeeded", "message": {"content": []}}));
        assert!(matches!(outcome, ItemOutcome::Error(_)));
    }
}
