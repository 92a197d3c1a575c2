//! Structured order extraction from a finished conversation.
//!
//! Once the agent closes the conversation, the history is sent back to the
//! model with an instruction to answer with JSON only. The reply is parsed
//! leniently: anything outside the outermost braces (code fences, a stray
//! preamble) is ignored.

use super::LanguageModel;
use super::context::{ConversationHistory, Prompt};
use crate::config::LlmConfig;
use crate::error::{Result, VoiceError};
use std::time::Duration;
use tracing::{debug, info};

/// Default instruction for [`extract_order`].
pub const DEFAULT_EXTRACTION_PROMPT: &str = "\
Based on the conversation above, extract the order as JSON with this shape:
{
  \"customer\": {\"name\": \"name or null\", \"address\": \"delivery address or null\"},
  \"items\": [{\"product_name\": \"Product\", \"quantity\": 1, \"price\": 10.99}],
  \"total\": 10.99
}
Answer with the JSON object only. If no order was placed, return an empty items array and null values.";

/// Run the extraction instruction against `history` and parse the reply.
///
/// # Errors
///
/// Returns [`VoiceError::Timeout`] if the model does not finish within
/// `timeout`, or [`VoiceError::Llm`] if the call fails or the reply holds no
/// JSON object.
pub async fn extract_order(
    llm: &dyn LanguageModel,
    config: &LlmConfig,
    history: &ConversationHistory,
    instruction: &str,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let prompt = Prompt::build(config, history, instruction);
    let reply = tokio::time::timeout(timeout, collect_reply(llm, &prompt))
        .await
        .map_err(|_| VoiceError::Timeout {
            stage: "extraction",
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })??;
    debug!("extraction reply: {reply}");
    let order = parse_json_object(&reply)?;
    info!(
        "order extracted with {} items",
        order
            .get("items")
            .and_then(serde_json::Value::as_array)
            .map_or(0, Vec::len)
    );
    Ok(order)
}

async fn collect_reply(llm: &dyn LanguageModel, prompt: &Prompt) -> Result<String> {
    let mut tokens = llm.stream(prompt).await?;
    let mut reply = String::new();
    while let Some(token) = tokens.recv().await {
        reply.push_str(&token?);
    }
    Ok(reply)
}

/// Parse the outermost `{...}` span of `text`.
fn parse_json_object(text: &str) -> Result<serde_json::Value> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(VoiceError::Llm("extraction reply holds no JSON object".to_owned()));
    };
    if end < start {
        return Err(VoiceError::Llm("extraction reply holds no JSON object".to_owned()));
    }
    serde_json::from_str(&text[start..=end])
        .map_err(|e| VoiceError::Llm(format!("extraction reply is not valid JSON: {e}")))
}
