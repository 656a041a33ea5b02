//! Nutrition extraction providers.
//!
//! Vision-capable chat models are asked for strict JSON and their replies
//! are parsed leniently: fenced blocks are unwrapped, the first JSON
//! object is recovered from surrounding prose, and every field is
//! normalized into bounded shapes before anything touches storage.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::models::AnalysisResult;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(90);

const ANALYSIS_PROMPT: &str = "You are a nutrition analyst. Inspect this food image and \
return strict JSON only. Use keys exactly: dish, meal_type, calories_kcal, protein_g, \
fiber_g, confidence_score, nutrients, chemicals, notes. Rules: calories_kcal/protein_g/\
fiber_g must be numbers when possible; confidence_score is between 0 and 1; nutrients \
and chemicals must be arrays of short strings.";

/// Closed set of analysis backends. The browser-automated `perplexity_web`
/// flow is deliberately absent; its provider string is rejected at parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Perplexity,
    OpenRouter,
    Manual,
}

impl Provider {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "perplexity" => Ok(Self::Perplexity),
            "openrouter" => Ok(Self::OpenRouter),
            "manual" => Ok(Self::Manual),
            _ => Err(ApiError::Validation("Unsupported provider".to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Perplexity => "perplexity",
            Self::OpenRouter => "openrouter",
            Self::Manual => "manual",
        }
    }
}

/// Sends the image to the chosen vision provider and returns normalized
/// nutrition facts.
pub async fn analyze_image(
    config: &Config,
    provider: Provider,
    image: &[u8],
) -> Result<AnalysisResult> {
    match provider {
        Provider::Perplexity => analyze_with_perplexity(config, image).await,
        Provider::OpenRouter => analyze_with_openrouter(config, image).await,
        Provider::Manual => Err(ApiError::Validation(
            "Unsupported provider for photo analysis".to_string(),
        )),
    }
}

/// Parses caller-supplied JSON-ish text into the same normalized shape
/// the AI providers produce.
pub fn analyze_manual(text: &str, default_meal_type: &str) -> AnalysisResult {
    let mut result = normalize_payload(&parse_loose_json(text), default_meal_type);
    result.source = "manual".to_string();
    result.model = Some("manual".to_string());
    result.raw = Some(text.to_string());
    result
}

async fn analyze_with_perplexity(config: &Config, image: &[u8]) -> Result<AnalysisResult> {
    let api_key = config
        .perplexity_api_key
        .as_deref()
        .ok_or_else(|| ApiError::Validation("PERPLEXITY_API_KEY is not set".to_string()))?;

    let payload = json!({
        "model": config.perplexity_model,
        "messages": build_messages(image),
        "temperature": 0.1,
    });

    let data = post_chat_completion(&config.perplexity_api_url, api_key, &payload, &[]).await?;
    let raw = extract_message_content(&data);
    let mut result = normalize_payload(&parse_loose_json(&raw), "other");
    result.source = "perplexity".to_string();
    result.model = Some(config.perplexity_model.clone());
    result.raw = Some(raw);
    Ok(result)
}

async fn analyze_with_openrouter(config: &Config, image: &[u8]) -> Result<AnalysisResult> {
    let api_key = config
        .openrouter_api_key
        .as_deref()
        .ok_or_else(|| ApiError::Validation("OPENROUTER_API_KEY is not set".to_string()))?;

    let payload = json!({
        "model": config.openrouter_model,
        "messages": build_messages(image),
        "temperature": 0.1,
    });

    // OpenRouter attributes traffic through optional referer headers.
    let mut extra_headers: Vec<(&str, String)> = Vec::new();
    if let Some(url) = &config.openrouter_app_url {
        extra_headers.push(("HTTP-Referer", url.clone()));
    }
    if let Some(name) = &config.openrouter_app_name {
        extra_headers.push(("X-Title", name.clone()));
    }

    let data =
        post_chat_completion(&config.openrouter_api_url, api_key, &payload, &extra_headers).await?;
    let raw = extract_message_content(&data);
    let mut result = normalize_payload(&parse_loose_json(&raw), "other");
    result.source = "openrouter".to_string();
    result.model = Some(config.openrouter_model.clone());
    result.raw = Some(raw);
    Ok(result)
}

async fn post_chat_completion(
    url: &str,
    api_key: &str,
    payload: &Value,
    extra_headers: &[(&str, String)],
) -> Result<Value> {
    let client = reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| ApiError::Provider(e.to_string()))?;

    let mut request = client.post(url).bearer_auth(api_key).json(payload);
    for (name, value) in extra_headers {
        request = request.header(*name, value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| ApiError::Provider(e.to_string()))?
        .error_for_status()
        .map_err(|e| ApiError::Provider(e.to_string()))?;

    response
        .json::<Value>()
        .await
        .map_err(|e| ApiError::Provider(e.to_string()))
}

fn build_messages(image: &[u8]) -> Value {
    let encoded = BASE64.encode(image);
    json!([{
        "role": "user",
        "content": [
            { "type": "text", "text": ANALYSIS_PROMPT },
            {
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{encoded}") },
            },
        ],
    }])
}

/// Pulls the assistant text out of a chat-completions response; models
/// return either a plain string or an array of typed parts.
fn extract_message_content(data: &Value) -> String {
    let content = &data["choices"][0]["message"]["content"];
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.clone()),
                Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("text") => {
                    obj.get("text").and_then(Value::as_str).map(str::to_string)
                }
                _ => None,
            })
            .filter(|fragment| !fragment.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => data.to_string(),
    }
}

/// Best-effort JSON recovery: strips markdown fences, then falls back to
/// the first `{...}` object embedded in the text.
fn parse_loose_json(raw: &str) -> Value {
    let mut cleaned = raw.trim().to_string();
    if cleaned.is_empty() {
        return Value::Null;
    }
    if cleaned.starts_with("```") {
        cleaned = cleaned.replace("```json", "").replace("```", "").trim().to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return value;
    }

    let Ok(object_re) = Regex::new(r"(?s)\{.*\}") else {
        return Value::Null;
    };
    object_re
        .find(&cleaned)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .unwrap_or(Value::Null)
}

fn normalize_payload(payload: &Value, default_meal_type: &str) -> AnalysisResult {
    let dish = payload
        .get("dish")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.chars().take(120).collect::<String>())
        .unwrap_or_else(|| "Unknown dish".to_string());

    let meal_type = payload
        .get("meal_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| m.to_lowercase().chars().take(30).collect::<String>())
        .unwrap_or_else(|| default_meal_type.to_string());

    AnalysisResult {
        dish,
        meal_type,
        calories_kcal: number_field(payload, &["calories_kcal", "calories"]),
        protein_g: number_field(payload, &["protein_g", "protein"]),
        fiber_g: number_field(payload, &["fiber_g", "fiber"]),
        confidence_score: number_field(payload, &["confidence_score", "confidence"])
            .map(|c| c.clamp(0.0, 1.0)),
        nutrients: string_list(payload.get("nutrients")),
        chemicals: string_list(payload.get("chemicals")),
        notes: optional_text(payload.get("notes")),
        source: String::new(),
        model: None,
        raw: None,
    }
}

fn number_field(payload: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(number_from_value)
}

fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let re = Regex::new(r"-?\d+(?:\.\d+)?").ok()?;
            re.find(s)?.as_str().parse().ok()
        }
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let items: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => s.split(',').map(|part| part.trim().to_string()).collect(),
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter(|item| !item.is_empty())
        .map(|item| item.chars().take(80).collect())
        .take(20)
        .collect()
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text.chars().take(400).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing() {
        assert_eq!(Provider::parse("perplexity").unwrap(), Provider::Perplexity);
        assert_eq!(Provider::parse(" OpenRouter ").unwrap(), Provider::OpenRouter);
        assert_eq!(Provider::parse("manual").unwrap(), Provider::Manual);
        assert_eq!(Provider::parse("").unwrap(), Provider::Perplexity);
        assert!(Provider::parse("perplexity_web").is_err());
        assert!(Provider::parse("gemini").is_err());
    }

    #[test]
    fn manual_analysis_unwraps_fenced_json() {
        let text = "```json\n{\"dish\": \"Miso soup\", \"calories_kcal\": 120, \
                    \"nutrients\": [\"sodium\"]}\n```";
        let result = analyze_manual(text, "lunch");
        assert_eq!(result.dish, "Miso soup");
        assert_eq!(result.calories_kcal, Some(120.0));
        assert_eq!(result.nutrients, vec!["sodium".to_string()]);
        assert_eq!(result.meal_type, "lunch");
        assert_eq!(result.source, "manual");
        assert_eq!(result.raw.as_deref(), Some(text));
    }

    #[test]
    fn embedded_object_is_recovered_from_prose() {
        let value = parse_loose_json("Here you go: {\"dish\": \"Pad thai\"} hope that helps");
        assert_eq!(value["dish"], "Pad thai");
        assert_eq!(parse_loose_json("no json here"), Value::Null);
        assert_eq!(parse_loose_json(""), Value::Null);
    }

    #[test]
    fn numbers_are_parsed_leniently() {
        assert_eq!(number_from_value(&json!(550)), Some(550.0));
        assert_eq!(number_from_value(&json!("about 550 kcal")), Some(550.0));
        assert_eq!(number_from_value(&json!("-12.5 g")), Some(-12.5));
        assert_eq!(number_from_value(&json!("none")), None);
        assert_eq!(number_from_value(&json!(null)), None);
    }

    #[test]
    fn payload_normalization_bounds_every_field() {
        let payload = json!({
            "dish": format!("  {}  ", "x".repeat(200)),
            "calories": "750 kcal",
            "protein": 32,
            "confidence_score": 3.5,
            "nutrients": "iron, , vitamin c",
            "chemicals": ["msg", 42],
            "notes": "n".repeat(500),
        });
        let result = normalize_payload(&payload, "other");
        assert_eq!(result.dish.chars().count(), 120);
        assert_eq!(result.calories_kcal, Some(750.0));
        assert_eq!(result.protein_g, Some(32.0));
        assert_eq!(result.confidence_score, Some(1.0));
        assert_eq!(result.nutrients, vec!["iron".to_string(), "vitamin c".to_string()]);
        assert_eq!(result.chemicals, vec!["msg".to_string(), "42".to_string()]);
        assert_eq!(result.notes.as_ref().map(|n| n.chars().count()), Some(400));
        assert_eq!(result.meal_type, "other");
    }

    #[test]
    fn empty_payload_gets_defaults() {
        let result = normalize_payload(&Value::Null, "other");
        assert_eq!(result.dish, "Unknown dish");
        assert_eq!(result.calories_kcal, None);
        assert!(result.nutrients.is_empty());
        assert_eq!(result.notes, None);
    }

    #[test]
    fn message_content_handles_part_arrays() {
        let data = json!({
            "choices": [{
                "message": {
                    "content": [
                        {"type": "text", "text": "{\"dish\":"},
                        {"type": "image_url", "image_url": {}},
                        {"type": "text", "text": "\"Soup\"}"},
                    ]
                }
            }]
        });
        assert_eq!(extract_message_content(&data), "{\"dish\":\n\"Soup\"}");

        let plain = json!({"choices": [{"message": {"content": "hello"}}]});
        assert_eq!(extract_message_content(&plain), "hello");
    }
}
