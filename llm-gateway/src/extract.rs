//! Dynamic JSON inspection, re-expressed per design note "Dynamic JSON
//! inspection" as tagged extractors: each provider shape is tried in a
//! declared order, and the first that yields a nonzero/non-empty result
//! wins. A generic map walk is kept only as a last-resort fallback for
//! tool-call discovery, keyed on the presence of `function`/`tool_calls`
//! substrings, exactly as the design note prescribes.

use serde_json::Value;

use crate::session::ModelUsage;

/// Extracts the top-level `"model"` field from a request body.
/// Best-effort: missing field or non-JSON body yields `None`, never an
/// error (.2 step 1).
pub fn extract_model(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_owned)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderShape {
    OpenAi,
    Anthropic,
    Ollama,
}

const PROVIDER_ORDER: [ProviderShape; 3] = [ProviderShape::OpenAi, ProviderShape::Anthropic, ProviderShape::Ollama];

fn extract_usage_for(shape: ProviderShape, value: &Value) -> Option<ModelUsage> {
    match shape {
        ProviderShape::OpenAi => {
            let usage = value.get("usage")?;
            let prompt = usage.get("prompt_tokens")?.as_u64()?;
            let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            Some(ModelUsage { prompt_tokens: prompt, completion_tokens: completion })
        }
        ProviderShape::Anthropic => {
            let usage = value.get("usage")?;
            let input = usage.get("input_tokens")?.as_u64()?;
            let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
            Some(ModelUsage { prompt_tokens: input, completion_tokens: output })
        }
        ProviderShape::Ollama => {
            let prompt = value.get("prompt_eval_count")?.as_u64()?;
            let completion = value.get("eval_count").and_then(Value::as_u64).unwrap_or(0);
            Some(ModelUsage { prompt_tokens: prompt, completion_tokens: completion })
        }
    }
}

/// Extracts token usage from a response body, trying each known provider
/// shape in order and returning the first nonzero result.
pub fn extract_usage(body: &[u8]) -> ModelUsage {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return ModelUsage::default();
    };

    for shape in PROVIDER_ORDER {
        if let Some(usage) = extract_usage_for(shape, &value) {
            if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
                return usage;
            }
        }
    }

    ModelUsage::default()
}

#[derive(Debug, Clone)]
pub struct ExtractedToolCall {
    pub tool_name: String,
    pub tool_type: String,
    pub request_id: String,
}

fn extract_tool_calls_for(shape: ProviderShape, value: &Value, request_id: &str) -> Vec<ExtractedToolCall> {
    match shape {
        ProviderShape::OpenAi => value
            .get("choices")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|choice| choice.get("message")?.get("tool_calls")?.as_array())
            .flatten()
            .filter_map(|call| {
                let name = call.get("function")?.get("name")?.as_str()?;
                Some(ExtractedToolCall {
                    tool_name: name.to_owned(),
                    tool_type: "function".to_owned(),
                    request_id: request_id.to_owned(),
                })
            })
            .collect(),
        ProviderShape::Anthropic => value
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter_map(|block| {
                let name = block.get("name")?.as_str()?;
                Some(ExtractedToolCall {
                    tool_name: name.to_owned(),
                    tool_type: "tool_use".to_owned(),
                    request_id: request_id.to_owned(),
                })
            })
            .collect(),
        ProviderShape::Ollama => value
            .get("message")
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|call| {
                let name = call.get("function")?.get("name")?.as_str()?;
                Some(ExtractedToolCall {
                    tool_name: name.to_owned(),
                    tool_type: "function".to_owned(),
                    request_id: request_id.to_owned(),
                })
            })
            .collect(),
    }
}

/// Last-resort fallback: a shallow walk of the JSON tree looking for keys
/// whose name contains `function` or `tool_calls`, used only when none of
/// the tagged provider shapes matched anything. This never attempts to
/// name the tool beyond "unknown" — it exists purely so a session's
/// `toolCalls` counter is not silently zero for an unrecognized shape.
fn fallback_tool_call_presence(value: &Value) -> bool {
    fn walk(value: &Value) -> bool {
        match value {
            Value::Object(map) => map.iter().any(|(key, v)| {
                key.contains("tool_calls") || key.contains("function") || walk(v)
            }),
            Value::Array(items) => items.iter().any(walk),
            _ => false,
        }
    }
    walk(value)
}

/// Extracts tool calls from a response body, trying each provider shape in
/// declared order; falls back to a presence-only detection when no shape
/// matched but the body still looks like it names a tool call.
pub fn extract_tool_calls(body: &[u8], request_id: &str) -> Vec<ExtractedToolCall> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };

    for shape in PROVIDER_ORDER {
        let calls = extract_tool_calls_for(shape, &value, request_id);
        if !calls.is_empty() {
            return calls;
        }
    }

    if fallback_tool_call_presence(&value) {
        return vec![ExtractedToolCall {
            tool_name: "unknown".to_owned(),
            tool_type: "unknown".to_owned(),
            request_id: request_id.to_owned(),
        }];
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_model_field() {
        assert_eq!(extract_model(br#"{"model":"gpt-4o"}"#).as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn missing_model_is_none() {
        assert_eq!(extract_model(br#"{"foo":1}"#), None);
        assert_eq!(extract_model(b"not json"), None);
    }

    #[test]
    fn openai_usage_shape() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;
        let usage = extract_usage(body);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
    }

    #[test]
    fn anthropic_usage_shape() {
        let body = br#"{"usage":{"input_tokens":7,"output_tokens":3}}"#;
        let usage = extract_usage(body);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn ollama_usage_shape() {
        let body = br#"{"prompt_eval_count":12,"eval_count":4}"#;
        let usage = extract_usage(body);
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 4);
    }

    #[test]
    fn openai_tool_calls_extracted() {
        let body = br#"{"choices":[{"message":{"tool_calls":[{"function":{"name":"get_weather"}}]}}]}"#;
        let calls = extract_tool_calls(body, "req-1");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "get_weather");
        assert_eq!(calls[0].tool_type, "function");
    }

    #[test]
    fn anthropic_tool_use_extracted() {
        let body = br#"{"content":[{"type":"tool_use","name":"lookup"}]}"#;
        let calls = extract_tool_calls(body, "req-2");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "lookup");
    }

    #[test]
    fn fallback_detects_unrecognized_tool_call_shape() {
        let body = br#"{"weird_function_call":{"tool_calls_inner":true}}"#;
        let calls = extract_tool_calls(body, "req-3");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "unknown");
    }

    #[test]
    fn no_tool_calls_when_absent() {
        let body = br#"{"choices":[{"message":{"content":"hi"}}]}"#;
        assert!(extract_tool_calls(body, "req-4").is_empty());
    }
}
