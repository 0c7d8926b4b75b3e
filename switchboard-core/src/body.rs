//! Narrow accessors over opaque request/response bodies.
//!
//! The proxy forwards bodies essentially verbatim, so everything here is
//! defensive: a body is a `serde_json::Value` of unknown shape and every
//! accessor returns an `Option` or an empty collection rather than
//! assuming a field exists.

use serde_json::Value;

/// Serialise a body once for pattern scanning. Non-JSON bodies arrive as
/// `Value::String` and serialise to their raw text.
pub fn serialize_body(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The `messages` array of a chat-style request, if present.
pub fn extract_messages(body: &Value) -> Option<&Vec<Value>> {
    body.get("messages").and_then(Value::as_array)
}

/// The model name named by the caller, if present.
pub fn extract_model(body: &Value) -> Option<&str> {
    body.get("model").and_then(Value::as_str)
}

/// The caller's `max_tokens`, if present.
pub fn extract_max_tokens(body: &Value) -> Option<u64> {
    body.get("max_tokens").and_then(Value::as_u64)
}

/// Produce the stable cache key text for a request body, so different
/// upstream schemas hash identically:
///
/// - chat `messages` array → `role:content` joined by `|`
/// - legacy `prompt` string → the string
/// - Anthropic `human_prompt` string → the string
/// - anything else → `None` (the request does not participate in caching)
pub fn extract_prompt_key(body: &Value) -> Option<String> {
    if let Some(messages) = extract_messages(body) {
        let parts: Vec<String> = messages
            .iter()
            .map(|m| {
                let role = m.get("role").and_then(Value::as_str).unwrap_or("");
                let content = m.get("content").and_then(Value::as_str).unwrap_or("");
                format!("{role}:{content}")
            })
            .collect();
        if parts.is_empty() {
            return None;
        }
        return Some(parts.join("|"));
    }
    if let Some(prompt) = body.get("prompt").and_then(Value::as_str) {
        return Some(prompt.to_string());
    }
    if let Some(prompt) = body.get("human_prompt").and_then(Value::as_str) {
        return Some(prompt.to_string());
    }
    None
}

/// Token usage from a response body. Understands both the OpenAI
/// (`prompt_tokens`/`completion_tokens`) and Anthropic
/// (`input_tokens`/`output_tokens`) usage shapes.
pub fn extract_usage(response: &Value) -> (Option<i64>, Option<i64>) {
    let usage = match response.get("usage") {
        Some(u) => u,
        None => return (None, None),
    };
    let input = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(Value::as_i64);
    let output = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_i64);
    (input, output)
}

/// Tool calls from `response.choices[0].message.tool_calls`, empty when
/// any link in that chain is missing.
pub fn extract_tool_calls(response: &Value) -> Vec<Value> {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("tool_calls"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Assistant-authored messages in the request, truncated to 500 chars each.
/// These are the model's prior reasoning steps as replayed by the caller.
pub fn extract_reasoning_steps(request: &Value) -> Vec<String> {
    extract_messages(request)
        .map(|messages| {
            messages
                .iter()
                .filter(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
                .filter_map(|m| m.get("content").and_then(Value::as_str))
                .map(|content| truncate_chars(content, 500))
                .collect()
        })
        .unwrap_or_default()
}

/// Rough input-token estimate when the upstream reported no usage:
/// `ceil(len(serialised messages) / 4)`.
pub fn estimate_input_tokens(request: &Value) -> i64 {
    let serialised = match extract_messages(request) {
        Some(messages) => serde_json::to_string(messages).unwrap_or_default(),
        None => return 0,
    };
    (serialised.len() as i64 + 3) / 4
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_key_from_messages() {
        let body = json!({
            "model": "gpt-3.5-turbo",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "2+2?"}
            ]
        });
        assert_eq!(
            extract_prompt_key(&body).unwrap(),
            "system:be terse|user:2+2?"
        );
    }

    #[test]
    fn test_prompt_key_legacy_and_anthropic() {
        assert_eq!(
            extract_prompt_key(&json!({"prompt": "hello"})).unwrap(),
            "hello"
        );
        assert_eq!(
            extract_prompt_key(&json!({"human_prompt": "hi"})).unwrap(),
            "hi"
        );
        assert!(extract_prompt_key(&json!({"input": "hi"})).is_none());
        assert!(extract_prompt_key(&json!({"messages": []})).is_none());
    }

    #[test]
    fn test_usage_both_schemas() {
        let openai = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 5}});
        assert_eq!(extract_usage(&openai), (Some(12), Some(5)));
        let anthropic = json!({"usage": {"input_tokens": 7, "output_tokens": 3}});
        assert_eq!(extract_usage(&anthropic), (Some(7), Some(3)));
        assert_eq!(extract_usage(&json!({})), (None, None));
    }

    #[test]
    fn test_tool_calls_defensive() {
        let resp = json!({
            "choices": [{"message": {"tool_calls": [{"id": "call_1"}]}}]
        });
        assert_eq!(extract_tool_calls(&resp).len(), 1);
        assert!(extract_tool_calls(&json!({"choices": []})).is_empty());
        assert!(extract_tool_calls(&json!({})).is_empty());
    }

    #[test]
    fn test_reasoning_steps_truncated() {
        let long = "x".repeat(600);
        let req = json!({"messages": [
            {"role": "assistant", "content": long},
            {"role": "user", "content": "next"}
        ]});
        let steps = extract_reasoning_steps(&req);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].chars().count(), 500);
    }

    #[test]
    fn test_token_estimate_rounds_up() {
        let req = json!({"messages": [{"role": "user", "content": "abc"}]});
        let serialised = serde_json::to_string(req.get("messages").unwrap()).unwrap();
        let expected = (serialised.len() as i64 + 3) / 4;
        assert_eq!(estimate_input_tokens(&req), expected);
        assert_eq!(estimate_input_tokens(&json!({})), 0);
    }
}
