use async_trait::async_trait;

use crossbar_core::{Result, ToolDefinition, ToolExecutionResult};

/// External tool backend consumed by the runtime.
///
/// The runtime never implements tools itself; it forwards calls from the
/// generator (llm mode) or from parsed event text (direct_tool mode).
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    async fn execute_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolExecutionResult>;
}

/// Parse `direct_tool` input: `<tool> <args…>`, whitespace-split.
///
/// Arguments become a JSON array of the remaining tokens. Quoting and
/// escaping are deliberately not interpreted.
pub fn parse_direct_tool(text: &str) -> Option<(String, serde_json::Value)> {
    let mut tokens = text.split_ascii_whitespace();
    let name = tokens.next()?;
    let args: Vec<serde_json::Value> = tokens
        .map(|t| serde_json::Value::String(t.to_string()))
        .collect();
    Some((name.to_string(), serde_json::Value::Array(args)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_and_args() {
        let (name, args) = parse_direct_tool("weather tomorrow berlin").unwrap();
        assert_eq!(name, "weather");
        assert_eq!(args, serde_json::json!(["tomorrow", "berlin"]));
    }

    #[test]
    fn tool_without_args() {
        let (name, args) = parse_direct_tool("ping").unwrap();
        assert_eq!(name, "ping");
        assert_eq!(args, serde_json::json!([]));
    }

    #[test]
    fn empty_text_is_none() {
        assert!(parse_direct_tool("   ").is_none());
        assert!(parse_direct_tool("").is_none());
    }

    #[test]
    fn quotes_are_not_interpreted() {
        let (_, args) = parse_direct_tool(r#"echo "two words""#).unwrap();
        assert_eq!(args, serde_json::json!([r#""two"#, r#"words""#]));
    }
}
