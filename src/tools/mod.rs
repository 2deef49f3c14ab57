//! Tools the model can call mid-conversation

pub mod bridge;
pub mod http;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ToolsConfig;

pub use bridge::{ToolCall, ToolInvocationBridge, ToolResult};
pub use http::HttpTool;
pub use registry::{FnTool, RegisteredTool, ToolDefinition, ToolHandler, ToolOutput, ToolRegistry, ToolSpec};

/// Build a registry holding every HTTP-backed tool in the configuration
pub fn registry_from_config(config: &ToolsConfig) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    let timeout = Duration::from_secs(config.handler_timeout_secs.max(1));
    for tool in &config.http {
        let handler = HttpTool::with_timeout(&tool.url, timeout)
            .map_err(|e| anyhow::anyhow!("tool '{}': {}", tool.name, e))?;
        let spec = ToolSpec::new(&tool.name, &tool.description)
            .with_parameters(tool.parameters.clone())
            .with_cost(tool.cost);
        registry.register(spec, Arc::new(handler));
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpToolConfig;

    #[test]
    fn test_registry_from_config() {
        let config = ToolsConfig {
            handler_timeout_secs: 10,
            http: vec![HttpToolConfig {
                name: "generate_image".into(),
                description: "Generate an image".into(),
                url: "http://localhost:7000/image".into(),
                parameters: serde_json::json!({"type": "object", "properties": {"prompt": {"type": "string"}}}),
                cost: 5,
            }],
        };
        let registry = registry_from_config(&config).unwrap();
        assert_eq!(registry.get("generate_image").unwrap().spec.cost, 5);
        assert_eq!(registry.definitions()[0].parameters["properties"]["prompt"]["type"], "string");
    }

    #[test]
    fn test_registry_from_config_rejects_bad_url() {
        let config = ToolsConfig {
            handler_timeout_secs: 10,
            http: vec![HttpToolConfig {
                name: "broken".into(),
                description: "".into(),
                url: "ftp://nope".into(),
                parameters: serde_json::json!({}),
                cost: 0,
            }],
        };
        assert!(registry_from_config(&config).is_err());
    }
}
