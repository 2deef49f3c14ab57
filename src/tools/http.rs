//! Tools served by external HTTP endpoints
//!
//! The endpoint receives the call arguments as the JSON body and answers
//! with the handler contract `{success, data?, message?}`.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::registry::{ToolHandler, ToolOutput};
use crate::error::ToolError;

/// Default timeout for tool endpoints
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTool {
    client: Client,
    url: url::Url,
}

impl HttpTool {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = url::Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("tool endpoint must be http(s): {}", url);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl ToolHandler for HttpTool {
    async fn call(&self, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
        if !args.is_object() {
            return Err(ToolError::InvalidArguments(format!("expected an object, got {}", args)));
        }

        debug!("POST {}", self.url);
        let resp = self.client.post(self.url.clone()).json(&args).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Ok(ToolOutput::failed(format!("endpoint returned {}: {}", status, body.trim())));
        }

        let body: serde_json::Value = resp.json().await?;
        parse_output(body)
    }
}

/// Accepts the handler contract; a bare JSON body counts as successful data.
fn parse_output(body: serde_json::Value) -> Result<ToolOutput, ToolError> {
    if body.get("success").is_some() {
        serde_json::from_value(body).map_err(|e| ToolError::Failed(format!("bad tool response: {}", e)))
    } else {
        Ok(ToolOutput::ok(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_endpoint() {
        assert!(HttpTool::new("file:///etc/passwd").is_err());
        assert!(HttpTool::new("http://localhost:7000/image").is_ok());
    }

    #[test]
    fn test_parse_contract_response() {
        let out = parse_output(serde_json::json!({"success": false, "message": "quota"})).unwrap();
        assert_eq!(out, ToolOutput::failed("quota"));
    }

    #[test]
    fn test_parse_bare_body_as_data() {
        let out = parse_output(serde_json::json!({"id": "rec_1"})).unwrap();
        assert!(out.success);
        assert_eq!(out.data.unwrap()["id"], "rec_1");
    }

    #[tokio::test]
    async fn test_non_object_arguments_rejected() {
        let tool = HttpTool::new("http://localhost:7000/image").unwrap();
        let err = tool.call(serde_json::json!("draw")).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
