//! Tool invocation bridge
//!
//! Turns a model-issued function call into exactly one [`ToolResult`]:
//!
//! ```text
//! function_call ─→ registry lookup ─→ credit reservation ─→ handler (bounded)
//!                        │                    │                   │
//!                  unknown tool          insufficient       ok / error / timeout
//!                        ↓                    ↓                   ↓
//!                   failure result      failure result   commit or refund → result
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::registry::{ToolHandler, ToolOutput, ToolRegistry};
use crate::credits::{CreditContext, CreditReservation};
use crate::error::{ProtocolError, ToolError};
use crate::types::ConversationId;

/// A function call issued by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub conversation_id: ConversationId,
}

/// The single answer to a [`ToolCall`]
///
/// `success == false` always carries `credits_charged == 0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub credits_charged: u64,
}

impl ToolResult {
    pub fn failure(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            success: false,
            data: None,
            message: Some(message.into()),
            credits_charged: 0,
        }
    }

    fn from_output(call: &ToolCall, output: ToolOutput, credits_charged: u64) -> Self {
        let credits_charged = if output.success { credits_charged } else { 0 };
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            success: output.success,
            data: output.data,
            message: output.message,
            credits_charged,
        }
    }

    /// Payload of the outbound `function_call.result` event
    pub fn output(&self) -> serde_json::Value {
        let mut out = serde_json::json!({ "success": self.success });
        if let Some(data) = &self.data {
            out["data"] = data.clone();
        }
        if let Some(message) = &self.message {
            out["message"] = serde_json::Value::String(message.clone());
        }
        out
    }
}

/// Per-session bridge between function-call events and tool handlers
pub struct ToolInvocationBridge {
    registry: Arc<ToolRegistry>,
    credits: Arc<CreditContext>,
    in_flight: Mutex<HashSet<String>>,
    handler_timeout: Duration,
}

impl ToolInvocationBridge {
    pub fn new(registry: Arc<ToolRegistry>, credits: Arc<CreditContext>, handler_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            credits,
            in_flight: Mutex::new(HashSet::new()),
            handler_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn credits(&self) -> &Arc<CreditContext> {
        &self.credits
    }

    /// Number of calls that have started and not yet been finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Claim a call id. A second call with an unresolved id is rejected.
    pub fn begin(&self, call: &ToolCall) -> Result<(), ProtocolError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ProtocolError::Malformed("bridge state poisoned".into()))?;
        if !in_flight.insert(call.call_id.clone()) {
            return Err(ProtocolError::DuplicateCallId(call.call_id.clone()));
        }
        Ok(())
    }

    /// Release a call id once its result has been emitted (or discarded).
    /// Returns how many calls remain in flight.
    pub fn finish(&self, call_id: &str) -> Result<usize, ProtocolError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ProtocolError::Malformed("bridge state poisoned".into()))?;
        if !in_flight.remove(call_id) {
            return Err(ProtocolError::UnknownCallId(call_id.to_string()));
        }
        Ok(in_flight.len())
    }

    /// Forget every unresolved call. Their results will be discarded when
    /// they arrive; credits are still settled by the running task.
    pub fn abandon_all(&self) -> usize {
        self.in_flight
            .lock()
            .map(|mut s| {
                let n = s.len();
                s.clear();
                n
            })
            .unwrap_or(0)
    }

    /// Run `call` on its own task and deliver the result on `done`.
    ///
    /// If `done` is closed by the time the result is ready (session ended),
    /// the result is dropped.
    pub fn spawn(self: &Arc<Self>, call: ToolCall, done: mpsc::Sender<ToolResult>) {
        let bridge = self.clone();
        tokio::spawn(async move {
            let result = bridge.execute(call).await;
            if done.send(result).await.is_err() {
                debug!("Session closed; discarding tool result");
            }
        });
    }

    /// Execute a call to completion. Never fails: every error path becomes
    /// a failure result, with credits refunded first.
    pub async fn execute(&self, call: ToolCall) -> ToolResult {
        let tool = match self.registry.get(&call.name) {
            Some(tool) => tool.clone(),
            None => {
                let violation = ProtocolError::UnknownTool(call.name.clone());
                warn!("Protocol violation in {}: {}", call.conversation_id, violation);
                return ToolResult::failure(&call, format!("Unknown tool '{}'", call.name));
            }
        };

        info!("Tool call {} '{}' in {}", call.call_id, call.name, call.conversation_id);

        let reservation = if tool.spec.is_paid() {
            match CreditReservation::acquire(&self.credits, tool.spec.cost).await {
                Ok(Some(r)) => Some(r),
                Ok(None) => {
                    info!("Insufficient balance for '{}' ({} credits)", call.name, tool.spec.cost);
                    return ToolResult::failure(
                        &call,
                        format!("Insufficient balance: '{}' costs {} credits", call.name, tool.spec.cost),
                    );
                }
                Err(e) => {
                    error!("Credit ledger error for '{}': {}", call.name, e);
                    return ToolResult::failure(&call, format!("Could not reserve credits: {}", e));
                }
            }
        } else {
            None
        };

        match self.run_handler(tool.handler.clone(), call.arguments.clone()).await {
            Ok(output) if output.success => {
                let charged = reservation.map(|r| r.commit()).unwrap_or(0);
                ToolResult::from_output(&call, output, charged)
            }
            Ok(output) => {
                release(reservation).await;
                ToolResult::from_output(&call, output, 0)
            }
            Err(e) => {
                warn!("Tool '{}' failed: {}", call.name, e);
                release(reservation).await;
                ToolResult::failure(&call, e.to_string())
            }
        }
    }

    /// Run the handler on its own task so a panic or a hang cannot take the
    /// result with it.
    async fn run_handler(&self, handler: Arc<dyn ToolHandler>, args: serde_json::Value) -> Result<ToolOutput, ToolError> {
        let mut task = tokio::spawn(async move { handler.call(args).await });
        match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ToolError::Failed(format!("handler aborted: {}", join_err))),
            Err(_) => {
                task.abort();
                Err(ToolError::Timeout(self.handler_timeout.as_millis() as u64))
            }
        }
    }
}

async fn release(reservation: Option<CreditReservation>) {
    if let Some(r) = reservation {
        let amount = r.amount();
        if let Err(e) = r.release().await {
            error!("Refund of {} credits failed: {}", amount, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::{CreditLedger, InMemoryLedger};
    use crate::tools::registry::ToolSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            call_id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({"prompt": "a lighthouse"}),
            conversation_id: "conv-1".to_string(),
        }
    }

    fn bridge_with(registry: ToolRegistry, ledger: Arc<InMemoryLedger>, timeout_ms: u64) -> Arc<ToolInvocationBridge> {
        let ledger: Arc<dyn CreditLedger> = ledger;
        let credits = CreditContext::new("owner-1", "conv-1", ledger);
        ToolInvocationBridge::new(Arc::new(registry), credits, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_paid_tool_insufficient_balance_skips_handler() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("generate_image", "Make an image").with_cost(5), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ToolOutput::ok(serde_json::json!({})))
            }
        });
        let ledger = Arc::new(InMemoryLedger::new(3));
        let bridge = bridge_with(registry, ledger.clone(), 1000);

        let result = bridge.execute(call("c1", "generate_image")).await;
        assert!(!result.success);
        assert_eq!(result.credits_charged, 0);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(ledger.balance("owner-1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_paid_tool_success_charges() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("generate_image", "Make an image").with_cost(5), |_| async {
            Ok(ToolOutput::ok(serde_json::json!({"media": {"url": "https://cdn/x.png"}})))
        });
        let ledger = Arc::new(InMemoryLedger::new(12));
        let bridge = bridge_with(registry, ledger.clone(), 1000);

        let result = bridge.execute(call("c1", "generate_image")).await;
        assert!(result.success);
        assert_eq!(result.credits_charged, 5);
        assert_eq!(ledger.balance("owner-1").await.unwrap(), 7);
        assert_eq!(result.output()["data"]["media"]["url"], "https://cdn/x.png");
    }

    #[tokio::test]
    async fn test_handler_error_refunds() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("send_message", "Send").with_cost(2), |_| async {
            Err(ToolError::Failed("smtp down".into()))
        });
        let ledger = Arc::new(InMemoryLedger::new(10));
        let bridge = bridge_with(registry, ledger.clone(), 1000);

        let result = bridge.execute(call("c1", "send_message")).await;
        assert!(!result.success);
        assert_eq!(result.credits_charged, 0);
        assert_eq!(ledger.balance("owner-1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_handler_reported_failure_refunds() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("create_record", "Create").with_cost(4), |_| async {
            Ok(ToolOutput::failed("duplicate record"))
        });
        let ledger = Arc::new(InMemoryLedger::new(10));
        let bridge = bridge_with(registry, ledger.clone(), 1000);

        let result = bridge.execute(call("c1", "create_record")).await;
        assert!(!result.success);
        assert_eq!(result.message.as_deref(), Some("duplicate record"));
        assert_eq!(ledger.balance("owner-1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_handler_timeout_refunds() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("slow", "Never finishes").with_cost(1), |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolOutput::ok(serde_json::json!({})))
        });
        let ledger = Arc::new(InMemoryLedger::new(1));
        let bridge = bridge_with(registry, ledger.clone(), 20);

        let result = bridge.execute(call("c1", "slow")).await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("timed out"));
        assert_eq!(ledger.balance("owner-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failure() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("boom", "Panics"), |_| async {
            if true {
                panic!("handler bug");
            }
            Ok(ToolOutput::ok(serde_json::json!({})))
        });
        let bridge = bridge_with(registry, Arc::new(InMemoryLedger::new(0)), 1000);
        let result = bridge.execute(call("c1", "boom")).await;
        assert!(!result.success);
        assert_eq!(result.call_id, "c1");
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_call() {
        let bridge = bridge_with(ToolRegistry::new(), Arc::new(InMemoryLedger::new(0)), 1000);
        let result = bridge.execute(call("c9", "teleport")).await;
        assert!(!result.success);
        assert_eq!(result.call_id, "c9");
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_call_ids() {
        let bridge = bridge_with(ToolRegistry::new(), Arc::new(InMemoryLedger::new(0)), 1000);
        bridge.begin(&call("c1", "x")).unwrap();
        assert_eq!(
            bridge.begin(&call("c1", "x")),
            Err(ProtocolError::DuplicateCallId("c1".into()))
        );
        assert_eq!(bridge.in_flight(), 1);
        assert_eq!(bridge.finish("c1"), Ok(0));
        assert_eq!(bridge.finish("c1"), Err(ProtocolError::UnknownCallId("c1".into())));
        // Resolved ids may be reused
        assert!(bridge.begin(&call("c1", "x")).is_ok());
    }

    #[tokio::test]
    async fn test_abandon_all_orphans_results() {
        let bridge = bridge_with(ToolRegistry::new(), Arc::new(InMemoryLedger::new(0)), 1000);
        bridge.begin(&call("c1", "x")).unwrap();
        bridge.begin(&call("c2", "x")).unwrap();
        assert_eq!(bridge.abandon_all(), 2);
        assert!(bridge.finish("c1").is_err());
    }

    #[tokio::test]
    async fn test_spawn_discards_result_when_session_closed() {
        let mut registry = ToolRegistry::new();
        registry.register_fn(ToolSpec::new("echo", "Echo"), |args| async move { Ok(ToolOutput::ok(args)) });
        let bridge = bridge_with(registry, Arc::new(InMemoryLedger::new(0)), 1000);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        bridge.spawn(call("c1", "echo"), tx);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
