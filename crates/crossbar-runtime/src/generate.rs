//! Response generation with tool roundtrips.
//!
//! Flow: event → generator stream → if tool calls → execute tools →
//! append results to the session → generate again. Stops when a round
//! produces no tool calls, or the roundtrip limit is hit.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use async_trait::async_trait;

use crossbar_core::{ChannelEvent, GatewayError, Result, ToolCall, ToolExecutionResult};
use crossbar_sessions::{Session, SessionManager, SessionMessage};

use crate::tools::ToolProvider;

/// Maximum generator/tool roundtrips per event to prevent runaway loops.
const MAX_TOOL_ROUNDTRIPS: usize = 8;

/// One streamed piece of a generated reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplyChunk {
    /// Text delta, appended to the accumulated reply.
    pub text: String,
    /// Tool invocations requested in this chunk.
    pub tool_calls: Vec<ToolCall>,
}

impl ReplyChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![call],
        }
    }
}

/// Stream of reply chunks for one generation round.
pub type ReplyStream = BoxStream<'static, Result<ReplyChunk>>;

/// External language-model bridge.
///
/// May be called several times per event: each call sees the session as
/// of that round plus the tool results produced since the last call.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        event: &ChannelEvent,
        session: &Session,
        tool_results: &[ToolExecutionResult],
    ) -> Result<ReplyStream>;
}

/// Drive the generator to a final text, interleaving tool executions.
///
/// Assistant and tool messages are appended to the session as the loop
/// progresses, so each generation round sees the full exchange so far.
pub(crate) async fn run_generation(
    generator: &Arc<dyn ResponseGenerator>,
    tools: Option<&Arc<dyn ToolProvider>>,
    sessions: &SessionManager,
    event: &ChannelEvent,
    session_id: &str,
) -> Result<Option<String>> {
    let mut round_results: Vec<ToolExecutionResult> = Vec::new();
    let mut last_text = String::new();

    for round in 0..MAX_TOOL_ROUNDTRIPS {
        let session = sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound {
                id: session_id.to_string(),
            })?;

        let mut stream = generator.generate(event, &session, &round_results).await?;
        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            text.push_str(&chunk.text);
            calls.extend(chunk.tool_calls);
        }

        if calls.is_empty() {
            return Ok(if text.is_empty() { None } else { Some(text) });
        }

        debug!(round, tool_calls = calls.len(), "executing tool roundtrip");
        sessions
            .add_message(
                session_id,
                SessionMessage::assistant_with_tools(text.clone(), calls.clone()),
            )
            .await?;
        last_text = text;

        round_results.clear();
        for call in calls {
            let result = execute_call(tools, &call).await;
            sessions
                .add_message(session_id, SessionMessage::tool(result.clone()))
                .await?;
            round_results.push(result);
        }
    }

    warn!(
        max_roundtrips = MAX_TOOL_ROUNDTRIPS,
        "generation hit the tool roundtrip limit"
    );
    Ok(if last_text.is_empty() {
        None
    } else {
        Some(last_text)
    })
}

/// Run one tool call, folding provider errors into an error result so the
/// generator can see what went wrong.
async fn execute_call(
    tools: Option<&Arc<dyn ToolProvider>>,
    call: &ToolCall,
) -> ToolExecutionResult {
    match tools {
        Some(provider) => provider
            .execute_tool(&call.name, call.arguments.clone())
            .await
            .unwrap_or_else(|e| ToolExecutionResult::error(e.to_string())),
        None => ToolExecutionResult::error(format!(
            "no tool provider configured for tool {}",
            call.name
        )),
    }
}
