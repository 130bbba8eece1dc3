use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::debug;
use ureq::Agent;

use crate::config::LlmConfig;
use crate::errors::Error;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_TOKENS: u32 = 2048;

/// A tool the agent may call during analysis.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

impl ToolSpec {
    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.input_schema,
        })
    }
}

/// One turn of the agent: either a tool invocation or its final answer.
#[derive(Debug, Clone)]
pub enum OracleTurn {
    ToolCall { id: String, name: String, input: Value },
    Final { text: String },
}

/// The LLM boundary. The analyzer only ever sees this trait, so tests swap in
/// a scripted oracle and the loop logic stays fully testable offline.
pub trait LlmOracle {
    fn next_turn(&self, system: &str, transcript: &[Value], tools: &[ToolSpec]) -> Result<OracleTurn, Error>;
}

/// The Messages API implementation.
pub struct AnthropicOracle {
    agent: Agent,
    api_key: String,
    model: String,
}

impl AnthropicOracle {
    pub fn new(config: &LlmConfig) -> AnthropicOracle {
        AnthropicOracle {
            agent: Agent::new_with_defaults(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

impl LlmOracle for AnthropicOracle {
    fn next_turn(&self, system: &str, transcript: &[Value], tools: &[ToolSpec]) -> Result<OracleTurn, Error> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": transcript,
            "tools": tools.iter().map(ToolSpec::to_json).collect::<Vec<_>>(),
        });

        let mut response = self
            .agent
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .send_json(&body)?;
        let reply: Value = response.body_mut().read_json()?;

        debug!(stop_reason = ?reply.get("stop_reason"), "oracle turn");

        let blocks = reply
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for block in &blocks {
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                return Ok(OracleTurn::ToolCall {
                    id: block.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                });
            }
        }

        let text = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(OracleTurn::Final { text })
    }
}

/// A canned oracle for tests: plays back a fixed sequence of turns.
pub struct ScriptedOracle {
    turns: Mutex<VecDeque<OracleTurn>>,
}

impl ScriptedOracle {
    pub fn new(turns: Vec<OracleTurn>) -> ScriptedOracle {
        ScriptedOracle {
            turns: Mutex::new(turns.into()),
        }
    }
}

impl LlmOracle for ScriptedOracle {
    fn next_turn(&self, _system: &str, _transcript: &[Value], _tools: &[ToolSpec]) -> Result<OracleTurn, Error> {
        let mut turns = self.turns.lock().unwrap_or_else(|e| e.into_inner());
        Ok(turns.pop_front().unwrap_or(OracleTurn::Final {
            text: String::new(),
        }))
    }
}
