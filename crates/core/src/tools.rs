//! Promotion Tool
//!
//! The remote voice agent can call exactly one local function: it promotes the
//! student to the next onboarding stage once the hidden validation criteria of
//! the current stage are met. This module declares that function and the
//! provider-agnostic call/response types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Name under which the promotion function is declared to the remote agent.
pub const PROMOTE_TOOL_NAME: &str = "promote_student_to_next_stage";

/// Result text returned for every handled promotion call.
pub const PROMOTION_RESULT: &str = "Promotion successful";

const PROMOTE_TOOL_DESCRIPTION: &str = "Call this function ONLY when the user has satisfactorily met the \
validation criteria based on the conversation to move them to the next learning module.";

/// Arguments of the promotion function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PromoteStudentArgs {
    /// Why the agent decided the student passed the stage.
    #[schemars(description = "The reason why the student passed.")]
    pub reason: String,
}

/// A function the remote agent is allowed to call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// Declaration of [`PROMOTE_TOOL_NAME`] with its generated argument schema.
pub fn promotion_tool() -> ToolDeclaration {
    let mut parameters = serde_json::to_value(schemars::schema_for!(PromoteStudentArgs))
        .unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = parameters.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    ToolDeclaration {
        name: PROMOTE_TOOL_NAME.to_string(),
        description: PROMOTE_TOOL_DESCRIPTION.to_string(),
        parameters,
    }
}

/// A function call requested by the remote agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolCall {
    pub fn is_promotion(&self) -> bool {
        self.name == PROMOTE_TOOL_NAME
    }

    /// Parses the arguments as promotion arguments.
    pub fn promotion_args(&self) -> Result<PromoteStudentArgs, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

/// What the local side reports back for a call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Success(String),
    Failure(String),
}

/// The answer to exactly one [`ToolCall`], correlated by id.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub result: ToolResult,
}

impl ToolResponse {
    pub fn success(call: &ToolCall, result: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            result: ToolResult::Success(result.into()),
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            result: ToolResult::Failure(error.into()),
        }
    }

    /// The response object as sent to the remote agent.
    pub fn payload(&self) -> Value {
        match &self.result {
            ToolResult::Success(result) => json!({ "result": result }),
            ToolResult::Failure(error) => json!({ "error": error }),
        }
    }
}
