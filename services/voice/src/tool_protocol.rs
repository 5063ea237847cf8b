use gemini_realtime::types::{FunctionCall, FunctionDeclaration, FunctionResponse};
use lumi_core::tools::{PROMOTION_RESULT, ToolCall, ToolResponse, promotion_tool};
use tracing::{info, warn};

/// The function declaration sent in the session setup.
pub fn declaration() -> FunctionDeclaration {
    let tool = promotion_tool();
    FunctionDeclaration {
        name: tool.name,
        description: tool.description,
        parameters_json_schema: tool.parameters,
    }
}

/// A call without an id is answered without one.
pub fn from_wire(call: &FunctionCall) -> ToolCall {
    ToolCall {
        id: call.id.clone().unwrap_or_default(),
        name: call.name.clone(),
        args: call.args.clone(),
    }
}

pub fn to_wire(response: &ToolResponse) -> FunctionResponse {
    FunctionResponse {
        id: (!response.id.is_empty()).then(|| response.id.clone()),
        name: response.name.clone(),
        response: response.payload(),
    }
}

/// Handles one call and produces its single response.
///
/// The promotion tool always reports success, whether or not there was a
/// further stage to move to. `on_promote` receives the stage increment.
pub fn answer(call: &ToolCall, mut on_promote: impl FnMut(u32)) -> ToolResponse {
    if call.is_promotion() {
        match call.promotion_args() {
            Ok(args) => {
                info!(id = %call.id, reason = %args.reason, "Agent requested stage promotion")
            }
            Err(e) => {
                warn!(id = %call.id, error = %e, "Promotion call carried unreadable arguments")
            }
        }
        on_promote(1);
        ToolResponse::success(call, PROMOTION_RESULT)
    } else {
        warn!(id = %call.id, name = %call.name, "Agent called an unsupported tool");
        ToolResponse::failure(call, format!("Unsupported tool: {}", call.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumi_core::tools::PROMOTE_TOOL_NAME;
    use serde_json::json;

    fn wire_call(id: Option<&str>, name: &str) -> FunctionCall {
        FunctionCall {
            id: id.map(str::to_string),
            name: name.to_string(),
            args: json!({"reason": "explained the offer"}),
        }
    }

    #[test]
    fn test_declaration_matches_tool() {
        let decl = declaration();
        assert_eq!(decl.name, PROMOTE_TOOL_NAME);
        assert!(decl.description.contains("validation criteria"));
        assert_eq!(decl.parameters_json_schema["type"], "object");
        assert_eq!(
            decl.parameters_json_schema["properties"]["reason"]["type"],
            "string"
        );
    }

    #[test]
    fn test_promotion_call_is_answered_with_success() {
        let call = from_wire(&wire_call(Some("call-1"), PROMOTE_TOOL_NAME));
        let mut increments = Vec::new();
        let response = answer(&call, |n| increments.push(n));

        assert_eq!(increments, vec![1]);
        let wire = to_wire(&response);
        assert_eq!(wire.id.as_deref(), Some("call-1"));
        assert_eq!(wire.name, PROMOTE_TOOL_NAME);
        assert_eq!(wire.response, json!({"result": "Promotion successful"}));
    }

    #[test]
    fn test_promotion_without_arguments_still_promotes() {
        let call = ToolCall {
            id: "call-2".into(),
            name: PROMOTE_TOOL_NAME.into(),
            args: json!({}),
        };
        let mut promoted = 0;
        let response = answer(&call, |_| promoted += 1);
        assert_eq!(promoted, 1);
        assert_eq!(to_wire(&response).response["result"], "Promotion successful");
    }

    #[test]
    fn test_unknown_tool_gets_error_response() {
        let call = from_wire(&wire_call(Some("call-3"), "open_door"));
        let mut promoted = false;
        let response = answer(&call, |_| promoted = true);

        assert!(!promoted);
        let wire = to_wire(&response);
        assert_eq!(wire.id.as_deref(), Some("call-3"));
        assert_eq!(wire.response, json!({"error": "Unsupported tool: open_door"}));
    }

    #[test]
    fn test_missing_id_round_trips_as_absent() {
        let call = from_wire(&wire_call(None, PROMOTE_TOOL_NAME));
        assert_eq!(call.id, "");
        let wire = to_wire(&answer(&call, |_| {}));
        assert_eq!(wire.id, None);
    }
}
