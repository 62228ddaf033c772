//! Prompt templates exposed via Model Context Protocol

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::mcp::rpc::{app_error_to_json_rpc, json_rpc_error, json_rpc_result, INVALID_PARAMS};

pub const GREET_USER_PROMPT: &str = "greet-user";
pub const VALID_GREETING_TIMES: [&str; 3] = ["morning", "afternoon", "evening"];

#[derive(Debug, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<HashMap<String, String>>,
}

pub fn build_prompts_list() -> Vec<Value> {
    vec![json!({
        "name": GREET_USER_PROMPT,
        "description": "Ask the assistant to greet a user",
        "arguments": [
            {
                "name": "name",
                "description": "Name of the user to greet",
                "required": true
            },
            {
                "name": "time",
                "description": "Time of day: morning, afternoon or evening",
                "required": false
            }
        ]
    })]
}

pub fn normalize_greeting_time(time: Option<&str>) -> Result<Option<&'static str>, AppError> {
    let Some(value) = time.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    VALID_GREETING_TIMES
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(value))
        .copied()
        .map(Some)
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_time",
                "time must be one of: morning, afternoon, evening",
            )
        })
}

pub fn render_greeting(name: &str, time: Option<&str>) -> String {
    match time {
        Some(time) => format!("Please greet {name} with a good {time} greeting."),
        None => format!("Please greet {name} in a way that suits the time of day."),
    }
}

pub fn get_prompt(params: GetPromptParams) -> Result<Value, AppError> {
    if params.name != GREET_USER_PROMPT {
        return Err(AppError::not_found(
            "prompt_not_found",
            format!("unknown prompt name: {}", params.name),
        ));
    }

    let arguments = params.arguments.unwrap_or_default();
    let name = arguments
        .get("name")
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request("missing_name", "argument name is required"))?;
    let time = normalize_greeting_time(arguments.get("time").map(String::as_str))?;

    Ok(json!({
        "description": "Greeting request",
        "messages": [{
            "role": "user",
            "content": {
                "type": "text",
                "text": render_greeting(name, time)
            }
        }]
    }))
}

pub fn handle_prompts_get(id: Option<Value>, params: Option<Value>) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
    };

    let params: GetPromptParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
    };

    match get_prompt(params) {
        Ok(result) => json_rpc_result(id, result),
        Err(err) => app_error_to_json_rpc(id, err),
    }
}
