//! Tools exposed via Model Context Protocol
//!
//! `calculate` performs basic arithmetic and `get-weather` answers from a
//! fixed lookup table. A division by zero is reported as a tool result with
//! `isError` set, not as a JSON-RPC error.

use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::mcp::rpc::{
    app_error_to_json_rpc, json_rpc_error, json_rpc_result, INTERNAL_ERROR, INVALID_PARAMS,
};

pub const CALCULATE_TOOL: &str = "calculate";
pub const WEATHER_TOOL: &str = "get-weather";

#[macros::mcp_tool(
    name = "calculate",
    description = "Apply add, subtract, multiply or divide to two numbers"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct CalculateTool {
    pub operation: Operation,
    pub a: f64,
    pub b: f64,
}

#[macros::mcp_tool(name = "get-weather", description = "Look up the current weather for a city")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetWeatherTool {
    pub city: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, macros::JsonSchema)]
pub enum Operation {
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "subtract")]
    Subtract,
    #[serde(rename = "multiply")]
    Multiply,
    #[serde(rename = "divide")]
    Divide,
}

impl Operation {
    pub const ALL: [Operation; 4] = [Self::Add, Self::Subtract, Self::Multiply, Self::Divide];

    pub fn parse(value: &str) -> Result<Self, AppError> {
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == value)
            .ok_or_else(|| {
                AppError::bad_request(
                    "invalid_operation",
                    "operation must be one of: add, subtract, multiply, divide",
                )
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }
}

pub fn build_tools_list() -> Vec<Tool> {
    vec![CalculateTool::tool(), GetWeatherTool::tool()]
}

/// Returns `None` for a division by zero.
pub fn calculate(operation: Operation, a: f64, b: f64) -> Option<f64> {
    match operation {
        Operation::Add => Some(a + b),
        Operation::Subtract => Some(a - b),
        Operation::Multiply => Some(a * b),
        Operation::Divide if b == 0.0 => None,
        Operation::Divide => Some(a / b),
    }
}

pub fn lookup_weather(city: &str) -> Option<&'static str> {
    match city.trim() {
        "Beijing" | "北京" => Some("Sunny, 25°C"),
        "Shanghai" | "上海" => Some("Cloudy, 28°C"),
        "Guangzhou" | "广州" => Some("Rainy, 30°C"),
        "Shenzhen" | "深圳" => Some("Overcast, 29°C"),
        _ => None,
    }
}

fn text_result(text: String, is_error: bool) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: is_error.then_some(true),
        meta: None,
        structured_content: None,
    }
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(
    arguments: serde_json::Map<String, Value>,
) -> Result<T, AppError> {
    serde_json::from_value(Value::Object(arguments)).map_err(|_| {
        AppError::bad_request(
            "invalid_arguments",
            "tool arguments do not match the input schema",
        )
    })
}

pub fn call_tool(tool_call: CallToolRequestParams) -> Result<CallToolResult, AppError> {
    let arguments = tool_call.arguments.unwrap_or_default();
    match tool_call.name.as_str() {
        CALCULATE_TOOL => {
            // Name the bad operation before the generic argument error.
            if let Some(operation) = arguments.get("operation").and_then(Value::as_str) {
                Operation::parse(operation)?;
            }
            let params: CalculateTool = parse_arguments(arguments)?;
            let operation = params.operation;

            Ok(match calculate(operation, params.a, params.b) {
                Some(result) => text_result(
                    format!(
                        "Result: {} {} {} = {result}",
                        params.a,
                        operation.as_str(),
                        params.b
                    ),
                    false,
                ),
                None => text_result("Error: division by zero".to_string(), true),
            })
        }
        WEATHER_TOOL => {
            let params: GetWeatherTool = parse_arguments(arguments)?;
            let city = params.city.trim();
            if city.is_empty() {
                return Err(AppError::bad_request(
                    "invalid_city",
                    "city must not be empty",
                ));
            }

            let weather = lookup_weather(city).unwrap_or("unknown city or weather data unavailable");
            Ok(text_result(format!("Weather in {city}: {weather}"), false))
        }
        other => Err(AppError::not_found(
            "tool_not_found",
            format!("unknown tool name: {other}"),
        )),
    }
}

pub fn handle_tools_call(id: Option<Value>, params: Option<Value>) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
    };

    let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
    };

    match call_tool(tool_call) {
        Ok(result) => match serde_json::to_value(result) {
            Ok(result) => json_rpc_result(id, result),
            Err(_) => json_rpc_error(id, INTERNAL_ERROR, "Internal error"),
        },
        Err(err) => app_error_to_json_rpc(id, err),
    }
}

/// Tool name carried by a `tools/call` params object, if any.
pub fn tool_name(params: Option<&Value>) -> Option<&str> {
    params
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: Value) -> Value {
        handle_tools_call(
            Some(json!(1)),
            Some(json!({ "name": name, "arguments": arguments })),
        )
    }

    #[test]
    fn lists_both_tools() {
        let names: Vec<String> = build_tools_list().into_iter().map(|tool| tool.name).collect();
        assert_eq!(names, vec!["calculate", "get-weather"]);
    }

    #[test]
    fn calculate_schema_lists_the_operations() {
        let tool = serde_json::to_value(CalculateTool::tool()).expect("serialize tool");
        let operation = &tool["inputSchema"]["properties"]["operation"];
        let allowed: Vec<&str> = operation["oneOf"]
            .as_array()
            .expect("operation variants")
            .iter()
            .filter_map(|variant| variant["enum"][0].as_str())
            .collect();

        assert_eq!(allowed, vec!["add", "subtract", "multiply", "divide"]);
        assert_eq!(
            tool["inputSchema"]["required"],
            json!(["operation", "a", "b"])
        );
    }

    #[test]
    fn operation_names_are_exact() {
        assert_eq!(Operation::parse("divide").expect("known"), Operation::Divide);
        assert!(Operation::parse("Divide").is_err());
    }

    #[test]
    fn calculate_adds() {
        let response = call("calculate", json!({ "operation": "add", "a": 5, "b": 3 }));
        assert_eq!(
            response["result"]["content"][0]["text"],
            "Result: 5 add 3 = 8"
        );
        assert!(response["result"].get("isError").map_or(true, Value::is_null));
    }

    #[test]
    fn division_by_zero_is_a_tool_error() {
        let response = call("calculate", json!({ "operation": "divide", "a": 1, "b": 0 }));
        assert!(response.get("error").is_none());
        assert_eq!(response["result"]["isError"], true);
        assert_eq!(
            response["result"]["content"][0]["text"],
            "Error: division by zero"
        );
    }

    #[test]
    fn unknown_operation_is_invalid_params() {
        let response = call("calculate", json!({ "operation": "modulo", "a": 1, "b": 2 }));
        assert_eq!(response["error"]["code"], INVALID_PARAMS);
        assert_eq!(response["error"]["data"]["code"], "invalid_operation");
    }

    #[test]
    fn missing_operand_is_invalid_params() {
        let response = call("calculate", json!({ "operation": "add", "a": 1 }));
        assert_eq!(response["error"]["data"]["code"], "invalid_arguments");
    }

    #[test]
    fn weather_known_and_unknown_cities() {
        let known = call("get-weather", json!({ "city": "Beijing" }));
        assert_eq!(
            known["result"]["content"][0]["text"],
            "Weather in Beijing: Sunny, 25°C"
        );

        let unknown = call("get-weather", json!({ "city": "Atlantis" }));
        assert_eq!(
            unknown["result"]["content"][0]["text"],
            "Weather in Atlantis: unknown city or weather data unavailable"
        );
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let response = call("rm-rf", json!({}));
        assert_eq!(response["error"]["code"], INVALID_PARAMS);
        assert_eq!(response["error"]["data"]["code"], "tool_not_found");
    }

    #[test]
    fn calculate_handles_each_operation() {
        assert_eq!(calculate(Operation::Subtract, 5.0, 3.0), Some(2.0));
        assert_eq!(calculate(Operation::Multiply, 5.0, 3.0), Some(15.0));
        assert_eq!(calculate(Operation::Divide, 5.0, 2.0), Some(2.5));
        assert_eq!(calculate(Operation::Divide, 5.0, 0.0), None);
    }
}
