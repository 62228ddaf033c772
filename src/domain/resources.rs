//! Model Context Protocol resource providers
//!
//! Exposes one static resource and one parameterized resource template.

use std::sync::LazyLock;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use rust_mcp_sdk::schema::{
    ReadResourceContent, ReadResourceRequestParams, ReadResourceResult, Resource,
    TextResourceContents,
};
use serde_json::{json, Value};

use crate::mcp::rpc::{
    json_rpc_error, json_rpc_error_with_data, json_rpc_result, INTERNAL_ERROR, INVALID_PARAMS,
    RESOURCE_NOT_FOUND,
};

pub const CONFIG_RESOURCE_URI: &str = "config://app";
pub const USER_PROFILE_URI_TEMPLATE: &str = "users://{userId}/profile";

static USER_PROFILE_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^users://(?P<user_id>[^/\s]+)/profile$").expect("user profile uri pattern")
});

pub fn build_resources_list() -> Vec<Resource> {
    vec![Resource {
        annotations: None,
        description: Some("Application configuration".to_string()),
        icons: vec![],
        meta: None,
        mime_type: Some("text/plain".to_string()),
        name: "config".to_string(),
        size: None,
        title: None,
        uri: CONFIG_RESOURCE_URI.to_string(),
    }]
}

pub fn build_resource_templates_list() -> Vec<Value> {
    vec![json!({
        "name": "user-profile",
        "uriTemplate": USER_PROFILE_URI_TEMPLATE,
        "description": "Profile of a single user",
        "mimeType": "text/plain"
    })]
}

/// Extracts `userId` from a `users://{userId}/profile` uri.
pub fn match_user_profile(uri: &str) -> Option<&str> {
    USER_PROFILE_URI
        .captures(uri)
        .and_then(|captures| captures.name("user_id"))
        .map(|user_id| user_id.as_str())
}

pub fn read_resource_text(uri: &str) -> Option<String> {
    if uri == CONFIG_RESOURCE_URI {
        return Some(
            "Application configuration.\nVersion: 1.0.0\nEnvironment: development".to_string(),
        );
    }

    match_user_profile(uri).map(|user_id| {
        let registered_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        format!("User ID: {user_id}\nName: User {user_id}\nRegistered at: {registered_at}")
    })
}

pub fn handle_resources_read(id: Option<Value>, params: Option<Value>) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
    };

    let resource_read: ReadResourceRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
    };

    let Some(text) = read_resource_text(&resource_read.uri) else {
        return json_rpc_error_with_data(
            id,
            RESOURCE_NOT_FOUND,
            "Resource not found",
            Some(json!({
                "code": "resource_not_found",
                "message": "unknown resource uri",
                "details": {
                    "uri": resource_read.uri,
                },
            })),
        );
    };

    let result = ReadResourceResult {
        contents: vec![ReadResourceContent::from(TextResourceContents {
            meta: None,
            mime_type: Some("text/plain".to_string()),
            text,
            uri: resource_read.uri,
        })],
        meta: None,
    };

    match serde_json::to_value(result) {
        Ok(result) => json_rpc_result(id, result),
        Err(_) => json_rpc_error(id, INTERNAL_ERROR, "Internal error"),
    }
}
