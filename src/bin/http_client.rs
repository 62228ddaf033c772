use anyhow::Context as _;
use mcp_session_server::{client::HttpMcpClient, config::ClientConfig, logging};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let config = ClientConfig::from_env().context("load client configuration")?;
    let mut client = HttpMcpClient::new(config.server_url.clone())?;

    let outcome = run(&mut client).await;

    // The session is terminated even when the walkthrough failed.
    if let Err(err) = client.close().await {
        warn!(error = %err, "failed to close session");
    }

    outcome
}

async fn run(client: &mut HttpMcpClient) -> anyhow::Result<()> {
    let init = client.initialize("mcp-session-client", env!("CARGO_PKG_VERSION")).await?;
    info!(
        session_id = client.session_id().unwrap_or("-"),
        protocol_version = %init.protocol_version,
        "connected"
    );
    print_section("Server info", &init.server_info)?;

    print_section("Resources", &client.list_resources().await?)?;
    print_section("Resource templates", &client.list_resource_templates().await?)?;
    print_section("Read config://app", &client.read_resource("config://app").await?)?;
    print_section(
        "Read users://123/profile",
        &client.read_resource("users://123/profile").await?,
    )?;

    print_section("Tools", &client.list_tools().await?)?;
    print_section(
        "Call calculate",
        &client
            .call_tool("calculate", json!({ "operation": "add", "a": 10, "b": 20 }))
            .await?,
    )?;
    print_section(
        "Call calculate (divide by zero)",
        &client
            .call_tool("calculate", json!({ "operation": "divide", "a": 1, "b": 0 }))
            .await?,
    )?;
    print_section(
        "Call get-weather",
        &client
            .call_tool("get-weather", json!({ "city": "Beijing" }))
            .await?,
    )?;

    print_section("Prompts", &client.list_prompts().await?)?;
    let mut arguments = Map::new();
    arguments.insert("name".to_string(), Value::from("Alice"));
    arguments.insert("time".to_string(), Value::from("morning"));
    print_section("Get greet-user", &client.get_prompt("greet-user", arguments).await?)?;

    Ok(())
}

fn print_section<T: Serialize>(title: &str, value: &T) -> anyhow::Result<()> {
    println!("=== {title} ===");
    println!("{}", serde_json::to_string_pretty(value)?);
    println!();
    Ok(())
}
