use std::sync::Arc;

use mcp_session_server::{logging, mcp::server::McpHandler, transport::stdio};
use tokio::io::{stdin, stdout, BufReader};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();
    info!("stdio server starting");

    stdio::serve(Arc::new(McpHandler::new()), BufReader::new(stdin()), stdout()).await?;
    Ok(())
}
