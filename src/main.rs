/// Relay: container-native workflow orchestration engine
///
/// Main entry point for the Relay server. Initializes configuration and
/// starts the HTTP server with workflow management, run execution, the
/// container metadata API, and the event gateway.

use relay::{config::Config, server::start_server};

/// Application entry point
///
/// Initializes the server with default configuration and starts listening.
/// The server provides:
/// - Workflow management API at /api/workflows/*
/// - Run management API at /api/runs/*
/// - Event gateway at /webhooks/{token} and /v1/events
/// - Container metadata API at /v1/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and a SQLite database under ./data)
    let config = Config::default();

    // Start the server
    start_server(config).await?;

    Ok(())
}
