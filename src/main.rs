/// Flowrunner: workflow execution engine
///
/// Main entry point. Loads configuration from the environment and runs the
/// engine (executor pool, job scheduler and cron triggers) until Ctrl-C.

use flowrunner::{config::Config, service::start_service};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (FLOWRUNNER_* environment variables, else defaults)
    let config = Config::default();

    start_service(config).await?;

    Ok(())
}
