use std::process::ExitCode;

use tracing::error;

use otlp_proxy::app::{shutdown_signal, App};
use otlp_proxy::config::Config;
use otlp_proxy::logger;

#[tokio::main]
async fn main() -> ExitCode {
    // The subscriber exists before config parsing so parse-time warnings are
    // visible; the configured level is applied right after.
    let log_level = logger::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    log_level.set_level(&config.log_level);
    config.log_summary();

    let app = match App::new(config) {
        Ok(app) => app,
        Err(e) => {
            error!("failed to build application: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = app.start().await {
        error!("failed to start server: {e}");
        return ExitCode::FAILURE;
    }

    shutdown_signal().await;
    app.shutdown().await;

    ExitCode::SUCCESS
}
