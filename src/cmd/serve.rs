//! Server command: `modelsmith serve`.

use anyhow::Result;
use modelsmith::config::AppConfig;

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    modelsmith::server::start_server(config).await
}
