use tarry::{ServerConfig, run_with_shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tarry_util::init_tracing();

    let config = ServerConfig::from_env_or_yaml()?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}
