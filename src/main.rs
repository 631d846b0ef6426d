#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use container_sshd::sshd::{ProviderFactory, SshdConfig, run_server};
use dotenv::dotenv;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = SshdConfig::from_env();
    info!("Starting container-sshd on {}", config.listen_address());

    let factory = provider_factory(&config)?;
    run_server(&config, factory).await?;

    Ok(())
}

#[cfg(feature = "docker")]
fn provider_factory(
    config: &SshdConfig,
) -> Result<Arc<dyn ProviderFactory>, Box<dyn std::error::Error>> {
    use container_sshd::sshd::docker::DockerProviderFactory;

    let factory = DockerProviderFactory::connect(config.poll_policy())?;
    info!("Using Docker backend");
    Ok(Arc::new(factory))
}

#[cfg(not(feature = "docker"))]
fn provider_factory(
    _config: &SshdConfig,
) -> Result<Arc<dyn ProviderFactory>, Box<dyn std::error::Error>> {
    use container_sshd::sshd::SshdError;

    Err(SshdError::Config(
        "no container backend compiled in, enable the `docker` feature".to_string(),
    )
    .into())
}
