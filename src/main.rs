//! Runs the demo service provider and identity provider side by side.

use std::{future::IntoFuture, sync::Arc, time::Duration};

use shaml_artifact::{
    config::{IdpConfig, SpConfig},
    idp::{self, IdentityProvider},
    sp::{self, HttpSoapClient, ServiceProvider},
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let sp_config = SpConfig::from_env()?;
    let idp_config = IdpConfig::from_env()?;

    let client = HttpSoapClient::new(sp_config.resolve_timeout)?;
    let service_provider = Arc::new(ServiceProvider::new(
        sp_config.clone(),
        sp_config.credentials()?,
        Arc::new(client),
    ));
    let identity_provider = Arc::new(IdentityProvider::new(
        idp_config.clone(),
        idp_config.credentials()?,
    ));

    {
        let service_provider = service_provider.clone();
        let identity_provider = identity_provider.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let sessions = service_provider.sessions().purge_idle();
                let artifacts = identity_provider.artifacts().purge_expired();
                tracing::debug!(sessions, artifacts, "purged idle state");
            }
        });
    }

    let sp_listener = TcpListener::bind(sp_config.bind_addr).await?;
    let idp_listener = TcpListener::bind(idp_config.bind_addr).await?;
    tracing::info!(sp = %sp_config.bind_addr, idp = %idp_config.bind_addr, "listening");

    tokio::try_join!(
        axum::serve(sp_listener, sp::router(service_provider)).into_future(),
        axum::serve(idp_listener, idp::router(identity_provider)).into_future(),
    )?;
    Ok(())
}
