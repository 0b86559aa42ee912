use crate::cli::commands::{CallCommand, MethodsCommand, ServeCommand, TargetArgs};
use crate::client::{self, Client};
use crate::config::Settings;
use crate::echo;
use crate::registry::Registry;
use crate::server::Server;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::info;

pub async fn handle_serve(cmd: ServeCommand, mut settings: Settings) -> Result<()> {
    cmd.apply(&mut settings);

    let registry = Arc::new(Registry::with_local_upgrader(settings.local.upgrader()));
    registry
        .register(echo::service())
        .context("Failed to register Echo service")?;

    let mut server = Server::new(Arc::clone(&registry)).with_options(settings.server.options());
    if let Some(tls) = settings
        .tls
        .server_tls(&settings.identity)
        .await
        .context("Failed to load server TLS material")?
    {
        server = server.with_tls(tls);
    }
    if let Some(owners) = settings.owners.start()? {
        server = server.with_owners(owners);
    }

    let listener = TcpListener::bind(&settings.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.address))?;
    server
        .serve_until(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!(metrics = ?server.metrics().snapshot(), "server stopped");
    Ok(())
}

async fn dial(target: &TargetArgs, settings: &Settings) -> Result<Client> {
    let mut client_settings = settings.client.clone();
    target.apply(&mut client_settings);
    let options = client_settings
        .dial_options(&settings.identity)
        .await
        .context("Failed to load client TLS material")?;
    Client::dial(&target.address, &options)
        .await
        .with_context(|| format!("Failed to dial {}", target.address))
}

fn utility_timeout(target: &TargetArgs, settings: &Settings) -> Duration {
    Duration::from_secs(target.timeout.unwrap_or(settings.client.timeout_secs))
}

pub async fn handle_ping(target: TargetArgs, settings: Settings) -> Result<()> {
    let client = dial(&target, &settings).await?;
    let start = Instant::now();
    client.ping().await.context("Ping failed")?;
    println!(
        "{}: ok in {:?} (coder={}, encrypted={}, unix={})",
        target.address,
        start.elapsed(),
        client.coder(),
        client.is_encrypted(),
        client.is_unix()
    );
    client.close().await?;
    Ok(())
}

pub async fn handle_methods(cmd: MethodsCommand, settings: Settings) -> Result<()> {
    let timeout = utility_timeout(&cmd.target, &settings);
    let methods = client::list_methods(&cmd.target.address, cmd.public, timeout)
        .await
        .with_context(|| format!("Failed to list methods on {}", cmd.target.address))?;
    for method in methods {
        println!("{method}");
    }
    Ok(())
}

pub async fn handle_hostname(target: TargetArgs, settings: Settings) -> Result<()> {
    let timeout = utility_timeout(&target, &settings);
    let hostname = client::get_hostname(&target.address, timeout)
        .await
        .with_context(|| format!("Failed to get host name of {}", target.address))?;
    println!("{hostname}");
    Ok(())
}

pub async fn handle_call(mut cmd: CallCommand, settings: Settings) -> Result<()> {
    let request: serde_json::Value =
        serde_json::from_str(&cmd.request).context("Request is not valid JSON")?;
    cmd.target.json = true;
    let client = dial(&cmd.target, &settings).await?;
    let response: serde_json::Value = client
        .request_reply(&cmd.method, &request)
        .await
        .with_context(|| format!("{} failed", cmd.method))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    client.close().await?;
    Ok(())
}
