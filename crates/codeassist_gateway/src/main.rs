// Code Assist Gateway
//
// login   - sign in with Google and store the credential
// serve   - run the OpenAI-compatible HTTP gateway
// status  - list stored credentials

use std::env;
use std::sync::Arc;

use anyhow::Context;
use codeassist_gateway::server::callback::DEFAULT_CALLBACK_TIMEOUT;
use codeassist_gateway::{start_server, telemetry, Gateway, GatewayConfig, LoginFlow};

const USAGE: &str = "usage: codeassist-gateway <login [identity] | serve [host] [port] | status>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    telemetry::init(config.debug);

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("login") => {
            let identity = args.get(2).map(String::as_str).unwrap_or("default");
            login(&config, identity).await
        }
        Some("serve") | None => {
            let host = args.get(2).map(String::as_str).unwrap_or("127.0.0.1");
            let port = match args.get(3) {
                Some(port) => port.parse::<u16>().with_context(|| format!("invalid port '{}'", port))?,
                None => 54545,
            };
            serve(&config, host, port).await
        }
        Some("status") => status(&config).await,
        Some(other) => anyhow::bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

async fn login(config: &GatewayConfig, identity: &str) -> anyhow::Result<()> {
    let gateway = Gateway::from_config(config)?;
    let flow = LoginFlow::new(
        Arc::clone(gateway.tokens()),
        Arc::clone(gateway.projects()),
        config.callback_port,
        config.project_hint.clone(),
    );
    let outcome = flow
        .run(identity, DEFAULT_CALLBACK_TIMEOUT)
        .await
        .context("login failed")?;

    println!();
    println!("[OK] Signed in as {}", outcome.email.as_deref().unwrap_or("unknown account"));
    println!("[OK] Credential stored as '{}' in {}", outcome.identity, config.token_store_path.display());
    match outcome.refresh.effective_project() {
        Some(project) => println!("[OK] Project: {}", project),
        None => println!("[INFO] No project discovered yet; one will be resolved per call"),
    }
    Ok(())
}

async fn serve(config: &GatewayConfig, host: &str, port: u16) -> anyhow::Result<()> {
    let gateway = Arc::new(Gateway::from_config(config)?);
    let stored = gateway.tokens().list().await?;
    if stored.is_empty() {
        println!("[WARN] No stored credentials; run `codeassist-gateway login` first");
    } else {
        println!("[OK] Loaded {} credential(s) from {}", stored.len(), config.token_store_path.display());
    }
    println!("[INFO] Endpoint chain: {}", gateway.endpoints().join(" -> "));
    println!("[INFO] Listening on http://{}:{}", host, port);

    start_server(host, port, gateway).await?;
    Ok(())
}

async fn status(config: &GatewayConfig) -> anyhow::Result<()> {
    let gateway = Gateway::from_config(config)?;
    let stored = gateway.tokens().list().await?;
    if stored.is_empty() {
        println!("No stored credentials in {}", config.token_store_path.display());
        return Ok(());
    }
    for (identity, credential) in stored {
        let parts = credential.refresh_parts();
        let state = if credential.is_expired() {
            "expired"
        } else if credential.needs_refresh(config.refresh_buffer) {
            "refresh due"
        } else {
            "valid"
        };
        println!(
            "{:<16} {:<32} {:<12} expires {:<25} project {}",
            identity,
            credential.email.as_deref().unwrap_or("-"),
            state,
            credential
                .expires_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            parts.effective_project().unwrap_or("-"),
        );
    }
    Ok(())
}
