//! waf-extproc - Main Entry Point

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use waf_extproc::authz::AuthzService;
use waf_extproc::engine::PassthroughEngine;
use waf_extproc::extproc::ExtProcService;
use waf_extproc::proto::ext_authz::authorization_server::AuthorizationServer;
use waf_extproc::proto::ext_proc::external_processor_server::ExternalProcessorServer;
use waf_extproc::{AdapterConfig, RuleEngine, TransactionRegistry};

#[derive(Parser)]
#[command(name = "waf-extproc", about = "Inline WAF enforcement for Envoy external processing")]
struct Args {
    /// Config file path
    #[arg(long, env = "WAF_EXTPROC_CONFIG", default_value = "/etc/waf-extproc/config.json")]
    config: String,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("waf-extproc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AdapterConfig::load(&args.config).unwrap_or_else(|_| {
        tracing::warn!("Config not found, using defaults");
        AdapterConfig::default()
    });
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    // TODO: link a real rule engine behind the RuleEngine trait; until
    // then every exchange passes.
    let engine: Arc<dyn RuleEngine> = Arc::new(PassthroughEngine);
    tracing::warn!("no rule engine configured, running in passthrough mode");

    let registry = Arc::new(TransactionRegistry::new(Duration::from_secs(
        config.transaction_ttl_secs,
    )));

    let addr = config.listen_addr.parse()?;
    tracing::info!("gRPC server listening on {}", addr);

    tonic::transport::Server::builder()
        .add_service(ExternalProcessorServer::new(ExtProcService::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
        )))
        .add_service(AuthorizationServer::new(AuthzService::new(
            engine, registry,
        )))
        .serve(addr)
        .await?;

    Ok(())
}
