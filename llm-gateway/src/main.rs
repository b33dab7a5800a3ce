#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context as _;

fn main() -> anyhow::Result<()> {
    run().inspect_err(|error| {
        eprintln!("fatal: {error:?}");
    })
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let _executable = args.next().context("executable name is missing from the environment")?;

    match args.next().as_deref() {
        Some("--help" | "-h") => {
            println!("llm-gateway: session, routing, and policy control plane\n\nUSAGE:\n    llm-gateway\n    llm-gateway --help");
            return Ok(());
        }
        Some(other) => anyhow::bail!("unrecognized argument: {other}"),
        None => {}
    }

    let conf = llm_gateway::config::Conf::load().context("failed to load configuration")?;

    let _logger_guard = gateway_log::init(&conf.log_dir, conf.log_directive.as_deref()).context("failed to setup logger")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting llm-gateway");

    if let Some(endpoint) = &conf.otel_endpoint {
        info!(%endpoint, "OpenTelemetry endpoint configured (exporter wiring out of scope)");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    let service = runtime.block_on(service::GatewayService::start(conf))?;

    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    runtime.block_on(service.stop());
    runtime.shutdown_timeout(std::time::Duration::from_secs(3));

    Ok(())
}
