mod cli;
mod config;
mod device;
mod events;
mod hub;
mod smoke;
mod types;
mod util;

use anyhow::{Context, Result};
use config::Settings;
use smoke::Smoke;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse()?)
                    .add_directive("rumqttc=warn".parse()?)
                    .add_directive("hyper=error".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let args = cli::parse();
    let settings = Settings::resolve(args)?;
    info!("configuration loaded successfully");
    debug!("{:#?}", settings);

    let mut smoke = Smoke::new(settings)?;
    let outcome = run(&mut smoke).await;

    if outcome.is_err() {
        // leave the identity in place so a failed run can be inspected
        smoke.keep_device_identity();
    }
    if let Err(e) = smoke.maybe_delete_device_identity().await {
        warn!("teardown failed: {e:#}");
    }

    outcome
}

async fn run(smoke: &mut Smoke) -> Result<()> {
    smoke
        .get_or_create_device_identity()
        .await
        .context("device registration failed")?;

    smoke
        .start_event_listener()
        .await
        .context("event stream subscription failed")?;

    smoke
        .connect_and_send()
        .await
        .context("connecting through the gateway failed")?;

    smoke
        .verify_telemetry()
        .await
        .context("telemetry verification failed")?;

    smoke
        .verify_direct_method()
        .await
        .context("direct method verification failed")?;

    info!("smoke test passed");
    Ok(())
}
