use sunwire::config::AppConfig;
use sunwire::export::JsonLogExporter;
use sunwire::poller::Poller;
use sunwire::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let cfg = AppConfig::load()?;
    let mut poller = Poller::new(cfg, Box::new(JsonLogExporter));

    if let Err(err) = poller.run().await {
        tracing::error!(%err, "exiting with error");
        std::process::exit(err.exit_code());
    }
    Ok(())
}
