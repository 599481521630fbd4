use anyhow::Result;
use ffrk_proxy::config::Settings;
use ffrk_proxy::Application;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.logging.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }

    let app = Application::new(settings).await?;
    app.run().await?;

    Ok(())
}
