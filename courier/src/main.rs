use clap::Parser;
use courier::config::{Args, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    courier::telemetry::init_telemetry()?;

    if args.validate {
        println!("Configuration OK");
        return Ok(());
    }

    let app = courier::Application::new(config).await?;

    app.serve(async {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
    })
    .await?;

    Ok(())
}
