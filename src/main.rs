use lantern::config::Config;
use lantern::server::listener::{serve, ServeOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let cfg = Config::load();

    let options = ServeOptions::default()
        .with_address(cfg.listen_addr)
        .with_port(cfg.listen_port);
    let server = serve(options, |req| format!("hello from {}\n", req.path)).await?;

    tokio::select! {
        res = server.join() => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
