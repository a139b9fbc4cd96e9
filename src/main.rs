use anyhow::Context;
use pml::config::PmlConfig;
use pml::runtime::PmlRuntime;
use pml::server::PmlServer;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() == 2 && (args[1] == "--version" || args[1] == "-V") {
        println!("pml {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::from(0);
    }

    match run().await {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(PmlConfig::load().context("failed to load configuration")?);

    #[cfg(feature = "embeddings")]
    let backend: Arc<dyn pml::embedding::EmbeddingBackend> = Arc::new(
        pml::embedding::FastembedBackend::new(config.settings.model_cache.as_deref())
            .context("failed to initialize the embedding backend")?,
    );
    #[cfg(not(feature = "embeddings"))]
    let backend: Arc<dyn pml::embedding::EmbeddingBackend> = {
        anyhow::bail!("built without the 'embeddings' feature; no embedding backend available");
    };

    let runtime = PmlRuntime::bootstrap(config, backend)
        .await
        .context("failed to bootstrap the PML runtime")?;

    let server = PmlServer::new(runtime.clone());
    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupt received, shutting down");
            Ok(())
        }
    };
    runtime.shutdown();
    result
}
