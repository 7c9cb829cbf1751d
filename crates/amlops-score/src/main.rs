use anyhow::Context;
use clap::Parser;

use amlops_common::telemetry::init_tracing;
use amlops_score::args::Args;
use amlops_score::{router, AppState, BuiltinPredictors, ScoringService, StartupInputs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel = init_tracing(
        "amlops-score",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let inputs = StartupInputs::from_env(args.scratch_root.clone());
    let service = match ScoringService::init(inputs, &BuiltinPredictors).await {
        Ok(service) => service,
        Err(e) => {
            eprintln!("{e}");
            if let Some(provider) = otel {
                let _ = provider.shutdown();
            }
            std::process::exit(1);
        }
    };

    let app = router(AppState::new(service), args.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    tracing::info!(addr = %args.listen_addr, "scoring server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("server error")?;

    if let Some(provider) = otel {
        let _ = provider.shutdown();
    }
    Ok(())
}
