use std::error::Error;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cmdline;
mod replay;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();

    match matches.subcommand() {
        Some(("replay", args)) => {
            let args = replay::ReplayArgs {
                input: args
                    .get_one::<String>("input")
                    .cloned()
                    .ok_or("--input is required")?,
                config: args.get_one::<String>("config").cloned(),
                format: args
                    .get_one::<String>("format")
                    .cloned()
                    .unwrap_or_else(|| "string".to_string()),
            };

            let cancel = CancellationToken::new();
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received interrupt, shutting down");
                    shutdown.cancel();
                }
            });

            let summary = replay::run(args, cancel)
                .await
                .map_err(|e| format!("Error running replay: {e:?}"))?;
            info!(
                seeded = summary.seeded,
                delivered = summary.delivered,
                "Replay finished"
            );
            info!(metrics = fanin_core::metrics::encode_text(), "Final counters");
        }
        other => {
            return Err(format!("Unknown subcommand {other:?}").into());
        }
    }

    Ok(())
}
