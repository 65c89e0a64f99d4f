//! Process entry point: logging to stderr, the single stdin reader, the
//! single stdout writer, and the fatal-error policy.

use std::process;
use std::time::Duration;

use tokio::io::{stdin, stdout, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use libp2p_helper::rpc::{writer, Response};
use libp2p_helper::{App, OutboundQueue};

#[tokio::main]
async fn main() {
    // stdout belongs to the RPC channel; logs go to stderr as JSON.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // A panic anywhere is a protocol-level failure: log it and exit nonzero
    // so the host restarts us.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "panic while handling RPC");
        default_hook(info);
        process::exit(1);
    }));

    info!("libp2p helper starting");

    let (out, out_rx) = OutboundQueue::new();
    tokio::spawn(async move {
        if let Err(e) = writer::run(out_rx, stdout()).await {
            error!(error = %e, "stdout write failed");
            process::exit(1);
        }
    });

    let app = App::new(out.clone());

    // Lines grow as needed; a 16 MiB payload base64-inflates to ~22 MB and
    // must still fit in one line.
    let mut lines = BufReader::new(stdin()).lines();
    let stop_reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(size = line.len(), "message received");
                if let Err(violation) = App::handle_line(&app, &line).await {
                    error!(error = %violation, "protocol violation on the command pipe");
                    process::exit(1);
                }
            }
            Ok(None) => break "EOF".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    // The host is expected to kill the helper, never to close stdin.
    out.send(Response::Error {
        seqno: 0,
        error: format!("helper stdin scanning stopped because {stop_reason}"),
    })
    .await;
    // Give the writer a moment to drain before exiting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    process::exit(1);
}
