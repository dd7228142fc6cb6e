//! Newline-delimited JSON transport over stdin/stdout.
//!
//! Each stdin line is one `ClientMessage`; each reply is one `VadEvent` line on
//! stdout. Lines are handled in arrival order so chunks for a session are never
//! reordered. Logging goes to stderr.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use vadhub_core::{ClientMessage, VadEvent, VadService};

/// Serve until stdin closes.
pub async fn serve(service: Arc<VadService>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut handled: u64 = 0;

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let svc = Arc::clone(&service);
        // Neural inference may block; keep it off the async workers.
        let reply = tokio::task::spawn_blocking(move || dispatch(&svc, &line))
            .await
            .context("message handler task")?;
        handled += 1;

        if let Some(event) = reply {
            debug!(event = event.name(), "reply");
            let mut out = serde_json::to_vec(&event).context("encoding event")?;
            out.push(b'\n');
            stdout.write_all(&out).await.context("writing stdout")?;
            stdout.flush().await.context("flushing stdout")?;
        }
    }

    info!(handled, "stdin closed");
    Ok(())
}

fn dispatch(service: &VadService, line: &str) -> Option<VadEvent> {
    match ClientMessage::parse(line) {
        Ok(message) => service.handle(message),
        Err(e) => Some(VadEvent::from(e)),
    }
}
