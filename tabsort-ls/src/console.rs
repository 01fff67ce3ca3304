//! Shutdown sources: operator console and OS signals
//!
//! The console reader runs on its own OS thread because stdin reads block.
//! It only forwards the shutdown request; it touches no service state.

use std::io::BufRead;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why the service is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Operator typed `q`
    Quit,
    /// stdin reached end of file
    Eof,
}

/// Whether a console line asks to quit
pub fn is_quit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("q")
}

/// Read lines from `input` until a quit command or EOF, then send the request
pub fn read_console<R: BufRead>(input: R, tx: mpsc::UnboundedSender<ShutdownRequest>) {
    for line in input.lines() {
        match line {
            Ok(line) if is_quit_command(&line) => {
                let _ = tx.send(ShutdownRequest::Quit);
                return;
            }
            Ok(line) => {
                if !line.trim().is_empty() {
                    debug!("Ignoring console input {:?} (type 'q' to quit)", line.trim());
                }
            }
            Err(e) => {
                warn!("Console read failed: {}", e);
                break;
            }
        }
    }
    let _ = tx.send(ShutdownRequest::Eof);
}

/// Start the stdin reader thread
pub fn spawn_console_reader() -> std::io::Result<mpsc::UnboundedReceiver<ShutdownRequest>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::Builder::new()
        .name("tabsort-console".to_string())
        .spawn(move || read_console(std::io::stdin().lock(), tx))?;
    info!("Press 'q' then Enter to stop the server");
    Ok(rx)
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
