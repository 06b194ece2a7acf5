use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use talkstream::{init_tracing, load_worker_config, CancelFlag, Worker};

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing("info") {
        eprintln!("Failed to initialize tracing: {}", e);
    }
    info!("Starting talkstream worker v{}", env!("CARGO_PKG_VERSION"));

    let config_arg = std::env::args().nth(1);
    let config = match load_worker_config(config_arg.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let worker = match Worker::from_config(config) {
        Ok(worker) => worker,
        Err(e) => {
            error!("Failed to build worker: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = worker.start().await {
        // Warmup is retried by the first job's Warmup stage.
        warn!("Engine warmup at start failed: {}", e);
    }

    // Ctrl-C cancels the job in flight and stops reading new ones.
    let current = Arc::new(Mutex::new(CancelFlag::new()));
    let shutdown = Arc::new(Notify::new());
    {
        let current = Arc::clone(&current);
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            if let Ok(flag) = current.lock() {
                flag.cancel();
            }
            shutdown.notify_one();
        }) {
            warn!("Failed to install Ctrl-C handler: {}", e);
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.notified() => {
                info!("Shutdown requested");
                break;
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read job from stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                error!("Skipping malformed job line: {}", e);
                continue;
            }
        };

        let cancel = CancelFlag::new();
        if let Ok(mut slot) = current.lock() {
            *slot = cancel.clone();
        }

        let response = worker.handle(envelope, cancel).await;
        info!("Job finished with status {}", response.status_label());

        match serde_json::to_string(&response) {
            Ok(mut out) => {
                out.push('\n');
                if let Err(e) = stdout.write_all(out.as_bytes()).await {
                    error!("Failed to write result: {}", e);
                    break;
                }
                if let Err(e) = stdout.flush().await {
                    error!("Failed to flush result: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize result: {}", e),
        }
    }

    if let Err(e) = worker.shutdown().await {
        error!("Engine dispose failed: {}", e);
    }
}
