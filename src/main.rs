use rabbitmq_retry_worker::{RetryWorker, ShutdownCoordinator, WorkerConfig};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match WorkerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("The worker failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let reconnect_delay = config.consumers.reconnect_delay();
    let shutdown = ShutdownCoordinator::with_heartbeat(config.consumers.heartbeat());
    let worker = RetryWorker::new(config);

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.listen_for_signals().await {
            log::error!("Failed to install signal handlers: {}", e);
        }
    });

    let mut exit = ExitCode::SUCCESS;
    while !shutdown.is_triggered() {
        match worker.run(&shutdown).await {
            Ok(()) => break,
            Err(e) if e.is_fatal() => {
                log::error!("The worker failed to start: {}", e);
                exit = ExitCode::FAILURE;
                break;
            }
            Err(e) => {
                log::error!("Worker failed: {}. Reconnecting in {:?}...", e, reconnect_delay);
                let mut token = shutdown.token();
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    log::info!("Application has shut down.");
    exit
}
