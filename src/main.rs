use std::sync::Arc;

use pulse_rpc::{
    backend::{process::run_worker, Arbiter, ProcessBackend, ThreadBackend},
    config::{Config, ControlChannel},
    domain::calculator_tree,
    logging,
    rpc::Dispatcher,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let dispatcher =
        Arc::new(Dispatcher::new(calculator_tree()?).with_path(config.mount_path.clone()));

    if config.control == ControlChannel::Stdio {
        run_worker(&config, dispatcher).await?;
        return Ok(());
    }

    let arbiter = Arbiter::empty()
        .with_backend(Arc::new(
            ThreadBackend::new(config.workers).with_shutdown_timeout(config.shutdown_timeout),
        ))
        .with_backend(Arc::new(
            ProcessBackend::current_exe()?
                .with_workers(config.workers)
                .with_startup_timeout(config.startup_timeout)
                .with_shutdown_timeout(config.shutdown_timeout),
        ));

    let instance = arbiter
        .spawn(
            config.bind_socket()?,
            &config.server_name,
            config.concurrency,
            dispatcher,
        )
        .await?;

    info!(
        mid = %instance.mid(),
        uri = %instance.uri(),
        concurrency = %config.concurrency,
        "server started"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    arbiter.shutdown().await?;
    Ok(())
}
