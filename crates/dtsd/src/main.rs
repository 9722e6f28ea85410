//! dtsd — dts worker daemon.
//!
//! Startup: logging → config → substrate (pool, timers) → registry →
//! executor → RPC server. Then park until SIGINT/SIGTERM and shut down in
//! reverse order. A bind failure exits non-zero.

use std::sync::Arc;

use anyhow::{Context, Result};

use dts_core::config::DtsConfig;
use dts_core::Resource;
use dts_rpc::{Server, ServerOptions};
use dts_runtime::{TimerService, WorkPool};

use dtsd::executor::TaskExecutor;
use dtsd::hub::ResultHub;
use dtsd::registry::{register_builtins, FunctionRegistry};
use dtsd::DispatchService;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DtsConfig::load().context("failed to load configuration")?;
    tracing::info!(
        port = config.server.port,
        workers = config.worker_threads(),
        queues = config.queue_count(),
        "dtsd starting"
    );

    let pool = Arc::new(WorkPool::new(
        config.worker_threads(),
        config.executor.queue_capacity,
    ));
    let timers = Arc::new(TimerService::new());
    let hub = Arc::new(ResultHub::new());

    let mut registry = FunctionRegistry::new();
    register_builtins(&mut registry);

    let mut executor = TaskExecutor::new(
        pool,
        timers.clone(),
        registry,
        Resource {
            cpu_core: config.executor.resources.cpu_core,
            mem_mb: config.executor.resources.mem_mb,
        },
    );
    {
        let hub = hub.clone();
        executor.set_terminal_sink(Arc::new(move |task| hub.publish(&task)));
    }
    let executor = Arc::new(executor);

    let service = Arc::new(DispatchService::new(executor.clone(), hub.clone()));
    let mut server = Server::start(ServerOptions::from_config(&config), service)
        .context("failed to start rpc server")?;
    tracing::info!(port = server.local_addr().port(), "dtsd listening");

    wait_for_shutdown_signal().context("signal handling failed")?;
    tracing::info!("shutdown signal received");

    // Reverse order: stop streams, then the front door, then execution.
    hub.close_all();
    server.shutdown();
    executor.shutdown();

    tracing::info!("dtsd exited cleanly");
    Ok(())
}

/// Park until SIGINT or SIGTERM.
fn wait_for_shutdown_signal() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    })
}
