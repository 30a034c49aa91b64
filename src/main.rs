use anyhow::Result;
use log::{error, info};
use trap_telemetry::config::{self, Config};
use trap_telemetry::pipeline::supervisor::shutdown_signal;
use trap_telemetry::PipelineSupervisor;

fn init_logging(config: &Config) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.pipeline.log_level.as_str()),
    )
    .init();
}

async fn run_app(config: Config) -> Result<()> {
    info!("Starting trap telemetry pipeline");

    let supervisor = PipelineSupervisor::new(config);
    supervisor.run(shutdown_signal()).await?;

    info!("Trap telemetry pipeline stopped");
    Ok(())
}

fn main() {
    let config_path = config::config_path_from_env();
    let config = match config::load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(2);
        }
    };

    init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_app(config)) {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
