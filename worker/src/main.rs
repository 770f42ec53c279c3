use clap::Parser;
use container_worker::WorkerOptions;
use task_config::LaunchSettings;

#[tokio::main]
async fn main() {
    let options = WorkerOptions::parse();

    // Settings are parsed again by the worker; here only the debug flag matters.
    let debug = LaunchSettings::from_json(&options.settings)
        .map(|settings| settings.debug)
        .unwrap_or(false);
    container_worker::init_logging(options.log_json, debug);

    let code = container_worker::run(options).await;
    std::process::exit(code);
}
