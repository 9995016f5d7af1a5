use clap::Parser;
use log::{error, info};
use mtcp_capture::configuration::config::{CliArgs, Config};
use mtcp_capture::controller::controller_handler::Controller;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .init();

    let args = CliArgs::parse();

    info!("Importing configuration");
    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration imported successfully");

    let controller = Controller::new(config);

    let result = tokio::spawn(async move {
        info!("Spawning the controller");
        controller.run().await
    })
    .await;

    match result {
        Ok(Ok(reports)) => {
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            info!(
                "{} capture(s) finished, {} failed",
                reports.len() - failed,
                failed
            );
        }
        Ok(Err(e)) => {
            error!("Error occured in the controller process: {}, exiting...", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Error joining at the end of execution: {:?}", e);
            std::process::exit(1);
        }
    }
}
