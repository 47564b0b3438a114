use anyhow::Result;
use clap::{Arg, Command};
use courier::common::{common_args, parse_app_mode, start_application, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("courier")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Task distribution and job scheduling over RabbitMQ")
        .args(common_args())
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Components to run")
                .value_parser(["worker", "scheduler", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker identity, overrides the configuration"),
        )
        .get_matches();

    let mode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");
    let app_mode = parse_app_mode(mode)?;

    start_application(StartupConfig::from_matches(&matches), app_mode, "courier").await
}
