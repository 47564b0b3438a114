use anyhow::Result;
use clap::Arg;
use courier::app::AppMode;
use courier::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let custom_args = vec![Arg::new("worker-id")
        .short('w')
        .long("worker-id")
        .value_name("ID")
        .help("Worker identity, overrides the configuration")];

    run_cli(
        "courier-worker",
        "Courier worker: consumes tasks for one identity and its session",
        custom_args,
        AppMode::Worker,
        "worker",
    )
    .await
}
