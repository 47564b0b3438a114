use anyhow::Result;
use courier::app::AppMode;
use courier::common::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli(
        "courier-scheduler",
        "Courier scheduler: fires registered jobs and runs scheduler-only tasks",
        Vec::new(),
        AppMode::Scheduler,
        "scheduler",
    )
    .await
}
