use std::fmt::Debug;
use std::fmt::Display;

use segflow::configuration::get_configuration;
use segflow::executor::init_flow_executor;
use segflow::startup::Application;
use segflow::telemetry::get_subscriber;
use segflow::telemetry::init_subscriber;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }

        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain=?e,
                error.message=%e,
                "{name} failed (inner)"
            )
        }

        Err(e) => {
            tracing::error!(
                error.cause_chain=?e,
                error.message=%e,
                "{name} failed (outer)"
            )
        }
    }
}

/// Initialise telemetry, load config, and start the server plus the flow
/// executor worker side by side. Whichever exits first takes the process
/// down with it; a marketing engine whose scheduler has died should not
/// keep accepting writes.
#[tokio::main] // requires tokio features: macros, rt-multi-thread
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("segflow", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;

    let server = Application::build(cfg.clone()).await?.run_until_stopped();
    let flow_executor = init_flow_executor(cfg);

    let server_thread = tokio::spawn(server);
    let flow_executor_thread = tokio::spawn(flow_executor);

    tokio::select! {
        o = server_thread => { report_exit("API", o) },
        o = flow_executor_thread => { report_exit("Flow executor", o) },
    }

    Ok(())
}
