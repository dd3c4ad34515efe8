use renderq_engine::Orchestrator;

/// Block until the first Ctrl-C, then request a graceful stop. A second
/// Ctrl-C exits the process immediately.
pub async fn wait_for_interrupt(orchestrator: &Orchestrator) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!(
        "stop requested; finishing in-flight tasks (press Ctrl-C again to exit immediately)"
    );
    orchestrator.request_stop();

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("stop requested again; exiting immediately");
            std::process::exit(130);
        }
    });
}
