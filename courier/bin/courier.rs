#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::sync::Arc;

use courier::{
    notifications::Branding,
    settings::Settings,
    shutdown::{self, ShutdownCoordinator},
};
use courier_common::{internal, logging};
use courier_dispatch::{RedisBus, Runtime, SmtpConnector, Supervisor};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let settings = Settings::load()?;
    internal!(level = DEBUG, "Settings: {settings:?}");

    let bus = RedisBus::connect(&settings.redis_url)
        .await
        .map_err(|e| anyhow::anyhow!("Unable to reach Redis at {}: {e}", settings.redis_url))?;

    let branding = Arc::new(Branding::from_env());
    let mut supervisor = Supervisor::new(Runtime::new(Arc::new(bus), SmtpConnector));
    for group in &settings.workers {
        supervisor.add_worker(group.build(&branding));
    }

    let coordinator = ShutdownCoordinator::new(supervisor.token());
    let (sender, receiver) = mpsc::unbounded_channel();
    shutdown::forward_os_signals(sender)?;
    tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .watch(receiver, |code| std::process::exit(code))
                .await;
        }
    });

    supervisor.run()?;
    let reports = supervisor.wait().await;
    coordinator.finished();

    let failed = reports.iter().filter(|report| report.result.is_err()).count();
    if failed == reports.len() {
        anyhow::bail!("No email worker could be started");
    }

    internal!(level = INFO, "Shutting down...");
    Ok(())
}
