//! Supervisor-level OS signal routing.

use std::sync::Arc;

use crate::state::SupervisorState;

/// Route SIGINT/SIGTERM to the interrupt flag and SIGHUP to the reload flag.
///
/// Runs on a dedicated thread for the life of the process.
pub(crate) fn install_main_signals(state: Arc<SupervisorState>) {
    let _ = std::thread::Builder::new()
        .name("gantry-signals".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(error = %e, "cannot start signal runtime");
                    return;
                }
            };
            runtime.block_on(route_signals(state));
        });
}

#[cfg(unix)]
async fn route_signals(state: Arc<SupervisorState>) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut interrupt, mut terminate, mut hangup) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(i), Ok(t), Ok(h)) => (i, t, h),
        _ => {
            tracing::error!("cannot install supervisor signal handlers");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => state.flag(&state.interrupt_signal),
            _ = terminate.recv() => state.flag(&state.interrupt_signal),
            _ = hangup.recv() => state.flag(&state.reload_signal),
        }
    }
}

#[cfg(not(unix))]
async fn route_signals(state: Arc<SupervisorState>) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        state.flag(&state.interrupt_signal);
    }
}
