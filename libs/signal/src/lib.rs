//! References: https://stackoverflow.com/questions/77585473/rust-tokio-how-to-handle-more-signals-than-just-sigint-i-e-sigquit

use std::fmt;

/// The signal that ended [`wait_for_stop_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Interrupt,
    CtrlC,
    CtrlBreak,
    CtrlClose,
    CtrlShutdown,
}

impl StopSignal {
    pub fn name(&self) -> &'static str {
        match self {
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Interrupt => "SIGINT",
            StopSignal::CtrlC => "CTRL_C",
            StopSignal::CtrlBreak => "CTRL_BREAK",
            StopSignal::CtrlClose => "CTRL_CLOSE",
            StopSignal::CtrlShutdown => "CTRL_SHUTDOWN",
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Waits for a signal that requests a graceful shutdown, like SIGTERM or SIGINT.
#[cfg(unix)]
async fn wait_for_signal_impl() -> std::io::Result<StopSignal> {
    use tokio::signal::unix::{signal, SignalKind};

    // Infos here:
    // https://www.gnu.org/software/libc/manual/html_node/Termination-Signals.html
    let mut signal_terminate = signal(SignalKind::terminate())?;
    let mut signal_interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = signal_terminate.recv() => StopSignal::Terminate,
        _ = signal_interrupt.recv() => StopSignal::Interrupt,
    })
}

/// Waits for a signal that requests a graceful shutdown, Ctrl-C (SIGINT).
#[cfg(windows)]
async fn wait_for_signal_impl() -> std::io::Result<StopSignal> {
    use tokio::signal::windows;

    // Infos here:
    // https://learn.microsoft.com/en-us/windows/console/handlerroutine
    let mut signal_c = windows::ctrl_c()?;
    let mut signal_break = windows::ctrl_break()?;
    let mut signal_close = windows::ctrl_close()?;
    let mut signal_shutdown = windows::ctrl_shutdown()?;

    Ok(tokio::select! {
        _ = signal_c.recv() => StopSignal::CtrlC,
        _ = signal_break.recv() => StopSignal::CtrlBreak,
        _ = signal_close.recv() => StopSignal::CtrlClose,
        _ = signal_shutdown.recv() => StopSignal::CtrlShutdown,
    })
}

/// Registers signal handlers and waits for a signal that
/// indicates a shutdown request.
///
/// If the platform handlers cannot be installed this falls back to
/// `tokio::signal::ctrl_c`, so the caller always gets a chance to
/// shut down cleanly.
pub async fn wait_for_stop_signal() -> StopSignal {
    match wait_for_signal_impl().await {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!("failed to install signal handlers: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            StopSignal::CtrlC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(StopSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(StopSignal::Interrupt.name(), "SIGINT");
        assert_eq!(StopSignal::CtrlShutdown.name(), "CTRL_SHUTDOWN");
    }
}
