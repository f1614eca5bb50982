use std::future::Future;
use std::io;
use std::sync::mpsc::Sender;
use std::thread;

use log::{info, warn};
use solarflow2mqtt::dispatcher::Event;

/// Forwards SIGINT and SIGTERM into the event loop as [`Event::Shutdown`].
pub fn spawn_shutdown_listener(inbox: Sender<Event>) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("cannot install signal handlers: {e}");
                return;
            }
        };
        runtime.block_on(forward_signal(wait_for_signal(), &inbox));
    });
}

/// Sends [`Event::Shutdown`] once `signal` resolves. Failing to listen keeps the bridge
/// running; it can still be stopped the hard way.
async fn forward_signal<F>(signal: F, inbox: &Sender<Event>)
where
    F: Future<Output = io::Result<&'static str>>,
{
    match signal.await {
        Ok(name) => {
            info!("received {name}");
            // the receiver is gone when the loop already stopped
            let _ = inbox.send(Event::Shutdown);
        }
        Err(e) => warn!("not listening for shutdown signals: {e}"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            return tokio::signal::ctrl_c().await.map(|()| "SIGINT");
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        Some(()) = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}
