/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Shutdown is broadcast to every controller, queue and server through a
//! watch channel. Receivers stop once the value is sent, whatever it is.

/// Receiver for a shutdown event.
pub type ShutdownRx = tokio::sync::watch::Receiver<ShutdownKind>;
pub type ShutdownTx = tokio::sync::watch::Sender<ShutdownKind>;

#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum ShutdownKind {
    /// Stop gracefully, letting in flight work finish.
    #[default]
    Normal,
    /// Sent by tests, which do not wait on anything outside the process.
    Testing,
}

pub fn channel(kind: ShutdownKind) -> (ShutdownTx, ShutdownRx) {
    tokio::sync::watch::channel(kind)
}

/// Sends [`ShutdownKind::Normal`] on the returned channel once the process
/// receives SIGINT or SIGTERM.
pub fn spawn_handler() -> crate::Result<(ShutdownTx, ShutdownRx)> {
    let (tx, rx) = channel(ShutdownKind::default());
    crate::metrics::shutdown_initiated().set(0);

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let sender = tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let sig_term = terminate.recv();
        #[cfg(not(unix))]
        let sig_term = std::future::pending::<()>();

        let signal = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sig_term => "SIGTERM",
        };

        crate::metrics::shutdown_initiated().set(1);
        tracing::info!(%signal, "shutting down from signal");
        // Every receiver may already be gone.
        sender.send(ShutdownKind::Normal).ok();
    });

    Ok((tx, rx))
}
