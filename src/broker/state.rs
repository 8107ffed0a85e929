//! Link status shared between the link's background tasks and every caller
//! that needs a connection.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::utils::{MqError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Initializing,
    Ready,
    InitFailed,
    Reconnecting,
    /// Shut down; no further connections are handed out.
    Stopped,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Initializing => "initializing",
            LinkState::Ready => "ready",
            LinkState::InitFailed => "init-failed",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Stopped => "stopped",
        })
    }
}

/// Written only by the broker link; read by anyone.
#[derive(Debug)]
pub struct LinkStatus {
    tx: watch::Sender<LinkState>,
}

impl LinkStatus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LinkState::Initializing);
        Self { tx }
    }

    pub fn get(&self) -> LinkState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: LinkState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            info!("broker link {previous} -> {state}");
        }
    }

    /// Atomically move `from -> to`. Returns `false` if the link was not in
    /// `from`, leaving it untouched.
    pub fn transition(&self, from: LinkState, to: LinkState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            info!("broker link {from} -> {to}");
        }
        moved
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }

    /// Wait up to `window` for the link to become ready.
    ///
    /// Fails immediately with `NotInitialized` once initialization has
    /// failed, and with `LinkUnavailable` when stopped or still not ready
    /// after the window.
    pub async fn wait_ready(&self, window: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let settled = tokio::time::timeout(
            window,
            rx.wait_for(|s| {
                matches!(
                    s,
                    LinkState::Ready | LinkState::InitFailed | LinkState::Stopped
                )
            }),
        )
        .await;

        match settled {
            Ok(Ok(state)) => match *state {
                LinkState::Ready => Ok(()),
                LinkState::InitFailed => Err(MqError::NotInitialized),
                other => Err(MqError::LinkUnavailable(format!("link is {other}"))),
            },
            Ok(Err(_)) => Err(MqError::LinkUnavailable("link dropped".into())),
            Err(_) => Err(MqError::LinkUnavailable(format!(
                "not ready after {window:?}, link is {}",
                self.get()
            ))),
        }
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}
