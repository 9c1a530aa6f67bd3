//! Cooperative stop signal shared by reflectors, informers and factories.

use tokio::sync::watch;

/// Owner side: fires the signal. Dropping the handle also counts as a stop.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Observer side, cheap to clone.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) { self.tx.send_replace(true); }

    pub fn signal(&self) -> StopSignal { StopSignal { rx: self.tx.subscribe() } }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal fired or the handle was dropped.
    pub async fn stopped(&self) { self.clone().into_stopped().await }

    /// Owned variant, usable as a `'static` future (e.g. with `take_until`).
    pub async fn into_stopped(mut self) {
        loop {
            if *self.rx.borrow_and_update() { return; }
            if self.rx.changed().await.is_err() { return; }
        }
    }
}
