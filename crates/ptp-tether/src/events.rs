//! Background event monitor.
//!
//! Polls the transport's event channel on its own tokio task, decodes Event
//! containers and dispatches them: ObjectAdded to the registered new-object
//! hook, everything to the broadcast channel. The monitor owns the event
//! channel outright and never touches the transaction lock.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::PtpError;
use crate::ptp::codes::{self, EventCode};
use crate::ptp::container::{Container, ContainerType};
use crate::transport::EventTransport;
use crate::types::PtpEvent;

/// Callback invoked with the handle of each newly added object.
pub type NewObjectHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Single-slot holder for the new-object hook. Registering replaces the previous one.
#[derive(Clone, Default)]
pub struct NewObjectListener {
    slot: Arc<Mutex<Option<NewObjectHook>>>,
}

impl NewObjectListener {
    /// Installs `hook`. Returns true if it replaced an earlier one.
    pub fn set(&self, hook: NewObjectHook) -> bool {
        match self.slot.lock() {
            Ok(mut slot) => slot.replace(hook).is_some(),
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    fn current(&self) -> Option<NewObjectHook> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }

    fn notify(&self, handle: u32) {
        // Clone out of the slot so the hook runs without holding the lock.
        if let Some(hook) = self.current() {
            hook(handle);
        }
    }
}

/// Decodes an Event container. Returns `None` for any other container type.
pub fn decode_event(container: &Container) -> Option<PtpEvent> {
    if container.kind != ContainerType::Event {
        return None;
    }
    let first = container.param(0).unwrap_or(0);
    let event = match EventCode::from_u16(container.code) {
        Some(EventCode::ObjectAdded) => PtpEvent::ObjectAdded { handle: first },
        Some(EventCode::CaptureComplete) => PtpEvent::CaptureComplete,
        Some(EventCode::DevicePropChanged) => PtpEvent::DevicePropChanged { property: first as u16 },
        Some(EventCode::StoreAdded) => PtpEvent::StoreAdded { storage_id: first },
        Some(EventCode::StoreRemoved) => PtpEvent::StoreRemoved { storage_id: first },
        Some(EventCode::StorageInfoChanged) => PtpEvent::StorageInfoChanged { storage_id: first },
        _ => PtpEvent::Other {
            code: container.code,
            params: container.params.clone(),
        },
    };
    Some(event)
}

/// Handle to the running monitor task.
pub struct EventMonitor {
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EventMonitor {
    /// Spawns the polling loop. `poll_interval` is the per-read wait on the event channel.
    pub fn start(
        source: Box<dyn EventTransport>,
        poll_interval: Duration,
        listener: NewObjectListener,
        events: broadcast::Sender<PtpEvent>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_event_loop(source, poll_interval, listener, events, shutdown_rx));
        info!("PTP event monitor started (poll every {:?})", poll_interval);
        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("PTP event monitor task ended abnormally: {}", e);
        }
        debug!("PTP event monitor stopped");
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn run_event_loop(
    mut source: Box<dyn EventTransport>,
    poll_interval: Duration,
    listener: NewObjectListener,
    events: broadcast::Sender<PtpEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let polled = tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("PTP event loop: shutdown signal received");
                break;
            }

            polled = source.next_event(poll_interval) => polled,
        };

        match polled {
            Ok(Some(container)) => dispatch(&container, &listener, &events),
            // Nothing this round
            Ok(None) | Err(PtpError::Timeout { .. }) => {}
            Err(PtpError::MalformedContainer { reason }) => {
                warn!("PTP event loop: skipping malformed event ({})", reason);
            }
            Err(e) => {
                warn!("PTP event loop: stopping on transport error: {}", e);
                break;
            }
        }
    }

    source.close().await;
    debug!("PTP event loop exited");
}

fn dispatch(container: &Container, listener: &NewObjectListener, events: &broadcast::Sender<PtpEvent>) {
    let Some(event) = decode_event(container) else {
        debug!("PTP event loop: ignoring non-event container {:?}", container.kind);
        return;
    };
    debug!(
        "PTP event {} params={:08x?}",
        codes::event_name(container.code),
        container.params
    );

    if let PtpEvent::ObjectAdded { handle } = event {
        listener.notify(handle);
    }
    // No subscribers is fine.
    let _ = events.send(event);
}
