use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::model::WatchedAttachmentItem;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Messages driving the queue's event loop.
pub enum ControlMsg {
    /// Complete current set of referenced attachments from the watcher.
    Emission(Vec<WatchedAttachmentItem>),
    /// Run a sync pass now.
    Trigger,
    Stop,
}

/// Forward watcher emissions onto the control channel. Exits when the host
/// drops its sender (the subscription is then over until the next start),
/// when the control channel closes, or when `stop` is raised.
pub fn spawn_forwarder(
    emissions: Receiver<Vec<WatchedAttachmentItem>>,
    control: Sender<ControlMsg>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match emissions.recv_timeout(POLL_INTERVAL) {
            Ok(items) => {
                if control.send(ControlMsg::Emission(items)).is_err() {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

/// Drain pending control messages, keeping only the newest emission
/// (latest-emission-wins). Returns the emission to reconcile and whether a
/// stop was seen while draining.
pub fn coalesce(
    latest: Vec<WatchedAttachmentItem>,
    control: &Receiver<ControlMsg>,
) -> (Vec<WatchedAttachmentItem>, bool) {
    let mut latest = latest;
    loop {
        match control.try_recv() {
            Ok(ControlMsg::Emission(items)) => latest = items,
            Ok(ControlMsg::Trigger) => {}
            Ok(ControlMsg::Stop) => return (latest, true),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                return (latest, false)
            }
        }
    }
}
