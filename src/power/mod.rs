use crate::channel;
use crate::error::StationError;
use crate::model::{ChangeSource, ConnectionTarget, PowerChange, PowerState, SessionState};
use crate::protocol::Command;
use crate::stream::{self, StreamOptions};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Owns the track power state of one command station.
///
/// Local commands update the state optimistically; reports from the status
/// stream always win over whatever was assumed before.
pub struct PowerController {
    target: ConnectionTarget,
    options: StreamOptions,
    state: Mutex<PowerState>,
    changes: broadcast::Sender<PowerChange>,
    session: Mutex<watch::Receiver<SessionState>>,
    reader: Mutex<Option<ReaderTask>>,
}

struct ReaderTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PowerController {
    pub fn new(target: ConnectionTarget, options: StreamOptions) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (_, session) = watch::channel(SessionState::Idle);
        Self {
            target,
            options,
            state: Mutex::new(PowerState::default()),
            changes,
            session: Mutex::new(session),
            reader: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn state(&self) -> PowerState {
        *self.power()
    }

    pub fn session_state(&self) -> SessionState {
        *self.session_receiver().borrow()
    }

    /// Receiver for session state of the current (or last) activation.
    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session_receiver().clone()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.changes.subscribe(),
        }
    }

    /// Starts the status stream reader on the current tokio runtime.
    ///
    /// The reader only holds a weak reference, so dropping the last handle
    /// still shuts it down.
    pub fn activate(self: &Arc<Self>) {
        let mut slot = self.reader_slot();
        if slot.is_some() {
            tracing::debug!(station = %self.target, "controller already active");
            return;
        }

        let (status_tx, status_rx) = watch::channel(SessionState::Idle);
        let (shutdown, shutdown_rx) = watch::channel(false);
        *self.session_receiver() = status_rx;

        let controller = Arc::downgrade(self);
        let handle = tokio::spawn(stream::run(
            self.target.clone(),
            self.options.clone(),
            move |state| {
                if let Some(controller) = controller.upgrade() {
                    controller.on_stream_event(state);
                }
            },
            status_tx,
            shutdown_rx,
        ));
        tracing::info!(station = %self.target, "track power controller activated");
        *slot = Some(ReaderTask { shutdown, handle });
    }

    /// Cancels the stream reader and waits until it has closed its connection.
    pub async fn deactivate(&self) {
        let task = self.reader_slot().take();
        let Some(task) = task else {
            return;
        };
        let _ = task.shutdown.send(true);
        if let Err(err) = task.handle.await {
            tracing::warn!(station = %self.target, error = %err, "reader task failed");
        }
        tracing::info!(station = %self.target, "track power controller deactivated");
    }

    pub async fn turn_on(&self) -> Result<(), StationError> {
        self.set_power(PowerState::On).await
    }

    pub async fn turn_off(&self) -> Result<(), StationError> {
        self.set_power(PowerState::Off).await
    }

    /// Applies a state reported by the station. Returns whether it changed.
    pub fn on_stream_event(&self, state: PowerState) -> bool {
        self.apply(state, ChangeSource::Stream)
    }

    // The optimistic update happens even when the send fails; the error is
    // still handed back so callers can report it.
    async fn set_power(&self, state: PowerState) -> Result<(), StationError> {
        let res = channel::send(
            &self.target,
            Command::for_state(state),
            self.options.connect_timeout,
        )
        .await;
        if let Err(err) = &res {
            tracing::warn!(station = %self.target, error = %err, "error while sending command");
        }
        self.apply(state, ChangeSource::Command);
        res
    }

    /// Sets the state and notifies. Command updates always notify, stream
    /// updates only when the value actually changes.
    fn apply(&self, next: PowerState, source: ChangeSource) -> bool {
        let mut state = self.power();
        if source == ChangeSource::Stream && *state == next {
            return false;
        }
        *state = next;
        let _ = self.changes.send(PowerChange {
            target: self.target.clone(),
            state: next,
            source,
        });
        true
    }

    fn power(&self) -> MutexGuard<'_, PowerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reader_slot(&self) -> MutexGuard<'_, Option<ReaderTask>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_receiver(&self) -> MutexGuard<'_, watch::Receiver<SessionState>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PowerController {
    fn drop(&mut self) {
        if let Some(task) = self.reader_slot().take() {
            let _ = task.shutdown.send(true);
        }
    }
}

/// Listener for power changes. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<PowerChange>,
}

impl Subscription {
    /// Next change, or `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<PowerChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "power change listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}
