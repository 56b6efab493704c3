//! Encoder controller
//!
//! Spawns the encoder process, learns its bus name over the handshake pipe
//! and then drives it with Configure/Start/Pause/Stop while following its
//! state through `PropertiesChanged` signals.
//!
//! Every event source the controller listens to (child exit, handshake
//! pipe, the two bus subscriptions and the stop timer) is a [`Source`]
//! stored in the controller. A source keeps one strong reference to the
//! shared state for as long as it is attached, and its task only holds a
//! weak one, so the shared state cannot go away while a callback may still
//! fire, and it goes away as soon as `cleanup` dropped the last source and
//! the owner dropped its handles.
//!
//! Handlers run one at a time, each to completion, on whatever runtime the
//! controller was given. A handler whose source got detached while it was
//! waiting for its turn is skipped.

use futures::stream::{BoxStream, StreamExt};
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::bus::{
    BusConnector, EncoderBus, EncoderMethod, NameOwnerChanged, PropertiesChanged, PropertyValue,
    ENCODER_INTERFACE, STATE_PROPERTY,
};
use super::launcher::{self, LaunchedEncoder};
use super::state::{Decoded, EncoderState, StateCode, StateMachine};
use super::wire::configure_entries;
use crate::config::EncoderSettings;
use crate::error::{EncoderError, Result};
use crate::session::SessionContext;

/// Largest bus name accepted over the handshake pipe
const HANDSHAKE_BUF_LEN: usize = 1023;

/// Receives encoder state changes.
///
/// Closures of the form `Fn(&EncoderController, EncoderState)` implement
/// this. An observer must not hold on to a clone of the controller it is
/// registered with, use the reference it is handed instead.
pub trait EncoderObserver: Send + Sync {
    fn on_state_change(&self, encoder: &EncoderController, state: EncoderState);
}

impl<F> EncoderObserver for F
where
    F: Fn(&EncoderController, EncoderState) + Send + Sync,
{
    fn on_state_change(&self, encoder: &EncoderController, state: EncoderState) {
        self(encoder, state)
    }
}

/// How hard to ask the encoder to go away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

impl KillMode {
    fn signal(self) -> libc::c_int {
        match self {
            KillMode::Graceful => libc::SIGTERM,
            KillMode::Forceful => libc::SIGKILL,
        }
    }
}

/// An attached event source.
///
/// Holds one reference to the controller; dropping it detaches the task
/// and gives that reference back.
struct Source {
    task: JoinHandle<()>,
    attached: Arc<AtomicBool>,
    _retained: Arc<Shared>,
}

impl Source {
    fn new(task: JoinHandle<()>, attached: Arc<AtomicBool>, retained: Arc<Shared>) -> Self {
        Self {
            task,
            attached,
            _retained: retained,
        }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::Release);
        self.task.abort();
    }
}

struct ChildWatch {
    pid: i32,
    source: Source,
}

#[derive(Default)]
struct Inner {
    name: Option<String>,
    machine: StateMachine,
    observer: Option<Arc<dyn EncoderObserver>>,
    bus: Option<Arc<dyn EncoderBus>>,

    child: Option<ChildWatch>,
    term_timer: Option<Source>,
    pipe_watch: Option<Source>,
    properties_slot: Option<Source>,
    disappeared_slot: Option<Source>,
}

struct Shared {
    runtime: Handle,
    connector: Arc<dyn BusConnector>,
    settings: EncoderSettings,
    inner: Mutex<Inner>,
    /// Held for the whole of one event handler, observer included
    dispatch: Mutex<()>,
}

/// The bus side of a finished handshake
struct Connected {
    name: String,
    bus: Arc<dyn EncoderBus>,
    properties: BoxStream<'static, PropertiesChanged>,
    owner: BoxStream<'static, NameOwnerChanged>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        debug!("Encoder controller released");
    }
}

/// Handle to one encoder process.
///
/// Cloning retains the controller, dropping releases it.
#[derive(Clone)]
pub struct EncoderController {
    shared: Arc<Shared>,
}

impl EncoderController {
    /// Create an idle controller in the `Null` state
    pub fn create(
        runtime: Handle,
        connector: Arc<dyn BusConnector>,
        settings: EncoderSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                connector,
                settings,
                inner: Mutex::new(Inner::default()),
                dispatch: Mutex::new(()),
            }),
        }
    }

    /// Launch the encoder for `session` and start waiting for its bus name.
    ///
    /// Returning `Ok` only means the process is running; the handshake
    /// completes later and is reported as a transition to `Spawned`.
    /// Event handlers are spawned on `runtime` and never run concurrently,
    /// even on a multi-thread runtime.
    pub fn spawn(
        runtime: &Handle,
        connector: Arc<dyn BusConnector>,
        settings: EncoderSettings,
        session: &SessionContext,
    ) -> Result<Self> {
        let encoder = Self::create(runtime.clone(), connector, settings);

        let _guard = runtime.enter();
        let LaunchedEncoder {
            child,
            pid,
            handshake,
        } = launcher::launch(&encoder.shared.settings, session)?;

        encoder.watch_child(child, pid);
        encoder.watch_handshake(handshake);

        Ok(encoder)
    }

    /// Take another reference to this controller
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Number of live references, owners and attached sources alike
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Register the state observer, replacing any previous one
    pub fn set_handler(&self, observer: impl EncoderObserver + 'static) {
        self.lock().observer = Some(Arc::new(observer));
    }

    pub fn clear_handler(&self) {
        self.lock().observer = None;
    }

    pub fn state(&self) -> EncoderState {
        self.lock().machine.current()
    }

    /// Bus name reported by the encoder, once the handshake is done
    pub fn bus_name(&self) -> Option<String> {
        self.lock().name.clone()
    }

    /// Pid of the encoder while it is tracked
    pub fn child_pid(&self) -> Option<i32> {
        self.lock().child.as_ref().map(|c| c.pid)
    }

    pub fn has_child(&self) -> bool {
        self.lock().child.is_some()
    }

    /// Number of installed bus subscriptions (0 or 2)
    pub fn subscription_count(&self) -> usize {
        let inner = self.lock();
        usize::from(inner.properties_slot.is_some()) + usize::from(inner.disappeared_slot.is_some())
    }

    /// Send the session parameters to the encoder.
    ///
    /// A failure is returned to the caller; the encoder is left running.
    pub async fn configure(&self, session: &SessionContext) -> Result<()> {
        let (bus, name) = self.remote()?;
        let entries = configure_entries(session);
        debug!("Configuring encoder {} with {} entries", name, entries.len());

        bus.call(name, EncoderMethod::Configure, entries)
            .await
            .inspect_err(|e| warn!("Configure failed: {}", e))
    }

    /// Start streaming. Any failure kills the encoder.
    pub async fn start(&self) -> Result<()> {
        self.call_or_kill(EncoderMethod::Start).await
    }

    /// Pause streaming. Any failure kills the encoder.
    pub async fn pause(&self) -> Result<()> {
        self.call_or_kill(EncoderMethod::Pause).await
    }

    /// Ask the encoder to stop, then make sure it does.
    ///
    /// Whatever the reply, SIGTERM is sent right away and SIGKILL follows
    /// if the process is still around after the stop timeout.
    pub async fn stop(&self) -> Result<()> {
        let result = self.invoke(EncoderMethod::Stop).await;
        if let Err(e) = &result {
            warn!("Stop failed: {}", e);
        }

        self.arm_stop_timer();
        self.kill(KillMode::Graceful);

        result
    }

    /// Detach every event source still attached.
    ///
    /// Each detached source gives back its reference. Calling this again
    /// is a no-op.
    pub fn cleanup(&self) {
        let released: Vec<Source> = {
            let mut inner = self.lock();
            [
                inner.child.take().map(|c| c.source),
                inner.term_timer.take(),
                inner.pipe_watch.take(),
                inner.properties_slot.take(),
                inner.disappeared_slot.take(),
            ]
            .into_iter()
            .flatten()
            .collect()
        };

        if !released.is_empty() {
            debug!("Detaching {} encoder event sources", released.len());
        }
    }

    /// Signal the tracked child.
    ///
    /// Returns whether a signal was delivered. No tracked child, or a child
    /// that already exited, is not an error.
    pub fn signal_child(&self, mode: KillMode) -> Result<bool> {
        let Some(pid) = self.child_pid() else {
            return Ok(false);
        };

        let delivered = launcher::send_signal(pid, mode.signal())?;
        if !delivered {
            debug!("Encoder {} already gone, nothing to signal", pid);
        }
        Ok(delivered)
    }

    fn kill(&self, mode: KillMode) -> bool {
        self.signal_child(mode).unwrap_or_else(|e| {
            error!("Failed to kill encoder: {}", e);
            false
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn weak(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    /// Spawn `body` as a source retaining this controller.
    ///
    /// The task gets a weak reference and the source's attached flag.
    fn spawn_source<F, Fut>(&self, body: F) -> Source
    where
        F: FnOnce(Weak<Shared>, Arc<AtomicBool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let attached = Arc::new(AtomicBool::new(true));
        let task = self
            .shared
            .runtime
            .spawn(body(self.weak(), attached.clone()));
        Source::new(task, attached, self.shared.clone())
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Run one event handler if its source is still attached
    fn dispatch(&self, attached: &AtomicBool, handler: impl FnOnce(&Self)) {
        let _turn = self
            .shared
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if attached.load(Ordering::Acquire) {
            handler(self);
        }
    }

    fn set_state(&self, state: EncoderState) {
        let (previous, observer) = {
            let mut inner = self.lock();
            let Some(previous) = inner.machine.transition(state) else {
                return;
            };
            (previous, inner.observer.clone())
        };

        debug!("Encoder state change from {} to {}", previous, state);

        if let Some(observer) = observer {
            observer.on_state_change(self, state);
        }
    }

    fn remote(&self) -> Result<(Arc<dyn EncoderBus>, String)> {
        let inner = self.lock();
        match (&inner.bus, &inner.name) {
            (Some(bus), Some(name)) => Ok((bus.clone(), name.clone())),
            _ => Err(EncoderError::NotConnected),
        }
    }

    async fn invoke(&self, method: EncoderMethod) -> Result<()> {
        let (bus, name) = self.remote()?;
        debug!("Calling {} on encoder {}", method.as_str(), name);
        bus.call(name, method, Vec::new()).await
    }

    async fn call_or_kill(&self, method: EncoderMethod) -> Result<()> {
        let result = self.invoke(method).await;
        if let Err(e) = &result {
            warn!("{} failed, killing encoder: {}", method.as_str(), e);
            self.kill(KillMode::Forceful);
        }
        result
    }

    fn watch_child(&self, mut child: Child, pid: i32) {
        let mut inner = self.lock();
        let source = self.spawn_source(|weak, attached| async move {
            let status = child.wait().await;
            if let Some(encoder) = Self::upgrade(&weak) {
                encoder.dispatch(&attached, |encoder| encoder.on_child_terminated(pid, status));
            }
        });
        inner.child = Some(ChildWatch { pid, source });
    }

    fn on_child_terminated(&self, pid: i32, status: io::Result<ExitStatus>) {
        match status {
            Ok(status) => info!("Encoder {} terminated: {}", pid, status),
            Err(e) => warn!("Lost track of encoder {}: {}", pid, e),
        }

        self.set_state(EncoderState::Terminated);
        self.cleanup();
    }

    fn watch_handshake(&self, mut handshake: pipe::Receiver) {
        let mut inner = self.lock();
        let source = self.spawn_source(|weak, attached| async move {
            let outcome = read_bus_name(&mut handshake).await;
            drop(handshake);

            let Some(encoder) = Self::upgrade(&weak) else {
                return;
            };

            let outcome = match outcome {
                Ok(name) => encoder.connect(name).await,
                Err(e) => Err(e),
            };

            // Skipped when cleanup ran while we were connecting
            encoder.dispatch(&attached, |encoder| match outcome {
                Ok(connected) => encoder.on_connected(connected),
                Err(e) => {
                    warn!("Encoder handshake failed: {}", e);
                    encoder.abort_handshake();
                }
            });
            encoder.close_pipe();
        });
        inner.pipe_watch = Some(source);
    }

    fn close_pipe(&self) {
        let source = self.lock().pipe_watch.take();
        drop(source);
    }

    /// The encoder can't be driven without its bus name, get rid of it.
    ///
    /// Cleanup then follows from the exit event, or happens here if there
    /// is no process left to wait for.
    fn abort_handshake(&self) {
        if !self.kill(KillMode::Forceful) {
            self.cleanup();
        }
    }

    async fn connect(&self, name: String) -> Result<Connected> {
        info!("Got bus name from encoder: {}", name);

        let bus = self.shared.connector.connect().await?;
        let properties = bus.watch_properties(name.clone()).await?;
        let owner = bus.watch_name_owner(name.clone()).await?;

        Ok(Connected {
            name,
            bus,
            properties,
            owner,
        })
    }

    fn on_connected(&self, connected: Connected) {
        let Connected {
            name,
            bus,
            properties,
            owner,
        } = connected;

        self.install_subscriptions(&mut self.lock(), name, bus, properties, owner);
        self.set_state(EncoderState::Spawned);
    }

    fn install_subscriptions(
        &self,
        inner: &mut Inner,
        name: String,
        bus: Arc<dyn EncoderBus>,
        properties: BoxStream<'static, PropertiesChanged>,
        owner: BoxStream<'static, NameOwnerChanged>,
    ) {
        inner.name = Some(name);
        inner.bus = Some(bus);
        inner.properties_slot = Some(self.attach(properties, Self::on_properties_changed));
        inner.disappeared_slot = Some(self.attach(owner, Self::on_name_owner_changed));
    }

    /// Feed every item of `stream` to `handler`, in delivery order
    fn attach<T, F>(&self, mut stream: BoxStream<'static, T>, handler: F) -> Source
    where
        T: Send + 'static,
        F: Fn(&Self, T) + Send + 'static,
    {
        self.spawn_source(|weak, attached| async move {
            while let Some(item) = stream.next().await {
                let Some(encoder) = Self::upgrade(&weak) else {
                    break;
                };
                encoder.dispatch(&attached, |encoder| handler(encoder, item));
                // A handler may have detached this very source
                if !attached.load(Ordering::Acquire) {
                    break;
                }
            }
        })
    }

    fn on_properties_changed(&self, signal: PropertiesChanged) {
        if signal.interface != ENCODER_INTERFACE {
            return;
        }

        let Some((_, value)) = signal
            .changed
            .iter()
            .find(|(name, _)| name == STATE_PROPERTY)
        else {
            return;
        };

        let PropertyValue::Int(code) = value else {
            warn!("Encoder published a non-integer State");
            return;
        };

        match StateCode::decode(*code) {
            Decoded::Known(state) => self.set_state(state),
            Decoded::Unknown(code) => error!("Encoder entered unknown state: {}", code),
        }
    }

    fn on_name_owner_changed(&self, signal: NameOwnerChanged) {
        if !signal.new_owner.is_empty() {
            debug!("{} acquired by {}", signal.name, signal.new_owner);
            return;
        }

        info!("Encoder {} disappeared", signal.name);

        match self.signal_child(KillMode::Graceful) {
            Ok(true) => {}
            Ok(false) => self.cleanup(),
            Err(e) => error!("Failed to stop vanished encoder: {}", e),
        }
    }

    fn arm_stop_timer(&self) {
        let deadline = Instant::now() + self.shared.settings.stop_timeout();

        let previous = {
            let mut inner = self.lock();
            let source = self.spawn_source(|weak, attached| async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(encoder) = Self::upgrade(&weak) {
                    encoder.dispatch(&attached, Self::on_stop_timeout);
                }
            });
            inner.term_timer.replace(source)
        };
        drop(previous);
    }

    fn on_stop_timeout(&self) {
        let timer = self.lock().term_timer.take();

        if self.has_child() {
            warn!("Encoder did not stop in time, killing it");
            self.kill(KillMode::Forceful);
        }

        drop(timer);
    }
}

/// One bounded read of the bus name off the handshake pipe.
///
/// The encoder writes its name in a single write, so whatever the first
/// successful read returns is the whole name.
async fn read_bus_name(handshake: &mut pipe::Receiver) -> Result<String> {
    let mut buf = [0u8; HANDSHAKE_BUF_LEN];

    loop {
        handshake
            .readable()
            .await
            .map_err(|e| EncoderError::Handshake(e.to_string()))?;

        match handshake.try_read(&mut buf) {
            Ok(0) => {
                return Err(EncoderError::Handshake(
                    "no bus name returned from encoder".to_string(),
                ))
            }
            Ok(n) => {
                return String::from_utf8(buf[..n].to_vec()).map_err(|_| {
                    EncoderError::Handshake("bus name is not valid UTF-8".to_string())
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(EncoderError::Handshake(e.to_string())),
        }
    }
}
