//! In-memory bus for controller tests

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::bus::{
    BusConnector, EncoderBus, EncoderMethod, NameOwnerChanged, PropertiesChanged, PropertyValue,
    ENCODER_INTERFACE, STATE_PROPERTY,
};
use super::wire::ConfigEntry;
use crate::error::{EncoderError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub destination: String,
    pub method: EncoderMethod,
    pub entries: Vec<ConfigEntry>,
}

#[derive(Default)]
struct State {
    calls: Vec<RecordedCall>,
    failing: HashSet<&'static str>,
    property_watchers: Vec<String>,
    owner_watchers: Vec<String>,
    properties_tx: Vec<UnboundedSender<PropertiesChanged>>,
    owner_tx: Vec<UnboundedSender<NameOwnerChanged>>,
}

/// Records calls and lets tests push signals to subscribers
#[derive(Default)]
pub struct FakeBus {
    state: Mutex<State>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Make every later call of `method` fail with an error reply
    pub fn fail(&self, method: EncoderMethod) {
        self.state().failing.insert(method.as_str());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn property_watchers(&self) -> Vec<String> {
        self.state().property_watchers.clone()
    }

    pub fn owner_watchers(&self) -> Vec<String> {
        self.state().owner_watchers.clone()
    }

    pub fn emit(&self, signal: PropertiesChanged) {
        for tx in &self.state().properties_tx {
            let _ = tx.unbounded_send(signal.clone());
        }
    }

    pub fn emit_state(&self, code: i64) {
        self.emit(PropertiesChanged {
            interface: ENCODER_INTERFACE.to_string(),
            changed: vec![(STATE_PROPERTY.to_string(), PropertyValue::Int(code))],
        });
    }

    pub fn emit_owner(&self, signal: NameOwnerChanged) {
        for tx in &self.state().owner_tx {
            let _ = tx.unbounded_send(signal.clone());
        }
    }

    pub fn emit_vanished(&self, name: &str) {
        self.emit_owner(NameOwnerChanged {
            name: name.to_string(),
            old_owner: name.to_string(),
            new_owner: String::new(),
        });
    }
}

impl EncoderBus for FakeBus {
    fn call(
        &self,
        destination: String,
        method: EncoderMethod,
        entries: Vec<ConfigEntry>,
    ) -> BoxFuture<'static, Result<()>> {
        let fails = {
            let mut state = self.state();
            state.calls.push(RecordedCall {
                destination,
                method,
                entries,
            });
            state.failing.contains(method.as_str())
        };

        Box::pin(async move {
            if fails {
                return Err(EncoderError::Remote {
                    name: "org.freedesktop.DBus.Error.Failed".to_string(),
                    message: format!("{} refused", method.as_str()),
                });
            }
            Ok(())
        })
    }

    fn watch_properties(
        &self,
        sender: String,
    ) -> BoxFuture<'static, Result<BoxStream<'static, PropertiesChanged>>> {
        let (tx, rx) = unbounded();
        {
            let mut state = self.state();
            state.property_watchers.push(sender);
            state.properties_tx.push(tx);
        }
        Box::pin(async move { Ok(rx.boxed()) })
    }

    fn watch_name_owner(
        &self,
        namespace: String,
    ) -> BoxFuture<'static, Result<BoxStream<'static, NameOwnerChanged>>> {
        let (tx, rx) = unbounded();
        {
            let mut state = self.state();
            state.owner_watchers.push(namespace);
            state.owner_tx.push(tx);
        }
        Box::pin(async move { Ok(rx.boxed()) })
    }
}

/// Hands out the same fake bus on every connect
pub struct FakeConnector {
    bus: Arc<FakeBus>,
}

impl FakeConnector {
    pub fn new(bus: Arc<FakeBus>) -> Self {
        Self { bus }
    }
}

impl BusConnector for FakeConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn EncoderBus>>> {
        let bus: Arc<dyn EncoderBus> = self.bus.clone();
        Box::pin(async move { Ok(bus) })
    }
}
