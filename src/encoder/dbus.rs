//! zbus-backed implementation of the encoder bus

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};
use zbus::message::Type as MessageType;
use zbus::zvariant::{OwnedValue, Signature, Type, Value};
use zbus::{Connection, MatchRule, MessageStream};

use super::bus::{
    BusConnector, EncoderBus, EncoderMethod, NameOwnerChanged, PropertiesChanged, PropertyValue,
    ENCODER_INTERFACE, ENCODER_OBJECT_PATH,
};
use super::wire::{ConfigEntry, ConfigValue};
use crate::error::{EncoderError, Result};

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";

/// Connects to the shared system bus
#[derive(Debug, Default, Clone)]
pub struct SystemBusConnector;

impl BusConnector for SystemBusConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn EncoderBus>>> {
        Box::pin(async {
            let connection = Connection::system()
                .await
                .map_err(|e| EncoderError::Connect(e.to_string()))?;
            debug!("Connected to system bus as {:?}", connection.unique_name());
            Ok(Arc::new(DBusEncoderBus { connection }) as Arc<dyn EncoderBus>)
        })
    }
}

/// Encoder bus on top of a zbus connection
#[derive(Clone)]
pub struct DBusEncoderBus {
    connection: Connection,
}

impl DBusEncoderBus {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

fn subscribe_error(what: &'static str) -> impl Fn(zbus::Error) -> EncoderError {
    move |e| EncoderError::Subscribe {
        what,
        reason: e.to_string(),
    }
}

fn call_error(e: zbus::Error) -> EncoderError {
    match e {
        zbus::Error::MethodError(name, message, _) => EncoderError::Remote {
            name: name.to_string(),
            message: message.unwrap_or_default(),
        },
        other => EncoderError::Transport(other.to_string()),
    }
}

/// A D-Bus dictionary that keeps its entries in the order they were
/// written or received.
///
/// Duplicate keys are kept as they are.
#[derive(Debug, Clone, PartialEq)]
struct OrderedDict<K, V>(Vec<(K, V)>);

impl<K, V> Type for OrderedDict<K, V>
where
    K: Type + Eq + Hash,
    V: Type,
{
    fn signature() -> Signature<'static> {
        <HashMap<K, V>>::signature()
    }
}

impl<K: Serialize, V: Serialize> Serialize for OrderedDict<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, K, V> Deserialize<'de> for OrderedDict<K, V>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct Entries<K, V>(PhantomData<(K, V)>);

        impl<'de, K, V> Visitor<'de> for Entries<K, V>
        where
            K: Deserialize<'de>,
            V: Deserialize<'de>,
        {
            type Value = OrderedDict<K, V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a dictionary")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                Ok(OrderedDict(entries))
            }
        }

        deserializer.deserialize_map(Entries(PhantomData))
    }
}

/// Configure argument, in the order the entries were built
fn configure_dict(entries: Vec<ConfigEntry>) -> OrderedDict<i32, Value<'static>> {
    OrderedDict(
        entries
            .into_iter()
            .map(|entry| (entry.key.code(), to_variant(entry.value)))
            .collect(),
    )
}

fn to_variant(value: ConfigValue) -> Value<'static> {
    match value {
        ConfigValue::Str(s) => Value::from(s),
        ConfigValue::U32(u) => Value::from(u),
    }
}

fn property_value(value: &OwnedValue) -> PropertyValue {
    match &**value {
        Value::I32(v) => PropertyValue::Int(i64::from(*v)),
        Value::U32(v) => PropertyValue::Int(i64::from(*v)),
        Value::I16(v) => PropertyValue::Int(i64::from(*v)),
        Value::U16(v) => PropertyValue::Int(i64::from(*v)),
        Value::U8(v) => PropertyValue::Int(i64::from(*v)),
        Value::I64(v) => PropertyValue::Int(*v),
        _ => PropertyValue::Other,
    }
}

impl EncoderBus for DBusEncoderBus {
    fn call(
        &self,
        destination: String,
        method: EncoderMethod,
        entries: Vec<ConfigEntry>,
    ) -> BoxFuture<'static, Result<()>> {
        let connection = self.connection.clone();
        Box::pin(async move {
            let reply = if method == EncoderMethod::Configure {
                let config = configure_dict(entries);
                connection
                    .call_method(
                        Some(destination.as_str()),
                        ENCODER_OBJECT_PATH,
                        Some(ENCODER_INTERFACE),
                        method.as_str(),
                        &(config,),
                    )
                    .await
            } else {
                connection
                    .call_method(
                        Some(destination.as_str()),
                        ENCODER_OBJECT_PATH,
                        Some(ENCODER_INTERFACE),
                        method.as_str(),
                        &(),
                    )
                    .await
            };

            reply.map(|_| ()).map_err(call_error)
        })
    }

    fn watch_properties(
        &self,
        sender: String,
    ) -> BoxFuture<'static, Result<BoxStream<'static, PropertiesChanged>>> {
        let connection = self.connection.clone();
        Box::pin(async move {
            let on_err = subscribe_error("encoder property changes");
            let rule = MatchRule::builder()
                .msg_type(MessageType::Signal)
                .sender(sender.as_str())
                .map_err(&on_err)?
                .path(ENCODER_OBJECT_PATH)
                .map_err(&on_err)?
                .interface(PROPERTIES_INTERFACE)
                .map_err(&on_err)?
                .member("PropertiesChanged")
                .map_err(&on_err)?
                .add_arg(ENCODER_INTERFACE)
                .map_err(&on_err)?
                .build();

            let stream = MessageStream::for_match_rule(rule, &connection, None)
                .await
                .map_err(&on_err)?;

            let decoded = stream.filter_map(|msg| async move {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Dropping unreadable message: {}", e);
                        return None;
                    }
                };
                let body = msg.body();
                match body.deserialize::<(String, OrderedDict<String, OwnedValue>, Vec<String>)>() {
                    Ok((interface, changed, _invalidated)) => Some(PropertiesChanged {
                        interface,
                        changed: changed
                            .0
                            .iter()
                            .map(|(name, value)| (name.clone(), property_value(value)))
                            .collect(),
                    }),
                    Err(e) => {
                        warn!("Malformed PropertiesChanged from encoder: {}", e);
                        None
                    }
                }
            });

            Ok(decoded.boxed())
        })
    }

    fn watch_name_owner(
        &self,
        namespace: String,
    ) -> BoxFuture<'static, Result<BoxStream<'static, NameOwnerChanged>>> {
        let connection = self.connection.clone();
        Box::pin(async move {
            let on_err = subscribe_error("bus name ownership changes");
            let rule = MatchRule::builder()
                .msg_type(MessageType::Signal)
                .sender(DBUS_NAME)
                .map_err(&on_err)?
                .path(DBUS_PATH)
                .map_err(&on_err)?
                .interface(DBUS_NAME)
                .map_err(&on_err)?
                .member("NameOwnerChanged")
                .map_err(&on_err)?
                .arg0ns(namespace.as_str())
                .map_err(&on_err)?
                .build();

            let stream = MessageStream::for_match_rule(rule, &connection, None)
                .await
                .map_err(&on_err)?;

            let decoded = stream.filter_map(|msg| async move {
                let msg = msg.ok()?;
                let body = msg.body();
                match body.deserialize::<(String, String, String)>() {
                    Ok((name, old_owner, new_owner)) => Some(NameOwnerChanged {
                        name,
                        old_owner,
                        new_owner,
                    }),
                    Err(e) => {
                        warn!("Malformed NameOwnerChanged: {}", e);
                        None
                    }
                }
            });

            Ok(decoded.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::wire::{configure_entries, ConfigKey};
    use crate::session::{DisplayRect, SessionContext};
    use serde::de::DeserializeOwned;
    use zbus::zvariant::serialized::Context;
    use zbus::zvariant::{to_bytes, LE};

    /// Marshal `value` the way it goes on the bus and read it back as `U`
    fn over_the_wire<T, U>(value: &T) -> U
    where
        T: Serialize + Type,
        U: DeserializeOwned + Type,
    {
        let data = to_bytes(Context::new_dbus(LE, 0), value).unwrap();
        let (decoded, _) = data.deserialize::<U>().unwrap();
        decoded
    }

    #[test]
    fn test_configure_body_keeps_entry_order() {
        let session = SessionContext {
            peer_address: "10.0.0.2".to_string(),
            local_address: "10.0.0.5".to_string(),
            rtp_port: 5000,
            rtcp_port: Some(5001),
            display_rect: Some(DisplayRect {
                x: 0,
                y: 0,
                width: 1280,
                height: 720,
            }),
            ..Default::default()
        };
        let entries = configure_entries(&session);
        let expected: Vec<i32> = entries.iter().map(|e| e.key.code()).collect();

        let dict = configure_dict(entries);
        assert_eq!(<OrderedDict<i32, Value<'static>>>::signature().as_str(), "a{iv}");

        let sent: OrderedDict<i32, OwnedValue> = over_the_wire(&dict);
        let keys: Vec<i32> = sent.0.iter().map(|(key, _)| *key).collect();
        assert_eq!(keys, expected);
        assert_eq!(keys[0], ConfigKey::PeerAddress.code());
        assert_eq!(keys.len(), 9);
    }

    #[test]
    fn test_changed_properties_keep_duplicates_in_order() {
        let changed = OrderedDict(vec![
            ("State".to_string(), Value::I32(2)),
            ("State".to_string(), Value::I32(3)),
        ]);

        let received: OrderedDict<String, OwnedValue> = over_the_wire(&changed);
        let decoded: Vec<_> = received
            .0
            .iter()
            .map(|(name, value)| (name.as_str(), property_value(value)))
            .collect();
        assert_eq!(
            decoded,
            vec![("State", PropertyValue::Int(2)), ("State", PropertyValue::Int(3))]
        );
    }

    #[test]
    fn test_property_value_accepts_integers() {
        let value = OwnedValue::try_from(Value::I32(3)).unwrap();
        assert_eq!(property_value(&value), PropertyValue::Int(3));

        let value = OwnedValue::try_from(Value::U32(4)).unwrap();
        assert_eq!(property_value(&value), PropertyValue::Int(4));
    }

    #[test]
    fn test_property_value_rejects_strings() {
        let value = OwnedValue::try_from(Value::from("3")).unwrap();
        assert_eq!(property_value(&value), PropertyValue::Other);
    }

    #[test]
    fn test_config_values_become_variants() {
        assert_eq!(to_variant(ConfigValue::U32(5000)), Value::U32(5000));
        assert_eq!(
            to_variant(ConfigValue::Str("10.0.0.2".to_string())),
            Value::from("10.0.0.2")
        );
    }
}
