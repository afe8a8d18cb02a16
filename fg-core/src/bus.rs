//! Typed message-bus façade
//!
//! Everything the engines need from the bus goes through here: service-name
//! lookup via the object mapper, typed property access, method calls,
//! subtree traversal, and match-rule signal subscription. Transport errors
//! are converted to `fg_error` variants carrying the path/interface/property
//! involved; callers never see raw zbus codes.

use std::collections::HashMap;

use fg_error::{FanGuardError, Result};
use tracing::debug;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MessageStream};

use crate::constants::{interfaces, paths, services};

/// Reply shape of the mapper's GetSubTree: path → service → interfaces.
pub type SubTree = HashMap<String, HashMap<String, Vec<String>>>;

/// Reply shape of GetManagedObjects: path → interface → property → value.
pub type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

/// How many signal messages a subscription may queue before the loop drains
/// them.
const SUBSCRIPTION_QUEUE: usize = 64;

/// Shared handle to the process-wide bus connection.
#[derive(Clone, Debug)]
pub struct BusFacade {
    conn: Connection,
}

impl BusFacade {
    /// Connect to the system bus.
    pub async fn new() -> Result<Self> {
        let conn = Connection::system()
            .await
            .map_err(|e| FanGuardError::BusConnection(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection (used by tests and the CLI).
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Look up the service owning `interface` on `path` via the object
    /// mapper.
    pub async fn get_service(&self, path: &str, interface: &str) -> Result<String> {
        let reply = self
            .conn
            .call_method(
                Some(services::OBJECT_MAPPER),
                paths::OBJECT_MAPPER,
                Some(interfaces::OBJECT_MAPPER),
                "GetObject",
                &(path, vec![interface]),
            )
            .await
            .map_err(|_| FanGuardError::ServiceNotFound {
                path: path.into(),
                interface: interface.into(),
            })?;

        let owners: HashMap<String, Vec<String>> =
            reply
                .body()
                .deserialize()
                .map_err(|e| FanGuardError::BadReply {
                    path: path.into(),
                    interface: interfaces::OBJECT_MAPPER.into(),
                    method: "GetObject".into(),
                    reason: e.to_string(),
                })?;

        owners
            .into_keys()
            .next()
            .ok_or_else(|| FanGuardError::ServiceNotFound {
                path: path.into(),
                interface: interface.into(),
            })
    }

    /// Read a property, resolving the owning service through the mapper.
    pub async fn get_property<T>(&self, path: &str, interface: &str, property: &str) -> Result<T>
    where
        T: TryFrom<OwnedValue>,
        <T as TryFrom<OwnedValue>>::Error: std::fmt::Display,
    {
        let service = self.get_service(path, interface).await.map_err(|e| {
            FanGuardError::PropertyUnavailable {
                path: path.into(),
                interface: interface.into(),
                property: property.into(),
                reason: e.to_string(),
            }
        })?;
        self.get_property_from(&service, path, interface, property)
            .await
    }

    /// Read a property from a known service.
    pub async fn get_property_from<T>(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<T>
    where
        T: TryFrom<OwnedValue>,
        <T as TryFrom<OwnedValue>>::Error: std::fmt::Display,
    {
        let value = self
            .get_property_variant(service, path, interface, property)
            .await?;

        T::try_from(value).map_err(|e| FanGuardError::PropertyUnavailable {
            path: path.into(),
            interface: interface.into(),
            property: property.into(),
            reason: format!("type mismatch: {}", e),
        })
    }

    /// Read a property as a raw variant from a known service.
    pub async fn get_property_variant(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<OwnedValue> {
        let reply = self
            .conn
            .call_method(
                Some(service),
                path,
                Some(interfaces::PROPERTIES),
                "Get",
                &(interface, property),
            )
            .await
            .map_err(|e| FanGuardError::PropertyUnavailable {
                path: path.into(),
                interface: interface.into(),
                property: property.into(),
                reason: e.to_string(),
            })?;

        reply
            .body()
            .deserialize()
            .map_err(|e| FanGuardError::BadReply {
                path: path.into(),
                interface: interface.into(),
                method: "Get".into(),
                reason: e.to_string(),
            })
    }

    /// Write a property, resolving the owning service through the mapper.
    pub async fn set_property(
        &self,
        path: &str,
        interface: &str,
        property: &str,
        value: Value<'_>,
    ) -> Result<()> {
        let service =
            self.get_service(path, interface)
                .await
                .map_err(|e| FanGuardError::PropertyWriteFailed {
                    path: path.into(),
                    interface: interface.into(),
                    property: property.into(),
                    reason: e.to_string(),
                })?;

        self.conn
            .call_method(
                Some(service.as_str()),
                path,
                Some(interfaces::PROPERTIES),
                "Set",
                &(interface, property, value),
            )
            .await
            .map_err(|e| FanGuardError::PropertyWriteFailed {
                path: path.into(),
                interface: interface.into(),
                property: property.into(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Call a method on a known service and return the reply message.
    pub async fn call_method<B>(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
    ) -> Result<zbus::Message>
    where
        B: serde::ser::Serialize + zbus::zvariant::DynamicType,
    {
        self.conn
            .call_method(Some(service), path, Some(interface), method, body)
            .await
            .map_err(|e| FanGuardError::MethodCallFailed {
                service: service.into(),
                path: path.into(),
                interface: interface.into(),
                method: method.into(),
                reason: e.to_string(),
            })
    }

    /// Call a method after resolving the owning service through the mapper.
    pub async fn lookup_and_call_method<B>(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
    ) -> Result<zbus::Message>
    where
        B: serde::ser::Serialize + zbus::zvariant::DynamicType,
    {
        let service = self.get_service(path, interface).await?;
        self.call_method(&service, path, interface, method, body)
            .await
    }

    /// Object paths below `root` implementing `interface`.
    pub async fn get_subtree_paths(
        &self,
        root: &str,
        interface: &str,
        depth: i32,
    ) -> Result<Vec<String>> {
        let reply = self
            .call_method(
                services::OBJECT_MAPPER,
                paths::OBJECT_MAPPER,
                interfaces::OBJECT_MAPPER,
                "GetSubTreePaths",
                &(root, depth, vec![interface]),
            )
            .await?;

        reply
            .body()
            .deserialize()
            .map_err(|e| FanGuardError::BadReply {
                path: root.into(),
                interface: interfaces::OBJECT_MAPPER.into(),
                method: "GetSubTreePaths".into(),
                reason: e.to_string(),
            })
    }

    /// Full subtree below `root` implementing `interface`, including owning
    /// services.
    pub async fn get_subtree(&self, root: &str, interface: &str, depth: i32) -> Result<SubTree> {
        let reply = self
            .call_method(
                services::OBJECT_MAPPER,
                paths::OBJECT_MAPPER,
                interfaces::OBJECT_MAPPER,
                "GetSubTree",
                &(root, depth, vec![interface]),
            )
            .await?;

        reply
            .body()
            .deserialize()
            .map_err(|e| FanGuardError::BadReply {
                path: root.into(),
                interface: interfaces::OBJECT_MAPPER.into(),
                method: "GetSubTree".into(),
                reason: e.to_string(),
            })
    }

    /// ObjectManager traversal of `service` starting at `path`.
    pub async fn get_managed_objects(&self, service: &str, path: &str) -> Result<ManagedObjects> {
        let reply = self
            .call_method(
                service,
                path,
                interfaces::OBJECT_MANAGER,
                "GetManagedObjects",
                &(),
            )
            .await?;

        reply
            .body()
            .deserialize()
            .map_err(|e| FanGuardError::BadReply {
                path: path.into(),
                interface: interfaces::OBJECT_MANAGER.into(),
                method: "GetManagedObjects".into(),
                reason: e.to_string(),
            })
    }

    /// Whether any connection currently owns `name`.
    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let reply = self
            .call_method(
                services::DBUS,
                paths::DBUS,
                interfaces::DBUS,
                "NameHasOwner",
                &(name,),
            )
            .await?;

        reply
            .body()
            .deserialize()
            .map_err(|e| FanGuardError::BadReply {
                path: paths::DBUS.into(),
                interface: interfaces::DBUS.into(),
                method: "NameHasOwner".into(),
                reason: e.to_string(),
            })
    }

    /// Subscribe to a match expression. The returned stream is drained by
    /// the subscribing subsystem from the event loop.
    pub async fn subscribe(&self, expr: &str) -> Result<MessageStream> {
        debug!(rule = %expr, "subscribing bus match");
        let rule: zbus::MatchRule<'_> = expr
            .try_into()
            .map_err(|e: zbus::Error| FanGuardError::internal(format!("bad match rule: {}", e)))?;
        MessageStream::for_match_rule(rule, &self.conn, Some(SUBSCRIPTION_QUEUE))
            .await
            .map_err(|e| FanGuardError::BusConnection(e.to_string()))
    }
}

/// Match-expression builders, one per signal shape the service consumes.
pub mod rules {
    use crate::constants::interfaces;

    /// PropertiesChanged on an exact object path.
    pub fn properties_changed(path: &str, interface: &str) -> String {
        format!(
            "type='signal',interface='{}',member='PropertiesChanged',path='{}',arg0='{}'",
            interfaces::PROPERTIES,
            path,
            interface
        )
    }

    /// PropertiesChanged anywhere under a path namespace.
    pub fn properties_changed_namespace(namespace: &str, interface: &str) -> String {
        format!(
            "type='signal',interface='{}',member='PropertiesChanged',path_namespace='{}',arg0='{}'",
            interfaces::PROPERTIES,
            namespace,
            interface
        )
    }

    /// InterfacesAdded whose object path matches `path`.
    pub fn interfaces_added(path: &str) -> String {
        format!(
            "type='signal',interface='{}',member='InterfacesAdded',arg0path='{}'",
            interfaces::OBJECT_MANAGER,
            path
        )
    }

    /// NameOwnerChanged for a specific well-known name.
    pub fn name_owner_changed(name: &str) -> String {
        format!(
            "type='signal',sender='org.freedesktop.DBus',interface='{}',member='NameOwnerChanged',arg0='{}'",
            interfaces::DBUS,
            name
        )
    }
}

/// Parsed PropertiesChanged payload.
pub struct PropertiesChanged {
    pub path: String,
    pub interface: String,
    pub changed: HashMap<String, OwnedValue>,
}

/// Decode a PropertiesChanged signal message.
pub fn read_properties_changed(msg: &zbus::Message) -> Result<PropertiesChanged> {
    let header = msg.header();
    let path = header
        .path()
        .map(|p| p.to_string())
        .ok_or_else(|| FanGuardError::internal("PropertiesChanged without a path"))?;

    let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        msg.body()
            .deserialize()
            .map_err(|e| FanGuardError::BadReply {
                path: path.clone(),
                interface: interfaces::PROPERTIES.into(),
                method: "PropertiesChanged".into(),
                reason: e.to_string(),
            })?;

    Ok(PropertiesChanged {
        path,
        interface,
        changed,
    })
}

/// Parsed InterfacesAdded payload.
pub struct InterfacesAdded {
    pub path: String,
    pub interfaces: HashMap<String, HashMap<String, OwnedValue>>,
}

/// Decode an InterfacesAdded signal message.
pub fn read_interfaces_added(msg: &zbus::Message) -> Result<InterfacesAdded> {
    let (path, interfaces): (OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>) = msg
        .body()
        .deserialize()
        .map_err(|e| FanGuardError::internal(format!("bad InterfacesAdded payload: {}", e)))?;

    Ok(InterfacesAdded {
        path: path.to_string(),
        interfaces,
    })
}

/// Decode a NameOwnerChanged signal message into (name, old, new).
pub fn read_name_owner_changed(msg: &zbus::Message) -> Result<(String, String, String)> {
    msg.body()
        .deserialize()
        .map_err(|e| FanGuardError::internal(format!("bad NameOwnerChanged payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_strings() {
        let r = rules::properties_changed_namespace(
            "/xyz/openbmc_project/sensors",
            interfaces::THRESHOLD_HARD_SHUTDOWN,
        );
        assert!(r.contains("path_namespace='/xyz/openbmc_project/sensors'"));
        assert!(r.contains("arg0='xyz.openbmc_project.Sensor.Threshold.HardShutdown'"));

        let r = rules::name_owner_changed("xyz.openbmc_project.Inventory.Manager");
        assert!(r.contains("member='NameOwnerChanged'"));
        assert!(r.contains("arg0='xyz.openbmc_project.Inventory.Manager'"));
    }
}
