//! Service registry: servers by name and id, client bindings by role.

use std::collections::HashMap;

use crate::connection::{ConnId, ConnectionState};
use crate::service::Service;
use patchbay_core::ConnectError;

/// Numeric id a server is addressed by on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(pub u32);

/// Handle to a registered client binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

/// Compute the fully-qualified service name from interface and role.
///
/// Any `::` separation in the interface name is collapsed to `.`, so a
/// nested interface type maps to a flat dotted name on the wire.
pub fn full_qualified_name(interface: &str, role: &str) -> String {
    let iface = interface.replace("::", ".");
    format!("{iface}.{role}")
}

pub(crate) struct ServerEntry {
    pub name: String,
    /// Taken out of the table while a request is being dispatched so the
    /// handler can borrow the dispatcher's other tables.
    pub service: Option<Box<dyn Service>>,
}

/// A client stub's registration with the dispatcher.
pub(crate) struct ClientBinding {
    pub role: String,
    pub fqn: String,
    /// Explicit service location; skips both local and broker resolution.
    pub location: Option<String>,
    pub state: ConnectionState,
    pub conn: Option<ConnId>,
    /// The peer's numeric server id, known once resolution completed.
    pub server_id: Option<u32>,
    /// Why the last connect attempt ended in Disconnected.
    pub connect_failure: Option<ConnectError>,
    pub on_state: Box<dyn FnMut(ConnectionState) + Send>,
}

#[derive(Default)]
pub(crate) struct ServiceRegistry {
    names: HashMap<String, ServerId>,
    servers: HashMap<ServerId, ServerEntry>,
    clients: HashMap<ClientId, ClientBinding>,
    /// Role -> interested clients; several stubs may share a role.
    by_role: HashMap<String, Vec<ClientId>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_server(&mut self, name: String, id: ServerId, service: Box<dyn Service>) {
        debug_assert!(!self.names.contains_key(&name));
        self.names.insert(name.clone(), id);
        self.servers.insert(
            id,
            ServerEntry {
                name,
                service: Some(service),
            },
        );
    }

    pub fn server_id_by_name(&self, name: &str) -> Option<ServerId> {
        self.names.get(name).copied()
    }

    pub fn has_server(&self, id: ServerId) -> bool {
        self.servers.contains_key(&id)
    }

    /// Borrow the service out of the table for one dispatch.
    pub fn take_service(&mut self, id: ServerId) -> Option<Box<dyn Service>> {
        self.servers.get_mut(&id).and_then(|e| e.service.take())
    }

    pub fn put_service(&mut self, id: ServerId, service: Box<dyn Service>) {
        if let Some(entry) = self.servers.get_mut(&id) {
            entry.service = Some(service);
        }
    }

    pub fn add_client(&mut self, id: ClientId, binding: ClientBinding) {
        self.by_role
            .entry(binding.role.clone())
            .or_default()
            .push(id);
        self.clients.insert(id, binding);
    }

    pub fn remove_client(&mut self, id: ClientId) -> Option<ClientBinding> {
        let binding = self.clients.remove(&id)?;
        if let Some(ids) = self.by_role.get_mut(&binding.role) {
            ids.retain(|c| *c != id);
            if ids.is_empty() {
                self.by_role.remove(&binding.role);
            }
        }
        Some(binding)
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientBinding> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut ClientBinding> {
        self.clients.get_mut(&id)
    }

    /// Clients currently riding on `conn`.
    pub fn clients_on_conn(&self, conn: ConnId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, b)| b.conn == Some(conn))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::CallContext;

    struct Nop;

    impl Service for Nop {
        fn interface(&self) -> &'static str {
            "test::Nop"
        }
        fn role(&self) -> &str {
            "nop"
        }
        fn dispatch(&mut self, _ctx: &mut CallContext<'_>, _method: u32, _args: &[u8]) {}
    }

    #[test]
    fn fqn_collapses_path_separators() {
        assert_eq!(full_qualified_name("test::Nop", "nop"), "test.Nop.nop");
        assert_eq!(full_qualified_name("Calc", "main"), "Calc.main");
    }

    #[test]
    fn server_is_reachable_by_name_and_id() {
        let mut registry = ServiceRegistry::new();
        let id = ServerId(17);
        registry.insert_server("test.Nop.nop".into(), id, Box::new(Nop));

        assert_eq!(registry.server_id_by_name("test.Nop.nop"), Some(id));
        assert!(registry.has_server(id));

        let service = registry.take_service(id).unwrap();
        // busy while dispatching
        assert!(registry.take_service(id).is_none());
        registry.put_service(id, service);
        assert!(registry.take_service(id).is_some());
    }

    #[test]
    fn several_clients_may_share_a_role() {
        let mut registry = ServiceRegistry::new();
        for n in [1u32, 2] {
            registry.add_client(
                ClientId(n),
                ClientBinding {
                    role: "echo".into(),
                    fqn: "test.Echo.echo".into(),
                    location: None,
                    state: ConnectionState::Disconnected,
                    conn: Some(ConnId(7)),
                    server_id: None,
                    connect_failure: None,
                    on_state: Box::new(|_| {}),
                },
            );
        }

        let mut on_conn = registry.clients_on_conn(ConnId(7));
        on_conn.sort_by_key(|c| c.0);
        assert_eq!(on_conn, vec![ClientId(1), ClientId(2)]);

        registry.remove_client(ClientId(1));
        assert_eq!(registry.clients_on_conn(ConnId(7)), vec![ClientId(2)]);
    }
}
