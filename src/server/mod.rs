//! Server side of the gateway: the control-port listener
//! ([`tunnel::TunnelServer`]), the pool of authenticated clients and their
//! sessions ([`client_pool::ClientHandlerPool`]), the public listeners
//! ([`external::ExternalPortServerPool`]) and the [`TttServer`] glue that
//! routes sessions between them.

pub mod client_pool;
pub mod external;
pub mod tunnel;

use std::{io::Error, rc::Rc, time::Duration};

use tracing::debug;

use crate::{
    config::ServerOption,
    proto::packet::OpenOpt,
    runtime::Runtime,
    server::{
        client_pool::{ClientHandlerPool, SessionEvent},
        external::{ExternalEvent, ExternalPortServerPool},
        tunnel::TunnelServer,
    },
};

pub struct TttServer {
    option: Rc<ServerOption>,
    tunnel: Rc<TunnelServer>,
    clients: Rc<ClientHandlerPool>,
    external: Rc<ExternalPortServerPool>,
}

impl TttServer {
    pub fn new(runtime: Rc<Runtime>, option: Rc<ServerOption>) -> Rc<TttServer> {
        let clients = ClientHandlerPool::new(Rc::clone(&runtime));
        let tunnel = TunnelServer::new(Rc::clone(&runtime), Rc::clone(&option), Rc::clone(&clients));
        let external = ExternalPortServerPool::new(runtime, Rc::clone(&option));

        Rc::new(TttServer {
            option,
            tunnel,
            clients,
            external,
        })
    }

    pub async fn start(self: &Rc<Self>) -> Result<(), Error> {
        // public side -> tunnel side. Weak in both directions: the observer
        // boxes would otherwise keep the two pools alive through each other.
        {
            let server = Rc::downgrade(self);
            self.external.set_observer(Box::new(move |session_id, event| {
                let server = match server.upgrade() {
                    Some(server) => server,
                    None => return,
                };
                match event {
                    ExternalEvent::Open { tunnel_index } => server.on_public_open(session_id, tunnel_index),
                    ExternalEvent::Receive(data) => {
                        server.clients.send_session_data(session_id, data);
                    }
                    ExternalEvent::Closed { receive_length } => {
                        server.clients.close_session(session_id, receive_length);
                    }
                }
            }));
        }

        // tunnel side -> public side.
        {
            let server = Rc::downgrade(self);
            self.clients.set_observer(Box::new(move |session_id, event| {
                let server = match server.upgrade() {
                    Some(server) => server,
                    None => return,
                };
                match event {
                    SessionEvent::Receive(data) => {
                        server.external.send(session_id, data);
                    }
                    SessionEvent::Closed { wait_length } => server.external.close(session_id, wait_length),
                    SessionEvent::Failed => server.external.destroy_session(session_id),
                }
            }));
        }

        self.tunnel.start().await?;
        self.external.start().await?;
        Ok(())
    }

    pub fn stop(&self) {
        self.external.stop();
        self.tunnel.stop();
        self.clients.stop();
    }

    /// Number of authenticated tunnel clients.
    pub fn client_count(&self) -> usize {
        self.clients.client_count()
    }

    pub fn session_count(&self) -> usize {
        self.clients.session_count()
    }

    pub fn client_statuses(&self) -> Vec<client_pool::ClientStatus> {
        self.clients.client_statuses()
    }

    pub fn port_infos(&self) -> Vec<external::PortInfo> {
        self.external.port_infos()
    }

    /// Rebinds a forward port with the current options and certificate
    /// material, dropping whatever sessions it carried.
    pub async fn restart_port(&self, tunnel_index: usize) -> Result<(), Error> {
        self.external.restart_port(tunnel_index).await
    }

    /// Reactivates a forward port, optionally auto-deactivating after
    /// `timeout`.
    pub fn activate_port(&self, tunnel_index: usize, timeout: Option<Duration>) {
        self.external.activate_port(tunnel_index, timeout);
    }

    pub fn deactivate_port(&self, tunnel_index: usize) {
        self.external.set_port_status(tunnel_index, external::PortStatus::Inactive);
    }

    fn on_public_open(self: &Rc<Self>, session_id: u32, tunnel_index: usize) {
        let tunnel = &self.option.tunnels[tunnel_index];
        let opt = OpenOpt {
            host: tunnel.destination_address.clone(),
            port: tunnel.endpoint_port(),
            tls: tunnel.endpoint_tls(),
            buffer_limit: tunnel
                .client_buffer_limit_bytes()
                .clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        };

        if !self.clients.open_session(session_id, opt, &tunnel.allowed_client_names) {
            debug!("no tunnel client for forward port {}, dropping session {session_id}", tunnel.forward_port);
            self.external.destroy_session(session_id);
        }
    }
}
