//! The control-port listener.
//!
//! Clients dial one port for everything; the first byte tells the two kinds
//! of connection apart (`C` starts a control packet, `D` a data-connection
//! hello). Control connections run the sync/auth handshake here and are then
//! promoted into the [`ClientHandlerPool`]; data connections are handed over
//! as soon as their hello decodes.

use std::{
    cell::RefCell,
    collections::HashMap,
    io::Error,
    rc::Rc,
    time::Duration,
};

use tokio::{net::TcpListener, task::AbortHandle};
use tracing::{debug, info, warn};

use crate::{
    config::ServerOption,
    net::{
        socket::{Connection, SocketEvent},
        tls::{self, CertMaterial},
    },
    proto::{
        data_state::{DataStatePacket, DATA_SNIFF_BYTE, DATA_STATE_LEN},
        packet::{CtrlCmd, CtrlPacket, TunnelMessage, CONTROL_SNIFF_BYTE},
        streamer::CtrlPacketStreamer,
    },
    runtime::Runtime,
    server::client_pool::ClientHandlerPool,
};

/// Grace before dropping a connection that failed authentication, so the
/// rejection message can flush.
const AUTH_FAIL_DELAY: Duration = Duration::from_secs(1);

enum ConnRole {
    /// Nothing received yet; the first byte decides.
    Unknown,
    Control {
        streamer: CtrlPacketStreamer,
        ctrl_id: Option<u16>,
        authed: bool,
    },
    /// A data connection buffering up its fixed-size hello.
    DataPending { buffered: Vec<u8> },
}

#[derive(Default)]
struct ServerState {
    conns: HashMap<u32, Rc<Connection>>,
    roles: HashMap<u32, ConnRole>,
}

pub struct TunnelServer {
    runtime: Rc<Runtime>,
    option: Rc<ServerOption>,
    pool: Rc<ClientHandlerPool>,
    st: RefCell<ServerState>,
    accept_abort: RefCell<Option<AbortHandle>>,
}

impl TunnelServer {
    pub fn new(runtime: Rc<Runtime>, option: Rc<ServerOption>, pool: Rc<ClientHandlerPool>) -> Rc<TunnelServer> {
        Rc::new(TunnelServer {
            runtime,
            option,
            pool,
            st: RefCell::new(ServerState::default()),
            accept_abort: RefCell::new(None),
        })
    }

    pub async fn start(self: &Rc<Self>) -> Result<(), Error> {
        let acceptor = match self.option.tls {
            true => Some(self.build_acceptor()?),
            false => None,
        };

        let listener = TcpListener::bind(("0.0.0.0", self.option.ctrl_port)).await?;
        info!("control port {} open (tls: {})", self.option.ctrl_port, self.option.tls);

        let server = Rc::clone(self);
        let handle = tokio::task::spawn_local(async move {
            server.accept_loop(listener, acceptor).await;
        });
        *self.accept_abort.borrow_mut() = Some(handle.abort_handle());
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.accept_abort.borrow_mut().take() {
            handle.abort();
        }
        let conns = {
            let mut st = self.st.borrow_mut();
            st.roles.clear();
            std::mem::take(&mut st.conns)
        };
        for (_, conn) in conns {
            conn.clear_observer();
            conn.destroy();
        }
    }

    fn build_acceptor(&self) -> Result<tokio_rustls::TlsAcceptor, Error> {
        let material = match (&self.option.cert_pem, &self.option.key_pem) {
            (Some(cert_pem), Some(key_pem)) => CertMaterial {
                cert_pem: cert_pem.clone(),
                key_pem: key_pem.clone(),
            },
            _ => {
                warn!("control port has TLS but no cert material, using a self-signed certificate");
                CertMaterial::self_signed(vec!["localhost".into()])?
            }
        };
        tls::make_acceptor(&material)
    }

    async fn accept_loop(self: Rc<Self>, listener: TcpListener, acceptor: Option<tokio_rustls::TlsAcceptor>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!("accept failed on control port: {error}");
                    continue;
                }
            };

            let _ = stream.set_nodelay(true);
            match &acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => self.register(stream, addr.to_string(), true),
                    Err(error) => debug!("TLS accept from {addr} failed: {error}"),
                },
                None => self.register(stream, addr.to_string(), false),
            }
        }
    }

    fn register<S>(self: &Rc<Self>, stream: S, peer: String, is_tls: bool)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + 'static,
    {
        let conn = Connection::wrap(Rc::clone(&self.runtime), stream, peer, is_tls);
        let conn_id = conn.id();

        {
            let mut st = self.st.borrow_mut();
            st.conns.insert(conn_id, Rc::clone(&conn));
            st.roles.insert(conn_id, ConnRole::Unknown);
        }

        let server = Rc::clone(self);
        let observed = Rc::clone(&conn);
        conn.set_observer(Box::new(move |event| match event {
            SocketEvent::Receive(data) => server.on_receive(conn_id, &observed, data),
            SocketEvent::Closed(error) => {
                if let Some(error) = error {
                    debug!("tunnel connection {conn_id} closed: {error}");
                }
                server.on_closed(conn_id);
            }
        }));
    }

    fn on_receive(self: &Rc<Self>, conn_id: u32, conn: &Rc<Connection>, data: Vec<u8>) {
        enum Step {
            ControlPackets(Vec<CtrlPacket>),
            DataReady { hello: DataStatePacket, leftover: Vec<u8> },
            Pending,
            Bad(String),
        }

        let step = 'step: {
            let mut st = self.st.borrow_mut();
            let role = match st.roles.get_mut(&conn_id) {
                Some(role) => role,
                None => return,
            };

            if let ConnRole::Unknown = role {
                match data.first() {
                    Some(&CONTROL_SNIFF_BYTE) => {
                        *role = ConnRole::Control {
                            streamer: CtrlPacketStreamer::new(),
                            ctrl_id: None,
                            authed: false,
                        }
                    }
                    Some(&DATA_SNIFF_BYTE) => *role = ConnRole::DataPending { buffered: Vec::new() },
                    Some(&byte) => break 'step Step::Bad(format!("unrecognized first byte {byte:#04x}")),
                    None => break 'step Step::Pending,
                }
            }

            match role {
                ConnRole::Control { streamer, .. } => match streamer.read_packets(data) {
                    Ok(packets) => Step::ControlPackets(packets),
                    Err(error) => Step::Bad(error.to_string()),
                },
                ConnRole::DataPending { buffered } => {
                    buffered.extend_from_slice(&data);
                    if buffered.len() < DATA_STATE_LEN {
                        Step::Pending
                    } else {
                        match DataStatePacket::decode(buffered) {
                            Ok(Some((hello, consumed))) => Step::DataReady {
                                hello,
                                leftover: buffered.split_off(consumed),
                            },
                            Ok(None) => Step::Pending,
                            Err(error) => Step::Bad(error.to_string()),
                        }
                    }
                }
                ConnRole::Unknown => return,
            }
        };

        match step {
            Step::ControlPackets(packets) => {
                for packet in packets {
                    self.handle_ctrl_packet(conn_id, conn, packet);
                }
            }
            Step::DataReady { hello, leftover } => {
                self.drop_conn(conn_id);
                conn.clear_observer();
                debug!(
                    "data connection bound: ctrl {} handler {} session {}",
                    hello.ctrl_id, hello.handler_id, hello.first_session_id
                );
                self.pool.attach_data_conn(hello.ctrl_id, hello.handler_id, Rc::clone(conn), leftover);
            }
            Step::Pending => {}
            Step::Bad(reason) => {
                warn!("connection {conn_id} broke framing: {reason}");
                self.drop_conn(conn_id);
                conn.destroy();
            }
        }
    }

    fn handle_ctrl_packet(self: &Rc<Self>, conn_id: u32, conn: &Rc<Connection>, packet: CtrlPacket) {
        match packet.cmd {
            CtrlCmd::SyncCtrl => self.on_sync_ctrl(conn_id, conn),
            CtrlCmd::AckCtrl => self.on_ack_ctrl(conn_id, conn, &packet),
            CtrlCmd::SuccessOfOpenSession | CtrlCmd::FailOfOpenSession => {
                if !self.is_authed(conn_id) {
                    self.reject(conn_id, conn);
                    return;
                }
                let success = packet.cmd == CtrlCmd::SuccessOfOpenSession;
                self.pool.on_open_session_result(packet.session_id, success);
            }
            CtrlCmd::CloseSession => {
                if !self.is_authed(conn_id) {
                    self.reject(conn_id, conn);
                    return;
                }
                let wait_length = packet.wait_receive_length().unwrap_or(0) as u64;
                self.pool.on_client_close_session(packet.session_id, wait_length);
            }
            CtrlCmd::Message => match packet.tunnel_message() {
                Ok(TunnelMessage::SysInfo(info)) => info!("client sysinfo: {info}"),
                Ok(TunnelMessage::Log(text)) => info!("client: {text}"),
                Err(error) => debug!("unreadable client message: {error}"),
            },
            other => {
                warn!("unexpected control packet {other:?} on the server side");
                self.reject(conn_id, conn);
            }
        }
    }

    fn on_sync_ctrl(self: &Rc<Self>, conn_id: u32, conn: &Rc<Connection>) {
        let assigned = {
            let mut st = self.st.borrow_mut();
            match st.roles.get_mut(&conn_id) {
                Some(ConnRole::Control { ctrl_id, .. }) if ctrl_id.is_none() => {
                    let id = self.runtime.next_ctrl_id();
                    *ctrl_id = Some(id);
                    Some(id)
                }
                _ => None,
            }
        };

        match assigned {
            Some(ctrl_id) => {
                debug!("control connection {conn_id} assigned ctrl {ctrl_id}");
                conn.send(CtrlPacket::sync_ctrl_ack(ctrl_id).encode());
            }
            None => self.reject(conn_id, conn),
        }
    }

    fn on_ack_ctrl(self: &Rc<Self>, conn_id: u32, conn: &Rc<Connection>, packet: &CtrlPacket) {
        let (name, key) = match packet.auth() {
            Ok(auth) => auth,
            Err(error) => {
                warn!("bad AckCtrl payload: {error}");
                self.reject(conn_id, conn);
                return;
            }
        };

        let ctrl_id = {
            let st = self.st.borrow();
            match st.roles.get(&conn_id) {
                Some(ConnRole::Control { ctrl_id: Some(id), authed: false, .. }) => *id,
                _ => {
                    drop(st);
                    self.reject(conn_id, conn);
                    return;
                }
            }
        };

        if key != self.option.key {
            warn!("client '{name}' failed authentication");
            if let Ok(message) = CtrlPacket::message(ctrl_id, &TunnelMessage::Log("authorization failed".into())) {
                conn.send(message.encode());
            }
            let server = Rc::downgrade(self);
            let conn = Rc::clone(conn);
            tokio::task::spawn_local(async move {
                tokio::time::sleep(AUTH_FAIL_DELAY).await;
                if let Some(server) = server.upgrade() {
                    server.drop_conn(conn.id());
                }
                conn.destroy();
            });
            return;
        }

        {
            let mut st = self.st.borrow_mut();
            if let Some(ConnRole::Control { authed, .. }) = st.roles.get_mut(&conn_id) {
                *authed = true;
            }
        }
        self.pool.add_client(ctrl_id, Rc::clone(conn), name);
    }

    fn on_closed(self: &Rc<Self>, conn_id: u32) {
        let authed_ctrl = {
            let mut st = self.st.borrow_mut();
            st.conns.remove(&conn_id);
            match st.roles.remove(&conn_id) {
                Some(ConnRole::Control {
                    ctrl_id: Some(ctrl_id),
                    authed: true,
                    ..
                }) => Some(ctrl_id),
                _ => None,
            }
        };

        if let Some(ctrl_id) = authed_ctrl {
            self.pool.remove_client(ctrl_id);
        }
    }

    fn is_authed(&self, conn_id: u32) -> bool {
        matches!(
            self.st.borrow().roles.get(&conn_id),
            Some(ConnRole::Control { authed: true, .. })
        )
    }

    fn reject(self: &Rc<Self>, conn_id: u32, conn: &Rc<Connection>) {
        debug!("dropping connection {conn_id} for a protocol violation");
        self.drop_conn(conn_id);
        conn.destroy();
    }

    fn drop_conn(&self, conn_id: u32) {
        let mut st = self.st.borrow_mut();
        st.conns.remove(&conn_id);
        st.roles.remove(&conn_id);
    }
}
