//! Client end of the control channel.
//!
//! Lifecycle: `connect` dials the server and sends `SyncCtrl`; the server
//! answers `SyncCtrlAck` with the assigned control id; the client sends
//! `AckCtrl` with its name and key and, once that is on the wire, a `sysinfo`
//! message. From then on the server drives session setup: `NewDataHandler`
//! makes the client dial a fresh data connection (announced with a
//! `DataStatePacket` hello), `OpenSession` tells it which endpoint to dial,
//! and `Success`/`FailOfOpenSession` + the ack close the loop.
//!
//! Endpoint bytes that arrive before `SuccessOfOpenSessionAck` are parked in
//! a wait buffer and flushed, in order, when the ack lands. Server bytes that
//! arrive before the endpoint dial finishes are parked the same way.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use tracing::{debug, info, warn};

use crate::{
    config::ClientOption,
    net::socket::{ConnectOpt, Connection, SocketEvent},
    proto::{
        data_state::DataStatePacket,
        packet::{CtrlCmd, CtrlPacket, OpenOpt, TunnelMessage},
        streamer::CtrlPacketStreamer,
    },
    runtime::Runtime,
    sysinfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlState {
    None,
    Connecting,
    Syncing,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataHandlerState {
    Initializing,
    ConnectingEndPoint,
    /// `SuccessOfOpenSession` is on the wire; endpoint -> server sends keep
    /// parking until the ack confirms the server is relaying.
    WaitingAck,
    OnlineSession,
    Terminated,
}

pub enum CtrlEvent {
    Connected,
    /// Terminal; the owner is expected to discard this client and reconnect.
    Closed,
}

struct DataHandler {
    conn: Rc<Connection>,
    handler_id: u16,
    state: DataHandlerState,
    /// Server -> endpoint bytes received before the endpoint came online.
    receive_wait: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct Callbacks {
    on_ctrl_state: Option<Box<dyn FnMut(CtrlEvent)>>,
    on_open_endpoint: Option<Box<dyn FnMut(u32, OpenOpt)>>,
    on_endpoint_data: Option<Box<dyn FnMut(u32, Vec<u8>)>>,
    on_endpoint_close: Option<Box<dyn FnMut(u32, u64)>>,
}

struct ClientState {
    ctrl_state: CtrlState,
    ctrl: Option<Rc<Connection>>,
    streamer: CtrlPacketStreamer,
    ctrl_id: u16,
    handlers: HashMap<u32, DataHandler>,
    /// Endpoint -> server bytes waiting for the open-session ack.
    send_wait: HashMap<u32, VecDeque<Vec<u8>>>,
}

pub struct TunnelClient {
    runtime: Rc<Runtime>,
    option: Rc<ClientOption>,
    st: RefCell<ClientState>,
    callbacks: RefCell<Callbacks>,
}

impl TunnelClient {
    pub fn new(runtime: Rc<Runtime>, option: Rc<ClientOption>) -> Rc<TunnelClient> {
        Rc::new(TunnelClient {
            runtime,
            option,
            st: RefCell::new(ClientState {
                ctrl_state: CtrlState::None,
                ctrl: None,
                streamer: CtrlPacketStreamer::new(),
                ctrl_id: 0,
                handlers: HashMap::new(),
                send_wait: HashMap::new(),
            }),
            callbacks: RefCell::new(Callbacks::default()),
        })
    }

    pub fn set_on_ctrl_state(&self, callback: Box<dyn FnMut(CtrlEvent)>) {
        self.callbacks.borrow_mut().on_ctrl_state = Some(callback);
    }

    pub fn set_on_open_endpoint(&self, callback: Box<dyn FnMut(u32, OpenOpt)>) {
        self.callbacks.borrow_mut().on_open_endpoint = Some(callback);
    }

    pub fn set_on_endpoint_data(&self, callback: Box<dyn FnMut(u32, Vec<u8>)>) {
        self.callbacks.borrow_mut().on_endpoint_data = Some(callback);
    }

    pub fn set_on_endpoint_close(&self, callback: Box<dyn FnMut(u32, u64)>) {
        self.callbacks.borrow_mut().on_endpoint_close = Some(callback);
    }

    pub fn ctrl_state(&self) -> CtrlState {
        self.st.borrow().ctrl_state
    }

    /// Dials the server's control port and starts the handshake.
    pub fn connect(self: &Rc<Self>) {
        self.st.borrow_mut().ctrl_state = CtrlState::Connecting;

        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let opt = ConnectOpt {
                host: this.option.host.clone(),
                port: this.option.port,
                tls: this.option.tls,
            };

            let conn = match Connection::connect(Rc::clone(&this.runtime), &opt).await {
                Ok(conn) => conn,
                Err(error) => {
                    warn!("control dial to {}:{} failed: {error}", opt.host, opt.port);
                    this.st.borrow_mut().ctrl_state = CtrlState::None;
                    this.fire_ctrl_event(CtrlEvent::Closed);
                    return;
                }
            };

            {
                let event_handler = Rc::clone(&this);
                conn.set_observer(Box::new(move |event| event_handler.on_ctrl_event(event)));
            }
            this.st.borrow_mut().ctrl = Some(Rc::clone(&conn));

            let sync_sender = Rc::clone(&this);
            conn.send_with(
                CtrlPacket::sync_ctrl().encode(),
                Some(Box::new(move |ok| match ok {
                    true => sync_sender.st.borrow_mut().ctrl_state = CtrlState::Syncing,
                    false => debug!("SyncCtrl never made it out"),
                })),
            );
        });
    }

    pub fn shutdown(&self) {
        let (ctrl, handlers) = {
            let mut st = self.st.borrow_mut();
            st.ctrl_state = CtrlState::None;
            (st.ctrl.take(), std::mem::take(&mut st.handlers))
        };

        for (_, handler) in handlers {
            handler.conn.clear_observer();
            handler.conn.destroy();
        }
        if let Some(ctrl) = ctrl {
            ctrl.clear_observer();
            ctrl.destroy();
        }
    }

    fn on_ctrl_event(self: &Rc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Receive(data) => {
                let packets = {
                    let mut st = self.st.borrow_mut();
                    st.streamer.read_packets(data)
                };
                match packets {
                    Ok(packets) => {
                        for packet in packets {
                            self.handle_ctrl_packet(packet);
                        }
                    }
                    Err(error) => {
                        warn!("control channel framing error: {error}");
                        if let Some(ctrl) = self.ctrl_conn() {
                            ctrl.destroy();
                        }
                    }
                }
            }
            SocketEvent::Closed(error) => {
                if let Some(error) = error {
                    warn!("control channel closed: {error}");
                }
                self.on_ctrl_closed();
            }
        }
    }

    fn on_ctrl_closed(self: &Rc<Self>) {
        let handlers = {
            let mut st = self.st.borrow_mut();
            st.ctrl_state = CtrlState::None;
            st.ctrl = None;
            st.send_wait.clear();
            std::mem::take(&mut st.handlers)
        };
        for (_, handler) in handlers {
            handler.conn.clear_observer();
            handler.conn.destroy();
        }
        self.fire_ctrl_event(CtrlEvent::Closed);
    }

    fn handle_ctrl_packet(self: &Rc<Self>, packet: CtrlPacket) {
        match packet.cmd {
            CtrlCmd::SyncCtrlAck => self.on_sync_ack(packet),
            CtrlCmd::NewDataHandler => self.connect_data_handler(packet.id, packet.session_id),
            CtrlCmd::OpenSession => self.on_open_session(packet),
            CtrlCmd::SuccessOfOpenSessionAck => self.promote_data_handler(packet.session_id),
            CtrlCmd::CloseSession => self.on_close_session(packet),
            CtrlCmd::Message => match packet.tunnel_message() {
                Ok(TunnelMessage::Log(text)) => info!("server: {text}"),
                Ok(TunnelMessage::SysInfo(_)) => {}
                Err(error) => debug!("unreadable server message: {error}"),
            },
            other => warn!("unexpected control packet {other:?} on the client side"),
        }
    }

    fn on_sync_ack(self: &Rc<Self>, packet: CtrlPacket) {
        {
            let mut st = self.st.borrow_mut();
            if st.ctrl_state != CtrlState::Syncing {
                warn!("SyncCtrlAck in state {:?}, ignoring", st.ctrl_state);
                return;
            }
            st.ctrl_id = packet.id;
        }

        let ctrl = match self.ctrl_conn() {
            Some(ctrl) => ctrl,
            None => return,
        };

        let ack = CtrlPacket::ack_ctrl(packet.id, &self.option.name, &self.option.key);
        let this = Rc::clone(self);
        ctrl.send_with(
            ack.encode(),
            Some(Box::new(move |ok| {
                if !ok {
                    return;
                }
                this.st.borrow_mut().ctrl_state = CtrlState::Connected;
                this.fire_ctrl_event(CtrlEvent::Connected);
                this.send_sysinfo();
            })),
        );
    }

    fn send_sysinfo(&self) {
        let ctrl = match self.ctrl_conn() {
            Some(ctrl) => ctrl,
            None => return,
        };
        let ctrl_id = self.st.borrow().ctrl_id;
        match CtrlPacket::message(ctrl_id, &TunnelMessage::SysInfo(sysinfo::snapshot_value())) {
            Ok(packet) => ctrl.send(packet.encode()),
            Err(error) => debug!("could not serialize sysinfo: {error}"),
        }
    }

    /// Server wants a fresh physical data connection for `session_id`.
    fn connect_data_handler(self: &Rc<Self>, handler_id: u16, session_id: u32) {
        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let opt = ConnectOpt {
                host: this.option.host.clone(),
                port: this.option.port,
                tls: this.option.tls,
            };

            let conn = match Connection::connect(Rc::clone(&this.runtime), &opt).await {
                Ok(conn) => conn,
                Err(error) => {
                    warn!("data connection dial failed for session {session_id}: {error}");
                    return;
                }
            };

            {
                let event_handler = Rc::clone(&this);
                conn.set_observer(Box::new(move |event| match event {
                    SocketEvent::Receive(data) => event_handler.on_data_conn_receive(session_id, data),
                    SocketEvent::Closed(_) => event_handler.on_data_conn_closed(session_id),
                }));
            }

            this.st.borrow_mut().handlers.insert(
                session_id,
                DataHandler {
                    conn: Rc::clone(&conn),
                    handler_id,
                    state: DataHandlerState::Initializing,
                    receive_wait: VecDeque::new(),
                },
            );

            let ctrl_id = this.st.borrow().ctrl_id;
            let hello = DataStatePacket::new(ctrl_id as u32, handler_id as u32, session_id);
            let sender = Rc::clone(&this);
            conn.send_with(
                hello.encode(),
                Some(Box::new(move |ok| {
                    if !ok {
                        sender.terminate_endpoint_session(session_id);
                    }
                })),
            );
        });
    }

    /// The endpoint address for a session arrives over the control channel
    /// once the data connection is bound.
    fn on_open_session(self: &Rc<Self>, packet: CtrlPacket) {
        let opt = match packet.open_opt() {
            Ok(opt) => opt,
            Err(error) => {
                warn!("bad OpenSession payload: {error}");
                if let Some(ctrl) = self.ctrl_conn() {
                    ctrl.destroy();
                }
                return;
            }
        };

        let session_id = packet.session_id;
        {
            let mut st = self.st.borrow_mut();
            match st.handlers.get_mut(&session_id) {
                Some(handler) => handler.state = DataHandlerState::ConnectingEndPoint,
                None => {
                    warn!("OpenSession for unknown session {session_id}");
                    return;
                }
            }
        }
        self.fire_open_endpoint(session_id, opt);
    }

    /// The endpoint dialed successfully; report it and go online when the
    /// packet is confirmed sent.
    pub fn sync_endpoint_session(self: &Rc<Self>, session_id: u32) {
        let handler_id = {
            let mut st = self.st.borrow_mut();
            let state = st.handlers.get(&session_id).map(|handler| handler.state);
            match state {
                Some(DataHandlerState::ConnectingEndPoint) => {}
                // The session was torn down while the endpoint dial was in
                // flight; close the fresh endpoint connection right back.
                other => {
                    debug!("endpoint sync for session {session_id} in state {other:?}");
                    drop(st);
                    self.fire_endpoint_close(session_id, 0);
                    return;
                }
            }

            let handler_id = st.handlers[&session_id].handler_id;
            st.send_wait.entry(session_id).or_default();
            handler_id
        };

        let ctrl = match self.ctrl_conn() {
            Some(ctrl) => ctrl,
            None => return,
        };

        let this = Rc::clone(self);
        ctrl.send_with(
            CtrlPacket::open_session_result(handler_id, session_id, true).encode(),
            Some(Box::new(move |ok| match ok {
                true => this.on_success_sent(session_id),
                false => this.terminate_endpoint_session(session_id),
            })),
        );
    }

    /// `SuccessOfOpenSession` hit the wire. Server -> endpoint bytes parked
    /// during the dial can flow now; the send direction stays parked until
    /// the ack.
    fn on_success_sent(self: &Rc<Self>, session_id: u32) {
        let parked = {
            let mut st = self.st.borrow_mut();
            let handler = match st.handlers.get_mut(&session_id) {
                Some(handler) => handler,
                None => return,
            };
            if handler.state != DataHandlerState::ConnectingEndPoint {
                return;
            }
            handler.state = DataHandlerState::WaitingAck;
            std::mem::take(&mut handler.receive_wait)
        };

        for data in parked {
            self.fire_endpoint_data(session_id, data);
        }
    }

    /// The endpoint is gone. While the dial was still in flight this turns
    /// into `FailOfOpenSession`; afterwards into a close-drain request.
    pub fn close_endpoint_session(self: &Rc<Self>, session_id: u32, receive_length: u64) {
        let (handler_id, state) = {
            let st = self.st.borrow();
            match st.handlers.get(&session_id) {
                Some(handler) => (handler.handler_id, handler.state),
                None => {
                    // Dial failed before a data handler even existed; nothing
                    // to report beyond what the server's own timeout covers.
                    return;
                }
            }
        };

        let ctrl = match self.ctrl_conn() {
            Some(ctrl) => ctrl,
            None => return,
        };

        match state {
            DataHandlerState::ConnectingEndPoint => {
                {
                    let mut st = self.st.borrow_mut();
                    if let Some(handler) = st.handlers.get_mut(&session_id) {
                        handler.state = DataHandlerState::Terminated;
                    }
                }
                ctrl.send(CtrlPacket::open_session_result(handler_id, session_id, false).encode());
            }
            // WaitingAck: the server already went online when it received the
            // success packet, so the close-drain path applies.
            DataHandlerState::WaitingAck | DataHandlerState::OnlineSession => {
                let drain = receive_length.min(u32::MAX as u64) as u32;
                ctrl.send(CtrlPacket::close_session(handler_id, session_id, drain).encode());
            }
            DataHandlerState::Initializing | DataHandlerState::Terminated => {}
        }
    }

    /// Endpoint -> server data. Parked until the open-session ack when the
    /// session is not online yet.
    pub fn send_data(self: &Rc<Self>, session_id: u32, data: Vec<u8>) -> bool {
        let conn = {
            let mut st = self.st.borrow_mut();
            match st.handlers.get(&session_id) {
                Some(handler) if handler.state == DataHandlerState::OnlineSession => Rc::clone(&handler.conn),
                Some(_) => {
                    match st.send_wait.get_mut(&session_id) {
                        Some(queue) => queue.push_back(data),
                        None => {
                            st.send_wait.insert(session_id, VecDeque::from([data]));
                        }
                    }
                    return true;
                }
                None => return false,
            }
        };
        conn.send(data);
        true
    }

    /// `SuccessOfOpenSessionAck` landed: the server is relaying. Goes online
    /// and flushes the endpoint -> server wait buffer ahead of any direct
    /// sends, so nothing overtakes the parked bytes.
    fn promote_data_handler(self: &Rc<Self>, session_id: u32) {
        let (conn, parked) = {
            let mut st = self.st.borrow_mut();
            let parked = st.send_wait.remove(&session_id).unwrap_or_default();
            let conn = st.handlers.get_mut(&session_id).map(|handler| {
                if handler.state == DataHandlerState::WaitingAck {
                    handler.state = DataHandlerState::OnlineSession;
                }
                Rc::clone(&handler.conn)
            });
            (conn, parked)
        };

        let conn = match conn {
            Some(conn) => conn,
            None => return,
        };
        for data in parked {
            conn.send(data);
        }
    }

    /// Server says the public side closed with `wait_receive_length` bytes
    /// still owed to the endpoint. The data connection drains its own queue
    /// first so nothing is reordered past the close.
    fn on_close_session(self: &Rc<Self>, packet: CtrlPacket) {
        let session_id = packet.session_id;
        let wait_length = packet.wait_receive_length().unwrap_or(0) as u64;

        let conn = {
            let st = self.st.borrow();
            st.handlers.get(&session_id).map(|handler| Rc::clone(&handler.conn))
        };

        match conn {
            Some(conn) => {
                let this = Rc::clone(self);
                conn.add_once_drain_listener(Box::new(move |_| {
                    {
                        let mut st = this.st.borrow_mut();
                        if let Some(handler) = st.handlers.get_mut(&session_id) {
                            handler.state = DataHandlerState::Terminated;
                            handler.conn.set_buffer_limit(-1);
                        }
                    }
                    this.fire_endpoint_close(session_id, wait_length);
                }));
            }
            None => self.fire_endpoint_close(session_id, 0),
        }
    }

    /// Drops every trace of a session: its wait buffers and its data
    /// connection. The data connection ends gracefully so bytes already
    /// queued toward the server (counted in a promised drain length) still
    /// make it out.
    pub fn terminate_endpoint_session(self: &Rc<Self>, session_id: u32) {
        let handler = {
            let mut st = self.st.borrow_mut();
            st.send_wait.remove(&session_id);
            st.handlers.remove(&session_id)
        };
        if let Some(handler) = handler {
            handler.conn.clear_observer();
            handler.conn.end();
        }
    }

    fn on_data_conn_receive(self: &Rc<Self>, session_id: u32, data: Vec<u8>) {
        let online = {
            let mut st = self.st.borrow_mut();
            match st.handlers.get_mut(&session_id) {
                // WaitingAck: receive_wait was already flushed when the
                // success packet went out, deliver directly.
                Some(handler)
                    if matches!(
                        handler.state,
                        DataHandlerState::WaitingAck | DataHandlerState::OnlineSession
                    ) =>
                {
                    true
                }
                Some(handler) => {
                    handler.receive_wait.push_back(data);
                    return;
                }
                None => {
                    debug!("data for unknown session {session_id}, dropping {} bytes", data.len());
                    return;
                }
            }
        };
        if online {
            self.fire_endpoint_data(session_id, data);
        }
    }

    fn on_data_conn_closed(self: &Rc<Self>, session_id: u32) {
        let existed = self.st.borrow_mut().handlers.remove(&session_id).is_some();
        if existed {
            debug!("data connection for session {session_id} dropped");
            self.fire_endpoint_close(session_id, 0);
        }
    }

    fn ctrl_conn(&self) -> Option<Rc<Connection>> {
        self.st.borrow().ctrl.clone()
    }

    fn fire_ctrl_event(&self, event: CtrlEvent) {
        let callback = self.callbacks.borrow_mut().on_ctrl_state.take();
        if let Some(mut callback) = callback {
            callback(event);
            let mut callbacks = self.callbacks.borrow_mut();
            if callbacks.on_ctrl_state.is_none() {
                callbacks.on_ctrl_state = Some(callback);
            }
        }
    }

    fn fire_open_endpoint(&self, session_id: u32, opt: OpenOpt) {
        let callback = self.callbacks.borrow_mut().on_open_endpoint.take();
        if let Some(mut callback) = callback {
            callback(session_id, opt);
            let mut callbacks = self.callbacks.borrow_mut();
            if callbacks.on_open_endpoint.is_none() {
                callbacks.on_open_endpoint = Some(callback);
            }
        }
    }

    fn fire_endpoint_data(&self, session_id: u32, data: Vec<u8>) {
        let callback = self.callbacks.borrow_mut().on_endpoint_data.take();
        if let Some(mut callback) = callback {
            callback(session_id, data);
            let mut callbacks = self.callbacks.borrow_mut();
            if callbacks.on_endpoint_data.is_none() {
                callbacks.on_endpoint_data = Some(callback);
            }
        }
    }

    fn fire_endpoint_close(&self, session_id: u32, wait_length: u64) {
        let callback = self.callbacks.borrow_mut().on_endpoint_close.take();
        if let Some(mut callback) = callback {
            callback(session_id, wait_length);
            let mut callbacks = self.callbacks.borrow_mut();
            if callbacks.on_endpoint_close.is_none() {
                callbacks.on_endpoint_close = Some(callback);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::oneshot,
        task::LocalSet,
    };

    use crate::proto::data_state::DATA_STATE_LEN;

    fn run_local<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        LocalSet::new().block_on(&runtime, future)
    }

    fn test_runtime() -> Rc<Runtime> {
        Runtime::new(std::env::temp_dir().join("revgate-tunnel-test"))
    }

    fn client_option(port: u16) -> Rc<ClientOption> {
        Rc::new(ClientOption {
            host: "127.0.0.1".into(),
            port,
            tls: false,
            name: "test-client".into(),
            key: "test-key".into(),
            global_memory_limit_mib: 8,
        })
    }

    /// Next non-Message control packet from the fake server's side.
    async fn read_packet(
        stream: &mut TcpStream,
        streamer: &mut CtrlPacketStreamer,
        queue: &mut VecDeque<CtrlPacket>,
    ) -> CtrlPacket {
        loop {
            while let Some(packet) = queue.pop_front() {
                if packet.cmd != CtrlCmd::Message {
                    return packet;
                }
            }
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "control stream ended early");
            buf.truncate(n);
            queue.extend(streamer.read_packets(buf).unwrap());
        }
    }

    #[test]
    fn parked_sends_stay_parked_until_the_ack() {
        run_local(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (ack_tx, ack_rx) = oneshot::channel::<()>();

            let opt = OpenOpt {
                host: "10.0.0.2".into(),
                port: 80,
                tls: false,
                buffer_limit: -1,
            };

            // Fake server: full handshake, one session, ack withheld until the
            // test says so, then read what the data connection delivers.
            let server = tokio::task::spawn_local(async move {
                let (mut ctrl, _) = listener.accept().await.unwrap();
                let mut streamer = CtrlPacketStreamer::new();
                let mut queue = VecDeque::new();

                let packet = read_packet(&mut ctrl, &mut streamer, &mut queue).await;
                assert_eq!(packet.cmd, CtrlCmd::SyncCtrl);
                ctrl.write_all(&CtrlPacket::sync_ctrl_ack(9).encode()).await.unwrap();

                let packet = read_packet(&mut ctrl, &mut streamer, &mut queue).await;
                assert_eq!(packet.cmd, CtrlCmd::AckCtrl);
                ctrl.write_all(&CtrlPacket::new_data_handler(500, 77).encode()).await.unwrap();

                let (mut data, _) = listener.accept().await.unwrap();
                let mut hello = [0u8; DATA_STATE_LEN];
                data.read_exact(&mut hello).await.unwrap();
                let (hello, _) = DataStatePacket::decode(&hello).unwrap().unwrap();
                assert_eq!(hello.handler_id, 500);
                assert_eq!(hello.first_session_id, 77);

                ctrl.write_all(&CtrlPacket::open_session(500, 77, &opt).encode()).await.unwrap();
                let packet = read_packet(&mut ctrl, &mut streamer, &mut queue).await;
                assert_eq!(packet.cmd, CtrlCmd::SuccessOfOpenSession);

                ack_rx.await.unwrap();
                ctrl.write_all(&CtrlPacket::open_session_ack(500, 77).encode()).await.unwrap();

                let mut relayed = [0u8; 2];
                data.read_exact(&mut relayed).await.unwrap();
                relayed
            });

            let client = TunnelClient::new(test_runtime(), client_option(port));
            let opened = Rc::new(RefCell::new(Vec::new()));
            {
                let opened = Rc::clone(&opened);
                client.set_on_open_endpoint(Box::new(move |session_id, _| {
                    opened.borrow_mut().push(session_id);
                }));
            }
            client.connect();

            for _ in 0..200 {
                if !opened.borrow().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(*opened.borrow(), vec![77]);

            // Endpoint dialed; the first byte arrives before the success
            // packet is even on the wire.
            client.sync_endpoint_session(77);
            assert!(client.send_data(77, b"A".to_vec()));

            // Let the success packet flush, then send a second byte. It must
            // park behind "A" until the ack, not jump the queue.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(client.send_data(77, b"B".to_vec()));
            assert_eq!(client.st.borrow().send_wait.get(&77).map(|q| q.len()), Some(2));

            ack_tx.send(()).unwrap();
            let relayed = server.await.unwrap();
            assert_eq!(&relayed, b"AB");

            client.shutdown();
        });
    }
}
