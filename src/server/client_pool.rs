//! Authenticated tunnel clients and the sessions routed through them.
//!
//! The pool owns everything between the public listener and the wire: which
//! control connection serves which forward port (round-robin over the allowed
//! names), the per-session data connections, and the open-session handshake.
//! Public bytes that arrive before a session comes online are parked and
//! flushed in order at promotion.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use tracing::{debug, info, warn};

use crate::{
    net::socket::{Connection, SocketEvent},
    proto::packet::{CtrlPacket, OpenOpt},
    runtime::Runtime,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// `NewDataHandler` sent, waiting for the client to dial back.
    WaitingDataConn,
    /// Data connection bound, `OpenSession` sent, endpoint dial in flight.
    ConnectingEndPoint,
    OnlineSession,
}

/// Snapshot of one registered tunnel client, for status reporting.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub ctrl_id: u16,
    pub name: String,
    pub peer: String,
    pub session_count: usize,
}

pub enum SessionEvent {
    /// Bytes from the endpoint, headed for the public side.
    Receive(Vec<u8>),
    /// The endpoint closed; the public side still has `wait_length` bytes of
    /// endpoint output to deliver before closing.
    Closed { wait_length: u64 },
    /// The session could not be established or its tunnel died mid-flight.
    Failed,
}

struct ServerSession {
    ctrl_id: u16,
    handler_id: u16,
    state: SessionState,
    opt: OpenOpt,
    data_conn: Option<Rc<Connection>>,
    /// Public -> endpoint bytes parked until the session is online.
    send_wait: VecDeque<Vec<u8>>,
}

struct ClientHandler {
    conn: Rc<Connection>,
    name: String,
    session_count: usize,
}

#[derive(Default)]
struct PoolState {
    clients: HashMap<u16, ClientHandler>,
    /// Insertion order, for round-robin selection.
    client_order: Vec<u16>,
    sessions: HashMap<u32, ServerSession>,
    handler_index: HashMap<u16, u32>,
    observer: Option<Box<dyn FnMut(u32, SessionEvent)>>,
}

pub struct ClientHandlerPool {
    runtime: Rc<Runtime>,
    st: RefCell<PoolState>,
    select_index: Cell<usize>,
}

impl ClientHandlerPool {
    pub fn new(runtime: Rc<Runtime>) -> Rc<ClientHandlerPool> {
        Rc::new(ClientHandlerPool {
            runtime,
            st: RefCell::new(PoolState::default()),
            select_index: Cell::new(0),
        })
    }

    pub fn set_observer(&self, observer: Box<dyn FnMut(u32, SessionEvent)>) {
        self.st.borrow_mut().observer = Some(observer);
    }

    pub fn client_count(&self) -> usize {
        self.st.borrow().clients.len()
    }

    pub fn session_count(&self) -> usize {
        self.st.borrow().sessions.len()
    }

    /// Snapshot of every registered client, for status reporting.
    pub fn client_statuses(&self) -> Vec<ClientStatus> {
        let st = self.st.borrow();
        st.client_order
            .iter()
            .filter_map(|ctrl_id| {
                st.clients.get(ctrl_id).map(|client| ClientStatus {
                    ctrl_id: *ctrl_id,
                    name: client.name.clone(),
                    peer: client.conn.peer().to_string(),
                    session_count: client.session_count,
                })
            })
            .collect()
    }

    /// Promotes an authenticated control connection into the pool.
    pub fn add_client(&self, ctrl_id: u16, conn: Rc<Connection>, name: String) {
        info!("tunnel client '{name}' registered (ctrl {ctrl_id})");
        let mut st = self.st.borrow_mut();
        st.client_order.push(ctrl_id);
        st.clients.insert(
            ctrl_id,
            ClientHandler {
                conn,
                name,
                session_count: 0,
            },
        );
    }

    /// Removes a control connection and fails every session it carried.
    pub fn remove_client(self: &Rc<Self>, ctrl_id: u16) {
        let (name, orphans) = {
            let mut st = self.st.borrow_mut();
            let name = match st.clients.remove(&ctrl_id) {
                Some(client) => client.name,
                None => return,
            };
            st.client_order.retain(|id| *id != ctrl_id);

            let orphans: Vec<u32> = st
                .sessions
                .iter()
                .filter(|(_, s)| s.ctrl_id == ctrl_id)
                .map(|(id, _)| *id)
                .collect();
            (name, orphans)
        };

        info!("tunnel client '{name}' disconnected (ctrl {ctrl_id}), dropping {} sessions", orphans.len());
        for session_id in orphans {
            self.release_session(session_id, true);
            self.emit(session_id, SessionEvent::Failed);
        }
    }

    /// Picks a client for a new session and asks it to dial a data
    /// connection. Returns false when no registered client may serve the
    /// port.
    pub fn open_session(self: &Rc<Self>, session_id: u32, opt: OpenOpt, allowed_names: &[String]) -> bool {
        let (ctrl_id, conn, handler_id) = {
            let mut st = self.st.borrow_mut();
            let ctrl_id = match self.select_client(&st, allowed_names) {
                Some(ctrl_id) => ctrl_id,
                None => return false,
            };

            let handler_id = self.runtime.next_handler_id();
            st.handler_index.insert(handler_id, session_id);
            st.sessions.insert(
                session_id,
                ServerSession {
                    ctrl_id,
                    handler_id,
                    state: SessionState::WaitingDataConn,
                    opt,
                    data_conn: None,
                    send_wait: VecDeque::new(),
                },
            );

            let client = st.clients.get_mut(&ctrl_id).expect("selected client exists");
            client.session_count += 1;
            (ctrl_id, Rc::clone(&client.conn), handler_id)
        };

        debug!("session {session_id} -> ctrl {ctrl_id}, handler {handler_id}");
        conn.send(CtrlPacket::new_data_handler(handler_id, session_id).encode());
        true
    }

    /// A fresh data connection announced itself. Binds it to its session and
    /// sends `OpenSession` so the client dials the endpoint.
    pub fn attach_data_conn(self: &Rc<Self>, ctrl_id: u32, handler_id: u32, conn: Rc<Connection>, leftover: Vec<u8>) {
        let bound = {
            let mut st = self.st.borrow_mut();
            let session_id = match st.handler_index.get(&(handler_id as u16)) {
                Some(session_id) => *session_id,
                None => {
                    warn!("data connection for unknown handler {handler_id}");
                    conn.destroy();
                    return;
                }
            };
            let session = st.sessions.get_mut(&session_id).expect("indexed session exists");
            if session.ctrl_id as u32 != ctrl_id || session.state != SessionState::WaitingDataConn {
                warn!("data connection for session {session_id} does not match its handshake");
                conn.destroy();
                return;
            }

            session.state = SessionState::ConnectingEndPoint;
            session.data_conn = Some(Rc::clone(&conn));
            let session_ctrl_id = session.ctrl_id;
            let handler_id = session.handler_id;
            let opt = session.opt.clone();
            let ctrl = st.clients.get(&session_ctrl_id).map(|c| Rc::clone(&c.conn));
            (session_id, handler_id, opt, ctrl)
        };
        let (session_id, handler_id, opt, ctrl) = bound;

        {
            let pool = Rc::clone(self);
            let observed = Rc::clone(&conn);
            conn.set_observer(Box::new(move |event| match event {
                SocketEvent::Receive(data) => pool.emit(session_id, SessionEvent::Receive(data)),
                SocketEvent::Closed(_) => pool.on_data_conn_closed(session_id, &observed),
            }));
        }

        if !leftover.is_empty() {
            self.emit(session_id, SessionEvent::Receive(leftover));
        }

        match ctrl {
            Some(ctrl) => ctrl.send(CtrlPacket::open_session(handler_id, session_id, &opt).encode()),
            None => {
                self.release_session(session_id, true);
                self.emit(session_id, SessionEvent::Failed);
            }
        }
    }

    /// `SuccessOfOpenSession` / `FailOfOpenSession` from a client.
    pub fn on_open_session_result(self: &Rc<Self>, session_id: u32, success: bool) {
        if !success {
            debug!("endpoint dial failed for session {session_id}");
            self.release_session(session_id, true);
            self.emit(session_id, SessionEvent::Failed);
            return;
        }

        let (ctrl, handler_id, parked) = {
            let mut st = self.st.borrow_mut();
            let session = match st.sessions.get_mut(&session_id) {
                Some(session) => session,
                None => return,
            };
            if session.state != SessionState::ConnectingEndPoint {
                warn!("open-session result for session {session_id} in state {:?}", session.state);
                return;
            }
            session.state = SessionState::OnlineSession;
            let parked = std::mem::take(&mut session.send_wait);
            let handler_id = session.handler_id;
            let session_ctrl_id = session.ctrl_id;
            let ctrl = st.clients.get(&session_ctrl_id).map(|c| Rc::clone(&c.conn));
            (ctrl, handler_id, parked)
        };

        if let Some(ctrl) = ctrl {
            ctrl.send(CtrlPacket::open_session_ack(handler_id, session_id).encode());
        }
        for data in parked {
            self.send_session_data(session_id, data);
        }
    }

    /// Public -> endpoint bytes. Parked while the session handshake is still
    /// in flight.
    pub fn send_session_data(self: &Rc<Self>, session_id: u32, data: Vec<u8>) -> bool {
        let conn = {
            let mut st = self.st.borrow_mut();
            match st.sessions.get_mut(&session_id) {
                Some(session) if session.state == SessionState::OnlineSession => {
                    match &session.data_conn {
                        Some(conn) => Rc::clone(conn),
                        None => return false,
                    }
                }
                Some(session) => {
                    session.send_wait.push_back(data);
                    return true;
                }
                None => return false,
            }
        };
        conn.send(data);
        true
    }

    /// The public connection closed with `receive_length` bytes that still
    /// have to reach the endpoint. Tells the client to drain, then flushes
    /// and ends the data connection.
    pub fn close_session(self: &Rc<Self>, session_id: u32, receive_length: u64) {
        let (ctrl, handler_id, data_conn, was_online) = {
            let st = self.st.borrow();
            let session = match st.sessions.get(&session_id) {
                Some(session) => session,
                None => return,
            };
            (
                st.clients.get(&session.ctrl_id).map(|c| Rc::clone(&c.conn)),
                session.handler_id,
                session.data_conn.clone(),
                session.state == SessionState::OnlineSession,
            )
        };

        if let Some(ctrl) = ctrl {
            match was_online {
                true => {
                    let drain = receive_length.min(u32::MAX as u64) as u32;
                    ctrl.send(CtrlPacket::close_session(handler_id, session_id, drain).encode());
                }
                // Never came online: the client has nothing to drain, just
                // tear the handshake down.
                false => ctrl.send(CtrlPacket::close_session(handler_id, session_id, 0).encode()),
            }
        }

        self.forget_session(session_id);
        if let Some(conn) = data_conn {
            conn.clear_observer();
            conn.end();
        }
    }

    /// `CloseSession` from a client: the endpoint closed. The data connection
    /// drains whatever is still queued toward the client before ending.
    pub fn on_client_close_session(self: &Rc<Self>, session_id: u32, wait_length: u64) {
        let data_conn = {
            let st = self.st.borrow();
            match st.sessions.get(&session_id) {
                Some(session) => session.data_conn.clone(),
                None => return,
            }
        };

        self.forget_session(session_id);
        if let Some(conn) = data_conn {
            conn.clear_observer();
            conn.end();
        }
        self.emit(session_id, SessionEvent::Closed { wait_length });
    }

    pub fn stop(&self) {
        let (clients, sessions) = {
            let mut st = self.st.borrow_mut();
            st.observer = None;
            st.client_order.clear();
            st.handler_index.clear();
            (std::mem::take(&mut st.clients), std::mem::take(&mut st.sessions))
        };

        for (_, session) in sessions {
            if let Some(conn) = session.data_conn {
                conn.clear_observer();
                conn.destroy();
            }
        }
        for (_, client) in clients {
            client.conn.clear_observer();
            client.conn.destroy();
        }
    }

    fn on_data_conn_closed(self: &Rc<Self>, session_id: u32, conn: &Rc<Connection>) {
        let known = self.st.borrow().sessions.contains_key(&session_id);
        if !known {
            return;
        }

        let wait_length = match conn.broke_flush() {
            true => 0,
            false => conn.receive_length(),
        };
        debug!("data connection for session {session_id} dropped");
        self.forget_session(session_id);
        self.emit(session_id, SessionEvent::Closed { wait_length });
    }

    /// Round-robin over registered clients, restricted to `allowed_names`
    /// when the port carries an allow-list.
    fn select_client(&self, st: &PoolState, allowed_names: &[String]) -> Option<u16> {
        let eligible: Vec<u16> = st
            .client_order
            .iter()
            .copied()
            .filter(|ctrl_id| match st.clients.get(ctrl_id) {
                Some(client) => allowed_names.is_empty() || allowed_names.contains(&client.name),
                None => false,
            })
            .collect();

        if eligible.is_empty() {
            return None;
        }

        let index = self.select_index.get();
        self.select_index.set(index.wrapping_add(1));
        Some(eligible[index % eligible.len()])
    }

    fn release_session(self: &Rc<Self>, session_id: u32, destroy: bool) {
        let data_conn = {
            let st = self.st.borrow();
            st.sessions.get(&session_id).and_then(|s| s.data_conn.clone())
        };
        self.forget_session(session_id);
        if let Some(conn) = data_conn {
            conn.clear_observer();
            match destroy {
                true => conn.destroy(),
                false => conn.end(),
            }
        }
    }

    fn forget_session(&self, session_id: u32) {
        let mut st = self.st.borrow_mut();
        if let Some(session) = st.sessions.remove(&session_id) {
            st.handler_index.remove(&session.handler_id);
            if let Some(client) = st.clients.get_mut(&session.ctrl_id) {
                client.session_count = client.session_count.saturating_sub(1);
            }
        }
    }

    fn emit(&self, session_id: u32, event: SessionEvent) {
        let observer = self.st.borrow_mut().observer.take();
        if let Some(mut observer) = observer {
            observer(session_id, event);
            let mut st = self.st.borrow_mut();
            if st.observer.is_none() {
                st.observer = Some(observer);
            }
        }
    }
}
