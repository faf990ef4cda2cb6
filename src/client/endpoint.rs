//! Pool of connections to the local endpoints the tunnel delivers to.
//!
//! One endpoint connection per session. Close requests carry a drain length:
//! the number of bytes the public side received that still have to reach the
//! endpoint; the connection only closes once that many bytes were written
//! (swept every [`SWEEP_INTERVAL`], force-closed after [`CLOSE_GRACE`]).

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
    time::Duration,
};

use tokio::{task::AbortHandle, time::Instant};
use tracing::{debug, warn};

use crate::{
    net::socket::{ConnectOpt, Connection, SocketEvent},
    proto::packet::OpenOpt,
    runtime::Runtime,
};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const CLOSE_GRACE: Duration = Duration::from_secs(60);

pub enum EndpointEvent {
    /// The dial succeeded; the session can be synced with the server.
    Connected,
    /// Bytes from the endpoint, headed for the tunnel.
    Receive(Vec<u8>),
    /// The endpoint connection is gone. `receive_length` is how many bytes it
    /// produced in total, or 0 when its own send queue broke mid-flush.
    Closed { receive_length: u64 },
}

pub type EndpointObserver = Box<dyn FnMut(u32, EndpointEvent)>;

struct EndpointSession {
    conn: Rc<Connection>,
    close_wait: bool,
    end_length: u64,
    last_send: Instant,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<u32, EndpointSession>,
    observer: Option<EndpointObserver>,
    on_terminate: Option<Box<dyn FnMut(u32)>>,
}

pub struct EndPointClientPool {
    runtime: Rc<Runtime>,
    st: RefCell<PoolState>,
    sweep_abort: Cell<Option<AbortHandle>>,
}

impl EndPointClientPool {
    pub fn new(runtime: Rc<Runtime>) -> Rc<EndPointClientPool> {
        Rc::new(EndPointClientPool {
            runtime,
            st: RefCell::new(PoolState::default()),
            sweep_abort: Cell::new(None),
        })
    }

    pub fn set_observer(&self, observer: EndpointObserver) {
        self.st.borrow_mut().observer = Some(observer);
    }

    pub fn set_on_terminate(&self, callback: Box<dyn FnMut(u32)>) {
        self.st.borrow_mut().on_terminate = Some(callback);
    }

    pub fn session_count(&self) -> usize {
        self.st.borrow().sessions.len()
    }

    pub fn start_sweep(self: &Rc<Self>) {
        let pool = Rc::downgrade(self);
        let handle = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let pool = match pool.upgrade() {
                    Some(pool) => pool,
                    None => return,
                };
                pool.sweep();
            }
        });
        self.sweep_abort.set(Some(handle.abort_handle()));
    }

    /// Dials the endpoint for `session_id`. Emits `Connected` on success or
    /// `Closed {0}` when the dial fails (which the tunnel reports as a failed
    /// session open).
    pub fn open(self: &Rc<Self>, session_id: u32, opt: OpenOpt) {
        let pool = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let connect = ConnectOpt {
                host: opt.host.clone(),
                port: opt.port,
                tls: opt.tls,
            };

            let conn = match Connection::connect(Rc::clone(&pool.runtime), &connect).await {
                Ok(conn) => conn,
                Err(error) => {
                    debug!("endpoint dial {}:{} failed for session {session_id}: {error}", opt.host, opt.port);
                    pool.emit(session_id, EndpointEvent::Closed { receive_length: 0 });
                    return;
                }
            };

            conn.set_buffer_limit(opt.buffer_limit as i64);
            {
                let observer_pool = Rc::clone(&pool);
                let observed = Rc::clone(&conn);
                conn.set_observer(Box::new(move |event| match event {
                    SocketEvent::Receive(data) => {
                        observer_pool.emit(session_id, EndpointEvent::Receive(data));
                    }
                    SocketEvent::Closed(_) => {
                        observer_pool.on_conn_closed(session_id, &observed);
                    }
                }));
            }

            pool.st.borrow_mut().sessions.insert(
                session_id,
                EndpointSession {
                    conn,
                    close_wait: false,
                    end_length: 0,
                    last_send: Instant::now(),
                },
            );
            pool.emit(session_id, EndpointEvent::Connected);
        });
    }

    /// Bytes from the tunnel for the endpoint.
    pub fn send(self: &Rc<Self>, session_id: u32, data: Vec<u8>) -> bool {
        {
            let mut st = self.st.borrow_mut();
            let session = match st.sessions.get_mut(&session_id) {
                Some(session) => session,
                None => return false,
            };
            session.last_send = Instant::now();
        }

        let conn = match self.session_conn(session_id) {
            Some(conn) => conn,
            None => return false,
        };

        let pool = Rc::downgrade(self);
        conn.send_with(
            data,
            Some(Box::new(move |ok| {
                if ok {
                    if let Some(pool) = pool.upgrade() {
                        pool.check_close(session_id, false);
                    }
                }
            })),
        );
        true
    }

    /// Starts close-draining: the connection shuts down once `end_length`
    /// bytes have been written to the endpoint.
    pub fn close(self: &Rc<Self>, session_id: u32, end_length: u64) {
        {
            let mut st = self.st.borrow_mut();
            let session = match st.sessions.get_mut(&session_id) {
                Some(session) => session,
                None => return,
            };
            session.close_wait = true;
            session.end_length = end_length;
            session.last_send = Instant::now();
        }
        self.check_close(session_id, false);
    }

    pub fn close_all(&self) {
        if let Some(handle) = self.sweep_abort.take() {
            handle.abort();
        }

        let sessions = {
            let mut st = self.st.borrow_mut();
            st.observer = None;
            st.on_terminate = None;
            std::mem::take(&mut st.sessions)
        };
        for (_, session) in sessions {
            session.conn.clear_observer();
            session.conn.destroy();
        }
    }

    fn session_conn(&self, session_id: u32) -> Option<Rc<Connection>> {
        self.st.borrow().sessions.get(&session_id).map(|s| Rc::clone(&s.conn))
    }

    fn check_close(self: &Rc<Self>, session_id: u32, force: bool) {
        let conn = {
            let mut st = self.st.borrow_mut();
            let session = match st.sessions.get(&session_id) {
                Some(session) => session,
                None => return,
            };

            let satisfied = session.close_wait && session.end_length <= session.conn.send_length();
            if !satisfied && !force {
                return;
            }
            st.sessions.remove(&session_id).map(|s| s.conn)
        };

        if let Some(conn) = conn {
            conn.clear_observer();
            match force {
                true => conn.destroy(),
                false => conn.end(),
            }
            self.fire_terminate(session_id);
        }
    }

    fn on_conn_closed(self: &Rc<Self>, session_id: u32, conn: &Rc<Connection>) {
        let known = self.st.borrow_mut().sessions.remove(&session_id).is_some();
        if !known {
            return;
        }

        let receive_length = match conn.broke_flush() {
            true => 0,
            false => conn.receive_length(),
        };
        self.emit(session_id, EndpointEvent::Closed { receive_length });
        self.fire_terminate(session_id);
    }

    fn sweep(self: &Rc<Self>) {
        let now = Instant::now();
        let expired: Vec<u32> = {
            let st = self.st.borrow();
            st.sessions
                .iter()
                .filter(|(_, s)| s.close_wait && now.duration_since(s.last_send) > CLOSE_GRACE)
                .map(|(id, _)| *id)
                .collect()
        };

        for session_id in expired {
            warn!("session {session_id} exceeded its close grace period, dropping");
            self.check_close(session_id, true);
        }
    }

    fn emit(&self, session_id: u32, event: EndpointEvent) {
        let observer = self.st.borrow_mut().observer.take();
        if let Some(mut observer) = observer {
            observer(session_id, event);
            let mut st = self.st.borrow_mut();
            if st.observer.is_none() {
                st.observer = Some(observer);
            }
        }
    }

    fn fire_terminate(&self, session_id: u32) {
        let callback = self.st.borrow_mut().on_terminate.take();
        if let Some(mut callback) = callback {
            callback(session_id);
            let mut st = self.st.borrow_mut();
            if st.on_terminate.is_none() {
                st.on_terminate = Some(callback);
            }
        }
    }
}
