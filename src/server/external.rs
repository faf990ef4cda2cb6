//! Public-facing listeners, one per configured forward port.
//!
//! Every accepted connection becomes a session. HTTP(S) ports wrap the
//! connection in an [`HttpHandler`] so headers and bodies are rewritten on the
//! way through; TCP ports relay bytes untouched. Close requests from the
//! tunnel carry a drain length and are honored the same way the client side
//! honors them: the connection ends only once that many bytes were written,
//! with a sweep that force-closes stragglers.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io::Error,
    rc::Rc,
    time::Duration,
};

use tokio::{net::TcpListener, task::AbortHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    config::{Protocol, ServerOption, TunnelingOption},
    http::handler::HttpHandler,
    net::{
        socket::{Connection, SendCallback, SocketEvent, SocketObserver},
        tls::{self, CertMaterial},
    },
    runtime::Runtime,
};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const CLOSE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Active,
    Inactive,
}

pub enum ExternalEvent {
    /// A public connection was accepted; the session needs a tunnel.
    Open { tunnel_index: usize },
    /// Bytes from the public side, headed for the endpoint.
    Receive(Vec<u8>),
    /// The public connection is gone. `receive_length` is how much it sent in
    /// total, or 0 when its send queue broke mid-flush.
    Closed { receive_length: u64 },
}

pub type ExternalObserver = Box<dyn FnMut(u32, ExternalEvent)>;

/// Snapshot of one forward port, for status reporting.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub forward_port: u16,
    pub status: PortStatus,
    pub session_count: usize,
    pub rx: u64,
    pub tx: u64,
}

/// A public connection, plain or HTTP-rewriting. Both variants expose the
/// same send/close/accounting surface.
#[derive(Clone)]
enum PortConn {
    Tcp(Rc<Connection>),
    Http(Rc<HttpHandler>),
}

impl PortConn {
    fn set_observer(&self, observer: SocketObserver) {
        match self {
            PortConn::Tcp(conn) => conn.set_observer(observer),
            PortConn::Http(handler) => handler.set_observer(observer),
        }
    }

    fn clear_observer(&self) {
        match self {
            PortConn::Tcp(conn) => conn.clear_observer(),
            PortConn::Http(handler) => handler.clear_observer(),
        }
    }

    fn send_with(&self, data: Vec<u8>, on_complete: Option<SendCallback>) {
        match self {
            PortConn::Tcp(conn) => conn.send_with(data, on_complete),
            PortConn::Http(handler) => handler.send_data(data, on_complete),
        }
    }

    fn send_length(&self) -> u64 {
        match self {
            PortConn::Tcp(conn) => conn.send_length(),
            PortConn::Http(handler) => handler.send_length(),
        }
    }

    fn receive_length(&self) -> u64 {
        match self {
            PortConn::Tcp(conn) => conn.receive_length(),
            PortConn::Http(handler) => handler.receive_length(),
        }
    }

    fn broke_flush(&self) -> bool {
        match self {
            PortConn::Tcp(conn) => conn.broke_flush(),
            PortConn::Http(handler) => handler.broke_flush(),
        }
    }

    fn end(&self) {
        match self {
            PortConn::Tcp(conn) => conn.end(),
            PortConn::Http(handler) => handler.end(),
        }
    }

    fn destroy(&self) {
        match self {
            PortConn::Tcp(conn) => conn.destroy(),
            PortConn::Http(handler) => handler.destroy(),
        }
    }
}

struct ExternalSession {
    conn: PortConn,
    tunnel_index: usize,
    close_wait: bool,
    end_length: u64,
    last_send: Instant,
}

#[derive(Default)]
struct PortStats {
    rx: u64,
    tx: u64,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<u32, ExternalSession>,
    observer: Option<ExternalObserver>,
    stats: Vec<PortStats>,
    statuses: Vec<PortStatus>,
}

/// The tasks serving one forward port, replaceable on restart.
#[derive(Default)]
struct PortTasks {
    accept: Option<AbortHandle>,
    deactivate_timer: Option<AbortHandle>,
}

pub struct ExternalPortServerPool {
    runtime: Rc<Runtime>,
    option: Rc<ServerOption>,
    st: RefCell<PoolState>,
    tasks: RefCell<Vec<PortTasks>>,
    sweep_abort: Cell<Option<AbortHandle>>,
}

impl ExternalPortServerPool {
    pub fn new(runtime: Rc<Runtime>, option: Rc<ServerOption>) -> Rc<ExternalPortServerPool> {
        let count = option.tunnels.len();
        let mut st = PoolState::default();
        st.stats = (0..count).map(|_| PortStats::default()).collect();
        st.statuses = vec![PortStatus::Active; count];

        Rc::new(ExternalPortServerPool {
            runtime,
            option,
            st: RefCell::new(st),
            tasks: RefCell::new((0..count).map(|_| PortTasks::default()).collect()),
            sweep_abort: Cell::new(None),
        })
    }

    pub fn set_observer(&self, observer: ExternalObserver) {
        self.st.borrow_mut().observer = Some(observer);
    }

    pub fn session_count(&self) -> usize {
        self.st.borrow().sessions.len()
    }

    pub fn port_status(&self, tunnel_index: usize) -> PortStatus {
        self.st.borrow().statuses[tunnel_index]
    }

    /// Toggles a port without touching its listener; inactive ports reject
    /// new connections but keep existing sessions alive.
    pub fn set_port_status(&self, tunnel_index: usize, status: PortStatus) {
        self.st.borrow_mut().statuses[tunnel_index] = status;
    }

    pub fn port_infos(&self) -> Vec<PortInfo> {
        let st = self.st.borrow();
        self.option
            .tunnels
            .iter()
            .enumerate()
            .map(|(index, tunnel)| PortInfo {
                forward_port: tunnel.forward_port,
                status: st.statuses[index],
                session_count: st.sessions.values().filter(|s| s.tunnel_index == index).count(),
                rx: st.stats[index].rx,
                tx: st.stats[index].tx,
            })
            .collect()
    }

    /// Binds every forward port and starts accepting. Ports with an
    /// inactivity timeout also get their deactivation timer here.
    pub async fn start(self: &Rc<Self>) -> Result<(), Error> {
        for index in 0..self.option.tunnels.len() {
            self.open_port(index).await?;
            let timeout_secs = self.option.tunnels[index].inactive_on_timeout_secs;
            if timeout_secs > 0 {
                self.arm_deactivate_timer(index, Duration::from_secs(timeout_secs));
            }
        }

        self.start_sweep();
        Ok(())
    }

    /// Rebinds a forward port: existing sessions are dropped, the old
    /// listener closed and a new one opened with the currently configured
    /// options and certificate material (freshly self-signed when none is
    /// configured). The port comes back active.
    pub async fn restart_port(self: &Rc<Self>, tunnel_index: usize) -> Result<(), Error> {
        if let Some(previous) = self.tasks.borrow_mut()[tunnel_index].accept.take() {
            previous.abort();
        }

        let stale: Vec<u32> = {
            let st = self.st.borrow();
            st.sessions
                .iter()
                .filter(|(_, s)| s.tunnel_index == tunnel_index)
                .map(|(id, _)| *id)
                .collect()
        };
        for session_id in stale {
            self.destroy_session(session_id);
            self.emit(session_id, ExternalEvent::Closed { receive_length: 0 });
        }

        self.open_port(tunnel_index).await?;
        self.st.borrow_mut().statuses[tunnel_index] = PortStatus::Active;
        Ok(())
    }

    /// Reactivates a port, optionally arming a timer that deactivates it
    /// again after `timeout`.
    pub fn activate_port(self: &Rc<Self>, tunnel_index: usize, timeout: Option<Duration>) {
        self.st.borrow_mut().statuses[tunnel_index] = PortStatus::Active;
        if let Some(previous) = self.tasks.borrow_mut()[tunnel_index].deactivate_timer.take() {
            previous.abort();
        }
        if let Some(timeout) = timeout {
            self.arm_deactivate_timer(tunnel_index, timeout);
        }
    }

    async fn open_port(self: &Rc<Self>, index: usize) -> Result<(), Error> {
        let tunnel = &self.option.tunnels[index];
        let listener = TcpListener::bind(("0.0.0.0", tunnel.forward_port)).await?;
        let acceptor = match tunnel.tls {
            true => Some(self.build_acceptor(tunnel)?),
            false => None,
        };

        info!(
            "forward port {} open ({:?} -> {}:{})",
            tunnel.forward_port,
            tunnel.protocol,
            tunnel.destination_address,
            tunnel.endpoint_port()
        );

        let pool = Rc::clone(self);
        let handle = tokio::task::spawn_local(async move {
            pool.accept_loop(index, listener, acceptor).await;
        });
        if let Some(previous) = self.tasks.borrow_mut()[index].accept.replace(handle.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn arm_deactivate_timer(self: &Rc<Self>, index: usize, timeout: Duration) {
        let forward_port = self.option.tunnels[index].forward_port;
        let pool = Rc::downgrade(self);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.st.borrow_mut().statuses[index] = PortStatus::Inactive;
                pool.tasks.borrow_mut()[index].deactivate_timer = None;
                info!("forward port {forward_port} deactivated after {timeout:?}");
            }
        });
        if let Some(previous) = self.tasks.borrow_mut()[index].deactivate_timer.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    fn build_acceptor(&self, tunnel: &TunnelingOption) -> Result<tokio_rustls::TlsAcceptor, Error> {
        let material = match (&tunnel.cert_pem, &tunnel.key_pem) {
            (Some(cert_pem), Some(key_pem)) => CertMaterial {
                cert_pem: cert_pem.clone(),
                key_pem: key_pem.clone(),
            },
            _ => {
                warn!("forward port {} has TLS but no cert material, using a self-signed certificate", tunnel.forward_port);
                CertMaterial::self_signed(vec![tunnel.destination_address.clone(), "localhost".into()])?
            }
        };
        tls::make_acceptor(&material)
    }

    async fn accept_loop(self: Rc<Self>, index: usize, listener: TcpListener, acceptor: Option<tokio_rustls::TlsAcceptor>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!("accept failed on forward port: {error}");
                    continue;
                }
            };

            if self.st.borrow().statuses[index] == PortStatus::Inactive {
                debug!("rejecting {addr}, port is inactive");
                continue;
            }

            let _ = stream.set_nodelay(true);
            match &acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => self.register_session(index, stream, addr.to_string(), true),
                    Err(error) => debug!("TLS accept from {addr} failed: {error}"),
                },
                None => self.register_session(index, stream, addr.to_string(), false),
            }
        }
    }

    fn register_session<S>(self: &Rc<Self>, index: usize, stream: S, peer: String, is_tls: bool)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + 'static,
    {
        let tunnel = &self.option.tunnels[index];
        let session_id = self.runtime.next_session_id();

        let conn = Connection::wrap(Rc::clone(&self.runtime), stream, peer, is_tls);
        conn.set_buffer_limit(tunnel.server_buffer_limit_bytes());

        let conn = match tunnel.protocol.is_http() {
            true => PortConn::Http(HttpHandler::attach(conn, http_destination(tunnel), tunnel.http.clone())),
            false => PortConn::Tcp(conn),
        };

        {
            let pool = Rc::clone(self);
            conn.set_observer(Box::new(move |event| match event {
                SocketEvent::Receive(data) => pool.on_session_receive(session_id, data),
                SocketEvent::Closed(_) => pool.on_session_closed(session_id),
            }));
        }

        self.st.borrow_mut().sessions.insert(
            session_id,
            ExternalSession {
                conn,
                tunnel_index: index,
                close_wait: false,
                end_length: 0,
                last_send: Instant::now(),
            },
        );

        debug!("session {session_id} opened on forward port {}", tunnel.forward_port);
        self.emit(session_id, ExternalEvent::Open { tunnel_index: index });
    }

    /// Bytes from the tunnel for the public connection.
    pub fn send(self: &Rc<Self>, session_id: u32, data: Vec<u8>) -> bool {
        let conn = {
            let mut st = self.st.borrow_mut();
            let (index, conn) = match st.sessions.get_mut(&session_id) {
                Some(session) => {
                    session.last_send = Instant::now();
                    (session.tunnel_index, session.conn.clone())
                }
                None => return false,
            };
            st.stats[index].tx += data.len() as u64;
            conn
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

    /// Starts close-draining: the public connection shuts down once
    /// `end_length` bytes have been written to it.
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

    /// Drops a session immediately, e.g. when no tunnel client can serve it.
    pub fn destroy_session(&self, session_id: u32) {
        if let Some(session) = self.st.borrow_mut().sessions.remove(&session_id) {
            session.conn.clear_observer();
            session.conn.destroy();
        }
    }

    pub fn stop(&self) {
        for task in self.tasks.borrow_mut().iter_mut() {
            if let Some(handle) = task.accept.take() {
                handle.abort();
            }
            if let Some(handle) = task.deactivate_timer.take() {
                handle.abort();
            }
        }
        if let Some(handle) = self.sweep_abort.take() {
            handle.abort();
        }

        let sessions = {
            let mut st = self.st.borrow_mut();
            st.observer = None;
            std::mem::take(&mut st.sessions)
        };
        for (_, session) in sessions {
            session.conn.clear_observer();
            session.conn.destroy();
        }
    }

    fn start_sweep(self: &Rc<Self>) {
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

    fn on_session_receive(self: &Rc<Self>, session_id: u32, data: Vec<u8>) {
        {
            let mut st = self.st.borrow_mut();
            let index = match st.sessions.get(&session_id) {
                Some(session) => session.tunnel_index,
                None => return,
            };
            st.stats[index].rx += data.len() as u64;
        }
        self.emit(session_id, ExternalEvent::Receive(data));
    }

    fn on_session_closed(self: &Rc<Self>, session_id: u32) {
        let session = match self.st.borrow_mut().sessions.remove(&session_id) {
            Some(session) => session,
            None => return,
        };

        let receive_length = match session.conn.broke_flush() {
            true => 0,
            false => session.conn.receive_length(),
        };
        debug!(
            "session {session_id} closed, rx {} tx {}",
            session.conn.receive_length(),
            session.conn.send_length()
        );
        self.emit(session_id, ExternalEvent::Closed { receive_length });
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
        }
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

    fn emit(&self, session_id: u32, event: ExternalEvent) {
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

/// The authority HTTP handlers rewrite toward. Default ports stay implicit so
/// `Host` headers come out the way a browser would write them.
fn http_destination(tunnel: &TunnelingOption) -> String {
    let port = tunnel.endpoint_port();
    let implicit = match tunnel.protocol {
        Protocol::Https => port == 443,
        _ => port == 80,
    };
    match implicit {
        true => tunnel.destination_address.clone(),
        false => format!("{}:{}", tunnel.destination_address, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpOption;
    use tokio::task::LocalSet;

    fn run_local<F: std::future::Future>(future: F) -> F::Output {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        LocalSet::new().block_on(&runtime, future)
    }

    fn test_runtime() -> Rc<Runtime> {
        Runtime::new(std::env::temp_dir().join("revgate-external-test"))
    }

    fn server_option(tunnels: Vec<TunnelingOption>) -> Rc<ServerOption> {
        Rc::new(ServerOption {
            ctrl_port: 0,
            key: "k".into(),
            tls: false,
            cert_pem: None,
            key_pem: None,
            global_memory_limit_mib: 8,
            tunnels,
        })
    }

    fn tunnel(protocol: Protocol, destination_port: Option<u16>) -> TunnelingOption {
        TunnelingOption {
            forward_port: 8080,
            protocol,
            destination_address: "10.0.0.2".into(),
            destination_port,
            destination_tls: false,
            tls: false,
            cert_pem: None,
            key_pem: None,
            buffer_limit_on_server: -1,
            buffer_limit_on_client: -1,
            allowed_client_names: Vec::new(),
            inactive_on_timeout_secs: 0,
            http: HttpOption::default(),
        }
    }

    #[test]
    fn destination_omits_default_ports() {
        assert_eq!(http_destination(&tunnel(Protocol::Http, None)), "10.0.0.2");
        assert_eq!(http_destination(&tunnel(Protocol::Https, Some(443))), "10.0.0.2");
        assert_eq!(http_destination(&tunnel(Protocol::Http, Some(3000))), "10.0.0.2:3000");
    }

    #[test]
    fn unmet_drain_is_force_closed_after_grace() {
        run_local(async {
            let pool = ExternalPortServerPool::new(test_runtime(), server_option(vec![tunnel(Protocol::Tcp, Some(9000))]));

            let opened = Rc::new(RefCell::new(Vec::new()));
            {
                let opened = Rc::clone(&opened);
                pool.set_observer(Box::new(move |session_id, event| {
                    if matches!(event, ExternalEvent::Open { .. }) {
                        opened.borrow_mut().push(session_id);
                    }
                }));
            }

            let (near, _far) = tokio::io::duplex(4096);
            pool.register_session(0, near, "test".into(), false);
            let session_id = opened.borrow()[0];

            // Promise far more bytes than will ever be written, so the drain
            // can never complete on its own.
            pool.close(session_id, 1_000_000);
            assert_eq!(pool.session_count(), 1);

            tokio::time::pause();
            tokio::time::advance(CLOSE_GRACE + Duration::from_secs(1)).await;
            pool.sweep();
            assert_eq!(pool.session_count(), 0);
        });
    }

    #[test]
    fn restart_rebinds_the_listener_and_drops_sessions() {
        run_local(async {
            let port = {
                let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                free.local_addr().unwrap().port()
            };
            let mut forward = tunnel(Protocol::Tcp, Some(9000));
            forward.forward_port = port;
            let pool = ExternalPortServerPool::new(test_runtime(), server_option(vec![forward]));

            let opened = Rc::new(RefCell::new(Vec::new()));
            {
                let opened = Rc::clone(&opened);
                pool.set_observer(Box::new(move |session_id, event| {
                    if matches!(event, ExternalEvent::Open { .. }) {
                        opened.borrow_mut().push(session_id);
                    }
                }));
            }

            pool.start().await.unwrap();

            let _first = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            for _ in 0..200 {
                if !opened.borrow().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(pool.session_count(), 1);

            pool.restart_port(0).await.unwrap();
            assert_eq!(pool.session_count(), 0);
            assert_eq!(pool.port_status(0), PortStatus::Active);

            // The rebound listener accepts again.
            let _second = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            for _ in 0..200 {
                if opened.borrow().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(pool.session_count(), 1);

            pool.stop();
        });
    }

    #[test]
    fn activation_timeout_deactivates_again() {
        run_local(async {
            tokio::time::pause();
            let pool = ExternalPortServerPool::new(test_runtime(), server_option(vec![tunnel(Protocol::Tcp, Some(9000))]));

            pool.set_port_status(0, PortStatus::Inactive);
            pool.activate_port(0, Some(Duration::from_secs(5)));
            assert_eq!(pool.port_status(0), PortStatus::Active);

            tokio::time::sleep(Duration::from_secs(6)).await;
            assert_eq!(pool.port_status(0), PortStatus::Inactive);
        });
    }
}
