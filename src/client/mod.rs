//! Client side of the gateway: the control-channel state machine
//! ([`tunnel::TunnelClient`]), the endpoint dialing pool
//! ([`endpoint::EndPointClientPool`]) and the [`TttClient`] glue that wires
//! them together and reconnects when the control channel drops.

pub mod endpoint;
pub mod tunnel;

use std::{cell::Cell, cell::RefCell, rc::Rc, time::Duration};

use tracing::{info, warn};

use crate::{
    client::{
        endpoint::{EndPointClientPool, EndpointEvent},
        tunnel::{CtrlEvent, TunnelClient},
    },
    config::ClientOption,
    runtime::Runtime,
};

/// How long to wait before redialing the server after the control channel
/// goes down.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct ActiveClient {
    tunnel: Rc<TunnelClient>,
    endpoints: Rc<EndPointClientPool>,
}

pub struct TttClient {
    runtime: Rc<Runtime>,
    option: Rc<ClientOption>,
    active: RefCell<Option<ActiveClient>>,
    stopped: Cell<bool>,
}

impl TttClient {
    pub fn new(runtime: Rc<Runtime>, option: Rc<ClientOption>) -> Rc<TttClient> {
        Rc::new(TttClient {
            runtime,
            option,
            active: RefCell::new(None),
            stopped: Cell::new(false),
        })
    }

    /// Builds a fresh tunnel client + endpoint pool pair and dials the
    /// server. Called again (after [`RECONNECT_DELAY`]) every time the
    /// control channel is lost.
    pub fn start(self: &Rc<Self>) {
        if self.stopped.get() {
            return;
        }

        let tunnel = TunnelClient::new(Rc::clone(&self.runtime), Rc::clone(&self.option));
        let endpoints = EndPointClientPool::new(Rc::clone(&self.runtime));
        endpoints.start_sweep();

        // tunnel -> endpoints wiring. The pool is owned by these closures;
        // the reverse direction holds only a weak tunnel reference so the
        // pair can be dropped on reconnect.
        {
            let this = Rc::downgrade(self);
            tunnel.set_on_ctrl_state(Box::new(move |event| match event {
                CtrlEvent::Connected => info!("control channel established"),
                CtrlEvent::Closed => {
                    if let Some(this) = this.upgrade() {
                        this.on_ctrl_closed();
                    }
                }
            }));
        }
        {
            let endpoints = Rc::clone(&endpoints);
            tunnel.set_on_open_endpoint(Box::new(move |session_id, opt| {
                endpoints.open(session_id, opt);
            }));
        }
        {
            let endpoints = Rc::clone(&endpoints);
            tunnel.set_on_endpoint_data(Box::new(move |session_id, data| {
                endpoints.send(session_id, data);
            }));
        }
        {
            let endpoints = Rc::clone(&endpoints);
            tunnel.set_on_endpoint_close(Box::new(move |session_id, wait_length| {
                endpoints.close(session_id, wait_length);
            }));
        }

        // endpoints -> tunnel wiring.
        {
            let tunnel = Rc::downgrade(&tunnel);
            endpoints.set_observer(Box::new(move |session_id, event| {
                let tunnel = match tunnel.upgrade() {
                    Some(tunnel) => tunnel,
                    None => return,
                };
                match event {
                    EndpointEvent::Connected => tunnel.sync_endpoint_session(session_id),
                    EndpointEvent::Receive(data) => {
                        tunnel.send_data(session_id, data);
                    }
                    EndpointEvent::Closed { receive_length } => {
                        tunnel.close_endpoint_session(session_id, receive_length)
                    }
                }
            }));
        }
        {
            let tunnel = Rc::downgrade(&tunnel);
            endpoints.set_on_terminate(Box::new(move |session_id| {
                if let Some(tunnel) = tunnel.upgrade() {
                    tunnel.terminate_endpoint_session(session_id);
                }
            }));
        }

        tunnel.connect();
        *self.active.borrow_mut() = Some(ActiveClient { tunnel, endpoints });
    }

    fn on_ctrl_closed(self: &Rc<Self>) {
        if let Some(active) = self.active.borrow_mut().take() {
            active.endpoints.close_all();
        }

        if self.stopped.get() {
            return;
        }

        warn!("control channel lost, reconnecting in {RECONNECT_DELAY:?}");
        let this = Rc::downgrade(self);
        tokio::task::spawn_local(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            if let Some(this) = this.upgrade() {
                this.start();
            }
        });
    }

    pub fn stop(&self) {
        self.stopped.set(true);
        if let Some(active) = self.active.borrow_mut().take() {
            active.endpoints.close_all();
            active.tunnel.shutdown();
        }
    }
}
