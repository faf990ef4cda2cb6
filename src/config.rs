//! Normalized, read-only configuration.
//!
//! Options are loaded once from a JSON file at startup and handed around by
//! `Rc`; nothing mutates them afterwards. `normalize` fills protocol-derived
//! defaults (http -> port 80, https -> port 443 + TLS on the endpoint dial)
//! and rejects configs a gateway cannot run with.

use std::{
    fs,
    io::{Error, ErrorKind},
    path::Path,
    rc::Rc,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Https,
}

impl Protocol {
    pub fn is_http(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

/// Header appended (or substituted) on proxied HTTP messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomHeader {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub replace: bool,
}

/// Body rewrite rule: `from` is either a literal string or `/pattern/flags`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyRewriteRule {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOption {
    pub rewrite_host_in_text_body: bool,
    pub replace_access_control_allow_origin: bool,
    pub custom_request_headers: Vec<CustomHeader>,
    pub custom_response_headers: Vec<CustomHeader>,
    pub body_rewrite_rules: Vec<BodyRewriteRule>,
}

impl Default for HttpOption {
    fn default() -> Self {
        HttpOption {
            rewrite_host_in_text_body: true,
            replace_access_control_allow_origin: true,
            custom_request_headers: Vec::new(),
            custom_response_headers: Vec::new(),
            body_rewrite_rules: Vec::new(),
        }
    }
}

/// One public forward port and where its traffic should end up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelingOption {
    pub forward_port: u16,
    pub protocol: Protocol,
    pub destination_address: String,
    /// Defaults from the protocol when absent.
    pub destination_port: Option<u16>,
    /// TLS on the client's dial to the endpoint. https implies it.
    #[serde(default)]
    pub destination_tls: bool,
    /// TLS on the public listener. PEM material below, or self-signed.
    #[serde(default)]
    pub tls: bool,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    /// Per-connection in-memory buffer limit, in MiB. Negative disables.
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit_on_server: i32,
    #[serde(default = "default_buffer_limit")]
    pub buffer_limit_on_client: i32,
    /// Only clients with these names may serve this port. Empty allows all.
    #[serde(default)]
    pub allowed_client_names: Vec<String>,
    /// Deactivate the port this many seconds after activation; 0 keeps it up.
    #[serde(default)]
    pub inactive_on_timeout_secs: u64,
    #[serde(default)]
    pub http: HttpOption,
}

fn default_buffer_limit() -> i32 {
    -1
}

impl TunnelingOption {
    pub fn endpoint_port(&self) -> u16 {
        match self.destination_port {
            Some(port) => port,
            None => match self.protocol {
                Protocol::Https => 443,
                _ => 80,
            },
        }
    }

    pub fn endpoint_tls(&self) -> bool {
        self.destination_tls || self.protocol == Protocol::Https
    }

    /// Buffer limit fields are MiB in the config, bytes everywhere else.
    pub fn server_buffer_limit_bytes(&self) -> i64 {
        mib_to_bytes(self.buffer_limit_on_server)
    }

    pub fn client_buffer_limit_bytes(&self) -> i64 {
        mib_to_bytes(self.buffer_limit_on_client)
    }
}

fn mib_to_bytes(mib: i32) -> i64 {
    match mib < 0 {
        true => -1,
        false => mib as i64 * 1024 * 1024,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOption {
    /// Port the tunnel clients connect to.
    pub ctrl_port: u16,
    pub key: String,
    #[serde(default)]
    pub tls: bool,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    /// Process-wide in-memory send-buffer budget, in MiB.
    #[serde(default = "default_global_memory_mib")]
    pub global_memory_limit_mib: u64,
    pub tunnels: Vec<TunnelingOption>,
}

fn default_global_memory_mib() -> u64 {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOption {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub name: String,
    pub key: String,
    #[serde(default = "default_global_memory_mib")]
    pub global_memory_limit_mib: u64,
}

pub fn load_server_option(path: &Path) -> Result<Rc<ServerOption>, Error> {
    let text = fs::read_to_string(path)?;
    let mut option: ServerOption =
        serde_json::from_str(&text).map_err(|e| Error::new(ErrorKind::InvalidData, format!("bad server config: {e}")))?;
    normalize_server(&mut option)?;
    Ok(Rc::new(option))
}

pub fn load_client_option(path: &Path) -> Result<Rc<ClientOption>, Error> {
    let text = fs::read_to_string(path)?;
    let option: ClientOption =
        serde_json::from_str(&text).map_err(|e| Error::new(ErrorKind::InvalidData, format!("bad client config: {e}")))?;
    if option.name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput, "client name must not be empty"));
    }
    Ok(Rc::new(option))
}

pub fn normalize_server(option: &mut ServerOption) -> Result<(), Error> {
    if option.key.is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput, "server key must not be empty"));
    }

    let mut seen_ports = std::collections::HashSet::new();
    for tunnel in &mut option.tunnels {
        if tunnel.destination_address.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("forward port {} has no destination address", tunnel.forward_port),
            ));
        }
        if !seen_ports.insert(tunnel.forward_port) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("forward port {} is configured twice", tunnel.forward_port),
            ));
        }
        if tunnel.protocol == Protocol::Https {
            tunnel.tls = true;
        }
        if tunnel.destination_port.is_none() {
            tunnel.destination_port = Some(tunnel.endpoint_port());
        }
    }
    Ok(())
}
