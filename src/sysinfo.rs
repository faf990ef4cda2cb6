//! Host snapshot the client reports right after authenticating.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SysInfo {
    pub hostname: String,
    pub platform: &'static str,
    pub arch: &'static str,
    pub pid: u32,
    pub version: &'static str,
}

pub fn snapshot() -> SysInfo {
    SysInfo {
        hostname: hostname(),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION"),
    }
}

pub fn snapshot_value() -> serde_json::Value {
    serde_json::to_value(snapshot()).unwrap_or(serde_json::Value::Null)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serializes() {
        let value = snapshot_value();
        assert!(value.get("platform").is_some());
        assert!(value.get("pid").is_some());
    }
}
