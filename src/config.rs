//! Runtime configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;

use directories::ProjectDirs;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "droplink";
const APP_NAME: &str = "droplink";

const UPLOAD_DIR_ENV: &str = "UPLOAD_DIR";
const BASE_URL_ENV: &str = "APP_BASE_URL";
const HTTP_PORT_ENV: &str = "HTTP_PORT";

/// Default HTTP port for the share surface
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Directory where uploaded artifacts are written.
///
/// `UPLOAD_DIR` overrides; otherwise the platform data dir is used, with a
/// relative `uploads/` as last resort.
pub fn get_upload_dir() -> PathBuf {
    if let Ok(dir) = env::var(UPLOAD_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.data_dir().join("uploads"))
        .unwrap_or_else(|| PathBuf::from("uploads"))
}

/// HTTP port for the share surface (`HTTP_PORT` override)
pub fn get_http_port() -> u16 {
    env::var(HTTP_PORT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HTTP_PORT)
}

/// Base URL advertised in share links.
///
/// `APP_BASE_URL` overrides; otherwise built from the best local IPv4.
pub fn get_base_url(port: u16) -> String {
    if let Ok(base) = env::var(BASE_URL_ENV) {
        if !base.is_empty() {
            return base.trim_end_matches('/').to_string();
        }
    }
    format!("http://{}:{}", local_lan_ip(), port)
}

/// Pick a local IP for share links, prioritizing LAN ranges
/// (192.168.x.x, 10.x.x.x, 172.16.x.x)
fn local_lan_ip() -> String {
    local_ip_address::list_afinet_netifas()
        .ok()
        .and_then(|ips| {
            let mut best_ip = None;
            for (_name, ip) in ips {
                if ip.is_loopback() || !ip.is_ipv4() {
                    continue;
                }
                let ip_str = ip.to_string();
                if ip_str.starts_with("192.168.") {
                    return Some(ip_str); // Best match
                }
                if ip_str.starts_with("10.") {
                    best_ip = Some(ip_str);
                    continue;
                }
                if ip_str.starts_with("172.") && best_ip.is_none() {
                    best_ip = Some(ip_str);
                    continue;
                }
                if best_ip.is_none() {
                    best_ip = Some(ip_str);
                }
            }
            best_ip
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
