use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub const SERVICE_NAME: &str = "ZeroCloud";
pub const DEFAULT_TRANSPORT_PORT: u16 = 4568;
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_PORT: u16 = 5353;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Off means peers are only added through the manual resolver.
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    /// Query offsets from start before switching to the steady interval.
    pub burst: Vec<Duration>,
    pub steady_interval: Duration,
    pub sweep_interval: Duration,
    pub eviction_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: MDNS_GROUP,
            port: MDNS_PORT,
            burst: [0, 500, 1000, 2000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
            steady_interval: Duration::from_millis(5000),
            sweep_interval: Duration::from_millis(10_000),
            eviction_timeout: Duration::from_millis(15_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: String,
    pub service_name: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub download_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub connect_timeout: Duration,
    /// Port probed by the manual resolver on the remote host.
    pub resolver_port: u16,
    pub discovery: DiscoveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: system_hostname(),
            service_name: SERVICE_NAME.to_string(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_TRANSPORT_PORT,
            download_dir: default_download_dir(),
            max_upload_bytes: 1024 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            resolver_port: DEFAULT_TRANSPORT_PORT,
            discovery: DiscoveryConfig::default(),
        }
    }
}

pub fn system_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Unknown Device".to_string())
}

pub fn default_download_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("ZeroCloudDownloads")
}
