//! Where backend server lists come from.
//!
//! The built-in `FileSourcer` reads one server per line from plain text
//! files; deployments with an inventory service supply their own
//! `HostSourcer` through the config provider seam.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dl_codec::ProtocolVersion;
use tracing::warn;

use crate::server::DhcpServer;

#[async_trait]
pub trait HostSourcer: Send + Sync {
    async fn stable_servers(&self) -> anyhow::Result<Vec<Arc<DhcpServer>>>;

    async fn rc_servers(&self) -> anyhow::Result<Vec<Arc<DhcpServer>>>;

    /// Servers belonging to a named tier (used by tier overrides).
    async fn servers_in_tier(&self, tier: &str) -> anyhow::Result<Vec<Arc<DhcpServer>>>;
}

/// Sources servers from `host[:port]` lines in text files. The RC file is
/// optional; a tier name is interpreted as a path to another host file.
pub struct FileSourcer {
    stable_path: PathBuf,
    rc_path: Option<PathBuf>,
    version: ProtocolVersion,
}

impl FileSourcer {
    pub fn new(
        stable_path: impl Into<PathBuf>,
        rc_path: Option<PathBuf>,
        version: ProtocolVersion,
    ) -> Self {
        Self {
            stable_path: stable_path.into(),
            rc_path,
            version,
        }
    }

    async fn load(&self, path: &Path, is_rc: bool) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading host list {}", path.display()))?;

        let mut servers = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.parse_line(line).await {
                Some((hostname, address, port)) => {
                    let server = if is_rc {
                        DhcpServer::rc(hostname, address, port)
                    } else {
                        DhcpServer::new(hostname, address, port)
                    };
                    servers.push(Arc::new(server));
                }
                None => warn!("skipping unusable host line {:?}", line),
            }
        }
        Ok(servers)
    }

    /// `host[:port]`, where host is an IP literal or a DNS name resolved to
    /// an address of the configured protocol version.
    async fn parse_line(&self, line: &str) -> Option<(String, IpAddr, u16)> {
        let (host, port) = if line.parse::<IpAddr>().is_ok() {
            (line, self.version.server_port())
        } else {
            match line.rsplit_once(':') {
                Some((host, port_str)) => match port_str.parse::<u16>() {
                    Ok(port) => (host, port),
                    Err(_) => {
                        warn!("can't parse port in {:?}", line);
                        return None;
                    }
                },
                None => (line, self.version.server_port()),
            }
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some((host.to_string(), ip, port));
        }

        // DNS name: pick the first address matching the protocol version
        let addrs = tokio::net::lookup_host((host, port)).await.ok()?;
        let ip = addrs.map(|a| a.ip()).find(|ip| match self.version {
            ProtocolVersion::V4 => ip.is_ipv4(),
            ProtocolVersion::V6 => ip.is_ipv6(),
        })?;
        Some((host.to_string(), ip, port))
    }
}

#[async_trait]
impl HostSourcer for FileSourcer {
    async fn stable_servers(&self) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        self.load(&self.stable_path, false).await
    }

    async fn rc_servers(&self) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        match &self.rc_path {
            Some(path) => self.load(path, true).await,
            None => Ok(Vec::new()),
        }
    }

    async fn servers_in_tier(&self, tier: &str) -> anyhow::Result<Vec<Arc<DhcpServer>>> {
        self.load(Path::new(tier), false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_hosts(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_v4_default_port_and_explicit_port() {
        let hosts = write_hosts("10.0.0.1\n10.0.0.2:1067\n\n# comment\n");
        let sourcer = FileSourcer::new(hosts.path(), None, ProtocolVersion::V4);

        let servers = sourcer.stable_servers().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].port, 67);
        assert_eq!(servers[1].port, 1067);
        assert!(!servers[0].is_rc);
    }

    #[tokio::test]
    async fn test_v6_literal_default_port() {
        let hosts = write_hosts("2001:db8::1\n");
        let sourcer = FileSourcer::new(hosts.path(), None, ProtocolVersion::V6);

        let servers = sourcer.stable_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].port, 547);
        assert!(servers[0].address.is_ipv6());
    }

    #[tokio::test]
    async fn test_rc_file_marks_servers() {
        let stable = write_hosts("10.0.0.1\n");
        let rc = write_hosts("10.0.0.9\n");
        let sourcer = FileSourcer::new(
            stable.path(),
            Some(rc.path().to_path_buf()),
            ProtocolVersion::V4,
        );

        let rc_servers = sourcer.rc_servers().await.unwrap();
        assert_eq!(rc_servers.len(), 1);
        assert!(rc_servers[0].is_rc);
    }

    #[tokio::test]
    async fn test_bad_port_is_skipped() {
        let hosts = write_hosts("10.0.0.1:notaport\n10.0.0.2\n");
        let sourcer = FileSourcer::new(hosts.path(), None, ProtocolVersion::V4);

        let servers = sourcer.stable_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].hostname, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_missing_rc_file_is_empty() {
        let stable = write_hosts("10.0.0.1\n");
        let sourcer = FileSourcer::new(stable.path(), None, ProtocolVersion::V4);
        assert!(sourcer.rc_servers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tier_is_a_host_file() {
        let tier = write_hosts("10.1.0.1\n10.1.0.2\n");
        let stable = write_hosts("10.0.0.1\n");
        let sourcer = FileSourcer::new(stable.path(), None, ProtocolVersion::V4);

        let servers = sourcer
            .servers_in_tier(tier.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(servers.len(), 2);
    }
}
