//! Reachability checks
//!
//! A node is reachable if its service port accepts a TCP connection. When
//! the connect fails, one ICMP echo through the system `ping` utility is
//! tried before giving up.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Answers "is this address up right now"
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self, ip: &str) -> bool;
}

/// TCP connect to the node port, falling back to one ICMP echo
pub struct TcpEchoProbe {
    port: u16,
    timeout: Duration,
}

impl TcpEchoProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn tcp_connect(&self, ip: &str) -> bool {
        let addr = format!("{}:{}", ip, self.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, "TCP probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(addr = %addr, "TCP probe timed out");
                false
            }
        }
    }

    async fn echo(&self, ip: &str) -> bool {
        let wait_secs = self.timeout.as_secs().max(1).to_string();
        let child = Command::new("ping")
            .args(["-c", "1", "-W", &wait_secs, ip])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        // Allow the utility its own wait plus a little slack
        let deadline = self.timeout + Duration::from_secs(1);
        match tokio::time::timeout(deadline, child).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(ip = %ip, "ping could not run: {}", e);
                false
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Reachability for TcpEchoProbe {
    async fn is_reachable(&self, ip: &str) -> bool {
        if self.tcp_connect(ip).await {
            return true;
        }
        self.echo(ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let probe = TcpEchoProbe::new(port, Duration::from_secs(2));
        assert!(probe.tcp_connect("127.0.0.1").await);
        accept.abort();
    }

    #[tokio::test]
    async fn test_closed_port_fails_tcp() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let probe = TcpEchoProbe::new(port, Duration::from_secs(1));
        assert!(!probe.tcp_connect("127.0.0.1").await);
    }
}
