//! Local port availability checks

use std::io::ErrorKind;
use std::net::Ipv4Addr;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::ProxyError;

/// True when some process already holds `127.0.0.1:<port>`.
///
/// Checked by trying to bind; the probe listener is released immediately.
pub async fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => true,
        Err(e) => {
            // Permission problems surface later when the tunnel itself binds
            debug!(
                port,
                error = %e,
                "bind check failed for a reason other than the port being taken"
            );
            false
        }
    }
}

/// First free port in `start..start + attempts`
pub async fn find_free_port(start: u16, attempts: u16) -> Result<u16, ProxyError> {
    for offset in 0..attempts {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if !is_port_in_use(port).await {
            if offset > 0 {
                debug!(start, port, "preferred tunnel port taken, using the next free one");
            }
            return Ok(port);
        }
    }
    Err(ProxyError::PortExhaustion { start, attempts })
}
