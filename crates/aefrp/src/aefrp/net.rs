use std::{borrow::Cow, net::SocketAddr};

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". `SocketAddr` parsing and Tokio bind APIs do not accept it, so it is
/// rewritten to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Parses `addr` as a socket address, falling back to DNS for `host:port`.
pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("net: could not resolve {addr:?}"))
}

/// `host:port` for a local target given either as a full address or a bare port.
pub fn target_addr(target: &str, port: u16) -> String {
    let t = target.trim();
    if t.is_empty() {
        format!("127.0.0.1:{port}")
    } else if t.parse::<u16>().is_ok() {
        format!("127.0.0.1:{t}")
    } else {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn target_addr_defaults_to_loopback() {
        assert_eq!(target_addr("", 25565), "127.0.0.1:25565");
        assert_eq!(target_addr("8080", 80), "127.0.0.1:8080");
        assert_eq!(target_addr("10.0.0.5:22", 22), "10.0.0.5:22");
    }

    #[tokio::test]
    async fn resolve_accepts_literal_addresses() {
        let sa = resolve_socket_addr("127.0.0.1:9").await.unwrap();
        assert_eq!(sa.port(), 9);
    }
}
