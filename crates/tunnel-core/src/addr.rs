//! Host/port helpers shared by the dialer and the external-client variant.

use std::net::IpAddr;

use crate::error::TunnelError;

type Result<T> = crate::TunnelResult<T>;

/// Return `addr` unchanged when it already carries a port, otherwise append
/// `:default`.
pub fn with_default_port(addr: &str, default: u16) -> String {
    if split_host_port(addr).is_ok() {
        addr.to_string()
    } else {
        format!("{addr}:{default}")
    }
}

/// Split `host:port`, returning the port as a `u32` as required by the SSH
/// channel-open payload. Bracketed IPv6 literals are accepted.
pub fn split_host_port(addr: &str) -> Result<(String, u32)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| TunnelError::invalid_address(addr, "missing ']' in address"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| TunnelError::invalid_address(addr, "missing port"))?;
        (host.to_string(), port)
    } else {
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host.to_string(), port),
            Some(_) => {
                return Err(TunnelError::invalid_address(addr, "too many colons in address"));
            }
            None => return Err(TunnelError::invalid_address(addr, "missing port")),
        }
    };
    let port = port
        .parse::<u32>()
        .map_err(|_| TunnelError::invalid_address(addr, "invalid port"))?;
    Ok((host, port))
}

/// Bind `local_ip:0`, read back the kernel-assigned port, and release it.
///
/// Inherently racy: the port may be taken again before the caller binds it.
pub fn pick_free_port(local_ip: IpAddr) -> Result<(String, u16)> {
    let listener = std::net::TcpListener::bind((local_ip, 0))?;
    let port = listener.local_addr()?.port();
    Ok((port.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_appended_only_when_missing() {
        assert_eq!(with_default_port("example.com", 22), "example.com:22");
        assert_eq!(with_default_port("example.com:2222", 22), "example.com:2222");
        assert_eq!(with_default_port("[::1]:2022", 22), "[::1]:2022");
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("db.internal:5432").unwrap(), ("db.internal".into(), 5432));
        assert_eq!(split_host_port("127.0.0.1:80").unwrap(), ("127.0.0.1".into(), 80));
        assert_eq!(split_host_port("[fe80::1]:8080").unwrap(), ("fe80::1".into(), 8080));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("fe80::1:22").is_err());
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port("[fe80::1").is_err());
    }

    #[test]
    fn free_port_is_usable() {
        let (text, port) = pick_free_port("127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(text, port.to_string());
        assert_ne!(port, 0);
    }
}
