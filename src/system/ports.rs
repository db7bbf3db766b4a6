//! Ephemeral port allocation

use std::net::TcpListener;

/// Obtain a free host port by binding an ephemeral socket.
///
/// The socket is dropped immediately, so the port is only reserved in the
/// statistical sense; Docker rebinds it moments later.
pub fn get_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_nonzero() {
        let port = get_free_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn test_free_port_is_bindable() {
        let port = get_free_port().unwrap();
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}
