use std::{io, net::TcpListener};

/// Asks the OS for a free TCP port on loopback.
///
/// The port is advisory: it is released before the forwarder binds it, and a
/// lost race surfaces as a forwarder start error rather than a retry here.
pub fn free_local_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_a_bindable_port() {
        let port = free_local_port().unwrap();
        assert_ne!(port, 0);

        // The allocation released the binding.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
