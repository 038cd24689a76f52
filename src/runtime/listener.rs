//! Listening socket setup shared by every backend.

use std::io;
use std::net::SocketAddr;

/// Create a non-blocking TCP listener with SO_REUSEPORT for kernel load
/// balancing.
///
/// Every event loop thread and every cluster worker calls this for the same
/// address; the kernel spreads incoming connections across the sockets.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Pin the calling thread to the `index`-th CPU it is allowed to run on
/// (modulo the size of its allowed set).
#[cfg(target_os = "linux")]
pub fn pin_current_thread(index: usize) -> io::Result<()> {
    let size = std::mem::size_of::<libc::cpu_set_t>();
    unsafe {
        let mut allowed: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, size, &mut allowed) != 0 {
            return Err(io::Error::last_os_error());
        }

        let cpus: Vec<usize> = (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &allowed))
            .collect();
        if cpus.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no CPUs in affinity mask"));
        }

        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpus[index % cpus.len()], &mut set);
        if libc::sched_setaffinity(0, size, &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread pinning is only supported on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_is_nonblocking() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[cfg(unix)]
    #[test]
    fn test_listeners_share_port() {
        let first = create_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = first.local_addr().unwrap();

        // One listener per worker, all on the same port.
        let others: Vec<_> = (0..3)
            .map(|_| create_listener(addr, 128).unwrap())
            .collect();
        for listener in &others {
            assert_eq!(listener.local_addr().unwrap(), addr);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_bind_conflict_without_reuseport() {
        // A plain socket on the port makes a reuseport bind fail fast.
        let plain = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = plain.local_addr().unwrap();
        assert!(create_listener(addr, 128).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_pin_current_thread() {
        std::thread::spawn(|| {
            pin_current_thread(0).unwrap();
            pin_current_thread(usize::MAX).unwrap();
        })
        .join()
        .unwrap();
    }
}
