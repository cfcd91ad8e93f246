//! Thin wrappers over the libc socket calls the server needs.
//!
//! Everything here is synchronous setup work (creating listeners, querying
//! bound addresses); the asynchronous data path lives in [`crate::ring`].

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use log::error;

/// Convert a `SocketAddrV4` into the C representation expected by the kernel.
pub(crate) fn sockaddr_of(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    raw
}

/// Convert a kernel-filled `sockaddr_in` back into a `SocketAddrV4`.
pub(crate) fn addr_of(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(raw.sin_port))
}

/// Create a bound, listening TCP socket. Returns the raw descriptor; the
/// caller owns it and must close it exactly once.
pub fn tcp_listener(addr: SocketAddrV4, backlog: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        close(fd);
        return Err(err);
    }

    let raw = sockaddr_of(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        error!("bind({}) failed: {}", addr, err);
        close(fd);
        return Err(err);
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        close(fd);
        return Err(err);
    }

    Ok(fd)
}

/// Query the local address a socket is bound to.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr_of(&raw))
}

/// Close a raw descriptor, ignoring the result. Callers enforce the
/// exactly-once discipline; this is the single close site.
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 2121);
        assert_eq!(addr_of(&sockaddr_of(addr)), addr);
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let fd = tcp_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 4).unwrap();
        let bound = local_addr(fd).unwrap();
        assert_eq!(*bound.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(bound.port(), 0);
        close(fd);
    }
}
