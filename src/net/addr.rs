//! Socket address helpers.
//!
//! Addresses are plain [`SocketAddr`] values; this module supplies the
//! pieces std leaves out — numeric parsing with an IPv6 `%ifname` zone,
//! `[ip]:port` formatting, building an address from a bound or connected
//! fd, a (family, ip, port) equality test and a few predicates — plus the
//! `sockaddr` conversions used at syscall boundaries.

use std::ffi::CString;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use crate::{Error, Result};

/// Parses a numeric `ip` string and `port` into an address.
///
/// An IPv6 link-local address must carry its interface as `fe80::1%eth0`;
/// the name is resolved to the scope id via `if_nametoindex`. Name
/// resolution beyond this is out of scope.
pub fn parse_ip_port(ip: &str, port: u16) -> Result<SocketAddr> {
    if !ip.contains(':') {
        let ip: Ipv4Addr = ip.parse().map_err(|_| Error::InvalidInput)?;
        return Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)));
    }

    let (ip, ifname) = match ip.find('%') {
        Some(at) => (&ip[..at], Some(&ip[at + 1..])),
        None => (ip, None),
    };
    let ip: Ipv6Addr = ip.parse().map_err(|_| Error::InvalidInput)?;

    // Only link-local addresses take a scope id; see ipv6(7).
    let mut scope_id = 0;
    if is_linklocal_v6(&ip) || is_mc_linklocal_v6(&ip) {
        let ifname = match ifname {
            Some(name) if !name.is_empty() => name,
            _ => return Err(Error::Format),
        };
        let cname = CString::new(ifname).map_err(|_| Error::InvalidInput)?;
        scope_id = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if scope_id == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, scope_id)))
}

/// Formats an address as `[ip]:port`.
///
/// A link-local IPv6 address gets its interface name back (`[fe80::1%eth0]:80`),
/// falling back to the numeric scope id when the interface has vanished.
pub fn format_addr(addr: &SocketAddr) -> String {
    match addr {
        SocketAddr::V4(addr) => format!("[{}]:{}", addr.ip(), addr.port()),
        SocketAddr::V6(addr) => {
            let ip = addr.ip();
            if is_linklocal_v6(ip) || is_mc_linklocal_v6(ip) {
                let zone = match ifname_from_index(addr.scope_id()) {
                    Some(name) => name,
                    None => addr.scope_id().to_string(),
                };
                format!("[{}%{}]:{}", ip, zone, addr.port())
            } else {
                format!("[{}]:{}", ip, addr.port())
            }
        }
    }
}

/// The local address the fd is bound to.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { to_socket_addr(&storage) }
}

/// The peer address the fd is connected to.
pub fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    unsafe { to_socket_addr(&storage) }
}

/// Compares two addresses by (family, ip, port).
///
/// IPv6 flow info and scope id are ignored, matching what a listener
/// duplicate check or a self-connect test actually cares about.
pub fn sockaddr_eq(a: &SocketAddr, b: &SocketAddr) -> bool {
    match (a, b) {
        (SocketAddr::V4(a), SocketAddr::V4(b)) => a.ip() == b.ip() && a.port() == b.port(),
        (SocketAddr::V6(a), SocketAddr::V6(b)) => a.ip() == b.ip() && a.port() == b.port(),
        _ => false,
    }
}

/// Returns true when the port is the wildcard 0.
pub fn is_port_unspecified(addr: &SocketAddr) -> bool {
    addr.port() == 0
}

/// Returns true when the ip is the wildcard (`0.0.0.0` / `::`).
pub fn is_ip_unspecified(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(addr) => addr.ip().is_unspecified(),
        SocketAddr::V6(addr) => addr.ip().is_unspecified(),
    }
}

/// Returns true when the ip is a loopback address.
pub fn is_ip_loopback(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(addr) => addr.ip().is_loopback(),
        SocketAddr::V6(addr) => addr.ip().is_loopback(),
    }
}

/// Returns true when the ip is a multicast address.
pub fn is_ip_multicast(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(addr) => addr.ip().is_multicast(),
        SocketAddr::V6(addr) => addr.ip().is_multicast(),
    }
}

fn is_linklocal_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

fn is_mc_linklocal_v6(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xff0f == 0xff02
}

fn ifname_from_index(index: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if name.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(name) };
    Some(name.to_string_lossy().into_owned())
}

/// A `sockaddr_in`/`sockaddr_in6` big enough for either family, with a
/// stable address to hand to the kernel.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const SocketAddrCRepr as *const libc::sockaddr
    }
}

/// Converts an address into its C representation for `bind`/`connect`.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };

            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd",
                ))]
                sin_len: 0,
            };

            let sockaddr = SocketAddrCRepr { v4: sockaddr_in };
            (sockaddr, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd",
                ))]
                sin6_len: 0,
            };

            let sockaddr = SocketAddrCRepr { v6: sockaddr_in6 };
            (sockaddr, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Converts a `sockaddr_storage` filled in by the kernel back into a
/// `SocketAddr`.
///
/// # Safety
///
/// `storage` must hold a valid `sockaddr_in` or `sockaddr_in6`.
pub(crate) unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(Error::Unsupported),
    }
}
