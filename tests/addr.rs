use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;

use evio::net::addr::{
    format_addr, is_ip_loopback, is_ip_multicast, is_ip_unspecified, is_port_unspecified,
    local_addr, parse_ip_port, peer_addr, sockaddr_eq,
};
use evio::Error;

#[test]
fn parses_numeric_v4_and_v6() {
    let addr = parse_ip_port("192.0.2.7", 8080).unwrap();
    assert_eq!(addr, "192.0.2.7:8080".parse::<SocketAddr>().unwrap());

    let addr = parse_ip_port("2001:db8::1", 443).unwrap();
    assert_eq!(addr, "[2001:db8::1]:443".parse::<SocketAddr>().unwrap());
}

#[test]
fn rejects_garbage() {
    assert!(matches!(
        parse_ip_port("not an ip", 1),
        Err(Error::InvalidInput)
    ));
    assert!(matches!(
        parse_ip_port("999.0.0.1", 1),
        Err(Error::InvalidInput)
    ));
    // A link-local address without an interface is a format error.
    assert!(matches!(parse_ip_port("fe80::1", 1), Err(Error::Format)));
}

#[test]
fn formats_bracketed() {
    let addr = parse_ip_port("127.0.0.1", 80).unwrap();
    assert_eq!(format_addr(&addr), "[127.0.0.1]:80");

    let addr = parse_ip_port("2001:db8::2", 8443).unwrap();
    assert_eq!(format_addr(&addr), "[2001:db8::2]:8443");
}

#[test]
fn equality_compares_family_ip_and_port() {
    let a = parse_ip_port("10.0.0.1", 80).unwrap();
    let b = parse_ip_port("10.0.0.1", 80).unwrap();
    let c = parse_ip_port("10.0.0.2", 80).unwrap();
    // Ports genuinely participate in the comparison.
    let d = parse_ip_port("10.0.0.1", 81).unwrap();
    let e = parse_ip_port("::ffff:10.0.0.1", 80).unwrap();

    assert!(sockaddr_eq(&a, &b));
    assert!(!sockaddr_eq(&a, &c));
    assert!(!sockaddr_eq(&a, &d));
    // Different families never compare equal.
    assert!(!sockaddr_eq(&a, &e));
}

#[test]
fn predicates() {
    let unspec = parse_ip_port("0.0.0.0", 0).unwrap();
    assert!(is_port_unspecified(&unspec));
    assert!(is_ip_unspecified(&unspec));

    let loopback = parse_ip_port("127.0.0.1", 80).unwrap();
    assert!(is_ip_loopback(&loopback));
    assert!(!is_ip_unspecified(&loopback));
    assert!(!is_port_unspecified(&loopback));

    let mcast = parse_ip_port("239.1.2.3", 5000).unwrap();
    assert!(is_ip_multicast(&mcast));

    let mcast6 = parse_ip_port("ff0e::1", 5000).unwrap();
    assert!(is_ip_multicast(&mcast6));
}

#[test]
fn addr_from_bound_fd() {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let expected = sock.local_addr().unwrap();
    let got = local_addr(sock.as_raw_fd()).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn addrs_from_connected_fd() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server_addr = listener.local_addr().unwrap();

    let stream = TcpStream::connect(server_addr).unwrap();
    let (accepted, _) = listener.accept().unwrap();

    assert_eq!(peer_addr(stream.as_raw_fd()).unwrap(), server_addr);
    assert_eq!(
        local_addr(stream.as_raw_fd()).unwrap(),
        accepted.peer_addr().unwrap()
    );
}
