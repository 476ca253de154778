//! Broadcast capture of station UDP packets.
//!
//! Filtering happens in two stages: a broad capture-level filter (BPF
//! `udp and dst host 255.255.255.255` with libpcap, or the bound port for
//! the socket backend) and an application check on the destination address
//! and port. The socket backend reads the header destination through
//! `IP_PKTINFO`, so unicast datagrams to the same port are dropped too.
//! The capture loop blocks, so it gets its own OS thread.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use super::CaptureMeta;

pub const DEFAULT_CAPTURE_PORT: u16 = 59387;
pub const BPF_FILTER: &str = "udp and dst host 255.255.255.255";

// pcap DLT_* values we know how to strip.
pub const LINKTYPE_NULL: i32 = 0;
pub const LINKTYPE_ETHERNET: i32 = 1;
pub const LINKTYPE_RAW: i32 = 101;
pub const LINKTYPE_LOOP: i32 = 108;
pub const LINKTYPE_LINUX_SLL: i32 = 113;
pub const LINKTYPE_IPV4: i32 = 228;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame truncated")]
    Truncated,
    #[error("unsupported link type {0}")]
    UnsupportedLink(i32),
    #[error("not an IPv4 packet")]
    NotIpv4,
    #[error("not a UDP packet")]
    NotUdp,
    #[error("non-initial IP fragment")]
    Fragment,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("binding to interface {iface}: {source}")]
    Device {
        iface: String,
        #[source]
        source: io::Error,
    },
    #[error("spawning listener thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("pcap backend requested but the `pcap-capture` feature is not enabled")]
    PcapUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Broadcast-enabled UDP socket bound to the port.
    #[default]
    Socket,
    /// libpcap sniffing (promiscuous, interface-selectable).
    Pcap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub iface: Option<String>,
    #[serde(default)]
    pub backend: CaptureBackend,
    /// Log every accepted packet at debug level.
    #[serde(default = "default_true")]
    pub debug: bool,
}

fn default_port() -> u16 {
    DEFAULT_CAPTURE_PORT
}

fn default_true() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_CAPTURE_PORT,
            iface: None,
            backend: CaptureBackend::Socket,
            debug: true,
        }
    }
}

/// A UDP datagram lifted out of a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: &'a [u8],
}

fn be16(b: &[u8], at: usize) -> Result<u16, PacketError> {
    b.get(at..at + 2)
        .map(|s| u16::from_be_bytes([s[0], s[1]]))
        .ok_or(PacketError::Truncated)
}

/// Strip the link-layer header for `linktype` and parse the IPv4/UDP inside.
pub fn parse_link_frame(linktype: i32, frame: &[u8]) -> Result<UdpDatagram<'_>, PacketError> {
    match linktype {
        LINKTYPE_ETHERNET => {
            let mut ethertype = be16(frame, 12)?;
            let mut offset = 14;
            if ethertype == ETHERTYPE_VLAN {
                ethertype = be16(frame, 16)?;
                offset = 18;
            }
            if ethertype != ETHERTYPE_IPV4 {
                return Err(PacketError::NotIpv4);
            }
            parse_ipv4_udp(&frame[offset..])
        }
        LINKTYPE_NULL | LINKTYPE_LOOP => frame
            .get(4..)
            .ok_or(PacketError::Truncated)
            .and_then(parse_ipv4_udp),
        LINKTYPE_LINUX_SLL => {
            if be16(frame, 14)? != ETHERTYPE_IPV4 {
                return Err(PacketError::NotIpv4);
            }
            parse_ipv4_udp(&frame[16..])
        }
        LINKTYPE_RAW | LINKTYPE_IPV4 => parse_ipv4_udp(frame),
        other => Err(PacketError::UnsupportedLink(other)),
    }
}

/// Parse an IPv4 packet carrying UDP.
pub fn parse_ipv4_udp(packet: &[u8]) -> Result<UdpDatagram<'_>, PacketError> {
    let first = *packet.first().ok_or(PacketError::Truncated)?;
    if first >> 4 != 4 {
        return Err(PacketError::NotIpv4);
    }
    let ihl = usize::from(first & 0x0f) * 4;
    if ihl < 20 || packet.len() < ihl {
        return Err(PacketError::Truncated);
    }
    if packet[9] != IPPROTO_UDP {
        return Err(PacketError::NotUdp);
    }
    if be16(packet, 6)? & 0x1fff != 0 {
        return Err(PacketError::Fragment);
    }
    let total = usize::from(be16(packet, 2)?).clamp(ihl, packet.len());
    let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    let udp = &packet[ihl..total];
    if udp.len() < 8 {
        return Err(PacketError::Truncated);
    }
    let sport = be16(udp, 0)?;
    let dport = be16(udp, 2)?;
    let ulen = usize::from(be16(udp, 4)?);
    if ulen < 8 {
        return Err(PacketError::Truncated);
    }
    let end = ulen.min(udp.len());

    Ok(UdpDatagram {
        src: SocketAddrV4::new(src_ip, sport),
        dst: SocketAddrV4::new(dst_ip, dport),
        payload: &udp[8..end],
    })
}

/// Packet-level stage of the filter: limited broadcast to our port.
pub fn accepts(dst: SocketAddr, want_port: u16) -> bool {
    dst.ip() == IpAddr::V4(Ipv4Addr::BROADCAST) && dst.port() == want_port
}

pub type PacketCallback = Box<dyn FnMut(Vec<u8>, CaptureMeta) + Send>;

/// Blocking broadcast sniffer delivering `(payload, meta)` to a callback.
pub struct CaptureListener {
    cfg: CaptureConfig,
    callback: PacketCallback,
}

impl CaptureListener {
    pub fn new(cfg: CaptureConfig, callback: PacketCallback) -> Self {
        Self { cfg, callback }
    }

    /// Run on a dedicated thread. A fatal capture error ends only this thread.
    pub fn spawn(self) -> Result<JoinHandle<()>, ListenerError> {
        if self.cfg.backend == CaptureBackend::Pcap && !cfg!(feature = "pcap-capture") {
            return Err(ListenerError::PcapUnavailable);
        }
        let socket = match self.cfg.backend {
            CaptureBackend::Socket => Some(bind_broadcast(self.cfg.port, self.cfg.iface.as_deref())?),
            CaptureBackend::Pcap => None,
        };
        thread::Builder::new()
            .name("telemetry-capture".into())
            .spawn(move || {
                let mut this = self;
                let result = match socket {
                    Some(sock) => this.run_socket(sock),
                    None => this.run_pcap(),
                };
                if let Err(e) = result {
                    error!(error = %e, port = this.cfg.port, "capture stopped");
                }
            })
            .map_err(ListenerError::Spawn)
    }

    fn deliver(&mut self, payload: Vec<u8>, src: SocketAddr, dst: SocketAddr) {
        if !accepts(dst, self.cfg.port) {
            trace!(%src, %dst, "ignoring packet not broadcast to our port");
            return;
        }
        if self.cfg.debug {
            debug!(%src, %dst, bytes = payload.len(), "capture packet");
        }
        let meta = CaptureMeta {
            src,
            dst,
            received_at: Utc::now(),
        };
        (self.callback)(payload, meta);
    }

    /// Receive loop over a socket from [`bind_broadcast`].
    pub fn run_socket(&mut self, sock: UdpSocket) -> io::Result<()> {
        let local = sock.local_addr()?;
        info!(%local, iface = ?self.cfg.iface, port = self.cfg.port, "capture listening (socket backend)");
        let mut buf = vec![0u8; 65_535];
        loop {
            let (n, src, dst) = match recv_with_dst(&sock, &mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            match dst {
                Some(dst) => self.deliver(buf[..n].to_vec(), src, dst),
                None => trace!(%src, "datagram without destination info"),
            }
        }
    }

    #[cfg(feature = "pcap-capture")]
    fn run_pcap(&mut self) -> io::Result<()> {
        let to_io = |e: pcap::Error| io::Error::new(io::ErrorKind::Other, e);

        let device = match &self.cfg.iface {
            Some(name) => pcap::Device::from(name.as_str()),
            None => pcap::Device::lookup()
                .map_err(to_io)?
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no capture device"))?,
        };
        info!(iface = %device.name, filter = BPF_FILTER, port = self.cfg.port, "capture listening (pcap backend)");

        let mut cap = pcap::Capture::from_device(device)
            .map_err(to_io)?
            .promisc(true)
            .immediate_mode(true)
            .timeout(1000)
            .open()
            .map_err(to_io)?;
        cap.filter(BPF_FILTER, true).map_err(to_io)?;
        let link = cap.get_datalink().0;

        loop {
            let frame = match cap.next_packet() {
                Ok(pkt) => pkt.data.to_vec(),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(to_io(e)),
            };
            match parse_link_frame(link, &frame) {
                Ok(d) => {
                    let payload = d.payload.to_vec();
                    self.deliver(payload, SocketAddr::V4(d.src), SocketAddr::V4(d.dst));
                }
                Err(e) => trace!(error = %e, "skipping frame"),
            }
        }
    }

    #[cfg(not(feature = "pcap-capture"))]
    fn run_pcap(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            ListenerError::PcapUnavailable,
        ))
    }
}

/// UDP socket on `0.0.0.0:port` with broadcast receive and destination
/// reporting enabled, optionally pinned to one interface.
pub fn bind_broadcast(port: u16, iface: Option<&str>) -> Result<UdpSocket, ListenerError> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let bind_err = |source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    };
    let sock = UdpSocket::bind(addr).map_err(bind_err)?;
    sock.set_broadcast(true).map_err(bind_err)?;
    sockopt::enable_pktinfo(&sock).map_err(bind_err)?;
    if let Some(name) = iface {
        sockopt::bind_device(&sock, name).map_err(|source| ListenerError::Device {
            iface: name.to_string(),
            source,
        })?;
    }
    Ok(sock)
}

/// One datagram: `(len, source, destination from the IP header)`. The
/// destination port is the socket's own.
pub fn recv_with_dst(
    sock: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<SocketAddr>)> {
    let port = sock.local_addr()?.port();
    let (n, src, dst_ip) = sockopt::recv_pktinfo(sock, buf)?;
    Ok((n, src, dst_ip.map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, port)))))
}

#[cfg(target_os = "linux")]
mod sockopt {
    use std::ffi::OsString;
    use std::io::{self, IoSliceMut};
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
    use std::os::fd::AsRawFd;

    use nix::cmsg_space;
    use nix::sys::socket::{
        recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn,
    };

    pub fn enable_pktinfo(sock: &UdpSocket) -> io::Result<()> {
        setsockopt(sock, sockopt::Ipv4PacketInfo, &true).map_err(io::Error::from)
    }

    pub fn bind_device(sock: &UdpSocket, iface: &str) -> io::Result<()> {
        setsockopt(sock, sockopt::BindToDevice, &OsString::from(iface)).map_err(io::Error::from)
    }

    pub fn recv_pktinfo(
        sock: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<Ipv4Addr>)> {
        let mut cmsg = cmsg_space!(nix::libc::in_pktinfo);
        let mut iov = [IoSliceMut::new(buf)];
        let msg = recvmsg::<SockaddrIn>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let src = msg
            .address
            .map(|a| SocketAddr::V4(SocketAddrV4::from(a)))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without source"))?;
        let dst = msg.cmsgs().find_map(|c| match c {
            // ipi_addr is the header destination, in network byte order
            ControlMessageOwned::Ipv4PacketInfo(info) => {
                Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)))
            }
            _ => None,
        });
        Ok((msg.bytes, src, dst))
    }
}

#[cfg(not(target_os = "linux"))]
mod sockopt {
    use std::io;
    use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "socket capture backend needs Linux; use the pcap backend",
        )
    }

    pub fn enable_pktinfo(_sock: &UdpSocket) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn bind_device(_sock: &UdpSocket, _iface: &str) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn recv_pktinfo(
        _sock: &UdpSocket,
        _buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<Ipv4Addr>)> {
        Err(unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn ipv4_udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let udp_len = 8 + payload.len() as u16;
        let total = 20 + udp_len;
        let mut p = vec![0x45, 0x00];
        p.extend_from_slice(&total.to_be_bytes());
        p.extend_from_slice(&[0, 0, 0x40, 0x00, 64, IPPROTO_UDP, 0, 0]);
        p.extend_from_slice(&src);
        p.extend_from_slice(&dst);
        p.extend_from_slice(&sport.to_be_bytes());
        p.extend_from_slice(&dport.to_be_bytes());
        p.extend_from_slice(&udp_len.to_be_bytes());
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(payload);
        p
    }

    fn ethernet(ip: &[u8]) -> Vec<u8> {
        let mut f = vec![0xff; 6];
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        f.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        f.extend_from_slice(ip);
        f
    }

    #[test]
    fn parses_ethernet_broadcast() {
        let ip = ipv4_udp([192, 168, 1, 50], [255, 255, 255, 255], 4000, 59387, b"tempf=70&humidity=40");
        let frame = ethernet(&ip);
        let d = parse_link_frame(LINKTYPE_ETHERNET, &frame).unwrap();
        assert_eq!(d.src, "192.168.1.50:4000".parse().unwrap());
        assert_eq!(d.dst, "255.255.255.255:59387".parse().unwrap());
        assert_eq!(d.payload, b"tempf=70&humidity=40");
        assert!(accepts(SocketAddr::V4(d.dst), 59387));
        assert!(!accepts(SocketAddr::V4(d.dst), 59388));
        assert!(!accepts("192.168.1.20:59387".parse().unwrap(), 59387));
    }

    #[test]
    fn ethernet_padding_is_trimmed_by_udp_length() {
        let ip = ipv4_udp([10, 0, 0, 2], [255, 255, 255, 255], 1, 2, b"ab");
        let mut frame = ethernet(&ip);
        frame.extend_from_slice(&[0u8; 18]);
        let d = parse_link_frame(LINKTYPE_ETHERNET, &frame).unwrap();
        assert_eq!(d.payload, b"ab");
    }

    #[test]
    fn vlan_tag_and_other_links() {
        let ip = ipv4_udp([10, 0, 0, 2], [255, 255, 255, 255], 1, 2, b"x=1");
        let mut frame = vec![0xff; 12];
        frame.extend_from_slice(&ETHERTYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x05]);
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(&ip);
        assert_eq!(parse_link_frame(LINKTYPE_ETHERNET, &frame).unwrap().payload, b"x=1");

        assert_eq!(parse_link_frame(LINKTYPE_RAW, &ip).unwrap().payload, b"x=1");

        let mut null = vec![2, 0, 0, 0];
        null.extend_from_slice(&ip);
        assert_eq!(parse_link_frame(LINKTYPE_NULL, &null).unwrap().payload, b"x=1");

        assert_eq!(
            parse_link_frame(9999, &ip),
            Err(PacketError::UnsupportedLink(9999))
        );
    }

    #[test]
    fn rejects_non_udp_and_truncated() {
        let mut ip = ipv4_udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2, b"");
        ip[9] = 6; // TCP
        assert_eq!(parse_ipv4_udp(&ip), Err(PacketError::NotUdp));

        assert_eq!(parse_ipv4_udp(&[]), Err(PacketError::Truncated));
        assert_eq!(parse_ipv4_udp(&[0x45, 0, 0]), Err(PacketError::Truncated));
        assert_eq!(parse_ipv4_udp(&[0x60; 40]), Err(PacketError::NotIpv4));

        let arp = {
            let mut f = vec![0xff; 12];
            f.extend_from_slice(&0x0806u16.to_be_bytes());
            f.extend_from_slice(&[0u8; 28]);
            f
        };
        assert_eq!(parse_link_frame(LINKTYPE_ETHERNET, &arp), Err(PacketError::NotIpv4));
    }

    #[test]
    fn socket_reports_header_destination() {
        let sock = bind_broadcast(0, None).unwrap();
        let port = sock.local_addr().unwrap().port();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"tempf=68", ("127.0.0.1", port)).unwrap();

        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 64];
        let (n, src, dst) = recv_with_dst(&sock, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"tempf=68");
        assert_eq!(src, sender.local_addr().unwrap());
        assert_eq!(dst, Some(SocketAddr::from(([127, 0, 0, 1], port))));
    }

    #[test]
    fn unicast_to_capture_port_is_not_delivered() {
        let sock = bind_broadcast(0, None).unwrap();
        let port = sock.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        let cfg = CaptureConfig {
            port,
            ..CaptureConfig::default()
        };
        let mut listener = CaptureListener::new(
            cfg,
            Box::new(move |payload, meta| {
                let _ = tx.send((payload, meta));
            }),
        );
        thread::spawn(move || {
            let _ = listener.run_socket(sock);
        });

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"tempf=68", ("127.0.0.1", port)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn broadcast_to_capture_port_is_delivered() {
        let (tx, rx) = mpsc::channel();
        let mut listener = CaptureListener::new(
            CaptureConfig {
                port: 59387,
                ..CaptureConfig::default()
            },
            Box::new(move |payload, meta| {
                let _ = tx.send((payload, meta));
            }),
        );
        let src: SocketAddr = "192.168.1.50:4000".parse().unwrap();
        listener.deliver(b"a=1".to_vec(), src, "255.255.255.255:59387".parse().unwrap());
        listener.deliver(b"a=2".to_vec(), src, "192.168.1.2:59387".parse().unwrap());
        listener.deliver(b"a=3".to_vec(), src, "255.255.255.255:59388".parse().unwrap());

        let (payload, meta) = rx.try_recv().unwrap();
        assert_eq!(payload, b"a=1");
        assert_eq!(meta.dst, "255.255.255.255:59387".parse().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_interface_fails_to_bind() {
        let err = bind_broadcast(0, Some("no-such-if0")).unwrap_err();
        assert!(matches!(err, ListenerError::Device { .. }), "{err}");
    }
}
