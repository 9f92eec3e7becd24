//! Latency probing
//!
//! ICMP echo over an unprivileged datagram socket (Linux `ping_group_range`),
//! so measuring a region does not need root. A probe that cannot open its
//! socket, or gets no reply in time, reports the region as unreachable.

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

const ICMP_HEADER_SIZE: usize = 8;
const ECHO_PAYLOAD: &[u8] = b"pia-tools-probe\0";

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Measures round-trip time to an address
pub trait LatencyProbe: Send + Sync + 'static {
    /// Mean RTT, or `None` when nothing came back
    fn probe(&self, addr: IpAddr) -> impl Future<Output = Option<Duration>> + Send;
}

/// Probe parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Echo requests per probe
    pub count: u16,
    /// Upper bound on the whole probe
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            count: 3,
            timeout: Duration::from_secs(1),
        }
    }
}

/// ICMP echo probe
#[derive(Debug, Clone, Default)]
pub struct IcmpProbe {
    config: ProbeConfig,
}

impl IcmpProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    async fn run(&self, addr: IpAddr) -> std::io::Result<Option<Duration>> {
        let socket = open_socket(addr)?;
        socket.connect(SocketAddr::new(addr, 0)).await?;

        let count = self.config.count.max(1);
        let deadline = Instant::now() + self.config.timeout;
        // Spread the requests across the first part of the window
        let spacing = self.config.timeout / (u32::from(count) + 1);

        let mut sent_at: HashMap<u16, Instant> = HashMap::new();
        let mut rtts: Vec<Duration> = Vec::with_capacity(usize::from(count));
        let mut next_seq: u16 = 0;
        let mut next_send = Instant::now();
        let mut buf = [0u8; 512];

        loop {
            let now = Instant::now();
            if now >= deadline || rtts.len() == usize::from(count) {
                break;
            }

            if next_seq < count && now >= next_send {
                let packet = echo_request(addr.is_ipv6(), next_seq);
                socket.send(&packet).await?;
                sent_at.insert(next_seq, now);
                next_seq += 1;
                next_send = now + spacing;
                continue;
            }

            let wake = if next_seq < count {
                next_send.min(deadline)
            } else {
                deadline
            };

            tokio::select! {
                received = socket.recv(&mut buf) => {
                    let len = received?;
                    if let Some(seq) = parse_echo_reply(addr.is_ipv6(), &buf[..len]) {
                        if let Some(start) = sent_at.remove(&seq) {
                            rtts.push(start.elapsed());
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        Ok(mean(&rtts))
    }
}

impl LatencyProbe for IcmpProbe {
    async fn probe(&self, addr: IpAddr) -> Option<Duration> {
        match self.run(addr).await {
            Ok(latency) => {
                debug!("Probe {}: {:?}", addr, latency);
                latency
            }
            Err(e) => {
                debug!("Probe {} failed: {}", addr, e);
                None
            }
        }
    }
}

fn open_socket(addr: IpAddr) -> std::io::Result<UdpSocket> {
    let (domain, protocol) = match addr {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_nonblocking(true)?;
    // Datagram ICMP sockets speak the same send/recv calls as UDP
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Build an echo request; the kernel rewrites the identifier
fn echo_request(ipv6: bool, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_SIZE + ECHO_PAYLOAD.len()];
    packet[0] = if ipv6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST };
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[ICMP_HEADER_SIZE..].copy_from_slice(ECHO_PAYLOAD);

    if !ipv6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Sequence number of an echo reply, ignoring anything else
fn parse_echo_reply(ipv6: bool, packet: &[u8]) -> Option<u16> {
    if packet.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let expected = if ipv6 { ICMPV6_ECHO_REPLY } else { ICMPV4_ECHO_REPLY };
    if packet[0] != expected || packet[1] != 0 {
        return None;
    }
    Some(u16::from_be_bytes([packet[6], packet[7]]))
}

fn icmp_checksum(packet: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in packet.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn mean(samples: &[Duration]) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let total: Duration = samples.iter().sum();
    let avg = total / samples.len() as u32;
    // Zero is the "unmeasured" value everywhere else
    (!avg.is_zero()).then_some(avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_layout() {
        let packet = echo_request(false, 2);
        assert_eq!(packet[0], ICMPV4_ECHO_REQUEST);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 2);
        // A packet carrying its own checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_parse_echo_reply() {
        let mut reply = echo_request(false, 7);
        reply[0] = ICMPV4_ECHO_REPLY;
        assert_eq!(parse_echo_reply(false, &reply), Some(7));

        // Our own request looped back is not a reply
        assert_eq!(parse_echo_reply(false, &echo_request(false, 7)), None);
        assert_eq!(parse_echo_reply(false, &[0u8; 4]), None);

        let mut reply6 = echo_request(true, 1);
        reply6[0] = ICMPV6_ECHO_REPLY;
        assert_eq!(parse_echo_reply(true, &reply6), Some(1));
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), None);
        assert_eq!(mean(&[Duration::ZERO]), None);
        assert_eq!(
            mean(&[Duration::from_millis(10), Duration::from_millis(30)]),
            Some(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn test_probe_is_bounded() {
        // TEST-NET-1 never answers; the probe must give up on time
        let probe = IcmpProbe::new(ProbeConfig {
            count: 3,
            timeout: Duration::from_millis(300),
        });
        let start = std::time::Instant::now();
        let latency = probe.probe("192.0.2.1".parse().unwrap()).await;

        assert_eq!(latency, None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
