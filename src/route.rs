use std::fmt;
use std::str::FromStr;

/// Ethertype carrying DECnet routing payloads.
pub(crate) const ETH_P_DNA_RT: u16 = 0x6003;

/* Routing flag byte */
pub(crate) const RT_F_PF: u8 = 0x80; /* Padding follows */
pub(crate) const RT_F_VER: u8 = 0x40; /* Version, must be zero */
pub(crate) const RT_F_IE: u8 = 0x20; /* Intra ethernet */
pub(crate) const RT_F_RTS: u8 = 0x10; /* Packet is being returned to sender */
pub(crate) const RT_F_RQR: u8 = 0x08; /* Return packet to sender upon non-delivery */

/* Data packet formats */
pub(crate) const RT_PKT_MASK: u8 = 0x06;
pub(crate) const RT_PKT_SHORT: u8 = 0x02;
pub(crate) const RT_PKT_LONG: u8 = 0x06;

const SHORT_HDR: usize = 6;
const LONG_HDR: usize = 20;

/// Every DECnet node on an Ethernet answers to a MAC derived from its
/// address, prefixed with the HIORD bytes.
const HIORD: [u8; 4] = [0xaa, 0x00, 0x04, 0x00];

/// A 16-bit DECnet node address: 6 bits of area, 10 bits of node number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddr(pub u16);

impl NodeAddr {
    pub fn area(&self) -> u16 {
        self.0 >> 10
    }

    pub fn node(&self) -> u16 {
        self.0 & 0x03ff
    }

    pub(crate) fn hwaddr(&self) -> [u8; 6] {
        let [lo, hi] = self.0.to_le_bytes();
        [HIORD[0], HIORD[1], HIORD[2], HIORD[3], lo, hi]
    }

    fn from_hwaddr(bytes: &[u8]) -> Option<NodeAddr> {
        if bytes.len() != 6 || bytes[..4] != HIORD {
            return None;
        }
        Some(NodeAddr(u16::from_le_bytes([bytes[4], bytes[5]])))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.area(), self.node())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid node address, expected \"area.node\"")]
pub struct AddrParseError;

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (area, node) = s.split_once('.').ok_or(AddrParseError)?;
        let area: u16 = area.parse().map_err(|_| AddrParseError)?;
        let node: u16 = node.parse().map_err(|_| AddrParseError)?;
        if area == 0 || area > 63 || node == 0 || node > 1023 {
            return Err(AddrParseError);
        }
        Ok(NodeAddr(area << 10 | node))
    }
}

/// The routing control block handed to the NSP dispatcher along with each
/// segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouteHdr {
    pub rt_flags: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
    pub short_header: bool,
}

impl RouteHdr {
    pub fn returned(&self) -> bool {
        self.rt_flags & RT_F_RTS != 0
    }

    pub fn intra_ethernet(&self) -> bool {
        self.rt_flags & RT_F_IE != 0
    }
}

/// Strip the 16-bit length prefix, any padding and the data packet header.
/// Returns the control block and the NSP payload, or `None` for anything
/// that is not a well formed data packet (control packets included; we run
/// no routing adjacencies).
pub(crate) fn parse(buf: &[u8]) -> Option<(RouteHdr, &[u8])> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let buf = &buf[2..];
    if len == 0 || len > buf.len() {
        return None;
    }
    let mut buf = &buf[..len];

    let mut flags = *buf.first()?;
    if flags & RT_F_PF != 0 {
        let pad = (flags & !RT_F_PF) as usize;
        if pad == 0 || pad >= buf.len() {
            return None;
        }
        buf = &buf[pad..];
        flags = buf[0];
    }
    if flags & RT_F_VER != 0 {
        return None;
    }

    match flags & RT_PKT_MASK {
        RT_PKT_SHORT => {
            if buf.len() < SHORT_HDR {
                return None;
            }
            let dst = NodeAddr(u16::from_le_bytes([buf[1], buf[2]]));
            let src = NodeAddr(u16::from_le_bytes([buf[3], buf[4]]));
            let hdr = RouteHdr {
                rt_flags: flags,
                src,
                dst,
                short_header: true,
            };
            Some((hdr, &buf[SHORT_HDR..]))
        }
        RT_PKT_LONG => {
            if buf.len() < LONG_HDR {
                return None;
            }
            let dst = NodeAddr::from_hwaddr(&buf[3..9])?;
            let src = NodeAddr::from_hwaddr(&buf[11..17])?;
            let hdr = RouteHdr {
                rt_flags: flags,
                src,
                dst,
                short_header: false,
            };
            Some((hdr, &buf[LONG_HDR..]))
        }
        _ => None,
    }
}

/// Wrap an NSP payload in a long format data header with a length prefix,
/// ready to ride inside an Ethernet frame.
pub(crate) fn build(dst: NodeAddr, src: NodeAddr, nsp: &[u8]) -> Vec<u8> {
    let len = LONG_HDR + nsp.len();
    let mut v = Vec::with_capacity(2 + len);
    v.extend_from_slice(&(len as u16).to_le_bytes());
    v.push(RT_PKT_LONG | RT_F_IE | RT_F_RQR);
    v.extend_from_slice(&[0, 0]);
    v.extend_from_slice(&dst.hwaddr());
    v.extend_from_slice(&[0, 0]);
    v.extend_from_slice(&src.hwaddr());
    v.extend_from_slice(&[0, 0, 0]); /* next level 2, visit count, service class */
    v.extend_from_slice(nsp);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_split() {
        let addr = NodeAddr(1 << 10 | 12);
        assert_eq!(addr.area(), 1);
        assert_eq!(addr.node(), 12);
        assert_eq!(addr.to_string(), "1.12");
        assert_eq!("1.12".parse::<NodeAddr>().unwrap(), addr);
        assert!("64.1".parse::<NodeAddr>().is_err());
        assert!("1.0".parse::<NodeAddr>().is_err());
        assert!("7".parse::<NodeAddr>().is_err());
    }

    #[test]
    fn hwaddr_roundtrip() {
        let addr = NodeAddr(0x0523);
        assert_eq!(addr.hwaddr(), [0xaa, 0x00, 0x04, 0x00, 0x23, 0x05]);
        assert_eq!(NodeAddr::from_hwaddr(&addr.hwaddr()), Some(addr));
        assert_eq!(NodeAddr::from_hwaddr(&[0xff; 6]), None);
    }

    #[test]
    fn long_roundtrip() {
        let src = NodeAddr(0x0401);
        let dst = NodeAddr(0x0402);
        let frame = build(dst, src, &[0x18, 0xaa, 0xbb]);

        let (hdr, nsp) = parse(&frame).unwrap();
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.dst, dst);
        assert!(!hdr.short_header);
        assert!(hdr.intra_ethernet());
        assert!(!hdr.returned());
        assert_eq!(nsp, &[0x18, 0xaa, 0xbb]);
    }

    #[test]
    fn short_parse() {
        let mut buf = vec![0u8; 0];
        let body = [RT_PKT_SHORT, 0x02, 0x04, 0x01, 0x04, 0x00, 0x38, 0x01, 0x00];
        buf.extend_from_slice(&(body.len() as u16).to_le_bytes());
        buf.extend_from_slice(&body);

        let (hdr, nsp) = parse(&buf).unwrap();
        assert_eq!(hdr.dst, NodeAddr(0x0402));
        assert_eq!(hdr.src, NodeAddr(0x0401));
        assert!(hdr.short_header);
        assert!(!hdr.intra_ethernet());
        assert_eq!(nsp, &[0x38, 0x01, 0x00]);
    }

    #[test]
    fn padding_skipped() {
        let src = NodeAddr(0x0401);
        let dst = NodeAddr(0x0402);
        let inner = build(dst, src, &[0x04, 0x01, 0x00, 0x02, 0x00]);

        /* splice two pad bytes between the length word and the header */
        let mut padded = Vec::new();
        let len = (inner.len() - 2 + 2) as u16;
        padded.extend_from_slice(&len.to_le_bytes());
        padded.push(RT_F_PF | 2);
        padded.push(0);
        padded.extend_from_slice(&inner[2..]);

        let (hdr, _) = parse(&padded).unwrap();
        assert_eq!(hdr.src, src);
    }

    #[test]
    fn version_bit_rejected() {
        let src = NodeAddr(0x0401);
        let dst = NodeAddr(0x0402);
        let mut frame = build(dst, src, &[0x08]);
        frame[2] |= RT_F_VER;
        assert!(parse(&frame).is_none());
    }

    #[test]
    fn truncated_rejected() {
        assert!(parse(&[]).is_none());
        assert!(parse(&[0x06, 0x00, RT_PKT_LONG]).is_none());
        assert!(parse(&[0x01, 0x00, RT_PKT_SHORT]).is_none());
    }
}
