use std::fmt;
use std::time::{Duration, Instant};

pub(crate) use crate::route::{NodeAddr, RT_F_IE, RT_F_RTS};

use crate::route::RouteHdr;

mod cb;
mod ioutil;
mod listen;
mod stream;

pub(crate) use cb::{ConnCb, Fault, State, Wake};
pub(crate) use ioutil::*;
pub(crate) use listen::{parse_ci, CiError, ListenEntry, PendingCi};
pub use listen::NspListener;
pub use stream::NspStream;

/*
        DNA NSP Functional Specification V4.0.0 - S5.2

    Message identification octet layout, low bits first:

        --------------------------------
        | TYPE (2) | SUBTYPE (4) | 0 0 |
        --------------------------------

    Control messages have type bits 0b10; the data group has 0b00 with the
    subtype selecting between data segments, link service and interrupt
    messages; bare acknowledgements have 0b01.
*/
pub(crate) const MSG_CI: u8 = 0x18;
pub(crate) const MSG_CC: u8 = 0x28;
pub(crate) const MSG_DI: u8 = 0x38;
pub(crate) const MSG_DC: u8 = 0x48;
pub(crate) const MSG_CI_RETRANS: u8 = 0x68;
pub(crate) const MSG_CONNACK: u8 = 0x24;
pub(crate) const MSG_DATA_ACK: u8 = 0x04;
pub(crate) const MSG_OTH_ACK: u8 = 0x14;
pub(crate) const MSG_LINK_SERVICE: u8 = 0x10;
pub(crate) const MSG_OTHER_DATA: u8 = 0x30;
pub(crate) const MSG_DATA_BOM: u8 = 0x20;
pub(crate) const MSG_DATA_EOM: u8 = 0x40;

/* Disconnect reason codes */
pub(crate) const REASON_OK: u16 = 0;
pub(crate) const REASON_ID: u16 = 4; /* Invalid destination end user */
pub(crate) const REASON_US: u16 = 7; /* Unspecified source error */
pub(crate) const REASON_NL: u16 = 38; /* No link terminate */
pub(crate) const REASON_DC: u16 = 39; /* Disconnect confirm */
pub(crate) const REASON_IO: u16 = 40; /* Image data field overflow */

/* Services field: bit 0 always set, bits 2-3 select the flow control style */
pub(crate) const SVC_BASE: u8 = 0x01;
pub(crate) const FC_MASK: u8 = 0x0c;
pub(crate) const FC_NONE: u8 = 0x00;
pub(crate) const FC_SEGMENT: u8 = 0x04;
pub(crate) const FC_MESSAGE: u8 = 0x08;

/* Info field: NSP version 4.1 */
pub(crate) const INFO_VER41: u8 = 0x03;

/* Field-present bits in a Connect-Initiate menuver octet */
pub(crate) const MENUVER_ACC: u8 = 0x01;
pub(crate) const MENUVER_USR: u8 = 0x02;

/* Acknowledgement word */
pub(crate) const ACK_PRESENT: u16 = 0x8000;
pub(crate) const ACK_NAK: u16 = 0x4000;
pub(crate) const ACK_XSUB: u16 = 0x2000;

/// Receiver policy bit in the segnum word of a data segment: the sender
/// wants this segment acknowledged without delay.
pub(crate) const SEG_SENDACK: u16 = 0x1000;

/// Connect and disconnect payloads are small inline fields.
pub(crate) const MAX_USER_DATA: usize = 16;

/// Flow control window ceiling when the peer runs none of its own.
pub(crate) const MAX_WINDOW: usize = 0x07fe;

/* Worst case NSP data header: flags, two addresses, two acks, segnum */
pub(crate) const MAX_NSP_DATA_HEADER: usize = 11;
pub(crate) const SHORT_ROUTE_HEADER: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MsgKind {
    Nop,
    ConnInit { retrans: bool },
    ConnConf,
    DiscInit,
    DiscConf,
    ConnAck,
    Ack { oth: bool },
    Data,
    LinkService,
    OtherData,
    Reserved,
}

/// Classify a message identification octet. `None` means a reserved bit was
/// set and the segment must be dropped outright.
pub(crate) fn classify(flags: u8) -> Option<MsgKind> {
    if flags & 0x83 != 0 {
        return None;
    }
    if flags & 0x0c == 0x08 {
        return Some(match flags & 0x70 {
            0x00 => MsgKind::Nop,
            0x10 => MsgKind::ConnInit { retrans: false },
            0x60 => MsgKind::ConnInit { retrans: true },
            0x20 => MsgKind::ConnConf,
            0x30 => MsgKind::DiscInit,
            0x40 => MsgKind::DiscConf,
            _ => MsgKind::Reserved, /* 0x50, 0x70: Phase II node init */
        });
    }
    if flags == MSG_CONNACK {
        return Some(MsgKind::ConnAck);
    }
    if flags & 0x0c == 0x04 {
        return Some(MsgKind::Ack {
            oth: flags & 0x10 != 0,
        });
    }
    Some(match flags & 0x70 {
        0x10 => MsgKind::LinkService,
        0x30 => MsgKind::OtherData,
        /* 0x20 and 0x40 are the BOM/EOM bits of a data segment */
        _ => MsgKind::Data,
    })
}

/// A destination or source end user, either a well known object number or a
/// named task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectName {
    Number(u8),
    Name(String),
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectName::Number(n) => write!(f, "#{n}"),
            ObjectName::Name(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ObjectName {
    fn from(s: &str) -> Self {
        ObjectName::Name(s.to_uppercase())
    }
}

impl From<u8> for ObjectName {
    fn from(n: u8) -> Self {
        ObjectName::Number(n)
    }
}

/// Peer-advertised flow control style, from the services octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowCtl {
    None,
    Segment,
    Message,
}

impl FlowCtl {
    pub fn from_services(services: u8) -> FlowCtl {
        match services & FC_MASK {
            FC_SEGMENT => FlowCtl::Segment,
            FC_MESSAGE => FlowCtl::Message,
            _ => FlowCtl::None,
        }
    }
}

/// On/off gate commanded through link service messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlowGate {
    DontSend,
    Send,
}

/// Sidecar decoded from the routing and NSP headers, carried with the
/// segment through dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegCb {
    pub rt_flags: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
    pub short_header: bool,
    pub nsp_flags: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub services: u8,
    pub info: u8,
    pub segsize: u16,
}

impl SegCb {
    pub fn new(rt: &RouteHdr) -> SegCb {
        SegCb {
            rt_flags: rt.rt_flags,
            src: rt.src,
            dst: rt.dst,
            short_header: rt.short_header,
            nsp_flags: 0,
            src_port: 0,
            dst_port: 0,
            services: 0,
            info: 0,
            segsize: 0,
        }
    }

    pub fn returned(&self) -> bool {
        self.rt_flags & RT_F_RTS != 0
    }

    pub fn intra_ethernet(&self) -> bool {
        self.rt_flags & RT_F_IE != 0
    }
}

/// Stack-wide tunables. The kernel original exposes these as sysctls.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log malformed inbound packets (rate limited).
    pub log_martians: bool,
    /// Largest segment we offer to receive off-Ethernet.
    pub segbufsize: u16,
    /// Connect phase give-up timer.
    pub outgoing_timer: Duration,
    /// Send window ceiling against peers that run no flow control.
    pub no_fc_max_cwnd: usize,
    /// How long a data acknowledgement may wait for a ride.
    pub ackdelay: Duration,
    /// Per-link receive memory budget.
    pub rcvbuf: usize,
    /// Pending connect requests held per listener.
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_martians: true,
            segbufsize: 1450,
            outgoing_timer: Duration::from_secs(60),
            no_fc_max_cwnd: 8,
            ackdelay: Duration::from_secs(3),
            rcvbuf: 64240,
            accept_backlog: 16,
        }
    }
}

/// One-line-per-interval limiter for martian diagnostics.
#[derive(Debug)]
pub(crate) struct Ratelimit {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u32,
}

impl Ratelimit {
    pub fn new(interval: Duration) -> Self {
        Ratelimit {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    pub fn allow(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(t) if now.duration_since(t) < self.interval => {
                self.suppressed += 1;
                false
            }
            _ => {
                if self.suppressed > 0 {
                    log::info!("{} martian packets suppressed", self.suppressed);
                    self.suppressed = 0;
                }
                self.last = Some(now);
                true
            }
        }
    }
}

pub(crate) fn log_martian(
    limit: &mut Ratelimit,
    enabled: bool,
    dev: &str,
    msg: &str,
    cb: &SegCb,
) {
    if enabled && limit.allow() {
        log::info!(
            "martian packet ({msg}) dev={dev} src={} dst={} srcport={:#06x} dstport={:#06x}",
            cb.src,
            cb.dst,
            cb.src_port,
            cb.dst_port
        );
    }
}

/*
    Sequence numbers occupy the low 12 bits of their field. All comparisons
    are made modulo 4096 with a half-space split, the same wraparound rule
    TCP applies over its 32-bit space but on the narrower NSP one.
*/
pub(crate) const SEQ_MASK: u16 = 0x0fff;

pub(crate) fn seq_equal(a: u16, b: u16) -> bool {
    (a ^ b) & SEQ_MASK == 0
}

pub(crate) fn seq_next(cur: u16, got: u16) -> bool {
    seq_equal(cur.wrapping_add(1), got)
}

/// True iff `a` is strictly later than `b` in the 12-bit space.
pub(crate) fn seq_after(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) & SEQ_MASK > 2048
}

pub(crate) fn seq_before_or_equal(a: u16, b: u16) -> bool {
    seq_equal(a, b) || seq_after(b, a)
}

pub(crate) fn seq_add(seq: &mut u16, n: u16) {
    *seq = seq.wrapping_add(n) & SEQ_MASK;
}
