use std::cmp;
use std::collections::VecDeque;
use std::mem;
use std::time::{Duration, Instant};

use super::listen::PendingCi;
use super::*;

/// Terminal blocks linger this long so late duplicates die quietly.
const DESTROY_TIMER: Duration = Duration::from_secs(30);

/// Outbound user data buffered per link.
const SND_BUF: usize = 64240;

/// Accounting overhead charged per queued receive message on top of its
/// payload allocation.
const RX_OVERHEAD: usize = mem::size_of::<RxMsg>();

/*
        DNA NSP Functional Specification V4.0.0 - S5.1

    Port states. An inbound request rests in CR until the local user answers
    it; an outbound one walks CI -> CD -> RUN as the Connect-Ack and
    Connect-Confirm come back. Everything to the right of RUN is one of the
    disconnect endgames.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    O,      /* Open */
    Cr,     /* Connect received */
    Ci,     /* Connect initiate sent */
    Cd,     /* Connect delivered */
    Cc,     /* Connect confirm sent */
    Run,    /* Running */
    Di,     /* Disconnect initiate sent */
    Dic,    /* Disconnect complete */
    Dr,     /* Disconnect reject sent */
    Drc,    /* Disconnect reject complete */
    Dn,     /* Disconnect notification from peer */
    Rj,     /* Rejected */
    Nr,     /* No resources */
    Nc,     /* No communication */
    Cn,     /* Closed notification */
    Closed, /* Gone */
}

impl State {
    /// States past the point of no return: further inputs are dropped
    /// without reply or mutation.
    pub fn post_terminal(self) -> bool {
        matches!(
            self,
            State::Rj
                | State::Dn
                | State::Dic
                | State::Drc
                | State::Cn
                | State::Nr
                | State::Nc
                | State::Closed
        )
    }
}

/// User-visible outcome latched on a failed or torn down link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Refused,
    Unreachable,
    NoResources,
    Disconnected,
    TimedOut,
}

impl Fault {
    pub fn as_error(self) -> crate::Error {
        match self {
            Fault::Refused => crate::Error::Refused,
            Fault::Unreachable => crate::Error::Unreachable,
            Fault::NoResources => crate::Error::NoResources,
            Fault::Disconnected => crate::Error::Disconnected,
            Fault::TimedOut => crate::Error::TimedOut,
        }
    }
}

/// Notifications owed after processing one inbound segment or timer pass.
/// The engine itself never blocks; the dispatcher turns these into condvar
/// signals once the lock is about to drop.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Wake {
    pub reader: bool,
    pub oth_reader: bool,
    pub writer: bool,
    pub state: bool,
    pub destroy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistKind {
    RetransCi,
    RetransCc,
    Destroy,
}

/// One outstanding segment awaiting acknowledgement.
#[derive(Debug)]
struct TxEntry {
    segnum: u16,
    #[allow(dead_code)]
    len: usize,
}

#[derive(Debug)]
struct RxMsg {
    buf: Vec<u8>,
    off: usize,
    charge: usize,
}

/// Per-link state block: addresses, both subchannels' counters, flow
/// control, timers and queues. One per entry in the connection table.
#[derive(Debug)]
pub(crate) struct ConnCb {
    pub state: State,
    pub local_addr: u16,
    pub remote_addr: u16,

    /* cached path back to the peer */
    pub node: NodeAddr,
    pub intra_ethernet: bool,

    /* data subchannel */
    pub num_data_sent: u16,
    pub num_data_rcv: u16,
    pub ackrcv_dat: u16,

    /* other-data subchannel */
    pub num_oth_sent: u16,
    pub num_oth_rcv: u16,
    pub ackrcv_oth: u16,

    /* flow control */
    pub flowrem_dat: u16,
    pub flowrem_oth: u16,
    pub flowrem_sw: FlowGate,
    pub flowloc_sw: FlowGate,

    /* peer capabilities */
    pub services_rem: u8,
    pub info_rem: u8,
    pub segsize_rem: u16,
    pub max_window: usize,

    pub conndata_in: Vec<u8>,
    pub discdata_in: Vec<u8>,
    pub disc_reason: u16,
    pub fault: Option<Fault>,
    pub shutdown: bool,

    /* timers */
    persist: Option<Instant>,
    persist_kind: Option<PersistKind>,
    conntimer: Option<Instant>,
    ackdelay: Option<Instant>,
    nsp_rxtshift: u32,
    pub stamp: Instant,

    /* receive side */
    data_rcv_queue: VecDeque<RxMsg>,
    oth_rcv_queue: VecDeque<RxMsg>,
    rmem: usize,
    rcv_drops: u64,
    pub filter: Option<fn(&[u8]) -> bool>,

    /* transmit side */
    outgoing: VecDeque<u8>,
    oth_out: VecDeque<Vec<u8>>,
    data_xmit: VecDeque<TxEntry>,
    oth_xmit: VecDeque<TxEntry>,
    ctl_out: VecDeque<Vec<u8>>,
    retrans_frame: Option<Vec<u8>>,

    cfg: Config,
}

impl ConnCb {
    pub fn new(cfg: Config) -> Self {
        ConnCb {
            state: State::O,
            local_addr: 0,
            remote_addr: 0,
            node: NodeAddr(0),
            intra_ethernet: false,
            num_data_sent: 0,
            num_data_rcv: 0,
            ackrcv_dat: 0,
            num_oth_sent: 0,
            num_oth_rcv: 0,
            ackrcv_oth: 0,
            flowrem_dat: 0,
            /* one unsolicited interrupt is always allowed */
            flowrem_oth: 1,
            flowrem_sw: FlowGate::Send,
            flowloc_sw: FlowGate::Send,
            services_rem: 0,
            info_rem: 0,
            segsize_rem: 230 - MAX_NSP_DATA_HEADER as u16,
            max_window: MAX_WINDOW,
            conndata_in: Vec::new(),
            discdata_in: Vec::new(),
            disc_reason: 0,
            fault: None,
            shutdown: false,
            persist: None,
            persist_kind: None,
            conntimer: None,
            ackdelay: None,
            nsp_rxtshift: 0,
            stamp: Instant::now(),
            data_rcv_queue: VecDeque::new(),
            oth_rcv_queue: VecDeque::new(),
            rmem: 0,
            rcv_drops: 0,
            filter: None,
            outgoing: VecDeque::new(),
            oth_out: VecDeque::new(),
            data_xmit: VecDeque::new(),
            oth_xmit: VecDeque::new(),
            ctl_out: VecDeque::new(),
            retrans_frame: None,
            cfg,
        }
    }

    /// Active open: queue the Connect-Initiate and arm both connect timers.
    pub fn start_connect(
        &mut self,
        local_addr: u16,
        node: NodeAddr,
        dstname: &ObjectName,
        srcname: &ObjectName,
        user: &[u8],
        now: Instant,
    ) {
        self.local_addr = local_addr;
        self.node = node;
        self.state = State::Ci;

        let ci = build_conn_init(
            local_addr,
            SVC_BASE | FC_NONE,
            INFO_VER41,
            self.cfg.segbufsize,
            dstname,
            srcname,
            user,
        );
        self.ctl_out.push_back(ci.clone());
        self.retrans_frame = Some({
            let mut f = ci;
            f[0] = MSG_CI_RETRANS;
            f
        });
        self.persist = Some(now + self.rxt_backoff());
        self.persist_kind = Some(PersistKind::RetransCi);
        self.conntimer = Some(now + self.cfg.outgoing_timer);
    }

    /// Passive open: adopt a decoded Connect-Initiate. The block waits in
    /// CR until the user answers with `confirm` or `refuse`.
    pub fn from_ci(cfg: Config, ci: &PendingCi, local_addr: u16) -> ConnCb {
        let mut cb = ConnCb::new(cfg);
        cb.state = State::Cr;
        cb.local_addr = local_addr;
        cb.remote_addr = ci.remote_port;
        cb.node = ci.node;
        cb.intra_ethernet = ci.rt_flags & RT_F_IE != 0;
        cb.services_rem = ci.services;
        cb.info_rem = ci.info;
        cb.segsize_rem = ci.segsize;
        cb.conndata_in = ci.userdata.clone();
        if FlowCtl::from_services(ci.services) == FlowCtl::None {
            cb.max_window = cb.cfg.no_fc_max_cwnd;
        }
        cb.clamp_segsize(ci.short_header, ci.rt_flags & RT_F_IE != 0);
        cb
    }

    /// Accept a connect request: Connect-Ack stops the peer's CI
    /// retransmission, Connect-Confirm carries our capabilities.
    pub fn confirm(&mut self, user: &[u8], now: Instant) {
        self.ctl_out.push_back(build_conn_ack(self.remote_addr));
        let cc = build_conn_conf(
            self.remote_addr,
            self.local_addr,
            SVC_BASE | FC_NONE,
            INFO_VER41,
            self.cfg.segbufsize,
            user,
        );
        self.ctl_out.push_back(cc.clone());
        self.retrans_frame = Some(cc);
        self.state = State::Cc;
        self.persist = Some(now + self.rxt_backoff());
        self.persist_kind = Some(PersistKind::RetransCc);
        self.conntimer = Some(now + self.cfg.outgoing_timer);
    }

    /// Refuse a connect request and wait out the peer's confirm in DR.
    pub fn refuse(&mut self, reason: u16, now: Instant) {
        self.ctl_out.push_back(build_disc(
            MSG_DI,
            self.remote_addr,
            self.local_addr,
            reason,
            &[],
        ));
        self.state = State::Dr;
        self.conntimer = Some(now + self.cfg.outgoing_timer);
    }

    /// User close. A live link sends Disconnect-Initiate and waits in DI
    /// for the peer's confirm; with no peer address on record there is
    /// nobody to tell and the block goes straight onto the destroy timer.
    pub fn user_close(&mut self, disc_data: &[u8], now: Instant) {
        match self.state {
            State::Ci | State::Cd | State::Cc | State::Run => {
                if self.remote_addr != 0 {
                    self.ctl_out.push_back(build_disc(
                        MSG_DI,
                        self.remote_addr,
                        self.local_addr,
                        REASON_OK,
                        disc_data,
                    ));
                    self.state = State::Di;
                    self.conntimer = Some(now + self.cfg.outgoing_timer);
                } else {
                    self.persist = Some(now);
                    self.persist_kind = Some(PersistKind::Destroy);
                    self.conntimer = None;
                }
            }
            _ => {}
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.nsp_rxtshift = 0;
        self.stamp = now;
    }

    /// An off-Ethernet or short-header path cannot carry a full Ethernet
    /// segment; cap what the peer may push through it.
    fn clamp_segsize(&mut self, short_header: bool, intra_ethernet: bool) {
        if short_header || !intra_ethernet {
            let ceil = self.cfg.segbufsize - (MAX_NSP_DATA_HEADER + SHORT_ROUTE_HEADER) as u16;
            if self.segsize_rem > ceil {
                self.segsize_rem = ceil;
            }
        }
    }

    /* ---- inbound dispatch ---- */

    /// Apply one inbound message to the state machine. `body` starts right
    /// after the address words.
    pub fn on_message(
        &mut self,
        port: &mut dyn Port,
        cb: &SegCb,
        body: &[u8],
        now: Instant,
    ) -> Wake {
        let mut wake = Wake::default();

        if cb.returned() {
            /* only our own Connect-Initiate is ever reflected */
            if cb.nsp_flags == MSG_CI || cb.nsp_flags == MSG_CI_RETRANS {
                self.returned_ci(port, &mut wake, now);
            }
            return wake;
        }

        if self.state.post_terminal() {
            return wake;
        }

        let Some(kind) = classify(cb.nsp_flags) else {
            return wake;
        };

        match kind {
            MsgKind::Nop | MsgKind::Reserved => {}
            /* a retransmitted CI for a link we already track */
            MsgKind::ConnInit { .. } => {}
            MsgKind::ConnAck => self.conn_ack(&mut wake, now),
            MsgKind::ConnConf => self.conn_conf(cb, body, &mut wake),
            MsgKind::DiscInit => self.disc_init(port, cb, body, &mut wake, now),
            MsgKind::DiscConf => self.disc_conf(port, body, &mut wake, now),
            MsgKind::Ack { .. } | MsgKind::Data | MsgKind::LinkService | MsgKind::OtherData => {
                /* both data and ack frames kick a confirm-sent link to RUN */
                if self.state == State::Cc {
                    self.state = State::Run;
                    self.clamp_segsize(cb.short_header, cb.intra_ethernet());
                    self.persist = None;
                    self.persist_kind = None;
                    self.retrans_frame = None;
                    self.conntimer = None;
                    wake.state = true;
                }

                let oth = matches!(
                    kind,
                    MsgKind::LinkService | MsgKind::OtherData | MsgKind::Ack { oth: true }
                );

                let mut body = body;
                self.process_acks(&mut body, oth, &mut wake);

                if matches!(kind, MsgKind::Ack { .. }) || self.state != State::Run {
                    return wake;
                }

                match kind {
                    MsgKind::LinkService => self.link_service(port, body, &mut wake),
                    MsgKind::OtherData => self.other_data(port, body, &mut wake),
                    _ => self.data(port, body, &mut wake, now),
                }
            }
        }

        wake
    }

    /// Our own Connect-Initiate came back from the routing layer: nobody
    /// out there to talk to.
    fn returned_ci(&mut self, port: &mut dyn Port, wake: &mut Wake, now: Instant) {
        if self.state == State::Ci {
            self.state = State::Nc;
            self.fault = Some(Fault::Unreachable);
            wake.state = true;
            self.enter_terminal(port, false, now);
        }
    }

    /// Connect-Ack: the remote node has the request and is delivering it.
    fn conn_ack(&mut self, wake: &mut Wake, now: Instant) {
        if self.state == State::Ci {
            self.state = State::Cd;
            self.persist = None;
            self.persist_kind = None;
            self.conntimer = Some(now + self.cfg.outgoing_timer);
            wake.state = true;
        }
    }

    fn conn_conf(&mut self, cb: &SegCb, mut body: &[u8], wake: &mut Wake) {
        let Some(services) = pull_u8(&mut body) else {
            return;
        };
        let Some(info) = pull_u8(&mut body) else {
            return;
        };
        let Some(segsize) = pull_le16(&mut body) else {
            return;
        };

        if matches!(self.state, State::Ci | State::Cd) {
            self.persist = None;
            self.persist_kind = None;
            self.retrans_frame = None;
            self.conntimer = None;
            self.remote_addr = cb.src_port;
            self.state = State::Run;
            self.services_rem = services;
            self.info_rem = info;
            self.segsize_rem = segsize;
            self.clamp_segsize(cb.short_header, cb.intra_ethernet());

            if FlowCtl::from_services(services) == FlowCtl::None {
                self.max_window = self.cfg.no_fc_max_cwnd;
            }

            if !body.is_empty() {
                if let Some(data) = pull_idf(&mut body, MAX_USER_DATA, 0) {
                    self.conndata_in = data;
                }
            }

            wake.state = true;
            wake.writer = true;
        }
    }

    fn disc_init(
        &mut self,
        port: &mut dyn Port,
        cb: &SegCb,
        mut body: &[u8],
        wake: &mut Wake,
        now: Instant,
    ) {
        let Some(reason) = pull_le16(&mut body) else {
            return;
        };
        self.disc_reason = reason;
        self.discdata_in.clear();
        if !body.is_empty() {
            if let Some(data) = pull_idf(&mut body, MAX_USER_DATA, 0) {
                self.discdata_in = data;
            }
        }
        self.remote_addr = cb.src_port;

        match self.state {
            State::Ci | State::Cd => {
                self.state = State::Rj;
                self.fault = Some(Fault::Refused);
                self.conntimer = None;
            }
            State::Run => {
                self.shutdown = true;
                self.state = State::Dn;
            }
            State::Di => self.state = State::Dic,
            _ => return,
        }

        wake.state = true;
        wake.reader = true;
        wake.oth_reader = true;
        wake.writer = true;
        self.enter_terminal(port, true, now);
    }

    fn disc_conf(
        &mut self,
        port: &mut dyn Port,
        mut body: &[u8],
        wake: &mut Wake,
        now: Instant,
    ) {
        let Some(reason) = pull_le16(&mut body) else {
            return;
        };
        self.disc_reason = reason;

        match self.state {
            State::Ci => {
                self.state = State::Nr;
                self.fault = Some(Fault::NoResources);
            }
            State::Dr if reason == REASON_DC => self.state = State::Drc,
            State::Dr if reason == REASON_NL => self.state = State::Cn,
            State::Di => self.state = State::Dic,
            State::Run => {
                self.shutdown = true;
                self.fault = Some(Fault::Disconnected);
                self.state = State::Cn;
            }
            State::Cc => {
                self.fault = Some(Fault::Disconnected);
                self.state = State::Cn;
            }
            _ => return,
        }

        wake.state = true;
        wake.reader = true;
        wake.oth_reader = true;
        wake.writer = true;
        /* a confirm is never confirmed back */
        self.enter_terminal(port, false, now);
    }

    /// Park the block on the destroy timer rather than freeing in place.
    /// When we know who to tell, confirm the disconnect; with no peer
    /// address on record no reply leaves this node.
    fn enter_terminal(&mut self, port: &mut dyn Port, reply: bool, now: Instant) {
        self.persist = Some(now + DESTROY_TIMER);
        self.persist_kind = Some(PersistKind::Destroy);
        self.conntimer = None;
        self.ackdelay = None;
        self.retrans_frame = None;

        if reply && self.remote_addr != 0 {
            let disc = build_disc(
                MSG_DC,
                self.remote_addr,
                self.local_addr,
                REASON_DC,
                &[],
            );
            port.emit(self.node, &disc);
        }
    }

    /* ---- acknowledgement processing ---- */

    /// Parse up to two piggybacked ack words off the head of `body`. `oth`
    /// marks an other-data class carrier, whose "own" ack refers to the
    /// opposite subchannel; the 0x2000 flip undoes the swap.
    fn process_acks(&mut self, body: &mut &[u8], oth: bool, wake: &mut Wake) {
        for _ in 0..2 {
            if body.len() < 2 {
                return;
            }
            let word = u16::from_le_bytes([body[0], body[1]]);
            if word & ACK_PRESENT == 0 {
                return;
            }
            *body = &body[2..];
            if word & ACK_NAK != 0 {
                /* NAKs are consumed but carry no action */
                continue;
            }
            let word = if oth { word ^ ACK_XSUB } else { word };
            self.apply_ack(word, wake);
        }
    }

    /// Advance one subchannel's high-water mark and release everything the
    /// peer now holds. Any forward progress wakes blocked writers.
    fn apply_ack(&mut self, word: u16, wake: &mut Wake) {
        let value = word & SEQ_MASK;
        match (word >> 12) & 0x03 {
            0 => {
                if seq_after(value, self.ackrcv_dat) {
                    self.ackrcv_dat = value;
                    Self::release(&mut self.data_xmit, value);
                    wake.writer = true;
                }
            }
            2 => {
                if seq_after(value, self.ackrcv_oth) {
                    self.ackrcv_oth = value;
                    Self::release(&mut self.oth_xmit, value);
                    wake.writer = true;
                }
            }
            _ => {}
        }
    }

    fn release(q: &mut VecDeque<TxEntry>, acknum: u16) {
        while let Some(front) = q.front() {
            if !seq_before_or_equal(front.segnum, acknum) {
                break;
            }
            q.pop_front();
        }
    }

    /* ---- data group handlers, RUN state only ---- */

    fn link_service(&mut self, port: &mut dyn Port, body: &[u8], wake: &mut Wake) {
        if body.len() != 4 {
            return;
        }
        let segnum = u16::from_le_bytes([body[0], body[1]]);
        let lsflags = body[2];
        let fcval = body[3] as i8;
        let fctype = FlowCtl::from_services(self.services_rem);

        /* Erroneous flag bits would justify an abort; dropping the message
           is enough here. */
        if lsflags & 0xf8 != 0 {
            return;
        }

        if seq_next(self.num_oth_rcv, segnum) {
            seq_add(&mut self.num_oth_rcv, 1);

            if lsflags & 0x04 == 0 {
                /* data subchannel */
                match lsflags & 0x03 {
                    0x00 => {
                        /* request count adjustment */
                        if fcval < 0 {
                            let dec = -(fcval as i16) as u16;
                            if fctype == FlowCtl::Segment && self.flowrem_dat > dec {
                                self.flowrem_dat -= dec;
                            }
                        } else if fcval > 0 {
                            self.flowrem_dat += fcval as u16;
                            wake.writer = true;
                        }
                    }
                    0x01 => self.flowrem_sw = FlowGate::DontSend,
                    0x02 => {
                        self.flowrem_sw = FlowGate::Send;
                        self.output(port);
                        wake.writer = true;
                    }
                    _ => {}
                }
            } else if fcval > 0 {
                /* interrupt subchannel */
                self.flowrem_oth += fcval as u16;
                wake.writer = true;
            }
        }

        self.send_oth_ack(port);
    }

    fn other_data(&mut self, port: &mut dyn Port, mut body: &[u8], wake: &mut Wake) {
        let Some(segnum) = pull_le16(&mut body) else {
            return;
        };

        if seq_next(self.num_oth_rcv, segnum) && self.queue_rcv(body, true) {
            seq_add(&mut self.num_oth_rcv, 1);
            wake.oth_reader = true;
        }

        /* Acked regardless: the ack reports in-order acceptance, not
           queueing success. */
        self.send_oth_ack(port);
    }

    fn data(&mut self, port: &mut dyn Port, mut body: &[u8], wake: &mut Wake, now: Instant) {
        let Some(segword) = pull_le16(&mut body) else {
            return;
        };
        let segnum = segword & SEQ_MASK;

        if seq_next(self.num_data_rcv, segnum) {
            if self.queue_rcv(body, false) {
                seq_add(&mut self.num_data_rcv, 1);
                wake.reader = true;
            }

            /* the queue is filling up faster than the user drains it */
            if self.flowloc_sw == FlowGate::Send && self.congested() {
                self.flowloc_sw = FlowGate::DontSend;
                self.send_link(port, 0x01, 0);
            }
        }

        if segword & SEG_SENDACK != 0 {
            self.send_data_ack(port);
        } else if self.ackdelay.is_none() {
            self.ackdelay = Some(now + self.cfg.ackdelay);
        }
    }

    /// Filter, charge the receive budget, then append. The charge covers
    /// the whole allocation, not just the payload bytes.
    fn queue_rcv(&mut self, payload: &[u8], oth: bool) -> bool {
        if let Some(filter) = self.filter {
            if !filter(payload) {
                return false;
            }
        }

        let buf = payload.to_vec();
        let charge = buf.capacity() + RX_OVERHEAD;
        if self.rmem + charge > self.cfg.rcvbuf {
            self.rcv_drops += 1;
            return false;
        }
        self.rmem += charge;

        let msg = RxMsg {
            buf,
            off: 0,
            charge,
        };
        if oth {
            self.oth_rcv_queue.push_back(msg);
        } else {
            self.data_rcv_queue.push_back(msg);
        }
        true
    }

    fn congested(&self) -> bool {
        self.rmem * 2 > self.cfg.rcvbuf
    }

    /* ---- outbound ---- */

    fn send_data_ack(&mut self, port: &mut dyn Port) {
        self.ackdelay = None;
        let v = build_data_ack(
            self.remote_addr,
            self.local_addr,
            self.num_data_rcv,
            self.num_oth_rcv,
        );
        port.emit(self.node, &v);
    }

    fn send_oth_ack(&mut self, port: &mut dyn Port) {
        let v = build_oth_ack(
            self.remote_addr,
            self.local_addr,
            self.num_oth_rcv,
            self.num_data_rcv,
        );
        port.emit(self.node, &v);
    }

    /// Link service messages ride the other-data subchannel and take a
    /// sequence number of their own.
    fn send_link(&mut self, port: &mut dyn Port, lsflags: u8, fcval: i8) {
        seq_add(&mut self.num_oth_sent, 1);
        let segnum = self.num_oth_sent;
        let v = build_link_service(
            self.remote_addr,
            self.local_addr,
            self.num_oth_rcv,
            self.num_data_rcv,
            segnum,
            lsflags,
            fcval,
        );
        self.oth_xmit.push_back(TxEntry { segnum, len: 0 });
        port.emit(self.node, &v);
    }

    pub fn can_send_data(&self) -> bool {
        if self.state != State::Run || self.flowrem_sw != FlowGate::Send {
            return false;
        }
        match FlowCtl::from_services(self.services_rem) {
            FlowCtl::None => self.data_xmit.len() < self.max_window,
            _ => self.flowrem_dat > 0,
        }
    }

    pub fn can_send_oth(&self) -> bool {
        self.state == State::Run && self.flowrem_oth > 0
    }

    pub fn send_space(&self) -> usize {
        SND_BUF - self.outgoing.len()
    }

    pub fn push_out(&mut self, buf: &[u8]) -> usize {
        let len = cmp::min(buf.len(), self.send_space());
        self.outgoing.extend(buf[..len].iter());
        len
    }

    pub fn push_interrupt(&mut self, buf: &[u8]) {
        self.oth_out.push_back(buf.to_vec());
    }

    pub fn out_empty(&self) -> bool {
        self.outgoing.is_empty() && self.oth_out.is_empty() && self.data_xmit.is_empty()
    }

    /// Flush queued user data while the window and flow gates allow. Every
    /// segment carries our current acks, so a pending delayed ack rides
    /// along for free.
    fn output(&mut self, port: &mut dyn Port) {
        while !self.outgoing.is_empty() && self.can_send_data() {
            let len = cmp::min(self.outgoing.len(), self.segsize_rem as usize);
            let payload: Vec<u8> = self.outgoing.drain(..len).collect();
            seq_add(&mut self.num_data_sent, 1);
            let segnum = self.num_data_sent;
            let v = build_data(
                self.remote_addr,
                self.local_addr,
                self.num_data_rcv,
                self.num_oth_rcv,
                segnum,
                false,
                &payload,
            );
            self.ackdelay = None;
            self.data_xmit.push_back(TxEntry { segnum, len });
            if FlowCtl::from_services(self.services_rem) != FlowCtl::None
                && self.flowrem_dat > 0
            {
                self.flowrem_dat -= 1;
            }
            port.emit(self.node, &v);
        }

        while !self.oth_out.is_empty() && self.can_send_oth() {
            let payload = self.oth_out.pop_front().unwrap();
            seq_add(&mut self.num_oth_sent, 1);
            let segnum = self.num_oth_sent;
            let v = build_other_data(
                self.remote_addr,
                self.local_addr,
                self.num_oth_rcv,
                self.num_data_rcv,
                segnum,
                &payload,
            );
            self.oth_xmit.push_back(TxEntry {
                segnum,
                len: payload.len(),
            });
            self.flowrem_oth -= 1;
            port.emit(self.node, &v);
        }
    }

    /* ---- timers ---- */

    fn rxt_backoff(&self) -> Duration {
        Duration::from_secs(1 << self.nsp_rxtshift.min(5))
    }

    /// Timer pass, run from the frame loop tick. Control frames queued by
    /// user context drain here so the device handle stays on one thread.
    pub fn on_tick(&mut self, port: &mut dyn Port, now: Instant) -> Wake {
        let mut wake = Wake::default();

        while let Some(v) = self.ctl_out.pop_front() {
            port.emit(self.node, &v);
        }

        if let Some(t) = self.persist {
            if now >= t {
                self.persist = None;
                match self.persist_kind {
                    Some(PersistKind::RetransCi) | Some(PersistKind::RetransCc) => {
                        if let Some(v) = &self.retrans_frame {
                            port.emit(self.node, v);
                        }
                        self.nsp_rxtshift += 1;
                        self.persist = Some(now + self.rxt_backoff());
                    }
                    Some(PersistKind::Destroy) => {
                        self.state = State::Closed;
                        wake.destroy = true;
                        wake.state = true;
                        return wake;
                    }
                    None => {}
                }
            }
        }

        if let Some(t) = self.conntimer {
            if now >= t {
                self.conntimer = None;
                if self.state != State::Run && !self.state.post_terminal() {
                    self.fault = Some(Fault::TimedOut);
                    self.state = State::Cn;
                    wake.state = true;
                    wake.reader = true;
                    wake.writer = true;
                    self.enter_terminal(port, true, now);
                    return wake;
                }
            }
        }

        if let Some(t) = self.ackdelay {
            if now >= t {
                self.send_data_ack(port);
            }
        }

        if self.state == State::Run {
            self.output(port);
        }

        wake
    }

    /* ---- user-side drains ---- */

    pub fn has_data(&self) -> bool {
        !self.data_rcv_queue.is_empty()
    }

    pub fn has_interrupt(&self) -> bool {
        !self.oth_rcv_queue.is_empty()
    }

    pub fn receive_drops(&self) -> u64 {
        self.rcv_drops
    }

    /// Copy queued in-order payload out to the user, releasing receive
    /// budget as messages empty.
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.data_rcv_queue.front_mut() else {
                break;
            };
            let avail = front.buf.len() - front.off;
            let n = cmp::min(buf.len() - copied, avail);
            buf[copied..copied + n].copy_from_slice(&front.buf[front.off..front.off + n]);
            copied += n;
            front.off += n;
            if front.off == front.buf.len() {
                let msg = self.data_rcv_queue.pop_front().unwrap();
                self.rmem -= msg.charge;
            }
        }
        copied
    }

    /// Interrupt messages keep their boundaries; one call, one message.
    pub fn recv_interrupt(&mut self) -> Option<Vec<u8>> {
        let msg = self.oth_rcv_queue.pop_front()?;
        self.rmem -= msg.charge;
        Some(msg.buf)
    }
}
