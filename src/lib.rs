use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use etherparse::{Ethernet2Header, Ethernet2HeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tap;

mod err;
pub use err::*;

mod route;
pub use route::{AddrParseError, NodeAddr};
use route::{RouteHdr, ETH_P_DNA_RT};

mod nsp;
pub use nsp::{Config, NspListener, NspStream, ObjectName};
use nsp::{
    classify, log_martian, parse_ci, pull_le16, pull_u8, return_disc, ConnCb, ListenEntry,
    MsgKind, PendingCi, Port, Ratelimit, SegCb, State, Wake, MSG_DC, MSG_DI, REASON_NL,
};

/// One row of the connection table: the state block plus the wakeup plumbing
/// and the backlog that keeps receive processing off a held block.
#[derive(Debug)]
pub(crate) struct ConnEntry {
    pub cb: ConnCb,
    pub rvar: Arc<Condvar>,
    pub ovar: Arc<Condvar>,
    pub wvar: Arc<Condvar>,
    pub svar: Arc<Condvar>,
    pub held: bool,
    pub backlog: VecDeque<(SegCb, Vec<u8>)>,
}

impl ConnEntry {
    fn new(cb: ConnCb) -> Self {
        ConnEntry {
            cb,
            rvar: Arc::new(Condvar::new()),
            ovar: Arc::new(Condvar::new()),
            wvar: Arc::new(Condvar::new()),
            svar: Arc::new(Condvar::new()),
            held: false,
            backlog: VecDeque::new(),
        }
    }

    fn apply(&self, wake: Wake) {
        if wake.reader {
            self.rvar.notify_all();
        }
        if wake.oth_reader {
            self.ovar.notify_all();
        }
        if wake.writer {
            self.wvar.notify_all();
        }
        if wake.state {
            self.svar.notify_all();
        }
    }

    fn notify_all(&self) {
        self.rvar.notify_all();
        self.ovar.notify_all();
        self.wvar.notify_all();
        self.svar.notify_all();
    }
}

/// Connection and listener tables plus everything the dispatcher needs.
/// Lives behind one mutex; per-link serialization on top of that uses the
/// held flag and backlog in each entry.
#[derive(Debug)]
pub(crate) struct Manager {
    pub cfg: Config,
    pub dev: String,
    pub local: NodeAddr,
    pub conns: HashMap<u16, ConnEntry>,
    pub listeners: HashMap<ObjectName, ListenEntry>,
    pub martian: Ratelimit,
}

impl Manager {
    fn new(cfg: Config, dev: String, local: NodeAddr) -> Self {
        Manager {
            cfg,
            dev,
            local,
            conns: HashMap::new(),
            listeners: HashMap::new(),
            martian: Ratelimit::new(Duration::from_secs(5)),
        }
    }

    /// Entry point from the delivery layer: classify, demultiplex and hand
    /// the segment to its state block, or answer for links we do not have.
    pub(crate) fn receive(&mut self, port: &mut dyn Port, rt: &RouteHdr, buf: &[u8]) {
        let mut cb = SegCb::new(rt);
        let mut buf: &[u8] = buf;

        let Some(flags) = pull_u8(&mut buf) else {
            return;
        };
        cb.nsp_flags = flags;

        let Some(kind) = classify(flags) else {
            self.martian_log("reserved flag bits", &cb);
            return;
        };
        log::trace!("nsp rx: type {flags:#04x} from {}", rt.src);

        match kind {
            MsgKind::Nop | MsgKind::Reserved => return,
            MsgKind::ConnInit { .. } => {
                if rt.returned() {
                    self.returned_ci(port, &mut cb, buf);
                } else {
                    self.conn_init(port, &mut cb, buf);
                }
                return;
            }
            _ => {}
        }

        /* only our own connect initiates are ever reflected back to us */
        if rt.returned() {
            return;
        }

        let Some(dst_port) = pull_le16(&mut buf) else {
            return;
        };
        cb.dst_port = dst_port;
        if kind != MsgKind::ConnAck {
            cb.src_port = pull_le16(&mut buf).unwrap_or(0);
        }

        let Manager {
            conns,
            martian,
            cfg,
            dev,
            ..
        } = self;
        let Some(entry) = conns.get_mut(&cb.dst_port) else {
            /* No connection for this segment. Connect-class messages that
               expect an answer get told there is no link; the rest vanish. */
            log_martian(martian, cfg.log_martians, dev, "no such link", &cb);
            if cb.nsp_flags & 0x0c == 0x08 && cb.nsp_flags & 0x70 == 0x20 {
                return_disc(port, &cb, MSG_DC, REASON_NL);
            }
            return;
        };

        /* a running link follows the freshest path back to its peer */
        if entry.cb.state == State::Run
            && (entry.cb.node != rt.src || entry.cb.intra_ethernet != rt.intra_ethernet())
        {
            entry.cb.node = rt.src;
            entry.cb.intra_ethernet = rt.intra_ethernet();
        }

        entry.cb.touch(Instant::now());

        /* user context holds the block: park the segment on the backlog */
        if entry.held {
            entry.backlog.push_back((cb, buf.to_vec()));
            return;
        }

        let wake = entry.cb.on_message(port, &cb, buf, Instant::now());
        entry.apply(wake);
    }

    /// A frame of ours bounced. For a Connect-Initiate the source field is
    /// the key on this side; anything else is dropped above.
    fn returned_ci(&mut self, port: &mut dyn Port, cb: &mut SegCb, mut buf: &[u8]) {
        let Some(dst_port) = pull_le16(&mut buf) else {
            return;
        };
        let Some(src_port) = pull_le16(&mut buf) else {
            return;
        };
        cb.dst_port = dst_port;
        cb.src_port = src_port;

        if let Some(entry) = self.conns.get_mut(&src_port) {
            let wake = entry.cb.on_message(port, cb, buf, Instant::now());
            entry.apply(wake);
        }
    }

    /// A fresh Connect-Initiate: find its listener and queue it, or answer
    /// with the reason the decode came up with.
    fn conn_init(&mut self, port: &mut dyn Port, cb: &mut SegCb, buf: &[u8]) {
        let fields = match parse_ci(cb, buf) {
            Ok(fields) => fields,
            Err(e) => {
                self.martian_log("malformed connect initiate", cb);
                if let Some(reason) = e.reason() {
                    return_disc(port, cb, MSG_DI, reason);
                }
                return;
            }
        };

        if self.known_remote(cb.src, cb.src_port) {
            /* a retransmission of a request we already track */
            return;
        }

        let Manager {
            listeners,
            martian,
            cfg,
            dev,
            ..
        } = self;
        let Some(listener) = listeners.get_mut(&fields.dstname) else {
            log_martian(martian, cfg.log_martians, dev, "no such object", cb);
            return_disc(port, cb, MSG_DI, REASON_NL);
            return;
        };

        if listener.queue.len() >= listener.backlog {
            log::debug!("accept queue full for {}, dropping", fields.dstname);
            return;
        }

        listener.queue.push_back(PendingCi {
            node: cb.src,
            remote_port: cb.src_port,
            services: cb.services,
            info: cb.info,
            segsize: cb.segsize,
            rt_flags: cb.rt_flags,
            short_header: cb.short_header,
            srcname: fields.srcname,
            access: fields.access,
            userdata: fields.userdata,
        });
        listener.cvar.notify_one();
    }

    /// Is this (node, port) pair already pending on a listener or bound to
    /// a connection? Retransmitted initiates must not fan out twice.
    fn known_remote(&self, node: NodeAddr, remote_port: u16) -> bool {
        self.conns
            .values()
            .any(|e| e.cb.node == node && e.cb.remote_addr == remote_port)
            || self
                .listeners
                .values()
                .any(|l| {
                    l.queue
                        .iter()
                        .any(|ci| ci.node == node && ci.remote_port == remote_port)
                })
    }

    fn martian_log(&mut self, msg: &str, cb: &SegCb) {
        log_martian(&mut self.martian, self.cfg.log_martians, &self.dev, msg, cb);
    }

    /// Periodic pass: drain backlogs freed by user context, then run every
    /// block's timers. Blocks whose destroy timer fired leave the table.
    pub(crate) fn on_tick(&mut self, port: &mut dyn Port) {
        let now = Instant::now();
        let mut dead = Vec::new();

        for (&addr, entry) in self.conns.iter_mut() {
            if !entry.held {
                while let Some((cb, body)) = entry.backlog.pop_front() {
                    let wake = entry.cb.on_message(port, &cb, &body, now);
                    entry.apply(wake);
                }
            }

            let wake = entry.cb.on_tick(port, now);
            entry.apply(wake);
            if wake.destroy {
                dead.push(addr);
            }
        }

        for addr in dead {
            if let Some(entry) = self.conns.remove(&addr) {
                entry.notify_all();
            }
        }
    }

    /// Pick an unused local link address.
    pub(crate) fn alloc_port(&mut self) -> Result<u16, Error> {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let port: u16 = rng.gen_range(1..=u16::MAX);
            if !self.conns.contains_key(&port) {
                return Ok(port);
            }
        }
        Err(Error::AddrExhausted)
    }

    pub(crate) fn insert_conn(&mut self, local_addr: u16, cb: ConnCb) {
        self.conns.insert(local_addr, ConnEntry::new(cb));
    }

    /// Take up a pending connect request: allocate an address, build the
    /// block and queue Connect-Ack plus Connect-Confirm.
    pub(crate) fn establish(&mut self, ci: PendingCi, user: &[u8]) -> Result<u16, Error> {
        let local_addr = self.alloc_port()?;
        let mut cb = ConnCb::from_ci(self.cfg.clone(), &ci, local_addr);
        cb.confirm(user, Instant::now());
        self.insert_conn(local_addr, cb);
        Ok(local_addr)
    }
}

/// TAP-backed emitter. A node's MAC is a pure function of its address, so
/// no neighbour discovery is needed before answering anyone.
struct EthPort {
    tap: Tap,
    local: NodeAddr,
}

impl Port for EthPort {
    fn emit(&mut self, dst: NodeAddr, nsp: &[u8]) {
        let payload = route::build(dst, self.local, nsp);

        let eth = Ethernet2Header {
            destination: dst.hwaddr(),
            source: self.local.hwaddr(),
            ether_type: ETH_P_DNA_RT,
        };

        let mut frame = Vec::with_capacity(14 + payload.len());
        if eth.write(&mut frame).is_err() {
            return;
        }
        frame.extend_from_slice(&payload);

        if let Err(e) = self.tap.write_all(&frame) {
            log::warn!("tap write failed: {e}");
        }
    }
}

/// A userspace DECnet node: one TAP device, one frame loop, any number of
/// listeners and links.
#[derive(Debug)]
pub struct Stack {
    manager: Arc<Mutex<Manager>>,
    jh: thread::JoinHandle<()>,
}

impl Stack {
    /// Bring up the device and start the frame loop.
    pub fn new(name: &str, local: NodeAddr, cfg: Config) -> Result<Self, Error> {
        let tap = Tap::new(name, false)?;
        tap.bring_up()?;

        let manager = Arc::new(Mutex::new(Manager::new(cfg, name.to_string(), local)));

        let jh = {
            let manager = manager.clone();

            thread::spawn(move || frame_loop(tap, local, manager))
        };

        Ok(Stack { manager, jh })
    }

    /// Register a listener for a destination object.
    pub fn bind(&self, object: impl Into<ObjectName>) -> Result<NspListener, Error> {
        let object = object.into();
        let mut manager = self.manager.lock().unwrap();
        let backlog = manager.cfg.accept_backlog;

        match manager.listeners.entry(object.clone()) {
            Entry::Occupied(_) => Err(Error::ObjectInUse(object)),
            Entry::Vacant(v) => {
                let cvar = Arc::new(Condvar::new());

                v.insert(ListenEntry {
                    cvar: cvar.clone(),
                    queue: VecDeque::new(),
                    backlog,
                });

                Ok(NspListener {
                    object,
                    manager: self.manager.clone(),
                    cvar,
                })
            }
        }
    }

    /// Active open: send Connect-Initiate and block until the link runs or
    /// the connect fails.
    pub fn connect(
        &self,
        node: NodeAddr,
        object: impl Into<ObjectName>,
        user_data: &[u8],
    ) -> Result<NspStream, Error> {
        let object = object.into();
        let mut manager = self.manager.lock().unwrap();

        let local_addr = manager.alloc_port()?;
        let mut cb = ConnCb::new(manager.cfg.clone());
        cb.start_connect(
            local_addr,
            node,
            &object,
            &ObjectName::Number(0),
            user_data,
            Instant::now(),
        );
        manager.insert_conn(local_addr, cb);

        let svar = manager.conns[&local_addr].svar.clone();
        loop {
            let entry = manager
                .conns
                .get(&local_addr)
                .ok_or(Error::StreamClosed(local_addr))?;

            match entry.cb.state {
                State::Run => break,
                state if state.post_terminal() => {
                    let err = entry
                        .cb
                        .fault
                        .map(|f| f.as_error())
                        .unwrap_or(Error::Disconnected);
                    return Err(err);
                }
                _ => manager = svar.wait(manager).unwrap(),
            }
        }

        Ok(NspStream::attach(self.manager.clone(), &manager, local_addr))
    }

    pub fn join(self) {
        self.jh.join().unwrap();
    }
}

fn frame_loop(tap: Tap, local: NodeAddr, manager: Arc<Mutex<Manager>>) -> ! {
    let hwaddr = local.hwaddr();
    let mut port = EthPort { tap, local };

    loop {
        {
            let mut manager = manager.lock().unwrap();
            manager.on_tick(&mut port);
        }

        let mut pfd = [PollFd::new(port.tap.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut pfd[..], 1) {
            Ok(0) | Err(_) => continue,
            Ok(_) => {}
        }

        let mut buf = [0u8; 2048];
        let Ok(n) = port.tap.read(&mut buf) else {
            continue;
        };

        let Ok(eth) = Ethernet2HeaderSlice::from_slice(&buf[..n]) else {
            continue;
        };
        if eth.ether_type() != ETH_P_DNA_RT || eth.destination() != hwaddr {
            continue;
        }

        let Some((rt, nsp)) = route::parse(&buf[eth.slice().len()..n]) else {
            continue;
        };
        if rt.dst != local && !rt.returned() {
            continue;
        }

        let mut manager = manager.lock().unwrap();
        manager.receive(&mut port, &rt, nsp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsp::{
        build_conn_conf, build_conn_init, TestPort, FC_NONE, INFO_VER41, MSG_CI, REASON_ID,
        SVC_BASE,
    };
    use route::{RT_F_IE, RT_F_RTS, RT_PKT_LONG};

    const LOCAL: NodeAddr = NodeAddr(0x0402);
    const PEER: NodeAddr = NodeAddr(0x0401);

    fn manager() -> Manager {
        Manager::new(Config::default(), "tap0".to_string(), LOCAL)
    }

    fn rt_hdr() -> RouteHdr {
        RouteHdr {
            rt_flags: RT_PKT_LONG | RT_F_IE,
            src: PEER,
            dst: LOCAL,
            short_header: false,
        }
    }

    fn returned_rt_hdr() -> RouteHdr {
        let mut rt = rt_hdr();
        rt.rt_flags |= RT_F_RTS;
        rt
    }

    fn listen(m: &mut Manager, object: &str) {
        m.listeners.insert(
            ObjectName::from(object),
            ListenEntry {
                cvar: Arc::new(Condvar::new()),
                queue: VecDeque::new(),
                backlog: m.cfg.accept_backlog,
            },
        );
    }

    fn sample_ci(src_port: u16) -> Vec<u8> {
        build_conn_init(
            src_port,
            SVC_BASE | FC_NONE,
            INFO_VER41,
            1400,
            &ObjectName::from("TASK=FOO"),
            &ObjectName::from("USER"),
            &[],
        )
    }

    #[test]
    fn connect_initiate_lands_on_the_listener() {
        let mut m = manager();
        let mut port = TestPort::new();
        listen(&mut m, "TASK=FOO");

        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101));

        let entry = &m.listeners[&ObjectName::from("TASK=FOO")];
        assert_eq!(entry.queue.len(), 1);
        let ci = &entry.queue[0];
        assert_eq!(ci.node, PEER);
        assert_eq!(ci.remote_port, 0x0101);
        assert_eq!(ci.services, SVC_BASE | FC_NONE);
        assert_eq!(ci.info, INFO_VER41);
        assert_eq!(ci.segsize, 1400);
        assert_eq!(ci.srcname, ObjectName::from("USER"));
        assert!(port.sent.is_empty());
    }

    #[test]
    fn retransmitted_initiate_is_not_queued_twice() {
        let mut m = manager();
        let mut port = TestPort::new();
        listen(&mut m, "TASK=FOO");

        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101));
        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101));

        assert_eq!(m.listeners[&ObjectName::from("TASK=FOO")].queue.len(), 1);
    }

    #[test]
    fn full_accept_queue_drops() {
        let mut m = manager();
        m.cfg.accept_backlog = 1;
        let mut port = TestPort::new();
        listen(&mut m, "TASK=FOO");

        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101));
        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0102));

        assert_eq!(m.listeners[&ObjectName::from("TASK=FOO")].queue.len(), 1);
        assert!(port.sent.is_empty());
    }

    #[test]
    fn initiate_for_unknown_object_is_refused() {
        let mut m = manager();
        let mut port = TestPort::new();

        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101));

        assert_eq!(port.sent.len(), 1);
        let (dst, frame) = &port.sent[0];
        assert_eq!(*dst, PEER);
        assert_eq!(frame[0], MSG_DI);
        assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), 0x0101);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), REASON_NL);
    }

    #[test]
    fn malformed_initiate_answers_from_the_reason_table() {
        let mut m = manager();
        let mut port = TestPort::new();
        listen(&mut m, "TASK=FOO");

        /* destination descriptor with an unknown format */
        let mut ci = vec![MSG_CI];
        ci.extend_from_slice(&[0, 0]);
        ci.extend_from_slice(&[0x01, 0x01]);
        ci.push(SVC_BASE);
        ci.push(INFO_VER41);
        ci.extend_from_slice(&1400u16.to_le_bytes());
        ci.extend_from_slice(&[9, 9]);

        m.receive(&mut port, &rt_hdr(), &ci);

        assert!(m.listeners[&ObjectName::from("TASK=FOO")].queue.is_empty());
        assert_eq!(port.sent.len(), 1);
        let frame = &port.sent[0].1;
        assert_eq!(frame[0], MSG_DI);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), REASON_ID);
    }

    #[test]
    fn truncated_initiate_is_silent() {
        let mut m = manager();
        let mut port = TestPort::new();

        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101)[..6]);
        assert!(port.sent.is_empty());
    }

    #[test]
    fn reserved_flag_bits_are_dropped() {
        let mut m = manager();
        let mut port = TestPort::new();

        m.receive(&mut port, &rt_hdr(), &[0x81, 0x00, 0x00]);
        assert!(port.sent.is_empty());
    }

    #[test]
    fn unknown_link_connect_class_gets_no_link_reply() {
        let mut m = manager();
        let mut port = TestPort::new();

        /* a connect confirm for a port we never allocated */
        let cc = build_conn_conf(0x0202, 0x0101, SVC_BASE, INFO_VER41, 1400, &[]);
        m.receive(&mut port, &rt_hdr(), &cc);

        assert_eq!(port.sent.len(), 1);
        let frame = &port.sent[0].1;
        assert_eq!(frame[0], MSG_DC);
        assert_eq!(u16::from_le_bytes([frame[5], frame[6]]), REASON_NL);
    }

    #[test]
    fn unknown_link_data_is_dropped_silently() {
        let mut m = manager();
        let mut port = TestPort::new();

        let mut data = vec![0x60];
        data.extend_from_slice(&0x0202u16.to_le_bytes());
        data.extend_from_slice(&0x0101u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(b"hello");

        m.receive(&mut port, &rt_hdr(), &data);
        assert!(port.sent.is_empty());
    }

    fn connecting_manager() -> (Manager, u16) {
        let mut m = manager();
        let mut cb = ConnCb::new(m.cfg.clone());
        cb.start_connect(
            0x0303,
            PEER,
            &ObjectName::from("TASK=FOO"),
            &ObjectName::Number(0),
            &[],
            Instant::now(),
        );
        m.insert_conn(0x0303, cb);
        (m, 0x0303)
    }

    #[test]
    fn returned_initiate_keys_on_the_source_port() {
        let (mut m, local_port) = connecting_manager();
        let mut port = TestPort::new();

        /* our own CI, reflected: dstaddr zero, srcaddr is our port */
        let frame = sample_ci(local_port);
        m.receive(&mut port, &returned_rt_hdr(), &frame);

        let entry = &m.conns[&local_port];
        assert_eq!(entry.cb.state, State::Nc);
        assert!(port.sent.is_empty());
    }

    #[test]
    fn returned_non_initiate_is_dropped() {
        let (mut m, local_port) = connecting_manager();
        let mut port = TestPort::new();

        let mut data = vec![0x60];
        data.extend_from_slice(&0x0101u16.to_le_bytes());
        data.extend_from_slice(&local_port.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());

        m.receive(&mut port, &returned_rt_hdr(), &data);
        assert_eq!(m.conns[&local_port].cb.state, State::Ci);
        assert!(port.sent.is_empty());
    }

    #[test]
    fn confirm_reaches_the_connecting_block() {
        let (mut m, local_port) = connecting_manager();
        let mut port = TestPort::new();

        let cc = build_conn_conf(local_port, 0x0101, SVC_BASE | FC_NONE, INFO_VER41, 1400, &[]);
        m.receive(&mut port, &rt_hdr(), &cc);

        let cb = &m.conns[&local_port].cb;
        assert_eq!(cb.state, State::Run);
        assert_eq!(cb.remote_addr, 0x0101);
        assert_eq!(cb.segsize_rem, 1400);
    }

    #[test]
    fn held_block_backlogs_and_tick_drains() {
        let (mut m, local_port) = connecting_manager();
        let mut port = TestPort::new();

        m.conns.get_mut(&local_port).unwrap().held = true;

        let cc = build_conn_conf(local_port, 0x0101, SVC_BASE | FC_NONE, INFO_VER41, 1400, &[]);
        m.receive(&mut port, &rt_hdr(), &cc);

        {
            let entry = &m.conns[&local_port];
            assert_eq!(entry.cb.state, State::Ci);
            assert_eq!(entry.backlog.len(), 1);
        }

        /* still held: the tick must not touch the backlog */
        m.on_tick(&mut port);
        assert_eq!(m.conns[&local_port].backlog.len(), 1);

        m.conns.get_mut(&local_port).unwrap().held = false;
        m.on_tick(&mut port);

        let entry = &m.conns[&local_port];
        assert!(entry.backlog.is_empty());
        assert_eq!(entry.cb.state, State::Run);
    }

    #[test]
    fn running_link_updates_its_route() {
        let (mut m, local_port) = connecting_manager();
        let mut port = TestPort::new();

        let cc = build_conn_conf(local_port, 0x0101, SVC_BASE | FC_NONE, INFO_VER41, 1400, &[]);
        m.receive(&mut port, &rt_hdr(), &cc);
        assert!(m.conns[&local_port].cb.intra_ethernet);

        /* the same peer, now heard through an off-Ethernet path */
        let mut rt = rt_hdr();
        rt.rt_flags &= !RT_F_IE;
        let mut data = vec![0x60];
        data.extend_from_slice(&local_port.to_le_bytes());
        data.extend_from_slice(&0x0101u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(b"x");
        m.receive(&mut port, &rt, &data);

        assert!(!m.conns[&local_port].cb.intra_ethernet);
    }

    #[test]
    fn accepted_request_queues_ack_and_confirm() {
        let mut m = manager();
        let mut port = TestPort::new();
        listen(&mut m, "TASK=FOO");

        m.receive(&mut port, &rt_hdr(), &sample_ci(0x0101));
        let ci = m
            .listeners
            .get_mut(&ObjectName::from("TASK=FOO"))
            .unwrap()
            .queue
            .pop_front()
            .unwrap();

        let local_addr = m.establish(ci, b"ok").unwrap();
        assert_eq!(m.conns[&local_addr].cb.state, State::Cc);

        /* the tick flushes the queued connect ack and confirm */
        m.on_tick(&mut port);
        let kinds: Vec<u8> = port.sent.iter().map(|(_, f)| f[0]).collect();
        assert!(kinds.contains(&nsp::MSG_CONNACK));
        assert!(kinds.contains(&nsp::MSG_CC));
    }
}
