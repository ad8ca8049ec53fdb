use super::*;
use crate::route::NodeAddr;

/// Where outbound NSP segments go. The live stack backs this with the TAP
/// device; tests capture frames in memory.
pub(crate) trait Port {
    fn emit(&mut self, dst: NodeAddr, nsp: &[u8]);
}

/* ---- wire pulls, little-endian throughout ---- */

pub(crate) fn pull_u8(buf: &mut &[u8]) -> Option<u8> {
    let (&b, rest) = buf.split_first()?;
    *buf = rest;
    Some(b)
}

pub(crate) fn pull_le16(buf: &mut &[u8]) -> Option<u16> {
    if buf.len() < 2 {
        return None;
    }
    let v = u16::from_le_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Some(v)
}

/// Pull one length-prefixed image field of at most `max` bytes. `follow_on`
/// is how many bytes must still remain afterwards for the fields that
/// follow this one.
pub(crate) fn pull_idf(buf: &mut &[u8], max: usize, follow_on: usize) -> Option<Vec<u8>> {
    let flen = pull_u8(buf)? as usize;
    if flen > max || flen + follow_on > buf.len() {
        return None;
    }
    let (field, rest) = buf.split_at(flen);
    *buf = rest;
    Some(field.to_vec())
}

/* ---- outbound segment builders ---- */

fn put_le16(v: &mut Vec<u8>, x: u16) {
    v.extend_from_slice(&x.to_le_bytes());
}

fn common(flags: u8, dst_port: u16, src_port: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(16);
    v.push(flags);
    put_le16(&mut v, dst_port);
    put_le16(&mut v, src_port);
    v
}

/// Both piggyback ack words: the carrying message's own subchannel first,
/// then the cross subchannel tagged with the 0x2000 bit.
fn push_acks(v: &mut Vec<u8>, own_rcv: u16, cross_rcv: u16) {
    put_le16(v, ACK_PRESENT | (own_rcv & SEQ_MASK));
    put_le16(v, ACK_PRESENT | ACK_XSUB | (cross_rcv & SEQ_MASK));
}

pub(crate) fn build_data_ack(dst: u16, src: u16, numdat_rcv: u16, numoth_rcv: u16) -> Vec<u8> {
    let mut v = common(MSG_DATA_ACK, dst, src);
    push_acks(&mut v, numdat_rcv, numoth_rcv);
    v
}

pub(crate) fn build_oth_ack(dst: u16, src: u16, numoth_rcv: u16, numdat_rcv: u16) -> Vec<u8> {
    let mut v = common(MSG_OTH_ACK, dst, src);
    push_acks(&mut v, numoth_rcv, numdat_rcv);
    v
}

/// Connect-Ack is the one message without a source address.
pub(crate) fn build_conn_ack(dst: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(3);
    v.push(MSG_CONNACK);
    put_le16(&mut v, dst);
    v
}

pub(crate) fn build_data(
    dst: u16,
    src: u16,
    numdat_rcv: u16,
    numoth_rcv: u16,
    segnum: u16,
    sendack: bool,
    payload: &[u8],
) -> Vec<u8> {
    let mut v = common(MSG_DATA_BOM | MSG_DATA_EOM, dst, src);
    push_acks(&mut v, numdat_rcv, numoth_rcv);
    let mut segword = segnum & SEQ_MASK;
    if sendack {
        segword |= SEG_SENDACK;
    }
    put_le16(&mut v, segword);
    v.extend_from_slice(payload);
    v
}

pub(crate) fn build_other_data(
    dst: u16,
    src: u16,
    numoth_rcv: u16,
    numdat_rcv: u16,
    segnum: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut v = common(MSG_OTHER_DATA, dst, src);
    push_acks(&mut v, numoth_rcv, numdat_rcv);
    put_le16(&mut v, segnum & SEQ_MASK);
    v.extend_from_slice(payload);
    v
}

pub(crate) fn build_link_service(
    dst: u16,
    src: u16,
    numoth_rcv: u16,
    numdat_rcv: u16,
    segnum: u16,
    lsflags: u8,
    fcval: i8,
) -> Vec<u8> {
    let mut v = common(MSG_LINK_SERVICE, dst, src);
    push_acks(&mut v, numoth_rcv, numdat_rcv);
    put_le16(&mut v, segnum & SEQ_MASK);
    v.push(lsflags);
    v.push(fcval as u8);
    v
}

pub(crate) fn build_disc(flags: u8, dst: u16, src: u16, reason: u16, data: &[u8]) -> Vec<u8> {
    let mut v = common(flags, dst, src);
    put_le16(&mut v, reason);
    if !data.is_empty() {
        v.push(data.len() as u8);
        v.extend_from_slice(data);
    }
    v
}

pub(crate) fn build_conn_conf(
    dst: u16,
    src: u16,
    services: u8,
    info: u8,
    segsize: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut v = common(MSG_CC, dst, src);
    v.push(services);
    v.push(info);
    put_le16(&mut v, segsize);
    if !data.is_empty() {
        v.push(data.len() as u8);
        v.extend_from_slice(data);
    }
    v
}

fn push_object(v: &mut Vec<u8>, obj: &ObjectName) {
    match obj {
        ObjectName::Number(n) => {
            v.push(0);
            v.push(*n);
        }
        ObjectName::Name(s) => {
            v.push(1);
            v.push(0);
            v.push(s.len() as u8);
            v.extend_from_slice(s.as_bytes());
        }
    }
}

/// A Connect-Initiate as first sent: both addresses in the header, ours in
/// the source slot, the destination one still zero.
pub(crate) fn build_conn_init(
    src_port: u16,
    services: u8,
    info: u8,
    segsize: u16,
    dstname: &ObjectName,
    srcname: &ObjectName,
    user: &[u8],
) -> Vec<u8> {
    let mut v = common(MSG_CI, 0, src_port);
    v.push(services);
    v.push(info);
    put_le16(&mut v, segsize);
    push_object(&mut v, dstname);
    push_object(&mut v, srcname);
    if user.is_empty() {
        v.push(0);
    } else {
        v.push(MENUVER_USR);
        v.push(user.len() as u8);
        v.extend_from_slice(user);
    }
    v
}

/// Disconnect reply for a segment that reached no link, addressed straight
/// back at its source.
pub(crate) fn return_disc(port: &mut dyn Port, cb: &SegCb, flags: u8, reason: u16) {
    let v = build_disc(flags, cb.src_port, cb.dst_port, reason, &[]);
    port.emit(cb.src, &v);
}

#[cfg(test)]
pub(crate) struct TestPort {
    pub sent: Vec<(NodeAddr, Vec<u8>)>,
}

#[cfg(test)]
impl TestPort {
    pub fn new() -> Self {
        TestPort { sent: Vec::new() }
    }
}

#[cfg(test)]
impl Port for TestPort {
    fn emit(&mut self, dst: NodeAddr, nsp: &[u8]) {
        self.sent.push((dst, nsp.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_idf_bounds() {
        let mut buf: &[u8] = &[3, b'a', b'b', b'c', 9];
        assert_eq!(pull_idf(&mut buf, 16, 1).unwrap(), b"abc".to_vec());
        assert_eq!(buf, &[9]);

        let mut buf: &[u8] = &[3, b'a', b'b', b'c'];
        assert!(pull_idf(&mut buf, 2, 0).is_none());

        let mut buf: &[u8] = &[3, b'a', b'b', b'c'];
        assert!(pull_idf(&mut buf, 16, 1).is_none());

        let mut buf: &[u8] = &[5, b'a'];
        assert!(pull_idf(&mut buf, 16, 0).is_none());
    }

    #[test]
    fn data_ack_layout() {
        let v = build_data_ack(0x0201, 0x0102, 6, 3);
        assert_eq!(
            v,
            vec![0x04, 0x01, 0x02, 0x02, 0x01, 0x06, 0x80, 0x03, 0xa0]
        );
    }

    #[test]
    fn oth_ack_swaps_subchannels() {
        let v = build_oth_ack(0x0201, 0x0102, 3, 6);
        assert_eq!(
            v,
            vec![0x14, 0x01, 0x02, 0x02, 0x01, 0x03, 0x80, 0x06, 0xa0]
        );
    }

    #[test]
    fn conn_ack_has_no_source() {
        assert_eq!(build_conn_ack(0x0101), vec![0x24, 0x01, 0x01]);
    }

    #[test]
    fn data_segment_layout() {
        let v = build_data(0x0201, 0x0102, 5, 0, 6, true, b"xy");
        assert_eq!(v[0], MSG_DATA_BOM | MSG_DATA_EOM);
        /* two ack words, then the segnum with the sendack bit */
        assert_eq!(u16::from_le_bytes([v[5], v[6]]), ACK_PRESENT | 5);
        assert_eq!(u16::from_le_bytes([v[7], v[8]]), ACK_PRESENT | ACK_XSUB);
        assert_eq!(u16::from_le_bytes([v[9], v[10]]), SEG_SENDACK | 6);
        assert_eq!(&v[11..], b"xy");
    }

    #[test]
    fn disc_data_optional() {
        let bare = build_disc(MSG_DC, 0x0201, 0x0102, REASON_DC, &[]);
        assert_eq!(bare.len(), 7);
        let full = build_disc(MSG_DI, 0x0201, 0x0102, REASON_OK, b"bye");
        assert_eq!(&full[7..], b"\x03bye");
    }

    #[test]
    fn conn_init_menuver() {
        let ci = build_conn_init(
            0x0101,
            SVC_BASE,
            INFO_VER41,
            1450,
            &ObjectName::from("FOO"),
            &ObjectName::Number(0),
            &[],
        );
        assert_eq!(*ci.last().unwrap(), 0);

        let ci = build_conn_init(
            0x0101,
            SVC_BASE,
            INFO_VER41,
            1450,
            &ObjectName::from("FOO"),
            &ObjectName::Number(0),
            b"hi",
        );
        let tail = &ci[ci.len() - 4..];
        assert_eq!(tail, &[MENUVER_USR, 2, b'h', b'i']);
    }
}
