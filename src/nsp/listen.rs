use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::{Error, Manager};

use super::stream::NspStream;
use super::*;

/// Access control fields riding on a Connect-Initiate. Format checked only;
/// verification belongs to the session layer.
#[derive(Debug, Clone, Default)]
pub(crate) struct Access {
    pub user: Vec<u8>,
    pub password: Vec<u8>,
    pub account: Vec<u8>,
}

/// One Connect-Initiate waiting on a listener's accept queue, fully decoded.
#[derive(Debug, Clone)]
pub(crate) struct PendingCi {
    pub node: NodeAddr,
    pub remote_port: u16,
    pub services: u8,
    pub info: u8,
    pub segsize: u16,
    pub rt_flags: u8,
    pub short_header: bool,
    pub srcname: ObjectName,
    pub access: Option<Access>,
    pub userdata: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct ListenEntry {
    pub cvar: Arc<Condvar>,
    pub queue: VecDeque<PendingCi>,
    pub backlog: usize,
}

/// What was wrong with a Connect-Initiate body. Each failure mode maps to
/// the reason code of the Disconnect-Initiate we answer with, or to silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CiError {
    Truncated,
    BadDstName,
    DstNameType,
    BadSrcName,
    BadAccess,
    BadUserData,
}

impl CiError {
    pub fn reason(&self) -> Option<u16> {
        match self {
            CiError::Truncated => None,
            CiError::BadDstName | CiError::DstNameType => Some(REASON_ID),
            CiError::BadSrcName => Some(REASON_US),
            CiError::BadAccess | CiError::BadUserData => Some(REASON_IO),
        }
    }
}

/// Decode one end user descriptor. Returns the name and the raw format
/// octet; callers restrict the formats they accept.
fn parse_object(buf: &mut &[u8]) -> Option<(ObjectName, u8)> {
    let fmt = pull_u8(buf)?;
    let objnum = pull_u8(buf)?;

    let namel = match fmt {
        0 => return Some((ObjectName::Number(objnum), fmt)),
        1 => 16,
        2 => {
            /* group and user code, unused here */
            if buf.len() < 4 {
                return None;
            }
            *buf = &buf[4..];
            12
        }
        4 => {
            /* UIC format */
            if buf.len() < 8 {
                return None;
            }
            *buf = &buf[8..];
            12
        }
        _ => return None,
    };

    let name = pull_idf(buf, namel, 0)?;
    let name = String::from_utf8(name).ok()?;
    Some((ObjectName::Name(name.to_uppercase()), fmt))
}

/// The decoded variable part of a Connect-Initiate.
#[derive(Debug)]
pub(crate) struct CiFields {
    pub dstname: ObjectName,
    pub srcname: ObjectName,
    pub access: Option<Access>,
    pub userdata: Vec<u8>,
}

/// Parse a Connect-Initiate body (everything after the flags octet) and
/// fill the sidecar's header fields as a side effect.
pub(crate) fn parse_ci(cb: &mut SegCb, mut buf: &[u8]) -> Result<CiFields, CiError> {
    cb.dst_port = pull_le16(&mut buf).ok_or(CiError::Truncated)?;
    cb.src_port = pull_le16(&mut buf).ok_or(CiError::Truncated)?;
    cb.services = pull_u8(&mut buf).ok_or(CiError::Truncated)?;
    cb.info = pull_u8(&mut buf).ok_or(CiError::Truncated)?;
    cb.segsize = pull_le16(&mut buf).ok_or(CiError::Truncated)?;

    let (dstname, dstfmt) = parse_object(&mut buf).ok_or(CiError::BadDstName)?;
    if dstfmt > 1 {
        return Err(CiError::DstNameType);
    }
    let (srcname, _) = parse_object(&mut buf).ok_or(CiError::BadSrcName)?;

    let menuver = pull_u8(&mut buf).ok_or(CiError::Truncated)?;

    /* flagged fields with nothing behind them: short on the wire, no reply */
    if menuver & (MENUVER_ACC | MENUVER_USR) != 0 && buf.is_empty() {
        return Err(CiError::Truncated);
    }

    let mut access = None;
    if menuver & MENUVER_ACC != 0 {
        let usr_follow = if menuver & MENUVER_USR != 0 { 1 } else { 0 };
        let user = pull_idf(&mut buf, 39, 2).ok_or(CiError::BadAccess)?;
        let password = pull_idf(&mut buf, 39, 1).ok_or(CiError::BadAccess)?;
        let account = pull_idf(&mut buf, 39, usr_follow).ok_or(CiError::BadAccess)?;
        access = Some(Access {
            user,
            password,
            account,
        });
    }

    let mut userdata = Vec::new();
    if menuver & MENUVER_USR != 0 {
        userdata = pull_idf(&mut buf, MAX_USER_DATA, 0).ok_or(CiError::BadUserData)?;
    }

    Ok(CiFields {
        dstname,
        srcname,
        access,
        userdata,
    })
}

/// A passive endpoint bound to a destination object.
#[derive(Debug)]
pub struct NspListener {
    pub(crate) object: ObjectName,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) cvar: Arc<Condvar>,
}

impl NspListener {
    /// Block until a connect request arrives, then take up the link:
    /// Connect-Ack stops the peer's retransmission, Connect-Confirm carries
    /// our half of the handshake. The returned stream sits in the
    /// confirm-sent state until the peer's first frame promotes it.
    pub fn accept(&self) -> Result<NspStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        loop {
            let ci = {
                let entry = manager
                    .listeners
                    .get_mut(&self.object)
                    .ok_or_else(|| Error::ObjectClosed(self.object.clone()))?;
                entry.queue.pop_front()
            };

            match ci {
                Some(ci) => {
                    let local_addr = manager.establish(ci, &[])?;
                    return Ok(NspStream::attach(self.manager.clone(), &manager, local_addr));
                }
                None => manager = self.cvar.wait(manager).unwrap(),
            }
        }
    }

    /// Refuse the oldest pending connect request with the given reason. The
    /// rejecting block waits out the peer's confirm in the reject state.
    pub fn reject(&self, reason: u16) -> Result<(), Error> {
        let mut manager = self.manager.lock().unwrap();

        let ci = {
            let entry = manager
                .listeners
                .get_mut(&self.object)
                .ok_or_else(|| Error::ObjectClosed(self.object.clone()))?;
            entry.queue.pop_front()
        };

        match ci {
            Some(ci) => {
                let local_addr = manager.alloc_port()?;
                let mut cb = ConnCb::from_ci(manager.cfg.clone(), &ci, local_addr);
                cb.refuse(reason, Instant::now());
                manager.insert_conn(local_addr, cb);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for NspListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();

        manager.listeners.remove(&self.object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteHdr;

    fn seg_cb() -> SegCb {
        let rt = RouteHdr {
            rt_flags: RT_PKT_LONG_FLAGS,
            src: NodeAddr(0x0401),
            dst: NodeAddr(0x0402),
            short_header: false,
        };
        SegCb::new(&rt)
    }

    const RT_PKT_LONG_FLAGS: u8 = 0x26; /* long format, intra-ethernet */

    fn ci_header() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&[0x00, 0x00]); /* dstaddr */
        v.extend_from_slice(&[0x01, 0x01]); /* srcaddr */
        v.push(SVC_BASE);
        v.push(INFO_VER41);
        v.extend_from_slice(&1400u16.to_le_bytes());
        v
    }

    fn named(name: &str) -> Vec<u8> {
        let mut v = vec![1, 0, name.len() as u8];
        v.extend_from_slice(name.as_bytes());
        v
    }

    #[test]
    fn happy_path() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&named("USER"));
        body.push(0); /* menuver */

        let mut cb = seg_cb();
        cb.nsp_flags = MSG_CI;
        let fields = parse_ci(&mut cb, &body).unwrap();

        assert_eq!(cb.src_port, 0x0101);
        assert_eq!(cb.dst_port, 0);
        assert_eq!(cb.services, SVC_BASE);
        assert_eq!(cb.info, INFO_VER41);
        assert_eq!(cb.segsize, 1400);
        assert_eq!(fields.dstname, ObjectName::from("TASK=FOO"));
        assert_eq!(fields.srcname, ObjectName::from("USER"));
        assert!(fields.access.is_none());
        assert!(fields.userdata.is_empty());
    }

    #[test]
    fn numbered_object() {
        let mut body = ci_header();
        body.extend_from_slice(&[0, 25]);
        body.extend_from_slice(&[0, 0]);
        body.push(0);

        let fields = parse_ci(&mut seg_cb(), &body).unwrap();
        assert_eq!(fields.dstname, ObjectName::Number(25));
    }

    #[test]
    fn truncated_header_is_silent() {
        let body = ci_header();
        let err = parse_ci(&mut seg_cb(), &body[..5]).unwrap_err();
        assert_eq!(err, CiError::Truncated);
        assert_eq!(err.reason(), None);
    }

    #[test]
    fn bad_destination_name() {
        let mut body = ci_header();
        body.extend_from_slice(&[7, 0]); /* unknown descriptor format */

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::BadDstName);
        assert_eq!(err.reason(), Some(REASON_ID));
    }

    #[test]
    fn destination_format_above_one() {
        let mut body = ci_header();
        body.extend_from_slice(&[2, 0, 0, 0, 0, 0, 3, b'F', b'O', b'O']);
        body.extend_from_slice(&named("USER"));
        body.push(0);

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::DstNameType);
        assert_eq!(err.reason(), Some(REASON_ID));
    }

    #[test]
    fn bad_source_name() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&[5, 0]); /* unknown descriptor format */

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::BadSrcName);
        assert_eq!(err.reason(), Some(REASON_US));
    }

    #[test]
    fn source_format_two_is_legal() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&[2, 0, 1, 2, 3, 4, 4, b'U', b'S', b'E', b'R']);
        body.push(0);

        let fields = parse_ci(&mut seg_cb(), &body).unwrap();
        assert_eq!(fields.srcname, ObjectName::from("USER"));
    }

    #[test]
    fn truncated_at_menuver_is_silent() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&named("USER"));

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::Truncated);
        assert_eq!(err.reason(), None);
    }

    #[test]
    fn truncated_before_access_is_silent() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&named("USER"));
        body.push(MENUVER_ACC);

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::Truncated);
        assert_eq!(err.reason(), None);
    }

    #[test]
    fn access_field_overflow() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&named("USER"));
        body.push(MENUVER_ACC);
        body.push(40); /* above the 39 byte ceiling */
        body.extend_from_slice(&[0u8; 45]);

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::BadAccess);
        assert_eq!(err.reason(), Some(REASON_IO));
    }

    #[test]
    fn access_fields_decoded() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&named("USER"));
        body.push(MENUVER_ACC | MENUVER_USR);
        body.extend_from_slice(b"\x04fred");
        body.extend_from_slice(b"\x03pwd");
        body.extend_from_slice(b"\x00");
        body.extend_from_slice(b"\x02hi");

        let fields = parse_ci(&mut seg_cb(), &body).unwrap();
        let access = fields.access.unwrap();
        assert_eq!(access.user, b"fred");
        assert_eq!(access.password, b"pwd");
        assert!(access.account.is_empty());
        assert_eq!(fields.userdata, b"hi");
    }

    #[test]
    fn user_data_overflow() {
        let mut body = ci_header();
        body.extend_from_slice(&named("TASK=FOO"));
        body.extend_from_slice(&named("USER"));
        body.push(MENUVER_USR);
        body.push(17);
        body.extend_from_slice(&[0u8; 17]);

        let err = parse_ci(&mut seg_cb(), &body).unwrap_err();
        assert_eq!(err, CiError::BadUserData);
        assert_eq!(err.reason(), Some(REASON_IO));
    }
}
