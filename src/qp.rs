use std::collections::VecDeque;

use bitflags::bitflags;
use log::{debug, trace};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cq::{WcOpcode, WcStatus, WorkCompletion};
use crate::error::{Error, Result};
use crate::graph::{
    CqHandle, MembershipHandle, PdHandle, QpHandle, Resource, ResourceId, ResourceKind,
};
use crate::mr::AccessFlags;
use crate::wr::{Fault, OutboundFrame, RecvWr};
use crate::{Context, Gid};

/// Transport service type of a queue pair.
///
/// The discriminants are the values the verbs API uses on the wire, so a raw `u32` coming from
/// a remote agent can be checked with `QpType::try_from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum QpType {
    /// Reliable connection.
    Rc = 2,
    /// Unreliable connection.
    Uc = 3,
    /// Unreliable datagram.
    Ud = 4,
    /// Raw Ethernet frames.
    RawPacket = 8,
}

impl QpType {
    /// Whether queue pairs of this type must be connected to a remote peer before use.
    pub fn is_connected(self) -> bool {
        matches!(self, QpType::Rc | QpType::Uc)
    }
}

impl From<QpType> for u32 {
    fn from(t: QpType) -> u32 {
        t as u32
    }
}

impl TryFrom<u32> for QpType {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            2 => Ok(QpType::Rc),
            3 => Ok(QpType::Uc),
            4 => Ok(QpType::Ud),
            8 => Ok(QpType::RawPacket),
            _ => Err(Error::InvalidArgument("unsupported queue pair type")),
        }
    }
}

/// State of a queue pair. See [RDMAmojo] for the meaning of each state.
///
/// [RDMAmojo]: http://www.rdmamojo.com/2012/05/05/qp-state-machine/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QpState {
    /// Freshly created, or reset. Nothing can be posted.
    #[default]
    Reset,
    /// Initialized. Receive requests can be posted but nothing is processed.
    Init,
    /// Ready to receive.
    Rtr,
    /// Ready to send.
    Rts,
    /// Send queue drained.
    Sqd,
    /// Send queue error.
    Sqe,
    /// Error. Every posted or outstanding request completes with a flush error.
    Error,
}

bitflags! {
    /// Which fields of a [`QpAttr`] a call to [`Context::modify_qp`] applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QpAttrMask: u32 {
        /// `qp_state`
        const STATE = 1;
        /// current state (ignored)
        const CUR_STATE = 1 << 1;
        /// `access`
        const ACCESS_FLAGS = 1 << 3;
        /// `pkey_index`
        const PKEY_INDEX = 1 << 4;
        /// `port_num`
        const PORT = 1 << 5;
        /// `qkey`
        const QKEY = 1 << 6;
        /// `dlid` and `service_level`
        const AV = 1 << 7;
        /// `path_mtu`
        const PATH_MTU = 1 << 8;
        /// `timeout`
        const TIMEOUT = 1 << 9;
        /// `retry_cnt`
        const RETRY_CNT = 1 << 10;
        /// `rnr_retry`
        const RNR_RETRY = 1 << 11;
        /// `rq_psn`
        const RQ_PSN = 1 << 12;
        /// `max_rd_atomic`
        const MAX_QP_RD_ATOMIC = 1 << 13;
        /// `min_rnr_timer`
        const MIN_RNR_TIMER = 1 << 15;
        /// `sq_psn`
        const SQ_PSN = 1 << 16;
        /// `max_dest_rd_atomic`
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        /// `dest_qp_num`
        const DEST_QPN = 1 << 20;
    }
}

/// Attributes applied by [`Context::modify_qp`]. Only the fields selected by the accompanying
/// [`QpAttrMask`] are read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub access: AccessFlags,
    pub pkey_index: u16,
    pub port_num: u8,
    pub qkey: u32,
    pub dlid: u16,
    pub service_level: u8,
    pub path_mtu: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub max_dest_rd_atomic: u8,
    pub dest_qp_num: u32,
}

/// Work queue capacities of a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[allow(missing_docs)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// An identifier for the network endpoint of a `QueuePair`.
///
/// Internally, this contains the `QueuePair`'s `qp_num`, as well as the context's `lid` and
/// `gid`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueuePairEndpoint {
    /// the `QueuePair`'s `qp_num`
    pub num: u32,
    /// the context's `lid`
    pub lid: u16,
    /// the context's `gid`, used for global routing
    pub gid: Option<Gid>,
}

/// Parameters carried along from the builder to [`Context::handshake`].
#[derive(Debug, Clone)]
struct ConnectParams {
    access: Option<AccessFlags>,
    timeout: Option<u8>,
    retry_count: Option<u8>,
    rnr_retry: Option<u8>,
    min_rnr_timer: Option<u8>,
    max_rd_atomic: Option<u8>,
    max_dest_rd_atomic: Option<u8>,
    path_mtu: Option<u8>,
    rq_psn: Option<u32>,
    service_level: u8,
}

impl ConnectParams {
    fn new(qp_type: QpType) -> Self {
        let rc = qp_type == QpType::Rc;
        let connected = qp_type.is_connected();
        ConnectParams {
            access: connected.then_some(AccessFlags::LOCAL_WRITE),
            min_rnr_timer: rc.then_some(16),
            retry_count: rc.then_some(6),
            rnr_retry: rc.then_some(6),
            timeout: rc.then_some(4),
            max_rd_atomic: rc.then_some(1),
            max_dest_rd_atomic: rc.then_some(1),
            path_mtu: connected.then_some(5),
            rq_psn: connected.then_some(0),
            service_level: 0,
        }
    }
}

/// A receive request waiting for an incoming message.
#[derive(Debug, Clone)]
pub(crate) struct PostedRecv {
    pub(crate) wr: RecvWr,
}

/// A queue pair: a send queue and a receive queue, each reporting to a completion queue.
#[derive(Debug)]
pub struct QueuePair {
    pd: PdHandle,
    send_cq: CqHandle,
    recv_cq: CqHandle,
    qp_type: QpType,
    qp_num: u32,
    state: QpState,
    port_num: u8,
    caps: QpCaps,
    sq_sig_all: bool,
    user_context: u64,
    connect: ConnectParams,
    pub(crate) recv_queue: VecDeque<PostedRecv>,
    pub(crate) transmitted: VecDeque<OutboundFrame>,
    pub(crate) fault: Option<Fault>,
}

impl Resource for QueuePair {
    const KIND: ResourceKind = ResourceKind::QueuePair;

    fn depends_on(&self, target: ResourceId) -> bool {
        match target {
            ResourceId::ProtectionDomain(pd) => self.pd == pd,
            ResourceId::CompletionQueue(cq) => self.send_cq == cq || self.recv_cq == cq,
            _ => false,
        }
    }
}

impl QueuePair {
    /// The protection domain the queue pair was created in.
    pub fn pd(&self) -> PdHandle {
        self.pd
    }

    /// Completion queue receiving send completions.
    pub fn send_cq(&self) -> CqHandle {
        self.send_cq
    }

    /// Completion queue receiving receive completions.
    pub fn recv_cq(&self) -> CqHandle {
        self.recv_cq
    }

    /// Transport type.
    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    /// The queue pair number, unique within its context.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Current state.
    pub fn state(&self) -> QpState {
        self.state
    }

    /// The port the queue pair was associated with during the transition to INIT, or 0.
    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    /// Work queue capacities.
    pub fn caps(&self) -> QpCaps {
        self.caps
    }

    /// Whether every send request generates a completion regardless of its flags.
    pub fn sq_sig_all(&self) -> bool {
        self.sq_sig_all
    }

    /// The opaque value given to [`QueuePairBuilder::set_context`].
    pub fn user_context(&self) -> u64 {
        self.user_context
    }

    /// Number of receive requests waiting for a message.
    pub fn outstanding_recvs(&self) -> usize {
        self.recv_queue.len()
    }

    /// Number of transmitted frames not yet taken with [`Context::take_transmitted`].
    pub fn pending_transmissions(&self) -> usize {
        self.transmitted.len()
    }
}

/// The attachment of a queue pair to a multicast group.
#[derive(Debug)]
pub struct MulticastMembership {
    qp: QpHandle,
    gid: Gid,
    lid: u16,
}

impl Resource for MulticastMembership {
    const KIND: ResourceKind = ResourceKind::MulticastMembership;

    fn depends_on(&self, target: ResourceId) -> bool {
        target == ResourceId::QueuePair(self.qp)
    }
}

impl MulticastMembership {
    /// The attached queue pair.
    pub fn qp(&self) -> QpHandle {
        self.qp
    }

    /// The multicast group.
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// The multicast LID.
    pub fn lid(&self) -> u16 {
        self.lid
    }
}

/// An unconfigured `QueuePair`.
///
/// A `QueuePairBuilder` is used to configure a `QueuePair` before it is created. To construct
/// one, use [`Context::create_qp`]. See also [RDMAmojo] for many more details.
///
/// [RDMAmojo]: http://www.rdmamojo.com/2013/01/12/ibv_modify_qp/
pub struct QueuePairBuilder<'ctx> {
    ctx: &'ctx mut Context,
    pd: PdHandle,
    send: CqHandle,
    recv: CqHandle,
    qp_type: u32,
    caps: QpCaps,
    sq_sig_all: bool,
    user_context: u64,
    connect: Option<ConnectParams>,
}

impl<'ctx> QueuePairBuilder<'ctx> {
    fn connect_params(&mut self) -> Option<&mut ConnectParams> {
        self.connect.as_mut()
    }

    /// Set the maximum number of send requests in the work queue.
    ///
    /// Defaults to 1.
    pub fn set_max_send_wr(&mut self, max_send_wr: u32) -> &mut Self {
        self.caps.max_send_wr = max_send_wr;
        self
    }

    /// Set the maximum number of receive requests in the work queue.
    ///
    /// Defaults to 1.
    pub fn set_max_recv_wr(&mut self, max_recv_wr: u32) -> &mut Self {
        self.caps.max_recv_wr = max_recv_wr;
        self
    }

    /// The maximum number of scatter/gather elements in any send request.
    ///
    /// Defaults to 1.
    pub fn set_max_send_sge(&mut self, max_send_sge: u32) -> &mut Self {
        self.caps.max_send_sge = max_send_sge;
        self
    }

    /// The maximum number of scatter/gather elements in any receive request.
    ///
    /// Defaults to 1.
    pub fn set_max_recv_sge(&mut self, max_recv_sge: u32) -> &mut Self {
        self.caps.max_recv_sge = max_recv_sge;
        self
    }

    /// The largest payload that can be posted with the `INLINE` send flag.
    ///
    /// Defaults to 0.
    pub fn set_max_inline_data(&mut self, max_inline_data: u32) -> &mut Self {
        self.caps.max_inline_data = max_inline_data;
        self
    }

    /// Generate a completion for every send request, whether or not it is `SIGNALED`.
    ///
    /// Defaults to false.
    pub fn set_sq_sig_all(&mut self, sq_sig_all: bool) -> &mut Self {
        self.sq_sig_all = sq_sig_all;
        self
    }

    /// Set the opaque context value for the new `QueuePair`.
    ///
    /// Defaults to 0.
    pub fn set_context(&mut self, ctx: u64) -> &mut Self {
        self.user_context = ctx;
        self
    }

    /// Set the access flags for the new `QueuePair`.
    ///
    /// Valid only for RC and UC QPs. Defaults to `LOCAL_WRITE`.
    pub fn set_access(&mut self, access: AccessFlags) -> &mut Self {
        if let Some(c) = self.connect_params() {
            c.access = Some(access);
        }
        self
    }

    /// Set the access flags of the new `QueuePair` such that it allows remote reads and writes.
    ///
    /// Valid only for RC and UC QPs.
    pub fn allow_remote_rw(&mut self) -> &mut Self {
        if let Some(c) = self.connect_params() {
            let access = c.access.unwrap_or(AccessFlags::LOCAL_WRITE);
            c.access = Some(access | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ);
        }
        self
    }

    /// Set the service level of the new `QueuePair`.
    /// service level (0-15). Higher value means higher priority.
    /// Defaults to 0.
    pub fn set_service_level(&mut self, service_level: u8) -> &mut Self {
        if let Some(c) = self.connect_params() {
            c.service_level = service_level;
        }
        self
    }

    /// Sets the minimum RNR NAK Timer Field Value for the new `QueuePair`.
    ///
    /// Defaults to 16 (2.56 ms delay). Valid only for RC QPs.
    pub fn set_min_rnr_timer(&mut self, timer: u8) -> &mut Self {
        if self.qp_type == QpType::Rc as u32 {
            if let Some(c) = self.connect_params() {
                c.min_rnr_timer = Some(timer);
            }
        }
        self
    }

    /// Sets the minimum timeout that the new `QueuePair` waits for ACK/NACK from remote QP
    /// before retransmitting the packet.
    ///
    /// Defaults to 4 (65.536µs). Valid only for RC QPs.
    pub fn set_timeout(&mut self, timeout: u8) -> &mut Self {
        if self.qp_type == QpType::Rc as u32 {
            if let Some(c) = self.connect_params() {
                c.timeout = Some(timeout);
            }
        }
        self
    }

    /// Sets the total number of times that the new `QueuePair` will try to resend the packets
    /// before reporting an error.
    ///
    /// This 3 bit value defaults to 6. Valid only for RC QPs.
    ///
    /// # Panics
    ///
    /// Panics if a count higher than 7 is given.
    pub fn set_retry_count(&mut self, count: u8) -> &mut Self {
        if self.qp_type == QpType::Rc as u32 {
            assert!(count <= 7);
            if let Some(c) = self.connect_params() {
                c.retry_count = Some(count);
            }
        }
        self
    }

    /// Sets the total number of times that the new `QueuePair` will try to resend the packets
    /// when an RNR NACK was sent by the remote QP before reporting an error.
    ///
    /// This 3 bit value defaults to 6. Valid only for RC QPs.
    ///
    /// # Panics
    ///
    /// Panics if a limit higher than 7 is given.
    pub fn set_rnr_retry(&mut self, n: u8) -> &mut Self {
        if self.qp_type == QpType::Rc as u32 {
            assert!(n <= 7);
            if let Some(c) = self.connect_params() {
                c.rnr_retry = Some(n);
            }
        }
        self
    }

    /// Set the path MTU (1: 256 up to 5: 4096).
    ///
    /// Defaults to 5. Valid only for RC and UC QPs.
    pub fn set_path_mtu(&mut self, path_mtu: u8) -> &mut Self {
        if let Some(c) = self.connect_params() {
            c.path_mtu = Some(path_mtu);
        }
        self
    }

    /// Set the PSN for the receive queue.
    ///
    /// Defaults to 0. Valid only for RC and UC QPs.
    pub fn set_rq_psn(&mut self, rq_psn: u32) -> &mut Self {
        if let Some(c) = self.connect_params() {
            c.rq_psn = Some(rq_psn);
        }
        self
    }

    /// Create a new `QueuePair` from this builder template. The queue pair starts in the
    /// RESET state.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): unsupported queue pair type, or a capacity larger than
    ///    the device allows.
    ///  - `StaleHandle`: the protection domain or one of the completion queues is not live.
    ///  - `ContextClosed`: the context was closed.
    pub fn build(&mut self) -> Result<QpHandle> {
        let ctx = &mut *self.ctx;
        ctx.check_open()?;
        let qp_type = QpType::try_from(self.qp_type)?;
        ctx.graph.pds.get(self.pd)?;
        ctx.graph.cqs.get(self.send)?;
        ctx.graph.cqs.get(self.recv)?;

        let attr = ctx.device().attr();
        if self.caps.max_send_wr > attr.max_qp_wr || self.caps.max_recv_wr > attr.max_qp_wr {
            return Err(Error::InvalidArgument("work queue deeper than max_qp_wr"));
        }
        if self.caps.max_send_sge > attr.max_sge || self.caps.max_recv_sge > attr.max_sge {
            return Err(Error::InvalidArgument("more scatter/gather elements than max_sge"));
        }
        if self.caps.max_inline_data > attr.max_inline_data {
            return Err(Error::InvalidArgument("inline data larger than the device allows"));
        }

        let qp_num = ctx.alloc_qp_num();
        let qp = ctx.graph.qps.insert(QueuePair {
            pd: self.pd,
            send_cq: self.send,
            recv_cq: self.recv,
            qp_type,
            qp_num,
            state: QpState::Reset,
            port_num: 0,
            caps: self.caps,
            sq_sig_all: self.sq_sig_all,
            user_context: self.user_context,
            connect: self
                .connect
                .clone()
                .unwrap_or_else(|| ConnectParams::new(qp_type)),
            recv_queue: VecDeque::new(),
            transmitted: VecDeque::new(),
            fault: None,
        });
        debug!("created {:?} ({:?}, qp_num {:#x})", qp, qp_type, qp_num);
        Ok(qp)
    }
}

/// The attributes that must accompany a transition, or `None` if the transition is illegal.
fn required_attrs(qp_type: QpType, from: QpState, to: QpState) -> Option<QpAttrMask> {
    use QpState::*;
    let m = QpAttrMask::STATE;
    let required = match (from, to) {
        (_, Reset) | (_, Error) => m,
        (Reset, Init) => match qp_type {
            QpType::RawPacket => m | QpAttrMask::PORT,
            QpType::Ud => m | QpAttrMask::PKEY_INDEX | QpAttrMask::PORT | QpAttrMask::QKEY,
            QpType::Rc | QpType::Uc => {
                m | QpAttrMask::PKEY_INDEX | QpAttrMask::PORT | QpAttrMask::ACCESS_FLAGS
            }
        },
        (Init, Init) => m,
        (Init, Rtr) => match qp_type {
            QpType::RawPacket | QpType::Ud => m,
            QpType::Uc => {
                m | QpAttrMask::AV | QpAttrMask::PATH_MTU | QpAttrMask::DEST_QPN | QpAttrMask::RQ_PSN
            }
            QpType::Rc => {
                m | QpAttrMask::AV
                    | QpAttrMask::PATH_MTU
                    | QpAttrMask::DEST_QPN
                    | QpAttrMask::RQ_PSN
                    | QpAttrMask::MAX_DEST_RD_ATOMIC
                    | QpAttrMask::MIN_RNR_TIMER
            }
        },
        (Rtr, Rts) => match qp_type {
            QpType::RawPacket => m,
            QpType::Ud | QpType::Uc => m | QpAttrMask::SQ_PSN,
            QpType::Rc => {
                m | QpAttrMask::SQ_PSN
                    | QpAttrMask::TIMEOUT
                    | QpAttrMask::RETRY_CNT
                    | QpAttrMask::RNR_RETRY
                    | QpAttrMask::MAX_QP_RD_ATOMIC
            }
        },
        (Rts, Rts) | (Sqd, Rts) | (Sqe, Rts) | (Rts, Sqd) | (Sqd, Sqd) => m,
        _ => return None,
    };
    Some(required)
}

impl Context {
    /// Prepare a new `QueuePair` of type `qp_type` in `pd`, reporting send completions to
    /// `send` and receive completions to `recv`.
    ///
    /// The type is taken as its raw verbs value so that unsupported values can be passed and
    /// rejected by [`QueuePairBuilder::build`].
    pub fn create_qp(
        &mut self,
        pd: PdHandle,
        send: CqHandle,
        recv: CqHandle,
        qp_type: impl Into<u32>,
    ) -> QueuePairBuilder<'_> {
        let qp_type = qp_type.into();
        let connect = QpType::try_from(qp_type)
            .ok()
            .filter(|t| t.is_connected())
            .map(ConnectParams::new);
        QueuePairBuilder {
            ctx: self,
            pd,
            send,
            recv,
            qp_type,
            caps: QpCaps {
                max_send_wr: 1,
                max_recv_wr: 1,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            sq_sig_all: false,
            user_context: 0,
            connect,
        }
    }

    /// Look up a queue pair.
    pub fn qp(&self, qp: QpHandle) -> Result<&QueuePair> {
        self.graph.qps.get(qp)
    }

    /// Modify the attributes of a queue pair, usually to move it to another state.
    ///
    /// Every transition requires a minimum set of attributes, which depends on the queue pair
    /// type (see [RDMAmojo]). Moving to ERROR flushes every outstanding receive request with
    /// `WrFlushError`; moving to RESET discards them.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): illegal transition, missing required attribute, or an
    ///    attribute out of range. The queue pair is left untouched.
    ///  - `StaleHandle`: `qp` is not live.
    ///
    /// [RDMAmojo]: http://www.rdmamojo.com/2013/01/12/ibv_modify_qp/
    pub fn modify_qp(&mut self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> Result<()> {
        self.check_open()?;
        let phys_port_cnt = self.device().attr().phys_port_cnt;
        let q = self.graph.qps.get_mut(qp)?;

        let from = q.state;
        let to = if mask.contains(QpAttrMask::STATE) {
            attr.qp_state
        } else {
            from
        };
        let required = required_attrs(q.qp_type, from, to)
            .ok_or(Error::InvalidArgument("illegal queue pair state transition"))?;
        if !mask.contains(required) {
            debug!(
                "{:?} {:?} -> {:?} is missing attributes {:?}",
                qp,
                from,
                to,
                required - mask
            );
            return Err(Error::InvalidArgument("missing required queue pair attributes"));
        }
        if mask.contains(QpAttrMask::PORT)
            && (attr.port_num == 0 || attr.port_num > phys_port_cnt)
        {
            return Err(Error::InvalidArgument("no such port"));
        }
        if (mask.contains(QpAttrMask::RETRY_CNT) && attr.retry_cnt > 7)
            || (mask.contains(QpAttrMask::RNR_RETRY) && attr.rnr_retry > 7)
        {
            return Err(Error::InvalidArgument("retry count is a 3 bit value"));
        }

        if mask.contains(QpAttrMask::PORT) {
            q.port_num = attr.port_num;
        }
        q.state = to;
        trace!("{:?}: {:?} -> {:?}", qp, from, to);

        match to {
            QpState::Reset => {
                q.recv_queue.clear();
                q.transmitted.clear();
                q.fault = None;
                q.port_num = 0;
            }
            QpState::Error if from != QpState::Error => {
                let (recv_cq, qp_num) = (q.recv_cq, q.qp_num);
                let flushed: Vec<_> = q.recv_queue.drain(..).collect();
                if !flushed.is_empty() {
                    debug!("{:?}: flushing {} receive request(s)", qp, flushed.len());
                }
                for posted in flushed {
                    let wc = WorkCompletion::new(
                        posted.wr.wr_id,
                        WcStatus::WrFlushError,
                        WcOpcode::Recv,
                        qp_num,
                    );
                    self.graph.complete(recv_cq, wc, false)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Bring a datagram queue pair (`Ud` or `RawPacket`) from RESET to RTS on `port`.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): the queue pair is connected (use
    ///    [`Context::handshake`]), not in RESET, or `port` does not exist.
    pub fn ready(&mut self, qp: QpHandle, port: u8) -> Result<()> {
        let q = self.qp(qp)?;
        if q.qp_type.is_connected() {
            return Err(Error::InvalidArgument(
                "connected queue pairs need a remote endpoint",
            ));
        }
        let ud = q.qp_type == QpType::Ud;

        let attr = QpAttr {
            qp_state: QpState::Init,
            port_num: port,
            pkey_index: 0,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE | QpAttrMask::PORT;
        if ud {
            mask |= QpAttrMask::PKEY_INDEX | QpAttrMask::QKEY;
        }
        self.modify_qp(qp, &attr, mask)?;

        let attr = QpAttr {
            qp_state: QpState::Rtr,
            ..Default::default()
        };
        self.modify_qp(qp, &attr, QpAttrMask::STATE)?;

        let attr = QpAttr {
            qp_state: QpState::Rts,
            sq_psn: 0,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE;
        if ud {
            mask |= QpAttrMask::SQ_PSN;
        }
        self.modify_qp(qp, &attr, mask)
    }

    /// Connect a queue pair to a remote endpoint and bring it to RTS.
    ///
    /// Datagram queue pairs ignore `remote` and behave as with [`Context::ready`]. For
    /// connected types, the parameters configured on the [`QueuePairBuilder`] are used.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): the queue pair is not in RESET, or `port` does not
    ///    exist.
    pub fn handshake(&mut self, qp: QpHandle, port: u8, remote: QueuePairEndpoint) -> Result<()> {
        let q = self.qp(qp)?;
        if !q.qp_type.is_connected() {
            return self.ready(qp, port);
        }
        let c = q.connect.clone();

        // init and associate with port
        let mut attr = QpAttr {
            qp_state: QpState::Init,
            pkey_index: 0,
            port_num: port,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE | QpAttrMask::PKEY_INDEX | QpAttrMask::PORT;
        if let Some(access) = c.access {
            attr.access = access;
            mask |= QpAttrMask::ACCESS_FLAGS;
        }
        self.modify_qp(qp, &attr, mask)?;

        // set ready to receive
        let mut attr = QpAttr {
            qp_state: QpState::Rtr,
            dest_qp_num: remote.num,
            dlid: remote.lid,
            service_level: c.service_level,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE | QpAttrMask::AV | QpAttrMask::DEST_QPN;
        if let Some(max_dest_rd_atomic) = c.max_dest_rd_atomic {
            attr.max_dest_rd_atomic = max_dest_rd_atomic;
            mask |= QpAttrMask::MAX_DEST_RD_ATOMIC;
        }
        if let Some(min_rnr_timer) = c.min_rnr_timer {
            attr.min_rnr_timer = min_rnr_timer;
            mask |= QpAttrMask::MIN_RNR_TIMER;
        }
        if let Some(path_mtu) = c.path_mtu {
            attr.path_mtu = path_mtu;
            mask |= QpAttrMask::PATH_MTU;
        }
        if let Some(rq_psn) = c.rq_psn {
            attr.rq_psn = rq_psn;
            mask |= QpAttrMask::RQ_PSN;
        }
        self.modify_qp(qp, &attr, mask)?;

        // set ready to send
        let mut attr = QpAttr {
            qp_state: QpState::Rts,
            sq_psn: 0,
            ..Default::default()
        };
        let mut mask = QpAttrMask::STATE | QpAttrMask::SQ_PSN;
        if let Some(timeout) = c.timeout {
            attr.timeout = timeout;
            mask |= QpAttrMask::TIMEOUT;
        }
        if let Some(retry_count) = c.retry_count {
            attr.retry_cnt = retry_count;
            mask |= QpAttrMask::RETRY_CNT;
        }
        if let Some(rnr_retry) = c.rnr_retry {
            attr.rnr_retry = rnr_retry;
            mask |= QpAttrMask::RNR_RETRY;
        }
        if let Some(max_rd_atomic) = c.max_rd_atomic {
            attr.max_rd_atomic = max_rd_atomic;
            mask |= QpAttrMask::MAX_QP_RD_ATOMIC;
        }
        self.modify_qp(qp, &attr, mask)
    }

    /// Get the network endpoint for this `QueuePair`.
    ///
    /// This endpoint will need to be communicated to the `QueuePair` on the remote end.
    pub fn endpoint(&self, qp: QpHandle) -> Result<QueuePairEndpoint> {
        let q = self.qp(qp)?;
        Ok(QueuePairEndpoint {
            num: q.qp_num,
            lid: self.lid(),
            gid: None,
        })
    }

    /// Attach a queue pair to a multicast group, so that it receives the frames sent to it.
    ///
    /// Attaching twice to the same group returns the existing membership.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): the queue pair is connected.
    ///  - `StaleHandle`: `qp` is not live.
    pub fn attach_mcast(&mut self, qp: QpHandle, gid: Gid, lid: u16) -> Result<MembershipHandle> {
        self.check_open()?;
        if self.qp(qp)?.qp_type.is_connected() {
            return Err(Error::InvalidArgument(
                "only datagram queue pairs join multicast groups",
            ));
        }
        if let Some(existing) = self.find_membership(qp, gid) {
            return Ok(existing);
        }
        let membership = self.graph.memberships.insert(MulticastMembership { qp, gid, lid });
        debug!("{:?} joined {:?}", qp, gid);
        Ok(membership)
    }

    /// Detach a queue pair from a multicast group.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): the queue pair is not attached to the group.
    pub fn detach_mcast(&mut self, qp: QpHandle, gid: Gid) -> Result<()> {
        self.check_open()?;
        self.qp(qp)?;
        let membership = self
            .find_membership(qp, gid)
            .ok_or(Error::InvalidArgument("queue pair is not attached to the group"))?;
        self.destroy(membership)
    }

    /// Look up a multicast membership.
    pub fn membership(&self, membership: MembershipHandle) -> Result<&MulticastMembership> {
        self.graph.memberships.get(membership)
    }

    fn find_membership(&self, qp: QpHandle, gid: Gid) -> Option<MembershipHandle> {
        self.graph
            .memberships
            .iter()
            .find(|(_, m)| m.qp == qp && m.gid == gid)
            .map(|(h, _)| h)
    }

    /// The queue pairs attached to `gid`, each listed once.
    pub fn group_members(&self, gid: Gid) -> Vec<QpHandle> {
        let mut members: Vec<QpHandle> = Vec::new();
        for (_, m) in self.graph.memberships.iter() {
            if m.gid == gid && !members.contains(&m.qp) {
                members.push(m.qp);
            }
        }
        members
    }
}
