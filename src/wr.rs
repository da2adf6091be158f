//! Work requests, and what happens to them once posted.
//!
//! Work requests are posted as linked lists ([`WrList`]), the way the verbs API chains
//! `ibv_send_wr` and `ibv_recv_wr` through their `next` pointers. A list whose chain loops is
//! rejected as a whole before anything is posted.
//!
//! Sends are executed at post time: the scatter/gather list is gathered into a frame that can be
//! collected with [`Context::take_transmitted`]. Receives wait in the receive queue until a
//! frame is delivered to the queue pair with [`Context::deliver`].

use std::ops::Range;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::cq::{WcFlags, WcOpcode, WcStatus, WorkCompletion};
use crate::error::{Error, Result};
use crate::graph::{MrHandle, QpHandle};
use crate::mr::{AccessFlags, Sge};
use crate::packet::{self, MacAddr};
use crate::qp::{PostedRecv, QpState, QpType, QueuePair};
use crate::{Context, Gid};

bitflags! {
    /// Flags of a send request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SendFlags: u32 {
        /// Wait for earlier RDMA reads and atomics to complete.
        const FENCE = 1;
        /// Generate a work completion even if the queue pair does not signal all sends.
        const SIGNALED = 1 << 1;
        /// Set the solicited event indicator, waking solicited-only waiters at the receiver.
        const SOLICITED = 1 << 2;
        /// Copy the payload at post time. The keys of the scatter/gather list are not checked.
        const INLINE = 1 << 3;
        /// Let the device fill in the IPv4 header checksum (raw packet queue pairs).
        const IP_CSUM = 1 << 4;
    }
}

/// The operation a send request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SendOpcode {
    /// Send the gathered bytes.
    #[default]
    Send,
    /// Send the gathered bytes along with 32 bits of immediate data.
    SendWithImm,
}

/// A send work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWr {
    /// Echoed in the work completion.
    pub wr_id: u64,
    /// The memory the frame is gathered from.
    pub sg_list: Vec<Sge>,
    /// The operation.
    pub opcode: SendOpcode,
    /// Flags.
    pub send_flags: SendFlags,
    /// Immediate data, used with [`SendOpcode::SendWithImm`].
    pub imm_data: u32,
}

impl SendWr {
    /// An unsignaled send of `sg_list`.
    pub fn new(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        SendWr {
            wr_id,
            sg_list,
            opcode: SendOpcode::Send,
            send_flags: SendFlags::empty(),
            imm_data: 0,
        }
    }

    /// Add `flags` to the send flags.
    pub fn with_flags(mut self, flags: SendFlags) -> Self {
        self.send_flags |= flags;
        self
    }

    /// Turn this into a send with immediate data.
    pub fn with_imm(mut self, imm_data: u32) -> Self {
        self.opcode = SendOpcode::SendWithImm;
        self.imm_data = imm_data;
        self
    }

    /// Total number of bytes referenced by the scatter/gather list.
    pub fn total_len(&self) -> usize {
        self.sg_list.iter().map(Sge::len).sum()
    }
}

/// A receive work request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWr {
    /// Echoed in the work completion.
    pub wr_id: u64,
    /// The memory an incoming frame is scattered to, in order.
    pub sg_list: Vec<Sge>,
}

impl RecvWr {
    /// A receive into `sg_list`.
    pub fn new(wr_id: u64, sg_list: Vec<Sge>) -> Self {
        RecvWr { wr_id, sg_list }
    }

    /// Total number of bytes the scatter/gather list can hold.
    pub fn total_len(&self) -> usize {
        self.sg_list.iter().map(Sge::len).sum()
    }
}

#[derive(Debug, Clone)]
struct WrNode<W> {
    wr: W,
    next: Option<usize>,
}

/// A linked list of work requests.
///
/// Requests are addressed by the index [`WrList::push`] returned. Pushing appends to the chain;
/// [`WrList::set_next`] rewires it arbitrarily, including into a loop, which posting detects.
#[derive(Debug, Clone)]
pub struct WrList<W> {
    nodes: Vec<WrNode<W>>,
    tail: Option<usize>,
}

impl<W> Default for WrList<W> {
    fn default() -> Self {
        WrList {
            nodes: Vec::new(),
            tail: None,
        }
    }
}

impl<W> WrList<W> {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `wr` to the end of the chain, and return its index.
    pub fn push(&mut self, wr: W) -> usize {
        let index = self.nodes.len();
        self.nodes.push(WrNode { wr, next: None });
        if let Some(tail) = self.tail {
            self.nodes[tail].next = Some(index);
        }
        self.tail = Some(index);
        index
    }

    /// Point the `next` link of request `node` at `next`.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument`: `node` or `next` is not a request of this list.
    pub fn set_next(&mut self, node: usize, next: Option<usize>) -> Result<()> {
        if next.map_or(false, |next| next >= self.nodes.len()) {
            return Err(Error::InvalidArgument("next link points outside the list"));
        }
        let node = self
            .nodes
            .get_mut(node)
            .ok_or(Error::InvalidArgument("no such work request"))?;
        node.next = next;
        Ok(())
    }

    /// The request following `node`.
    pub fn next(&self, node: usize) -> Option<usize> {
        self.nodes.get(node).and_then(|n| n.next)
    }

    /// The request at `node`.
    pub fn get(&self, node: usize) -> Option<&W> {
        self.nodes.get(node).map(|n| &n.wr)
    }

    /// The request at `node`.
    pub fn get_mut(&mut self, node: usize) -> Option<&mut W> {
        self.nodes.get_mut(node).map(|n| &mut n.wr)
    }

    /// The first request of the chain.
    pub fn head(&self) -> Option<usize> {
        (!self.nodes.is_empty()).then_some(0)
    }

    /// Number of requests stored, whether or not they are reachable from the head.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the list holds no request.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The indices of the chain, in order. If the chain loops, returns the index of the first
    /// request visited twice.
    pub fn chain(&self) -> Result<Vec<usize>, usize> {
        let mut visited = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut cursor = self.head();
        while let Some(i) = cursor {
            if visited[i] {
                return Err(i);
            }
            visited[i] = true;
            order.push(i);
            cursor = self.nodes[i].next;
        }
        Ok(order)
    }
}

impl<W> FromIterator<W> for WrList<W> {
    fn from_iter<I: IntoIterator<Item = W>>(iter: I) -> Self {
        let mut list = WrList::new();
        for wr in iter {
            list.push(wr);
        }
        list
    }
}

/// Failure of [`Context::post_send`] or [`Context::post_recv`].
///
/// Requests in front of `bad_wr` stay posted.
#[derive(Debug, thiserror::Error)]
#[error("posting failed after {posted} request(s): {error}")]
pub struct PostError {
    /// Number of requests of the list that were posted.
    pub posted: usize,
    /// Index of the request that was rejected, if the failure is tied to one.
    pub bad_wr: Option<usize>,
    /// Why it was rejected.
    #[source]
    pub error: Error,
}

impl PostError {
    fn whole_list(head: Option<usize>, error: Error) -> Self {
        PostError {
            posted: 0,
            bad_wr: head,
            error,
        }
    }

    /// The errno a verbs implementation reports for this failure.
    pub fn errno(&self) -> nix::errno::Errno {
        self.error.errno()
    }
}

/// A frame as it left a queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// The gathered bytes.
    pub data: Vec<u8>,
    /// Immediate data, for sends with immediate.
    pub imm_data: Option<u32>,
    /// Whether the solicited event indicator was set.
    pub solicited: bool,
}

impl OutboundFrame {
    /// View the frame as an incoming packet, for delivery to another queue pair.
    pub fn as_packet(&self) -> Packet<'_> {
        Packet {
            data: &self.data,
            imm_data: self.imm_data,
            solicited: self.solicited,
        }
    }
}

/// A message arriving at a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// The bytes to scatter into the receive buffers.
    pub data: &'a [u8],
    /// Immediate data sent along with the message.
    pub imm_data: Option<u32>,
    /// Whether the solicited event indicator is set.
    pub solicited: bool,
}

impl<'a> From<&'a [u8]> for Packet<'a> {
    fn from(data: &'a [u8]) -> Self {
        Packet {
            data,
            imm_data: None,
            solicited: false,
        }
    }
}

/// What became of a delivered packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A receive request consumed the packet and completed with `status`.
    Completed {
        /// The receive request that was consumed.
        wr_id: u64,
        /// Its completion status.
        status: WcStatus,
    },
    /// The queue pair was not ready to receive or had no receive request posted.
    Dropped,
}

/// Override for the next completion generated by a queue pair, to exercise error paths that
/// have no natural trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Status to report.
    pub status: WcStatus,
    /// Vendor error to report.
    pub vendor_err: u32,
}

/// Resolve `sge` to a region of the queue pair's protection domain.
fn resolve(
    ctx: &Context,
    qp: &QueuePair,
    sge: &Sge,
    check_key: bool,
) -> Option<(MrHandle, Range<usize>)> {
    ctx.graph.mrs.iter().find_map(|(h, mr)| {
        if mr.pd() != qp.pd() {
            return None;
        }
        let mut candidate = *sge;
        if !check_key {
            candidate.lkey = mr.lkey();
        }
        mr.range_of(&candidate).map(|range| (h, range))
    })
}

impl Context {
    /// Post a list of send requests to a queue pair.
    ///
    /// The list is rejected as a whole if its chain loops, if the queue pair is not in RTS or
    /// ERROR, or if it is longer than the send queue. Otherwise the requests are executed in
    /// order until one is found invalid; that one and the requests after it are not posted.
    ///
    /// Each posted request gathers its scatter/gather list into a frame. A request generates a
    /// completion if it is `SIGNALED`, if the queue pair signals all sends, or if it failed.
    /// In the ERROR state every request is completed with `WrFlushError` instead.
    ///
    /// Returns the number of requests posted.
    pub fn post_send(&mut self, qp: QpHandle, wrs: &WrList<SendWr>) -> Result<usize, PostError> {
        let head = wrs.head();
        self.check_open()
            .map_err(|e| PostError::whole_list(head, e))?;
        let order = wrs.chain().map_err(|bad_wr| {
            warn!("send list loops back to request #{}", bad_wr);
            PostError::whole_list(Some(bad_wr), Error::CycleDetected { bad_wr })
        })?;
        let q = self.qp(qp).map_err(|e| PostError::whole_list(head, e))?;
        let state = q.state();
        if state != QpState::Rts && state != QpState::Error {
            return Err(PostError::whole_list(
                head,
                Error::InvalidArgument("send queue is not ready to send"),
            ));
        }
        let available = q.caps().max_send_wr as usize;
        if order.len() > available {
            return Err(PostError {
                posted: 0,
                bad_wr: order.get(available).copied(),
                error: Error::QueueOverflow {
                    requested: order.len(),
                    available,
                },
            });
        }

        for (posted, &i) in order.iter().enumerate() {
            let Some(wr) = wrs.get(i) else { continue };
            let fail = |error| PostError {
                posted,
                bad_wr: Some(i),
                error,
            };
            if state == QpState::Error {
                self.flush(qp, wr.wr_id, WcOpcode::Send).map_err(fail)?;
                continue;
            }
            self.validate_send(qp, wr).map_err(fail)?;
            self.execute_send(qp, wr).map_err(fail)?;
        }
        Ok(order.len())
    }

    fn validate_send(&self, qp: QpHandle, wr: &SendWr) -> Result<()> {
        let q = self.qp(qp)?;
        let caps = q.caps();
        if wr.sg_list.len() > caps.max_send_sge as usize {
            return Err(Error::InvalidArgument("too many scatter/gather elements"));
        }
        let inline = wr.send_flags.contains(SendFlags::INLINE);
        if inline && wr.total_len() > caps.max_inline_data as usize {
            return Err(Error::InvalidArgument("inline payload exceeds max_inline_data"));
        }
        if wr.opcode == SendOpcode::SendWithImm && q.qp_type() == QpType::RawPacket {
            return Err(Error::InvalidArgument(
                "raw packet queue pairs cannot carry immediate data",
            ));
        }
        Ok(())
    }

    fn execute_send(&mut self, qp: QpHandle, wr: &SendWr) -> Result<()> {
        let q = self.qp(qp)?;
        let check_key = !wr.send_flags.contains(SendFlags::INLINE);
        let mut frame = Vec::with_capacity(wr.total_len());
        let mut status = WcStatus::Success;
        for sge in &wr.sg_list {
            match resolve(self, q, sge, check_key) {
                Some((mr, range)) => {
                    frame.extend_from_slice(&self.graph.mrs.get(mr)?.bytes()[range]);
                }
                None => {
                    debug!(
                        "{:?}: send wr {} references unregistered memory {:?}",
                        qp, wr.wr_id, sge
                    );
                    status = WcStatus::LocalProtectionError;
                    break;
                }
            }
        }
        let signaled = q.sq_sig_all() || wr.send_flags.contains(SendFlags::SIGNALED);
        let (send_cq, qp_num, qp_type) = (q.send_cq(), q.qp_num(), q.qp_type());

        let q = self.graph.qps.get_mut(qp)?;
        let mut vendor_err = 0;
        if let Some(fault) = q.fault.take() {
            status = fault.status;
            vendor_err = fault.vendor_err;
        }
        if status.is_success() {
            if wr.send_flags.contains(SendFlags::IP_CSUM) && qp_type == QpType::RawPacket {
                packet::offload_ipv4_checksum(&mut frame);
            }
            trace!("{:?} transmitted {} bytes (wr {})", qp, frame.len(), wr.wr_id);
            q.transmitted.push_back(OutboundFrame {
                data: frame,
                imm_data: (wr.opcode == SendOpcode::SendWithImm).then_some(wr.imm_data),
                solicited: wr.send_flags.contains(SendFlags::SOLICITED),
            });
        }

        if signaled || !status.is_success() {
            let mut wc = WorkCompletion::new(wr.wr_id, status, WcOpcode::Send, qp_num);
            wc.vendor_err = vendor_err;
            self.graph.complete(send_cq, wc, false)?;
        }
        Ok(())
    }

    fn flush(&mut self, qp: QpHandle, wr_id: u64, opcode: WcOpcode) -> Result<()> {
        let q = self.qp(qp)?;
        let cq = match opcode {
            WcOpcode::Send => q.send_cq(),
            WcOpcode::Recv => q.recv_cq(),
        };
        let wc = WorkCompletion::new(wr_id, WcStatus::WrFlushError, opcode, q.qp_num());
        self.graph.complete(cq, wc, false)
    }

    /// Post a list of receive requests to a queue pair.
    ///
    /// The list is rejected as a whole if its chain loops, if the queue pair is in RESET, or if
    /// the receive queue cannot hold all of it. Otherwise requests are queued in order until
    /// one is found invalid. In the ERROR state every request is completed with
    /// `WrFlushError` instead.
    ///
    /// Returns the number of requests posted.
    pub fn post_recv(&mut self, qp: QpHandle, wrs: &WrList<RecvWr>) -> Result<usize, PostError> {
        let head = wrs.head();
        self.check_open()
            .map_err(|e| PostError::whole_list(head, e))?;
        let order = wrs.chain().map_err(|bad_wr| {
            warn!("receive list loops back to request #{}", bad_wr);
            PostError::whole_list(Some(bad_wr), Error::CycleDetected { bad_wr })
        })?;
        let q = self.qp(qp).map_err(|e| PostError::whole_list(head, e))?;
        let state = q.state();
        if state == QpState::Reset {
            return Err(PostError::whole_list(
                head,
                Error::InvalidArgument("receive queue is in RESET"),
            ));
        }
        let caps = q.caps();
        let available = (caps.max_recv_wr as usize).saturating_sub(q.outstanding_recvs());
        if order.len() > available {
            return Err(PostError {
                posted: 0,
                bad_wr: order.get(available).copied(),
                error: Error::QueueOverflow {
                    requested: order.len(),
                    available,
                },
            });
        }

        for (posted, &i) in order.iter().enumerate() {
            let Some(wr) = wrs.get(i) else { continue };
            let fail = |error| PostError {
                posted,
                bad_wr: Some(i),
                error,
            };
            if state == QpState::Error {
                self.flush(qp, wr.wr_id, WcOpcode::Recv).map_err(fail)?;
                continue;
            }
            if wr.sg_list.len() > caps.max_recv_sge as usize {
                return Err(fail(Error::InvalidArgument("too many scatter/gather elements")));
            }
            let q = self.graph.qps.get_mut(qp).map_err(fail)?;
            q.recv_queue.push_back(PostedRecv { wr: wr.clone() });
        }
        trace!("{:?}: {} receive request(s) posted", qp, order.len());
        Ok(order.len())
    }

    /// Frames sent by a queue pair since the last call, oldest first.
    pub fn take_transmitted(&mut self, qp: QpHandle) -> Result<Vec<OutboundFrame>> {
        let q = self.graph.qps.get_mut(qp)?;
        Ok(q.transmitted.drain(..).collect())
    }

    /// Make the next completion generated by `qp` report `fault` instead of its real status.
    pub fn inject_fault(&mut self, qp: QpHandle, fault: Fault) -> Result<()> {
        self.check_open()?;
        self.graph.qps.get_mut(qp)?.fault = Some(fault);
        Ok(())
    }

    /// Deliver a frame to a queue pair. See [`Context::deliver_packet`].
    pub fn deliver(&mut self, qp: QpHandle, frame: &[u8]) -> Result<Delivery> {
        self.deliver_packet(qp, Packet::from(frame))
    }

    /// Deliver a message to a queue pair.
    ///
    /// The oldest posted receive request is consumed and the message is scattered into its
    /// buffers, in order. Nothing is written if the message does not fit (`LocalLengthError`),
    /// or if a buffer is not registered in the queue pair's protection domain or lacks
    /// `LOCAL_WRITE` access (`LocalProtectionError`). The receive completion is queued on the
    /// queue pair's receive CQ.
    ///
    /// The message is dropped if the queue pair is not ready to receive or has no receive
    /// request posted.
    pub fn deliver_packet(&mut self, qp: QpHandle, packet: Packet<'_>) -> Result<Delivery> {
        self.check_open()?;
        let q = self.graph.qps.get_mut(qp)?;
        if !matches!(q.state(), QpState::Rtr | QpState::Rts) {
            trace!("{:?} in {:?} dropped a {} byte packet", qp, q.state(), packet.data.len());
            return Ok(Delivery::Dropped);
        }
        let Some(posted) = q.recv_queue.pop_front() else {
            debug!("{:?} has no receive posted, dropping {} bytes", qp, packet.data.len());
            return Ok(Delivery::Dropped);
        };
        let fault = q.fault.take();

        let q = self.qp(qp)?;
        let (recv_cq, qp_num, qp_type) = (q.recv_cq(), q.qp_num(), q.qp_type());
        let wr = posted.wr;
        let mut status = WcStatus::Success;
        let mut targets = Vec::with_capacity(wr.sg_list.len());
        let mut remaining = packet.data.len();
        for sge in &wr.sg_list {
            let Some((mr, range)) = resolve(self, q, sge, true) else {
                status = WcStatus::LocalProtectionError;
                break;
            };
            if remaining > 0 {
                let take = remaining.min(range.len());
                if !self.graph.mrs.get(mr)?.access().contains(AccessFlags::LOCAL_WRITE) {
                    debug!("{:?}: receive buffer {:?} is not locally writable", qp, sge);
                    status = WcStatus::LocalProtectionError;
                    break;
                }
                targets.push((mr, range.start..range.start + take));
                remaining -= take;
            }
        }
        if status.is_success() && remaining > 0 {
            debug!(
                "{:?}: {} byte packet does not fit receive wr {} ({} bytes)",
                qp,
                packet.data.len(),
                wr.wr_id,
                wr.total_len()
            );
            status = WcStatus::LocalLengthError;
        }

        let mut wc = WorkCompletion::new(wr.wr_id, status, WcOpcode::Recv, qp_num);
        if let Some(fault) = fault {
            // a faulted receive writes nothing
            wc.status = fault.status;
            wc.vendor_err = fault.vendor_err;
        } else if status.is_success() {
            let mut offset = 0;
            for (mr, range) in targets {
                let len = range.len();
                self.graph.mrs.get_mut(mr)?.bytes_mut()[range]
                    .copy_from_slice(&packet.data[offset..offset + len]);
                offset += len;
            }
            wc.byte_len = packet.data.len() as u32;
            if matches!(qp_type, QpType::Ud | QpType::RawPacket) {
                wc.wc_flags |= WcFlags::GRH;
            }
            if let Some(imm) = packet.imm_data {
                wc.wc_flags |= WcFlags::WITH_IMM;
                wc.imm_data = imm;
            }
        }
        self.graph.complete(recv_cq, wc, packet.solicited)?;
        Ok(Delivery::Completed {
            wr_id: wr.wr_id,
            status: wc.status,
        })
    }

    /// Deliver a message to every queue pair attached to the multicast group `gid`. Returns
    /// the number of queue pairs a receive request was consumed on.
    pub fn deliver_to_group(&mut self, gid: Gid, packet: Packet<'_>) -> Result<usize> {
        let mut consumed = 0;
        for qp in self.group_members(gid) {
            if let Delivery::Completed { .. } = self.deliver_packet(qp, packet)? {
                consumed += 1;
            }
        }
        Ok(consumed)
    }

    /// Deliver an Ethernet frame to every queue pair attached to a group whose GID carries the
    /// frame's destination MAC (see [`packet::multicast_gid`]). Returns the number of queue
    /// pairs a receive request was consumed on.
    pub fn deliver_multicast(&mut self, packet: Packet<'_>) -> Result<usize> {
        let Some(dst) = packet.data.get(..6) else {
            return Ok(0);
        };
        let mut mac: MacAddr = [0; 6];
        mac.copy_from_slice(dst);
        let mut raw = [0u8; 16];
        raw[10..].copy_from_slice(&mac);
        self.deliver_to_group(Gid::from(raw), packet)
    }
}
