//! Building blocks for verbs conformance scenarios.
//!
//! A scenario typically opens one or two contexts, sets up a raw packet endpoint on each
//! ([`RawPacketEndpoint`]), moves frames between them ([`Fabric`]), checks what came out of the
//! completion queues ([`expect_completion`]) and finally tears everything down, sometimes in the
//! wrong order on purpose ([`destroy_after_unblocking`]).

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::graph::{Blocker, ChannelHandle, CqHandle, PdHandle, QpHandle, ResourceId};
use crate::{Context, Delivery, QpType, WcFlags, WcOpcode, WcStatus, WorkCompletion, PORT_NUM};

/// Moves transmitted frames between contexts, standing in for the network.
///
/// Frames are routed by destination MAC: a frame sent to a multicast MAC reaches every queue
/// pair of the destination context attached to the matching group.
#[derive(Debug, Default, Clone)]
pub struct Fabric {
    frames: u64,
    consumed: u64,
}

impl Fabric {
    /// An idle fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every frame `src_qp` has transmitted to the multicast members in `dst`.
    ///
    /// Returns the number of receive requests the frames consumed in `dst`.
    pub fn forward(
        &mut self,
        src: &mut Context,
        src_qp: QpHandle,
        dst: &mut Context,
    ) -> Result<usize> {
        let mut consumed = 0;
        for frame in src.take_transmitted(src_qp)? {
            let n = dst.deliver_multicast(frame.as_packet())?;
            trace!(
                "{:?}: {} byte frame reached {} receiver(s)",
                src_qp,
                frame.data.len(),
                n
            );
            self.frames += 1;
            consumed += n;
        }
        self.consumed += consumed as u64;
        Ok(consumed)
    }

    /// Forward every frame `src_qp` has transmitted straight to `dst_qp`, regardless of its
    /// destination address.
    pub fn forward_to(
        &mut self,
        src: &mut Context,
        src_qp: QpHandle,
        dst: &mut Context,
        dst_qp: QpHandle,
    ) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::new();
        for frame in src.take_transmitted(src_qp)? {
            let delivery = dst.deliver_packet(dst_qp, frame.as_packet())?;
            self.frames += 1;
            if let Delivery::Completed { .. } = delivery {
                self.consumed += 1;
            }
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }

    /// Number of frames forwarded so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Number of receive requests consumed by forwarded frames so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// How [`destroy_after_unblocking`] got rid of its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The first attempt succeeded.
    Destroyed,
    /// The first attempt was refused because of the given blocker; the retry after unblocking
    /// succeeded.
    DestroyedAfterUnblocking(Blocker),
}

/// Destroy `target`. If that is refused with `ResourceBusy`, run `unblock` and try again.
///
/// # Errors
///
/// Any error of the first attempt other than `ResourceBusy`, any error of `unblock`, and any
/// error of the retry (including a second `ResourceBusy`).
pub fn destroy_after_unblocking<F>(
    ctx: &mut Context,
    target: impl Into<ResourceId>,
    unblock: F,
) -> Result<DestroyOutcome>
where
    F: FnOnce(&mut Context) -> Result<()>,
{
    let target = target.into();
    match ctx.destroy(target) {
        Ok(()) => Ok(DestroyOutcome::Destroyed),
        Err(Error::ResourceBusy { blocker, .. }) => {
            debug!("{:?} is blocked by {}, unblocking", target, blocker);
            unblock(ctx)?;
            ctx.destroy(target)?;
            Ok(DestroyOutcome::DestroyedAfterUnblocking(blocker))
        }
        Err(e) => Err(e),
    }
}

/// The fields a scenario expects on a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedCompletion {
    /// Id of the work request.
    pub wr_id: u64,
    /// Completion status.
    pub status: WcStatus,
    /// Send or receive side.
    pub opcode: WcOpcode,
    /// Bytes received; zero on the send side.
    pub byte_len: u32,
    /// Number of the queue pair the request was posted on.
    pub qp_num: u32,
    /// Completion flags.
    pub wc_flags: WcFlags,
}

impl ExpectedCompletion {
    /// A successful send completion.
    pub fn send(wr_id: u64, qp_num: u32) -> Self {
        ExpectedCompletion {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
            qp_num,
            wc_flags: WcFlags::empty(),
        }
    }

    /// A successful receive completion of `byte_len` bytes on a datagram queue pair.
    pub fn recv(wr_id: u64, qp_num: u32, byte_len: u32) -> Self {
        ExpectedCompletion {
            wr_id,
            status: WcStatus::Success,
            opcode: WcOpcode::Recv,
            byte_len,
            qp_num,
            wc_flags: WcFlags::GRH,
        }
    }

    /// The same expectation with another status.
    pub fn with_status(mut self, status: WcStatus) -> Self {
        self.status = status;
        self
    }
}

/// One field of a work completion that differs from the expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[allow(missing_docs)]
pub enum Mismatch {
    #[error("wr_id is {actual}, expected {expected}")]
    WrId { expected: u64, actual: u64 },
    #[error("status is {actual:?}, expected {expected:?}")]
    Status { expected: WcStatus, actual: WcStatus },
    #[error("opcode is {actual:?}, expected {expected:?}")]
    Opcode { expected: WcOpcode, actual: WcOpcode },
    #[error("byte_len is {actual}, expected {expected}")]
    ByteLen { expected: u32, actual: u32 },
    #[error("qp_num is {actual:#x}, expected {expected:#x}")]
    QpNum { expected: u32, actual: u32 },
    #[error("wc_flags are {actual:?}, expected {expected:?}")]
    Flags { expected: WcFlags, actual: WcFlags },
    #[error("diagnostic fields are set: sl {sl}, dlid_path_bits {dlid_path_bits}, vendor_err {vendor_err:#x}, imm_data {imm_data:#x}")]
    Diagnostics {
        sl: u8,
        dlid_path_bits: u8,
        vendor_err: u32,
        imm_data: u32,
    },
}

/// Compare a work completion with what a scenario expects.
///
/// Besides the fields of `expected`, the diagnostic fields (service level, path bits, vendor
/// error and immediate data without `WITH_IMM`) must all be zero. An empty result means the
/// completion matches.
pub fn expect_completion(wc: &WorkCompletion, expected: &ExpectedCompletion) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    if wc.wr_id != expected.wr_id {
        mismatches.push(Mismatch::WrId {
            expected: expected.wr_id,
            actual: wc.wr_id,
        });
    }
    if wc.status != expected.status {
        mismatches.push(Mismatch::Status {
            expected: expected.status,
            actual: wc.status,
        });
    }
    if wc.opcode != expected.opcode {
        mismatches.push(Mismatch::Opcode {
            expected: expected.opcode,
            actual: wc.opcode,
        });
    }
    if wc.byte_len != expected.byte_len {
        mismatches.push(Mismatch::ByteLen {
            expected: expected.byte_len,
            actual: wc.byte_len,
        });
    }
    if wc.qp_num != expected.qp_num {
        mismatches.push(Mismatch::QpNum {
            expected: expected.qp_num,
            actual: wc.qp_num,
        });
    }
    if wc.wc_flags != expected.wc_flags {
        mismatches.push(Mismatch::Flags {
            expected: expected.wc_flags,
            actual: wc.wc_flags,
        });
    }
    if wc.has_diagnostics() {
        mismatches.push(Mismatch::Diagnostics {
            sl: wc.sl,
            dlid_path_bits: wc.dlid_path_bits,
            vendor_err: wc.vendor_err,
            imm_data: wc.imm_data,
        });
    }
    mismatches
}

/// A raw packet queue pair in RTS, with its own protection domain and completion queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPacketEndpoint {
    /// Protection domain of the queue pair and of the buffers registered for it.
    pub pd: PdHandle,
    /// Completion queue for sends.
    pub send_cq: CqHandle,
    /// Completion queue for receives, bound to the channel given at creation.
    pub recv_cq: CqHandle,
    /// The queue pair.
    pub qp: QpHandle,
}

impl RawPacketEndpoint {
    /// Set up an endpoint whose work queues and completion queues are `depth` deep. Receive
    /// completion events go to `channel`, if given.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): `depth` exceeds the device's pool size.
    pub fn create(ctx: &mut Context, channel: Option<ChannelHandle>, depth: u32) -> Result<Self> {
        let cqe = i32::try_from(depth)
            .map_err(|_| Error::InvalidArgument("endpoint depth out of range"))?;
        if depth > ctx.query_device()?.pool_size() {
            return Err(Error::InvalidArgument("endpoint deeper than the device pool"));
        }

        let pd = ctx.alloc_pd()?;
        let send_cq = ctx.create_cq(cqe, 0, None, 0)?;
        let recv_cq = ctx.create_cq(cqe, 0, channel, 0)?;
        let qp = ctx
            .create_qp(pd, send_cq, recv_cq, QpType::RawPacket)
            .set_max_send_wr(depth)
            .set_max_recv_wr(depth)
            .build()?;
        ctx.ready(qp, PORT_NUM)?;
        Ok(RawPacketEndpoint {
            pd,
            send_cq,
            recv_cq,
            qp,
        })
    }

    /// Destroy the endpoint, together with its multicast memberships and the memory regions
    /// registered in its protection domain.
    pub fn teardown(self, ctx: &mut Context) -> Result<()> {
        let memberships: Vec<_> = ctx
            .graph
            .memberships
            .iter()
            .filter(|(_, m)| m.qp() == self.qp)
            .map(|(h, _)| h)
            .collect();
        for membership in memberships {
            ctx.destroy(membership)?;
        }
        ctx.destroy_qp(self.qp)?;
        ctx.destroy_cq(self.send_cq)?;
        ctx.destroy_cq(self.recv_cq)?;

        let mrs: Vec<_> = ctx
            .graph
            .mrs
            .iter()
            .filter(|(_, mr)| mr.pd() == self.pd)
            .map(|(h, _)| h)
            .collect();
        for mr in mrs {
            ctx.dereg_mr(mr)?;
        }
        ctx.dealloc_pd(self.pd)
    }
}
