use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, trace, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{ChannelHandle, CqHandle, Resource, ResourceGraph, ResourceId, ResourceKind};
use crate::Context;

/// Status of a work completion. The discriminants are the verbs values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum WcStatus {
    /// The operation completed successfully.
    #[default]
    Success = 0,
    /// The incoming message did not fit the posted receive buffers.
    LocalLengthError = 1,
    /// An internal queue pair consistency error was detected.
    LocalQpOperationError = 2,
    /// A scatter/gather element referenced memory the queue pair may not access.
    LocalProtectionError = 4,
    /// The request was flushed because the queue pair moved to the ERROR state.
    WrFlushError = 5,
    /// A transport error not covered by another status.
    GeneralError = 21,
}

impl WcStatus {
    /// Whether the operation completed successfully.
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Which kind of work request a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum WcOpcode {
    /// A send request.
    #[default]
    Send = 0,
    /// A receive request.
    Recv = 128,
}

bitflags! {
    /// Flags of a work completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct WcFlags: u32 {
        /// A global routing header is present in the receive buffer (datagram queue pairs).
        const GRH = 1;
        /// `imm_data` is valid.
        const WITH_IMM = 1 << 1;
    }
}

/// A work completion, as returned by [`Context::poll_cq`].
///
/// If the status is not `Success`, only `wr_id`, `status`, `opcode`, `qp_num` and `vendor_err`
/// are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[allow(missing_docs)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub imm_data: u32,
    pub qp_num: u32,
    pub src_qp: u32,
    pub wc_flags: WcFlags,
    pub pkey_index: u16,
    pub slid: u16,
    pub sl: u8,
    pub dlid_path_bits: u8,
}

impl WorkCompletion {
    pub(crate) fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, qp_num: u32) -> Self {
        WorkCompletion {
            wr_id,
            status,
            opcode,
            qp_num,
            ..Default::default()
        }
    }

    /// Returns the 64 bit value that was associated with the corresponding Work Request.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Returns true if this work completion finished successfully.
    pub fn is_valid(&self) -> bool {
        self.status.is_success()
    }

    /// Returns `Some` containing the error status and vendor error if the operation failed.
    pub fn error(&self) -> Option<(WcStatus, u32)> {
        (!self.is_valid()).then_some((self.status, self.vendor_err))
    }

    /// Whether any of the fields the model always reports as zero (service level, path bits,
    /// vendor error, immediate data without `WITH_IMM`) is set.
    pub fn has_diagnostics(&self) -> bool {
        self.sl != 0
            || self.dlid_path_bits != 0
            || self.vendor_err != 0
            || (self.imm_data != 0 && !self.wc_flags.contains(WcFlags::WITH_IMM))
    }
}

/// How [`Context::get_cq_event`] behaves when no event is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Fail immediately with `WouldBlock`.
    NoWait,
    /// Wait up to the given duration, then fail with `TimedOut`.
    Timeout(Duration),
}

/// A completion queue that allows subscribing to the completion of queued sends and receives.
#[derive(Debug)]
pub struct CompletionQueue {
    capacity: usize,
    entries: VecDeque<WorkCompletion>,
    user_context: u64,
    channel: Option<ChannelHandle>,
    comp_vector: u32,
    armed: Option<bool>,
    overrun: bool,
    unacked: u32,
}

impl Resource for CompletionQueue {
    const KIND: ResourceKind = ResourceKind::CompletionQueue;

    fn depends_on(&self, target: ResourceId) -> bool {
        matches!(target, ResourceId::CompletionChannel(ch) if self.channel == Some(ch))
    }
}

impl CompletionQueue {
    /// Maximum number of completions the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of completions ready to be polled.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no completion is ready to be polled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The opaque value given at creation, echoed by [`Context::get_cq_event`].
    pub fn user_context(&self) -> u64 {
        self.user_context
    }

    /// The completion channel the queue reports events to.
    pub fn channel(&self) -> Option<ChannelHandle> {
        self.channel
    }

    /// The completion vector the queue was created on.
    pub fn comp_vector(&self) -> u32 {
        self.comp_vector
    }

    /// Whether a notification request is pending.
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Whether more completions were produced than the queue holds.
    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    /// Number of events returned by [`Context::get_cq_event`] and not yet acknowledged.
    pub fn unacked_events(&self) -> u32 {
        self.unacked
    }
}

/// A completion event channel.
///
/// The channel owns an event file descriptor which is readable exactly while events are
/// pending, so it can be handed to `poll(2)` or an event loop through [`AsFd`].
#[derive(Debug)]
pub struct CompletionChannel {
    fd: EventFd,
    pending: VecDeque<CqHandle>,
    subscribers: Vec<CqHandle>,
}

impl Resource for CompletionChannel {
    const KIND: ResourceKind = ResourceKind::CompletionChannel;
}

impl CompletionChannel {
    fn new() -> Result<Self> {
        let fd = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
        )?;
        Ok(CompletionChannel {
            fd,
            pending: VecDeque::new(),
            subscribers: Vec::new(),
        })
    }

    /// Number of events waiting to be returned by [`Context::get_cq_event`].
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// The completion queues bound to this channel.
    pub fn subscribers(&self) -> &[CqHandle] {
        &self.subscribers
    }

    fn signal(&mut self, cq: CqHandle) -> Result<()> {
        self.pending.push_back(cq);
        self.fd.write(1)?;
        Ok(())
    }

    fn take(&mut self) -> Result<Option<CqHandle>> {
        match self.pending.pop_front() {
            Some(cq) => {
                self.fd.read()?;
                Ok(Some(cq))
            }
            None => Ok(None),
        }
    }

    /// Forgets `cq` along with its pending events. Returns the number of events dropped.
    pub(crate) fn unsubscribe(&mut self, cq: CqHandle) -> Result<usize> {
        self.subscribers.retain(|&s| s != cq);
        let before = self.pending.len();
        self.pending.retain(|&p| p != cq);
        let dropped = before - self.pending.len();
        for _ in 0..dropped {
            self.fd.read()?;
        }
        Ok(dropped)
    }
}

impl AsFd for CompletionChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl ResourceGraph {
    /// Append a completion to `cq`, firing its channel if the queue is armed.
    ///
    /// `solicited` marks completions of messages sent with the `SOLICITED` flag. Errors always
    /// satisfy a solicited-only notification request.
    pub(crate) fn complete(
        &mut self,
        cq_handle: CqHandle,
        wc: WorkCompletion,
        solicited: bool,
    ) -> Result<()> {
        let cq = self.cqs.get_mut(cq_handle)?;
        if cq.entries.len() >= cq.capacity {
            if !cq.overrun {
                warn!(
                    "{:?} overrun: dropping completion of wr {} ({} entries)",
                    cq_handle, wc.wr_id, cq.capacity
                );
            }
            cq.overrun = true;
            return Ok(());
        }
        trace!("{:?} <- {:?}", cq_handle, wc);
        cq.entries.push_back(wc);

        let fire = match cq.armed {
            Some(solicited_only) => !solicited_only || solicited || !wc.status.is_success(),
            None => false,
        };
        if !fire {
            return Ok(());
        }
        cq.armed = None;
        if let Some(channel) = cq.channel {
            self.channels.get_mut(channel)?.signal(cq_handle)?;
            trace!("{:?} fired event for {:?}", channel, cq_handle);
        }
        Ok(())
    }
}

impl Context {
    /// Create a completion event channel.
    ///
    /// # Errors
    ///
    ///  - `Sys`: the event file descriptor could not be created.
    ///  - `ContextClosed`: the context was closed.
    pub fn create_comp_channel(&mut self) -> Result<ChannelHandle> {
        self.check_open()?;
        let channel = self.graph.channels.insert(CompletionChannel::new()?);
        debug!("created {:?}", channel);
        Ok(channel)
    }

    /// Look up a completion channel.
    pub fn comp_channel(&self, channel: ChannelHandle) -> Result<&CompletionChannel> {
        self.graph.channels.get(channel)
    }

    /// Create a completion queue (CQ).
    ///
    /// When an outstanding Work Request, within a Send or Receive Queue, is completed, a Work
    /// Completion is being added to the CQ of that Work Queue. A single CQ can be shared for
    /// sending and receiving, and across multiple QPs.
    ///
    /// `cqe` is the number of completions the queue holds. `user_context` is an opaque value
    /// echoed by [`Context::get_cq_event`]. If `channel` is given, notification events for the
    /// queue are delivered to it.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): `cqe` is not in `1..=max_cqe`, or `comp_vector` is not
    ///    in `0..num_comp_vectors`. Nothing is created.
    ///  - `StaleHandle`: `channel` is not live.
    ///  - `ContextClosed`: the context was closed.
    pub fn create_cq(
        &mut self,
        cqe: i32,
        user_context: u64,
        channel: Option<ChannelHandle>,
        comp_vector: i32,
    ) -> Result<CqHandle> {
        self.check_open()?;
        let attr = self.device().attr();
        let capacity = u32::try_from(cqe)
            .ok()
            .filter(|&n| n >= 1 && n <= attr.max_cqe)
            .ok_or(Error::InvalidArgument("cqe must be in 1..=max_cqe"))?;
        let comp_vector = u32::try_from(comp_vector)
            .ok()
            .filter(|&v| v < attr.num_comp_vectors)
            .ok_or(Error::InvalidArgument("no such completion vector"))?;
        if let Some(channel) = channel {
            self.graph.channels.get(channel)?;
        }

        let cq = self.graph.cqs.insert(CompletionQueue {
            capacity: capacity as usize,
            entries: VecDeque::new(),
            user_context,
            channel,
            comp_vector,
            armed: None,
            overrun: false,
            unacked: 0,
        });
        if let Some(channel) = channel {
            self.graph.channels.get_mut(channel)?.subscribers.push(cq);
        }
        debug!(
            "created {:?} with {} entries on vector {}",
            cq, capacity, comp_vector
        );
        Ok(cq)
    }

    /// Look up a completion queue.
    pub fn cq(&self, cq: CqHandle) -> Result<&CompletionQueue> {
        self.graph.cqs.get(cq)
    }

    /// Poll for (possibly multiple) work completions.
    ///
    /// `poll_cq` pops up to `max_entries` Work Completions from the head of the CQ in the order
    /// they entered it (FIFO). After a Work Completion was popped from a CQ, it cannot be
    /// returned to it. Fewer than `max_entries` completions means the CQ was emptied.
    ///
    /// # Errors
    ///
    ///  - `CompletionQueueOverrun` (`EOVERFLOW`): more completions were produced than the CQ
    ///    can hold. The CQ cannot be used anymore.
    pub fn poll_cq(&mut self, cq: CqHandle, max_entries: usize) -> Result<Vec<WorkCompletion>> {
        let mut completions = vec![WorkCompletion::default(); max_entries];
        let n = self.poll_cq_into(cq, &mut completions)?.len();
        completions.truncate(n);
        Ok(completions)
    }

    /// Like [`Context::poll_cq`], but pops into `completions` and returns the filled prefix.
    #[inline]
    pub fn poll_cq_into<'c>(
        &mut self,
        cq: CqHandle,
        completions: &'c mut [WorkCompletion],
    ) -> Result<&'c mut [WorkCompletion]> {
        self.check_open()?;
        let q = self.graph.cqs.get_mut(cq)?;
        if q.overrun {
            return Err(Error::CompletionQueueOverrun);
        }
        let n = completions.len().min(q.entries.len());
        for (slot, wc) in completions.iter_mut().zip(q.entries.drain(..n)) {
            *slot = wc;
        }
        Ok(&mut completions[..n])
    }

    /// Request a notification event on the CQ's channel for the next completion.
    ///
    /// Notification requests are single-shot: one event is generated, after which the CQ must
    /// be armed again. With `solicited_only`, only completions of solicited messages and error
    /// completions trigger the event. Arming an armed CQ again does not generate a second event,
    /// but widens a solicited-only request to all completions.
    ///
    /// Completions that are already in the CQ when it is armed do not trigger an event.
    pub fn req_notify_cq(&mut self, cq: CqHandle, solicited_only: bool) -> Result<()> {
        self.check_open()?;
        let q = self.graph.cqs.get_mut(cq)?;
        q.armed = Some(match q.armed {
            Some(previous) => previous && solicited_only,
            None => solicited_only,
        });
        trace!("armed {:?} (solicited only: {})", cq, solicited_only);
        Ok(())
    }

    /// Wait for the next completion event on `channel` and return the CQ it belongs to along
    /// with that CQ's user context.
    ///
    /// Every returned event must eventually be acknowledged with [`Context::ack_cq_events`];
    /// the CQ cannot be destroyed before.
    ///
    /// # Errors
    ///
    ///  - `WouldBlock` (`EAGAIN`): no event pending and `policy` is `NoWait`.
    ///  - `TimedOut` (`ETIMEDOUT`): no event arrived within the timeout.
    pub fn get_cq_event(
        &mut self,
        channel: ChannelHandle,
        policy: WaitPolicy,
    ) -> Result<(CqHandle, u64)> {
        self.check_open()?;
        if let Some(event) = self.take_cq_event(channel)? {
            return Ok(event);
        }
        let timeout = match policy {
            WaitPolicy::NoWait => return Err(Error::WouldBlock),
            WaitPolicy::Timeout(timeout) => timeout,
        };

        let ch = self.graph.channels.get(channel)?;
        let pollfd = nix::poll::PollFd::new(ch.as_fd(), nix::poll::PollFlags::POLLIN);
        let ret = nix::poll::poll(
            &mut [pollfd],
            nix::poll::PollTimeout::try_from(timeout)
                .map_err(|_| Error::InvalidArgument("timeout too long"))?,
        )?;
        match ret {
            0 => Err(Error::TimedOut),
            _ => self.take_cq_event(channel)?.ok_or(Error::WouldBlock),
        }
    }

    fn take_cq_event(&mut self, channel: ChannelHandle) -> Result<Option<(CqHandle, u64)>> {
        let Some(cq) = self.graph.channels.get_mut(channel)?.take()? else {
            return Ok(None);
        };
        let q = self.graph.cqs.get_mut(cq)?;
        q.unacked += 1;
        trace!("{:?} delivered event for {:?}", channel, cq);
        Ok(Some((cq, q.user_context)))
    }

    /// Acknowledge `count` events returned by [`Context::get_cq_event`] for `cq`.
    ///
    /// # Errors
    ///
    ///  - `InvalidArgument` (`EINVAL`): more events acknowledged than were received. Nothing
    ///    is acknowledged.
    pub fn ack_cq_events(&mut self, cq: CqHandle, count: u32) -> Result<()> {
        self.check_open()?;
        let q = self.graph.cqs.get_mut(cq)?;
        if count > q.unacked {
            return Err(Error::InvalidArgument(
                "acknowledging more events than were received",
            ));
        }
        q.unacked -= count;
        Ok(())
    }

    /// The file descriptor of a completion channel. It polls readable while events are pending.
    pub fn channel_fd(&self, channel: ChannelHandle) -> Result<BorrowedFd<'_>> {
        Ok(self.graph.channels.get(channel)?.as_fd())
    }
}
