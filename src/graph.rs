//! The resource graph of a [`Context`]: which resources exist, what they depend on, and in
//! which order they may be torn down.
//!
//! Dependencies are declared once, in [`dependents`], and consulted by a single generic
//! [`Context::destroy`]. A resource can only be destroyed once nothing that was created on top
//! of it remains; otherwise the destroy fails with [`Error::ResourceBusy`] and has no effect.
//!
//! | resource            | blocked by                                  |
//! |---------------------|---------------------------------------------|
//! | context             | protection domains, CQs, completion channels |
//! | protection domain   | queue pairs, memory regions                 |
//! | completion channel  | completion queues bound to it               |
//! | completion queue    | queue pairs using it, unacknowledged events |
//! | queue pair          | multicast memberships                       |

use std::fmt;

use log::{debug, warn};

use crate::arena::{Arena, Handle};
use crate::cq::{CompletionChannel, CompletionQueue};
use crate::error::{Error, Result};
use crate::mr::MemoryRegion;
use crate::qp::{MulticastMembership, QueuePair};
use crate::Context;

/// The kinds of resources a [`Context`] manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The device context itself.
    Context,
    /// A protection domain.
    ProtectionDomain,
    /// A registered memory region.
    MemoryRegion,
    /// A completion event channel.
    CompletionChannel,
    /// A completion queue.
    CompletionQueue,
    /// A queue pair.
    QueuePair,
    /// The attachment of a queue pair to a multicast group.
    MulticastMembership,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Context => "device context",
            ResourceKind::ProtectionDomain => "protection domain",
            ResourceKind::MemoryRegion => "memory region",
            ResourceKind::CompletionChannel => "completion channel",
            ResourceKind::CompletionQueue => "completion queue",
            ResourceKind::QueuePair => "queue pair",
            ResourceKind::MulticastMembership => "multicast membership",
        })
    }
}

/// A protection domain.
///
/// Memory regions and queue pairs are created in a protection domain, and a queue pair can only
/// access memory regions of its own domain. See also [RDMAmojo] for an overview.
///
/// [RDMAmojo]: http://www.rdmamojo.com/2012/08/24/ibv_alloc_pd/
#[derive(Debug)]
pub struct ProtectionDomain {
    _priv: (),
}

/// Handle to a [`ProtectionDomain`].
pub type PdHandle = Handle<ProtectionDomain>;
/// Handle to a [`MemoryRegion`].
pub type MrHandle = Handle<MemoryRegion>;
/// Handle to a [`CompletionChannel`].
pub type ChannelHandle = Handle<CompletionChannel>;
/// Handle to a [`CompletionQueue`].
pub type CqHandle = Handle<CompletionQueue>;
/// Handle to a [`QueuePair`].
pub type QpHandle = Handle<QueuePair>;
/// Handle to a [`MulticastMembership`].
pub type MembershipHandle = Handle<MulticastMembership>;

/// A handle to any destroyable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ResourceId {
    ProtectionDomain(PdHandle),
    MemoryRegion(MrHandle),
    CompletionChannel(ChannelHandle),
    CompletionQueue(CqHandle),
    QueuePair(QpHandle),
    MulticastMembership(MembershipHandle),
}

impl ResourceId {
    /// The kind of resource this identifies.
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceId::ProtectionDomain(_) => ResourceKind::ProtectionDomain,
            ResourceId::MemoryRegion(_) => ResourceKind::MemoryRegion,
            ResourceId::CompletionChannel(_) => ResourceKind::CompletionChannel,
            ResourceId::CompletionQueue(_) => ResourceKind::CompletionQueue,
            ResourceId::QueuePair(_) => ResourceKind::QueuePair,
            ResourceId::MulticastMembership(_) => ResourceKind::MulticastMembership,
        }
    }
}

macro_rules! resource_id_from {
    ($($variant:ident => $handle:ty),* $(,)?) => {
        $(
            impl From<$handle> for ResourceId {
                fn from(handle: $handle) -> Self {
                    ResourceId::$variant(handle)
                }
            }
        )*
    };
}

resource_id_from! {
    ProtectionDomain => PdHandle,
    MemoryRegion => MrHandle,
    CompletionChannel => ChannelHandle,
    CompletionQueue => CqHandle,
    QueuePair => QpHandle,
    MulticastMembership => MembershipHandle,
}

/// What prevents a resource from being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// A live resource of this kind was created on top of the target.
    Resource(ResourceKind),
    /// The target completion queue has completion events that were received but not
    /// acknowledged.
    UnackedEvents(u32),
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::Resource(kind) => write!(f, "a live {} still depends on it", kind),
            Blocker::UnackedEvents(n) => write!(f, "{} completion event(s) are not acknowledged", n),
        }
    }
}

/// Implemented by every resource kind stored in an [`Arena`]. Not nameable outside the crate.
pub trait Resource {
    /// The kind reported in errors and logs.
    const KIND: ResourceKind;

    /// Whether this resource was created on top of `target`.
    fn depends_on(&self, _target: ResourceId) -> bool {
        false
    }
}

impl Resource for ProtectionDomain {
    const KIND: ResourceKind = ResourceKind::ProtectionDomain;
}

#[derive(Debug, Clone, Copy)]
enum Dependent {
    Live(ResourceKind),
    UnackedEvents,
}

/// Everything that must be gone before a resource of `kind` may be destroyed, in the order the
/// checks are reported.
const fn dependents(kind: ResourceKind) -> &'static [Dependent] {
    use Dependent::*;
    use ResourceKind::*;
    match kind {
        Context => &[
            Live(ProtectionDomain),
            Live(CompletionQueue),
            Live(CompletionChannel),
        ],
        ProtectionDomain => &[Live(QueuePair), Live(MemoryRegion)],
        CompletionChannel => &[Live(CompletionQueue)],
        CompletionQueue => &[Live(QueuePair), UnackedEvents],
        QueuePair => &[Live(MulticastMembership)],
        MemoryRegion | MulticastMembership => &[],
    }
}

fn count_dependents<T: Resource>(arena: &Arena<T>, target: Option<ResourceId>) -> usize {
    arena
        .iter()
        .filter(|(_, r)| target.map_or(true, |t| r.depends_on(t)))
        .count()
}

/// All resources of one context.
pub(crate) struct ResourceGraph {
    pub(crate) pds: Arena<ProtectionDomain>,
    pub(crate) mrs: Arena<MemoryRegion>,
    pub(crate) channels: Arena<CompletionChannel>,
    pub(crate) cqs: Arena<CompletionQueue>,
    pub(crate) qps: Arena<QueuePair>,
    pub(crate) memberships: Arena<MulticastMembership>,
}

impl ResourceGraph {
    pub(crate) fn new(context: u32) -> Self {
        ResourceGraph {
            pds: Arena::new(context),
            mrs: Arena::new(context),
            channels: Arena::new(context),
            cqs: Arena::new(context),
            qps: Arena::new(context),
            memberships: Arena::new(context),
        }
    }

    /// Number of live resources of `kind` that depend on `target` (or all of them, if `target`
    /// is the context itself).
    fn live(&self, kind: ResourceKind, target: Option<ResourceId>) -> usize {
        match kind {
            ResourceKind::Context => 0,
            ResourceKind::ProtectionDomain => count_dependents(&self.pds, target),
            ResourceKind::MemoryRegion => count_dependents(&self.mrs, target),
            ResourceKind::CompletionChannel => count_dependents(&self.channels, target),
            ResourceKind::CompletionQueue => count_dependents(&self.cqs, target),
            ResourceKind::QueuePair => count_dependents(&self.qps, target),
            ResourceKind::MulticastMembership => count_dependents(&self.memberships, target),
        }
    }

    /// The first reason `target` cannot be destroyed, if any. `None` as target means the
    /// context.
    pub(crate) fn blocker(&self, target: Option<ResourceId>) -> Option<Blocker> {
        let kind = target.map_or(ResourceKind::Context, |t| t.kind());
        for dependent in dependents(kind) {
            match *dependent {
                Dependent::Live(k) => {
                    if self.live(k, target) > 0 {
                        return Some(Blocker::Resource(k));
                    }
                }
                Dependent::UnackedEvents => {
                    if let Some(ResourceId::CompletionQueue(cq)) = target {
                        match self.cqs.get(cq) {
                            Ok(cq) if cq.unacked_events() > 0 => {
                                return Some(Blocker::UnackedEvents(cq.unacked_events()));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        None
    }

    pub(crate) fn contains(&self, id: ResourceId) -> bool {
        match id {
            ResourceId::ProtectionDomain(h) => self.pds.contains(h),
            ResourceId::MemoryRegion(h) => self.mrs.contains(h),
            ResourceId::CompletionChannel(h) => self.channels.contains(h),
            ResourceId::CompletionQueue(h) => self.cqs.contains(h),
            ResourceId::QueuePair(h) => self.qps.contains(h),
            ResourceId::MulticastMembership(h) => self.memberships.contains(h),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pds.len()
            + self.mrs.len()
            + self.channels.len()
            + self.cqs.len()
            + self.qps.len()
            + self.memberships.len()
            == 0
    }

    /// Removes `id` from the graph. Callers check [`ResourceGraph::blocker`] first.
    fn remove(&mut self, id: ResourceId) -> Result<()> {
        match id {
            ResourceId::ProtectionDomain(h) => {
                self.pds.remove(h)?;
            }
            ResourceId::MemoryRegion(h) => {
                self.mrs.remove(h)?;
            }
            ResourceId::CompletionChannel(h) => {
                self.channels.remove(h)?;
            }
            ResourceId::CompletionQueue(h) => {
                let cq = self.cqs.remove(h)?;
                if let Some(channel) = cq.channel() {
                    let channel = self.channels.get_mut(channel)?;
                    let dropped = channel.unsubscribe(h)?;
                    if dropped > 0 {
                        debug!("dropped {} pending event(s) of destroyed {:?}", dropped, h);
                    }
                }
            }
            ResourceId::QueuePair(h) => {
                self.qps.remove(h)?;
            }
            ResourceId::MulticastMembership(h) => {
                self.memberships.remove(h)?;
            }
        }
        Ok(())
    }
}

impl Context {
    /// Allocate a protection domain (PD) for this context.
    ///
    /// See [RDMAmojo] for more information.
    ///
    /// [RDMAmojo]: http://www.rdmamojo.com/2012/08/24/ibv_alloc_pd/
    ///
    /// # Errors
    ///
    ///  - `ContextClosed`: the context was closed.
    pub fn alloc_pd(&mut self) -> Result<PdHandle> {
        self.check_open()?;
        let pd = self.graph.pds.insert(ProtectionDomain { _priv: () });
        debug!("allocated {:?}", pd);
        Ok(pd)
    }

    /// Whether `id` refers to a live resource of this context.
    pub fn is_live(&self, id: impl Into<ResourceId>) -> bool {
        self.graph.contains(id.into())
    }

    /// Destroy any resource of this context.
    ///
    /// Destruction is refused while something still depends on the resource (see the module
    /// documentation for the dependency table). A refused destroy has no effect at all, so it
    /// can be retried after the blocker has been removed.
    ///
    /// # Errors
    ///
    ///  - `ResourceBusy` (`EBUSY`): a dependent resource, or an unacknowledged completion
    ///    event, still exists.
    ///  - `StaleHandle` (`EINVAL`): the resource was already destroyed or belongs to another
    ///    context.
    ///  - `ContextClosed`: the context was closed.
    pub fn destroy(&mut self, id: impl Into<ResourceId>) -> Result<()> {
        self.check_open()?;
        let id = id.into();
        if !self.graph.contains(id) {
            return Err(Error::StaleHandle(id.kind()));
        }
        if let Some(blocker) = self.graph.blocker(Some(id)) {
            warn!("refusing to destroy {:?}: {}", id, blocker);
            return Err(Error::ResourceBusy {
                target: id.kind(),
                blocker,
            });
        }
        self.graph.remove(id)?;
        debug!("destroyed {:?}", id);
        Ok(())
    }

    /// Deallocate a protection domain. Fails with `ResourceBusy` while queue pairs or memory
    /// regions of the domain exist.
    pub fn dealloc_pd(&mut self, pd: PdHandle) -> Result<()> {
        self.destroy(pd)
    }

    /// Deregister a memory region.
    pub fn dereg_mr(&mut self, mr: MrHandle) -> Result<()> {
        self.destroy(mr)
    }

    /// Destroy a completion channel. Fails with `ResourceBusy` while a completion queue is
    /// bound to it.
    pub fn destroy_comp_channel(&mut self, channel: ChannelHandle) -> Result<()> {
        self.destroy(channel)
    }

    /// Destroy a completion queue. Fails with `ResourceBusy` while a queue pair uses it or
    /// while events received for it are not acknowledged. Events that are still queued on its
    /// channel are discarded.
    pub fn destroy_cq(&mut self, cq: CqHandle) -> Result<()> {
        self.destroy(cq)
    }

    /// Destroy a queue pair. Fails with `ResourceBusy` while it is attached to a multicast
    /// group.
    pub fn destroy_qp(&mut self, qp: QpHandle) -> Result<()> {
        self.destroy(qp)
    }
}
