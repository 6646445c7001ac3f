//! Release ordering ledger
//!
//! Every Vulkan handle this crate destroys is reported here as a
//! [`ReleaseEvent`]. The ledger does not destroy anything itself; it is the
//! record a test harness inspects to prove that teardown ran in dependency
//! order:
//!
//! ```text
//! buffers (buffer, then memory)
//!   -> descriptor pool
//!   -> pipeline -> shader module -> descriptor set layout -> pipeline layout
//!   -> command pool
//!   -> logical device -> instance
//! ```
//!
//! Ordering is enforced by construction (owners drop their handles in a
//! fixed order and keep the device alive through a shared context), so in
//! normal operation `verify` always passes.
//!
//! Checks run as events arrive against a per-owner summary, so recording is
//! constant time. Only the most recent [`LEDGER_CAPACITY`] events are kept
//! for inspection; a violation is remembered even after its events have
//! been discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{ComputeError, Result};

/// Events retained for `events` and `verify_monotonic`
pub const LEDGER_CAPACITY: usize = 4096;

/// One kind of released handle, ranked by its position in teardown order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReleaseStage {
    Buffer,
    BufferMemory,
    DescriptorPool,
    Pipeline,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    CommandPool,
    Device,
    Instance,
}

impl ReleaseStage {
    /// Device-level stages; nothing may be released after them.
    pub fn is_root(self) -> bool {
        matches!(self, ReleaseStage::Device | ReleaseStage::Instance)
    }

    /// Position in the global teardown order.
    ///
    /// A buffer and its memory share a rank: a set of buffers is released
    /// pair by pair, so `Buffer` legitimately follows another owner's
    /// `BufferMemory`. Likewise a pipeline and its shader module.
    pub fn rank(self) -> u8 {
        match self {
            ReleaseStage::Buffer | ReleaseStage::BufferMemory => 0,
            ReleaseStage::DescriptorPool => 1,
            ReleaseStage::Pipeline | ReleaseStage::ShaderModule => 2,
            ReleaseStage::DescriptorSetLayout | ReleaseStage::PipelineLayout => 3,
            ReleaseStage::CommandPool => 4,
            ReleaseStage::Device => 5,
            ReleaseStage::Instance => 6,
        }
    }
}

/// A single recorded release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseEvent {
    /// Identity of the owning object (one buffer pair, one pipeline, ...)
    pub owner: u64,
    pub stage: ReleaseStage,
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Hand out a process-unique owner id for ledger entries. Ids are never
/// reused, unlike driver handle values.
pub fn next_owner_id() -> u64 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// First ordering violation seen: (owner, stage released, stage it followed)
type Violation = (u64, ReleaseStage, ReleaseStage);

fn violation_error((owner, earlier, later): Violation) -> ComputeError {
    ComputeError::TeardownOrderViolation { owner, earlier, later }
}

/// Running summary that lets each event be checked in O(1).
#[derive(Debug, Default)]
struct OrderState {
    /// Latest stage released per owner
    last_by_owner: HashMap<u64, ReleaseStage>,

    /// Highest root stage released so far
    root: Option<ReleaseStage>,
}

impl OrderState {
    fn check(&self, event: ReleaseEvent) -> Option<Violation> {
        if let Some(&prior) = self.last_by_owner.get(&event.owner) {
            if prior > event.stage {
                return Some((event.owner, event.stage, prior));
            }
        }
        match self.root {
            Some(root) if event.stage < root => Some((event.owner, event.stage, root)),
            _ => None,
        }
    }

    fn apply(&mut self, event: ReleaseEvent) {
        let last = self.last_by_owner.entry(event.owner).or_insert(event.stage);
        *last = (*last).max(event.stage);
        if event.stage.is_root() {
            self.root = self.root.max(Some(event.stage));
        }
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    events: VecDeque<ReleaseEvent>,
    discarded: u64,
    order: OrderState,
    violation: Option<Violation>,
}

/// Append-only record of handle releases.
#[derive(Debug, Default)]
pub struct TeardownLedger {
    inner: Mutex<LedgerInner>,
}

impl TeardownLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a release. Called from `Drop` impls, so it never fails; an
    /// ordering problem is logged immediately and reported again by `verify`.
    pub fn record(&self, owner: u64, stage: ReleaseStage) {
        let mut inner = self.lock();
        let event = ReleaseEvent { owner, stage };
        if let Some(v) = inner.order.check(event) {
            log::error!("Teardown order violation: {}", violation_error(v));
            inner.violation.get_or_insert(v);
        }
        inner.order.apply(event);

        if inner.events.len() == LEDGER_CAPACITY {
            inner.events.pop_front();
            inner.discarded += 1;
        }
        inner.events.push_back(event);
    }

    /// Snapshot of the retained events, oldest first.
    pub fn events(&self) -> Vec<ReleaseEvent> {
        self.lock().events.iter().copied().collect()
    }

    /// Events dropped from the front to honour [`LEDGER_CAPACITY`].
    pub fn discarded(&self) -> u64 {
        self.lock().discarded
    }

    /// Forget retained events; the violation flag and owner summary stay.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.discarded += inner.events.len() as u64;
        inner.events.clear();
    }

    /// Per-owner ordering plus "device and instance go last".
    pub fn verify(&self) -> Result<()> {
        match self.lock().violation {
            Some(v) => Err(violation_error(v)),
            None => Ok(()),
        }
    }

    /// `verify` plus a global non-decreasing [`ReleaseStage::rank`] across
    /// the retained events. Holds for a full session teardown, not for a
    /// session that rebuilt descriptors or pipelines midway.
    pub fn verify_monotonic(&self) -> Result<()> {
        self.verify()?;
        verify_ranks(&self.events())
    }
}

/// Check a full event sequence for per-owner and root ordering.
pub fn verify_events(events: &[ReleaseEvent]) -> Result<()> {
    let mut order = OrderState::default();
    for event in events {
        if let Some(v) = order.check(*event) {
            return Err(violation_error(v));
        }
        order.apply(*event);
    }
    Ok(())
}

fn verify_ranks(events: &[ReleaseEvent]) -> Result<()> {
    for pair in events.windows(2) {
        if pair[1].stage.rank() < pair[0].stage.rank() {
            return Err(ComputeError::TeardownOrderViolation {
                owner: pair[1].owner,
                earlier: pair[1].stage,
                later: pair[0].stage,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(owner: u64, stage: ReleaseStage) -> ReleaseEvent {
        ReleaseEvent { owner, stage }
    }

    fn ledger_from(events: &[ReleaseEvent]) -> TeardownLedger {
        let ledger = TeardownLedger::new();
        for e in events {
            ledger.record(e.owner, e.stage);
        }
        ledger
    }

    #[test]
    fn test_prescribed_order_passes() {
        let events = [
            ev(1, ReleaseStage::Buffer),
            ev(1, ReleaseStage::BufferMemory),
            ev(2, ReleaseStage::Buffer),
            ev(2, ReleaseStage::BufferMemory),
            ev(3, ReleaseStage::DescriptorPool),
            ev(5, ReleaseStage::Pipeline),
            ev(5, ReleaseStage::ShaderModule),
            ev(4, ReleaseStage::DescriptorSetLayout),
            ev(4, ReleaseStage::PipelineLayout),
            ev(6, ReleaseStage::CommandPool),
            ev(7, ReleaseStage::Device),
            ev(7, ReleaseStage::Instance),
        ];
        verify_events(&events).unwrap();
        ledger_from(&events).verify_monotonic().unwrap();
    }

    #[test]
    fn test_interleaved_buffer_pairs_are_monotonic() {
        let mut events = Vec::new();
        for owner in 10..13 {
            events.push(ev(owner, ReleaseStage::Buffer));
            events.push(ev(owner, ReleaseStage::BufferMemory));
        }
        events.push(ev(20, ReleaseStage::DescriptorPool));
        events.push(ev(21, ReleaseStage::Device));
        events.push(ev(21, ReleaseStage::Instance));

        let ledger = ledger_from(&events);
        ledger.verify_monotonic().unwrap();
        assert_eq!(ledger.events().len(), 9);
    }

    #[test]
    fn test_buffer_after_descriptor_pool_breaks_global_order() {
        let ledger = ledger_from(&[
            ev(1, ReleaseStage::Buffer),
            ev(1, ReleaseStage::BufferMemory),
            ev(3, ReleaseStage::DescriptorPool),
            ev(2, ReleaseStage::Buffer),
            ev(2, ReleaseStage::BufferMemory),
        ]);
        ledger.verify().unwrap();
        assert!(matches!(
            ledger.verify_monotonic(),
            Err(ComputeError::TeardownOrderViolation { owner: 2, .. })
        ));
    }

    #[test]
    fn test_memory_before_buffer_is_caught() {
        let events = [ev(1, ReleaseStage::BufferMemory), ev(1, ReleaseStage::Buffer)];
        let err = verify_events(&events).unwrap_err();
        match err {
            ComputeError::TeardownOrderViolation { owner, earlier, later } => {
                assert_eq!(owner, 1);
                assert_eq!(earlier, ReleaseStage::Buffer);
                assert_eq!(later, ReleaseStage::BufferMemory);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ledger_from(&events).verify().is_err());
    }

    #[test]
    fn test_release_after_device_is_caught() {
        let ledger = TeardownLedger::new();
        ledger.record(9, ReleaseStage::Device);
        ledger.record(1, ReleaseStage::Buffer);
        assert!(ledger.verify().is_err());
    }

    #[test]
    fn test_independent_owners_may_interleave() {
        // A dispatch rebuilt midway: old descriptor pool goes before the buffers.
        let ledger = TeardownLedger::new();
        ledger.record(3, ReleaseStage::DescriptorPool);
        ledger.record(1, ReleaseStage::Buffer);
        ledger.record(1, ReleaseStage::BufferMemory);
        ledger.verify().unwrap();
        assert!(ledger.verify_monotonic().is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let ledger = TeardownLedger::new();
        let pairs = LEDGER_CAPACITY as u64;
        for owner in 0..pairs {
            ledger.record(owner, ReleaseStage::Buffer);
            ledger.record(owner, ReleaseStage::BufferMemory);
        }
        assert_eq!(ledger.events().len(), LEDGER_CAPACITY);
        assert_eq!(ledger.discarded(), pairs);
        ledger.verify_monotonic().unwrap();

        ledger.clear();
        assert!(ledger.events().is_empty());
    }

    #[test]
    fn test_violation_survives_discarding() {
        let ledger = TeardownLedger::new();
        ledger.record(1, ReleaseStage::BufferMemory);
        ledger.record(1, ReleaseStage::Buffer);
        ledger.clear();
        assert!(ledger.verify().is_err());
    }

    #[test]
    fn test_owner_ids_are_unique() {
        let a = next_owner_id();
        let b = next_owner_id();
        assert_ne!(a, b);
    }
}
