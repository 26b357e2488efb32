//! Release strategy: the message lifecycle rules.
//!
//! A [`ReleaseStrategy`] is a pure decision function. Given the current
//! contents of a group and one incoming fragment, it returns the next
//! contents of the group and the merged results to emit. The aggregator
//! persists the new group and emits the results inside the group's critical
//! section; the strategy itself never does I/O.

use crate::correlation::CorrelationId;
use crate::fragment::{EventFragment, FragmentKind, MergedResult};

/// Outcome of correlating one incoming fragment against a group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Correlation {
    /// Contents of the group after the fragment was applied, oldest first.
    pub group: Vec<EventFragment>,
    /// Results to emit, in release order.
    pub released: Vec<MergedResult>,
}

/// Decides when fragments match and what the match produces.
///
/// # Contract
///
/// - [`correlate`](ReleaseStrategy::correlate) must be deterministic and
///   free of side effects: it may be evaluated again after a rollback.
/// - Every fragment consumed by a release must be absent from the returned
///   group.
pub trait ReleaseStrategy: Send + Sync + 'static {
    /// Apply `incoming` to `group` (all fragments share `correlation_id`).
    fn correlate(
        &self,
        correlation_id: &CorrelationId,
        group: Vec<EventFragment>,
        incoming: EventFragment,
    ) -> Correlation;
}

/// The BPMN message lifecycle.
///
/// - A start-message definition is durable: it stays in the group and
///   releases every sent message, including ones buffered before it was
///   deployed.
/// - A waiting catch event is matched with the oldest buffered send and
///   stays in the group until a received event retires it.
/// - Sends buffer until something can consume them; buffered sends are
///   served oldest first.
/// - A cancelled subscription drops the whole group.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageLifecycle;

impl ReleaseStrategy for MessageLifecycle {
    fn correlate(
        &self,
        correlation_id: &CorrelationId,
        mut group: Vec<EventFragment>,
        incoming: EventFragment,
    ) -> Correlation {
        let mut released = Vec::new();
        match incoming.kind {
            FragmentKind::StartDeployed => {
                // Redeploying a definition replaces the previous one.
                group.retain(|f| f.kind != FragmentKind::StartDeployed);
                let (sent, mut rest): (Vec<_>, Vec<_>) =
                    group.into_iter().partition(|f| f.kind == FragmentKind::Sent);
                released.extend(
                    sent.iter()
                        .map(|s| MergedResult::merge(correlation_id.clone(), &incoming, s)),
                );
                rest.push(incoming);
                group = rest;
            }
            FragmentKind::Sent => {
                group.push(incoming);
                if let Some(start) = first_of(&group, FragmentKind::StartDeployed).cloned() {
                    // Nothing stays buffered while a definition exists, so
                    // the only pending send is the one that just arrived.
                    while let Some(pos) = position_of(&group, FragmentKind::Sent) {
                        let sent = group.remove(pos);
                        released.push(MergedResult::merge(correlation_id.clone(), &start, &sent));
                    }
                } else if let Some(waiting) = first_of(&group, FragmentKind::Waiting).cloned()
                    && let Some(pos) = position_of(&group, FragmentKind::Sent)
                {
                    let sent = group.remove(pos);
                    released.push(MergedResult::merge(correlation_id.clone(), &waiting, &sent));
                }
            }
            FragmentKind::Waiting => {
                if let Some(pos) = position_of(&group, FragmentKind::Sent) {
                    let sent = group.remove(pos);
                    released.push(MergedResult::merge(correlation_id.clone(), &incoming, &sent));
                }
                group.push(incoming);
            }
            FragmentKind::Received => {
                if let Some(pos) = position_of(&group, FragmentKind::Waiting) {
                    group.remove(pos);
                }
            }
            FragmentKind::SubscriptionCancelled => group.clear(),
        }
        Correlation { group, released }
    }
}

fn position_of(group: &[EventFragment], kind: FragmentKind) -> Option<usize> {
    group.iter().position(|f| f.kind == kind)
}

fn first_of(group: &[EventFragment], kind: FragmentKind) -> Option<&EventFragment> {
    group.iter().find(|f| f.kind == kind)
}
