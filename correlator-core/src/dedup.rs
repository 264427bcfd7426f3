use crate::alerts::{Alert, AlertStatus};
use crate::filter::FilterDecision;
use crate::store::Incident;
use uuid::Uuid;

/// What the pipeline should do with one alert, given the filter decision and
/// the currently-open incident for its fingerprint (if any).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DedupOutcome {
    CreateNew,
    AlreadyOpen { incident_id: Uuid },
    ResolveExisting { incident_id: Uuid },
    NoOp,
}

/// Pure decision. The caller holds the per-fingerprint lock around the
/// lookup that produced `open_incident` and the write that follows, so the
/// check-then-act sequence is a single logical unit.
pub fn decide(
    alert: &Alert,
    decision: FilterDecision,
    open_incident: Option<&Incident>,
) -> DedupOutcome {
    match (alert.status, open_incident) {
        // Re-firing the same condition must not open a second incident,
        // whatever the current rule set says about it.
        (AlertStatus::Firing, Some(incident)) => DedupOutcome::AlreadyOpen {
            incident_id: incident.id,
        },
        (AlertStatus::Firing, None) => match decision {
            FilterDecision::Included => DedupOutcome::CreateNew,
            FilterDecision::Excluded => DedupOutcome::NoOp,
        },
        (AlertStatus::Resolved, Some(incident)) => {
            // A resolution signal from before this incident opened belongs
            // to an earlier firing; it must not close the current one.
            if alert.starts_at < incident.created_at {
                DedupOutcome::NoOp
            } else {
                DedupOutcome::ResolveExisting {
                    incident_id: incident.id,
                }
            }
        }
        (AlertStatus::Resolved, None) => DedupOutcome::NoOp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::open_incident;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn alert(status: AlertStatus) -> Alert {
        Alert {
            fingerprint: "fp".into(),
            status,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
        }
    }

    #[test]
    fn firing_included_without_open_incident_creates() {
        let outcome = decide(&alert(AlertStatus::Firing), FilterDecision::Included, None);
        assert_eq!(outcome, DedupOutcome::CreateNew);
    }

    #[test]
    fn firing_excluded_is_noop() {
        let outcome = decide(&alert(AlertStatus::Firing), FilterDecision::Excluded, None);
        assert_eq!(outcome, DedupOutcome::NoOp);
    }

    #[test]
    fn refiring_with_open_incident_is_already_open() {
        let incident = open_incident("fp");
        let outcome = decide(
            &alert(AlertStatus::Firing),
            FilterDecision::Included,
            Some(&incident),
        );
        assert_eq!(
            outcome,
            DedupOutcome::AlreadyOpen {
                incident_id: incident.id
            }
        );
    }

    #[test]
    fn open_incident_wins_even_when_rules_now_exclude() {
        let incident = open_incident("fp");
        let outcome = decide(
            &alert(AlertStatus::Firing),
            FilterDecision::Excluded,
            Some(&incident),
        );
        assert!(matches!(outcome, DedupOutcome::AlreadyOpen { .. }));
    }

    #[test]
    fn resolved_with_open_incident_resolves() {
        let mut incident = open_incident("fp");
        incident.created_at = Utc::now() - Duration::minutes(10);
        let outcome = decide(
            &alert(AlertStatus::Resolved),
            FilterDecision::Excluded,
            Some(&incident),
        );
        assert_eq!(
            outcome,
            DedupOutcome::ResolveExisting {
                incident_id: incident.id
            }
        );
    }

    #[test]
    fn stale_resolution_is_ignored() {
        let incident = open_incident("fp");
        let mut stale = alert(AlertStatus::Resolved);
        stale.starts_at = incident.created_at - Duration::minutes(30);
        let outcome = decide(&stale, FilterDecision::Excluded, Some(&incident));
        assert_eq!(outcome, DedupOutcome::NoOp);
    }

    #[test]
    fn resolution_without_open_incident_is_noop() {
        let outcome = decide(&alert(AlertStatus::Resolved), FilterDecision::Included, None);
        assert_eq!(outcome, DedupOutcome::NoOp);
    }
}
