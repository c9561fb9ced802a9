//! Revision discovery. Each release owns a family of controllers named
//! `{prefix}-{revision}`; the next revision is always one past the highest
//! seen, so numbering never reuses a slot even after cleanup.

use rollout_models::ControllerKind;

use crate::convention::{self, RELEASE_LABEL_KEY, label_value};
use crate::errors::ClusterError;
use crate::gateway::{ClusterGateway, Controller};

/// One controller of the release family that still has desired replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveRevision {
    pub name: String,
    pub revision: i32,
    pub replicas: i32,
}

/// Lists the controllers belonging to a release, skipping objects owned by
/// another controller (a Deployment's ReplicaSets carry the release labels
/// too, but they are not revisions of their own).
pub async fn list_release_controllers(
    gateway: &dyn ClusterGateway,
    ns: &str,
    kind: ControllerKind,
    release_id: &str,
) -> Result<Vec<Controller>, ClusterError> {
    let selector = format!("{}={}", RELEASE_LABEL_KEY, label_value(release_id));
    let controllers = gateway.list_controllers(ns, kind, &selector).await?;
    Ok(controllers
        .into_iter()
        .filter(|c| {
            c.metadata()
                .owner_references
                .as_ref()
                .map(|refs| refs.is_empty())
                .unwrap_or(true)
        })
        .collect())
}

/// Revision number of a controller. The stamped label wins; the name suffix
/// is the fallback for objects labeled by an older toolchain.
pub fn revision_of(controller: &Controller) -> Option<i32> {
    controller
        .revision_label()
        .or_else(|| convention::revision_from_controller_name(controller.name()))
}

/// Next revision to deploy. The first rollout of a release is revision 0.
pub fn next_revision(controllers: &[Controller]) -> i32 {
    controllers
        .iter()
        .filter_map(revision_of)
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}

/// Revisions still scaled above zero, oldest first.
pub fn active_revisions(controllers: &[Controller]) -> Vec<ActiveRevision> {
    let mut active: Vec<ActiveRevision> = controllers
        .iter()
        .filter(|c| c.replicas() > 0)
        .filter_map(|c| {
            revision_of(c).map(|revision| ActiveRevision {
                name: c.name().to_string(),
                revision,
                replicas: c.replicas(),
            })
        })
        .collect();
    active.sort_by_key(|a| a.revision);
    active
}

/// Total desired replicas across the active revisions. The fixed-count
/// policy for a new revision starts from this when older revisions exist,
/// so a rollout does not double capacity mid-shift.
pub fn total_active_replicas(active: &[ActiveRevision]) -> i32 {
    active.iter().map(|a| a.replicas).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convention::REVISION_LABEL_KEY;

    fn deployment(name: &str, revision: Option<i32>, replicas: i32) -> Controller {
        let mut c = Controller::Deployment(Default::default());
        c.set_name(name);
        c.set_replicas(replicas);
        if let Some(rev) = revision {
            c.metadata_mut()
                .labels
                .get_or_insert_with(Default::default)
                .insert(REVISION_LABEL_KEY.to_string(), rev.to_string());
        }
        c
    }

    #[test]
    fn first_rollout_is_revision_zero() {
        assert_eq!(next_revision(&[]), 0);
    }

    #[test]
    fn next_revision_is_one_past_the_highest() {
        let family = vec![
            deployment("web-0", Some(0), 0),
            deployment("web-4", Some(4), 2),
            deployment("web-2", Some(2), 1),
        ];
        assert_eq!(next_revision(&family), 5);
    }

    #[test]
    fn name_suffix_backs_up_missing_label() {
        let family = vec![deployment("web-7", None, 1)];
        assert_eq!(next_revision(&family), 8);
    }

    #[test]
    fn active_revisions_skip_scaled_down_and_sort_oldest_first() {
        let family = vec![
            deployment("web-3", Some(3), 2),
            deployment("web-1", Some(1), 0),
            deployment("web-2", Some(2), 1),
        ];
        let active = active_revisions(&family);
        assert_eq!(
            active.iter().map(|a| a.revision).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(total_active_replicas(&active), 3);
    }
}
