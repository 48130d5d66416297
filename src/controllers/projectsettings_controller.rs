//! Peripheral `ProjectSettings` watcher. Full RBAC reconciliation from
//! group membership is explicitly out of scope (spec.md §1); this only
//! logs changes so the rest of the operator has visibility into when a
//! namespace's settings change, without acting on them yet.

use std::{sync::Arc, time::Duration};

use futures_util::Stream;
use kube::{
    Api,
    runtime::{Controller, controller::Action, reflector::ObjectRef, watcher},
};
use tracing::debug;

use crate::{controllers::reconcile_error::ReconcileError, resources::ProjectSettings};

pub fn new(
    client: kube::Client,
) -> impl Stream<
    Item = Result<
        (ObjectRef<ProjectSettings>, Action),
        kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
    >,
> {
    let settings_api: Api<ProjectSettings> = Api::all(client);

    Controller::new(settings_api, watcher::Config::default()).run(
        reconcile,
        |_, _, _| Action::requeue(Duration::from_secs(300)),
        Arc::new(()),
    )
}

async fn reconcile(
    object: Arc<ProjectSettings>,
    _context: Arc<()>,
) -> Result<Action, ReconcileError> {
    debug!(
        namespace = ?object.metadata.namespace,
        name = ?object.metadata.name,
        groups = object.spec.groups.len(),
        "observed ProjectSettings change"
    );
    Ok(Action::requeue(Duration::from_secs(300)))
}
