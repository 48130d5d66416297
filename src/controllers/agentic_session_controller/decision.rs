//! Pure decision-tree helpers for spec.md §4.2 steps 2-8: bootstrap,
//! start/stop intent, the stopping handler, the temp-content short-circuit
//! and the running-drift check. Kept free of any `kube`/IO dependency so
//! the reconciliation policy can be exercised without a cluster.

use std::collections::BTreeMap;

use crate::labels::annotation;
use crate::resources::Phase;

/// What step 2 (bootstrap) decides: a brand-new session (no phase yet)
/// always starts out `Pending` with `observedGeneration` left unset so the
/// very next tick picks up step 3 onward.
pub fn needs_bootstrap(phase: Option<&Phase>) -> bool {
    phase.is_none()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
    None,
}

/// Reads the `desired-phase` annotation (step 3). Any value other than
/// `Running`/`Stopped` is treated as absent rather than an error, since the
/// annotation is an advisory hint other components may set loosely.
pub fn read_intent(annotations: Option<&BTreeMap<String, String>>) -> Intent {
    match annotations.and_then(|a| a.get(annotation::DESIRED_PHASE)).map(String::as_str) {
        Some("Running") => Intent::Start,
        Some("Stopped") => Intent::Stop,
        _ => Intent::None,
    }
}

/// Step 3: does a `Start` intent actually require action? Only a session
/// resting in a terminal phase (`Failed`/`Completed`/`Stopped`) needs the
/// restart reset; `Pending`/`Creating`/`Running`/`Stopping` either already
/// own an in-flight creation or have nothing to restart, and re-running the
/// reset on every tick would stomp `startTime` and never let the session
/// progress past this step.
pub fn should_act_on_start_intent(current: Option<&Phase>) -> bool {
    current.map(Phase::is_terminal).unwrap_or(false)
}

/// Step 3: does a `Stop` intent require action? A session that is already
/// terminal or already `Stopping` has nothing left to do.
pub fn should_act_on_stop_intent(current: Option<&Phase>) -> bool {
    !matches!(
        current,
        Some(Phase::Stopped) | Some(Phase::Stopping) | Some(Phase::Failed)
    )
}

/// Step 4: the stopping handler is done once the job it is waiting on is
/// gone (the caller supplies that fact; this only encodes the phase
/// transition once it's true).
pub fn stopping_is_complete(job_still_exists: bool) -> bool {
    !job_still_exists
}

/// Step 5: temp-content reconciliation (create/delete) applies to `Pending`
/// and to every terminal phase; `Running`/`Creating`/`Stopping` sessions own
/// the workspace themselves and never get a temp-content pod.
pub fn temp_content_phase_applies(current: Option<&Phase>) -> bool {
    matches!(
        current,
        Some(Phase::Pending) | Some(Phase::Stopped) | Some(Phase::Completed) | Some(Phase::Failed)
    )
}

/// Step 5: once temp-content reconciliation has run, every phase except
/// `Pending` stops here for the tick — a terminal session has nothing left
/// to reconcile until a restart (`desired-phase=Running`) is observed.
pub fn temp_content_short_circuits_tick(current: Option<&Phase>) -> bool {
    temp_content_phase_applies(current) && !matches!(current, Some(Phase::Pending))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationAction {
    /// A Job is already running for this session; just resume the monitor.
    ResumeMonitoring,
    /// No job exists yet (fresh `Pending`, or `Creating` whose Job vanished).
    CreateJob,
}

/// Steps 6-7: decide whether the `Pending`/`Creating` session needs a job
/// created. A `Creating` session whose Job still exists only needs its
/// monitor resumed; everything else (fresh `Pending`, or `Creating` with no
/// surviving Job) goes through job creation.
pub fn decide_creation_action(current: Option<&Phase>, job_exists: bool) -> CreationAction {
    if matches!(current, Some(Phase::Creating)) && job_exists {
        CreationAction::ResumeMonitoring
    } else {
        CreationAction::CreateJob
    }
}

/// Step 8: a `Running` session only runs drift reconciliation; it never
/// re-enters job creation. This just documents the guard so the caller
/// doesn't need to duplicate the match arms inline.
pub fn is_running(current: Option<&Phase>) -> bool {
    matches!(current, Some(Phase::Running))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_triggers_only_when_phase_absent() {
        assert!(needs_bootstrap(None));
        assert!(!needs_bootstrap(Some(&Phase::Pending)));
    }

    #[test]
    fn intent_parses_known_values_only() {
        let mut annotations = BTreeMap::new();
        annotations.insert(annotation::DESIRED_PHASE.to_string(), "Running".to_string());
        assert_eq!(read_intent(Some(&annotations)), Intent::Start);

        annotations.insert(annotation::DESIRED_PHASE.to_string(), "Stopped".to_string());
        assert_eq!(read_intent(Some(&annotations)), Intent::Stop);

        annotations.insert(annotation::DESIRED_PHASE.to_string(), "garbage".to_string());
        assert_eq!(read_intent(Some(&annotations)), Intent::None);

        assert_eq!(read_intent(None), Intent::None);
    }

    #[test]
    fn start_intent_only_acts_from_a_terminal_phase() {
        assert!(!should_act_on_start_intent(Some(&Phase::Running)));
        assert!(!should_act_on_start_intent(Some(&Phase::Creating)));
        assert!(!should_act_on_start_intent(Some(&Phase::Pending)));
        assert!(!should_act_on_start_intent(Some(&Phase::Stopping)));
        assert!(!should_act_on_start_intent(None));
        assert!(should_act_on_start_intent(Some(&Phase::Stopped)));
        assert!(should_act_on_start_intent(Some(&Phase::Completed)));
        assert!(should_act_on_start_intent(Some(&Phase::Failed)));
    }

    #[test]
    fn stop_intent_is_a_noop_once_terminal_or_stopping() {
        assert!(!should_act_on_stop_intent(Some(&Phase::Stopped)));
        assert!(!should_act_on_stop_intent(Some(&Phase::Stopping)));
        assert!(!should_act_on_stop_intent(Some(&Phase::Failed)));
        assert!(should_act_on_stop_intent(Some(&Phase::Running)));
    }

    #[test]
    fn stopping_completes_once_job_gone() {
        assert!(!stopping_is_complete(true));
        assert!(stopping_is_complete(false));
    }

    #[test]
    fn temp_content_applies_to_pending_and_terminal_phases_only() {
        assert!(temp_content_phase_applies(Some(&Phase::Pending)));
        assert!(temp_content_phase_applies(Some(&Phase::Stopped)));
        assert!(temp_content_phase_applies(Some(&Phase::Completed)));
        assert!(temp_content_phase_applies(Some(&Phase::Failed)));
        assert!(!temp_content_phase_applies(Some(&Phase::Running)));
        assert!(!temp_content_phase_applies(Some(&Phase::Creating)));
    }

    #[test]
    fn temp_content_short_circuits_every_applicable_phase_except_pending() {
        assert!(!temp_content_short_circuits_tick(Some(&Phase::Pending)));
        assert!(temp_content_short_circuits_tick(Some(&Phase::Stopped)));
        assert!(temp_content_short_circuits_tick(Some(&Phase::Completed)));
        assert!(temp_content_short_circuits_tick(Some(&Phase::Failed)));
        assert!(!temp_content_short_circuits_tick(Some(&Phase::Running)));
    }

    #[test]
    fn creation_action_resumes_only_when_creating_with_a_surviving_job() {
        assert_eq!(
            decide_creation_action(Some(&Phase::Creating), true),
            CreationAction::ResumeMonitoring
        );
        assert_eq!(
            decide_creation_action(Some(&Phase::Creating), false),
            CreationAction::CreateJob
        );
        assert_eq!(
            decide_creation_action(Some(&Phase::Pending), false),
            CreationAction::CreateJob
        );
    }
}
