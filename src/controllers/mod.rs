pub mod agentic_session_controller;
pub mod namespace_controller;
pub mod projectsettings_controller;
pub mod reconcile_error;
