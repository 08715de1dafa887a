// =============================================================================
// Exit management — per-position state machines and their manager loop
// =============================================================================

pub mod manager;
pub mod rule;

pub use manager::ExitManager;
pub use rule::{ExitAction, ExitContext, ExitRule, ExitState};
