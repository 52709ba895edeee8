pub mod decision;
pub mod plan_validator;
pub mod position_sizer;
pub mod position_tracker;
pub mod reconciliation;
pub mod settlement;
