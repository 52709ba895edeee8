pub mod reconciliation_actor;
