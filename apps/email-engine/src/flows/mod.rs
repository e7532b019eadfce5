// Flows: multi-step drip campaigns.
// Definitions are authored through `definitions`; `orchestrator` turns triggers and
// cancel events into ledger rows and bulk cancellations; `stats` reads them back.

pub mod definitions;
pub mod handlers;
pub mod orchestrator;
pub mod stats;
