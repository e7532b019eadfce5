// Dispatch: outbound provider, retry policy and the polling worker.
// The worker is the only component that sends mail.

pub mod provider;
pub mod retry;
pub mod worker;
