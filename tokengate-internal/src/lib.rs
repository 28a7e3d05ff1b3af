pub mod admission; // per-subject concurrency and rate gating
pub mod cache; // fast-path cache client
pub mod config;
pub mod credential; // one-time access-credential exchange
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod observability; // utilities for observability (logs, etc.)
pub mod provider; // upstream completion provider client
pub mod quota; // token quota ledger
pub mod reconcile; // periodic usage reconciliation
pub mod relay; // streaming completion relay
pub mod session; // session tokens and per-request auth
pub mod store; // durable account/usage store client

#[cfg(test)]
pub(crate) mod test_helpers;
