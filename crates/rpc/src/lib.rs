//! The RPC fan-out worker and block header validation.
//!
//! A single long-lived worker owns the wrapped Bitcoin node client, the
//! contract executor capability and the header validator, serving
//! cross-cutting `RpcMethod` envelopes from every other role. A 1 s poll
//! loop is the sole writer of the global consensus height.

pub mod client;
pub mod headers;
mod normalize;
pub mod worker;

pub use client::{BitcoinRpcClient, ContractExecutor, RpcClientError};
pub use headers::BlockHeaderValidator;
pub use normalize::normalize_call_result;
pub use worker::{RpcWorker, RpcWorkerConfig};
