pub mod bundler;
pub mod config;
pub mod deployment;
pub mod error;
pub mod events;
pub mod notify;
pub mod query;
pub mod queue;
pub mod reconcile;
pub mod repository;
pub mod rpc;
pub mod scanner;
pub mod scheduler;
pub mod sync;
pub mod userop;

#[cfg(test)]
mod testing;
