//! Rendezvous primitives over the KV tree.
//!
//! [`Waiter`] lets a coordinator watch many nodes publish state under a
//! prefix and fire barrier notifications; [`Customer`] is the other side,
//! publishing one node's state under an ephemeral session-bound key.

pub mod customer;
pub mod waiter;

pub use customer::Customer;
pub use waiter::{ReadyPredicate, WaitNode, WaitNodeUpdate, Waiter, WaiterEvents};
