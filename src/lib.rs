//! Leader-election supervisor.
//!
//! Exactly one participant in a cohort of identical peers is leader at any
//! time, with an external coordination service (etcd) as the source of
//! truth. Candidacy changes are translated into lifecycle actions: a start
//! action when this process becomes leader, a stop action when it stops
//! being leader, and an error action when an action fails, after which the
//! process re-enters candidacy.
//!
//! The heart of the crate is the state-reconciliation engine in [`elector`]:
//! a single-consumer state machine that keeps the locally observable role
//! consistent with the actions that have actually succeeded. Backends and
//! actions plug in through the traits in [`backends`] and [`actions`].

pub mod actions;
pub mod backends;
mod builder;
pub mod channel;
pub mod elector;

pub use actions::{Action, ActionError, CommandAction, TimeoutAction};
pub use backends::{Backend, BackendError, ConsoleBackend, EtcdBackend, EtcdConfig};
pub use builder::ElectorBuilder;
pub use elector::{Elector, ElectorError, Event, Role};
