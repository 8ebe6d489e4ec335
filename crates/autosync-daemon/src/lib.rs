//! Autosync Daemon - Callback listener, NAT traversal and sync scheduler
//!
//! Keeps a budget in step with the bank by syncing on a timer and, when the
//! host can be reached from the internet, on every bank notification.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SyncScheduler                           │
//! │  populate → sync if due → register callback → wait / sleep   │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────────┐  ┌───────────────────────────┐
//! │      CallbackRegistrar        │  │     CallbackListener      │
//! │  resolver → binder → mapper   │  │  accept → parse → 200 OK  │
//! │  → bank add/remove callback   │  │  → IpValidator            │
//! └───────────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! Everything runs on one task of a current-thread runtime; blocking UPnP
//! and SMTP calls go to the blocking pool.

pub mod alert;
pub mod binder;
pub mod collaborators;
pub mod error;
pub mod listener;
pub mod portmap;
pub mod registrar;
pub mod resolver;
pub mod scheduler;
pub mod validator;

pub use alert::{AlertError, Alerter, SmtpAlerter};
pub use binder::{BindError, BoundSocket, PortBinder};
pub use collaborators::{
    CallbackApi, CollaboratorError, CommandCallbacks, CommandSync, CommandSyncFactory, SyncJob,
    SyncJobFactory,
};
pub use error::{error_chain, DaemonError, IterationOutcome};
pub use listener::{CallbackListener, CallbackSignal};
pub use portmap::{IgdGateway, NatGateway, PortMapError, PortMapper, PortMapping};
pub use registrar::{CallbackRegistrar, CallbackRegistration};
pub use resolver::{NetworkEnvironmentResolver, NetworkProbe, Reachability, ResolveError, SystemProbe};
pub use scheduler::SyncScheduler;
pub use validator::IpValidator;
