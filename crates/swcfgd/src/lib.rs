//! Switch configuration deployment daemon
//!
//! This crate hosts the concurrent core of swcfgd: a single [`Reconciler`]
//! loop, one [`DeviceWorker`] per deployable device fed through a latest-wins
//! [`mailbox`], and two action workers that persist rendered configurations
//! and purge old artifacts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  records  ┌──────────────┐  put   ┌──────────────┐
//! │ RecordSource │──────────▶│  Reconciler  │───────▶│ DeviceWorker │──▶ DeviceDriver
//! └──────────────┘           │              │        │  (per device)│
//!                            │              │ batch  ├──────────────┤
//!                            │              │───────▶│    Writer    │──▶ output_dir
//!                            └──────────────┘        ├──────────────┤
//!                                                    │   Cleaner    │
//!                                                    └──────────────┘
//! ```
//!
//! Every unit observes the process wide
//! [`CancellationSignal`](swcfg_common::CancellationSignal); shutdown is
//! sequenced by [`shutdown::Units::drain`].

pub mod action;
pub mod error;
pub mod mailbox;
pub mod reconciler;
pub mod shutdown;
pub mod source;
pub mod worker;

pub use error::{FatalError, FatalResult, SourceError};
pub use mailbox::{mailbox, Mailbox, MailboxSender, Received};
pub use reconciler::{Reconciler, ReconcilerSettings, RunSummary};
pub use shutdown::{arm_watchdog, Unit, UnitOutcome, Units};
pub use source::{JsonFileSource, RecordSource};
pub use worker::{DeviceWorker, WorkerExit, WorkerSettings};
