//! Core XA protocol types for the xabridge transaction manager.
//!
//! This crate holds the pieces shared between a transaction coordinator and
//! the resource adapters it drives: the error taxonomy, the XA flag and
//! outcome vocabulary, the [`XaResource`] capability trait, and the xid value
//! types with their wire codec.
//!
//! The coordinator itself lives in the `xabridge-tm` crate.

#![warn(missing_docs)]

pub mod error;
pub mod xa;
pub mod xid;

pub use error::{Result, TxError};
pub use xa::{RollbackReason, Vote, XaError, XaResource, XaResult};
pub use xid::{BranchXid, GlobalXid, FORMAT_ID};
