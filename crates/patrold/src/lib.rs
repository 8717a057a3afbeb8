//! patrold — patrol monitor daemon library.
//!
//! The binary wires these modules together; `patrolctl` reuses [`config`]
//! so both tools resolve settings the same way.

pub mod annotate;
pub mod batch;
pub mod config;
pub mod dbus_interface;
pub mod engine;
pub mod interactive;
pub mod pipeline;
pub mod recorder;
pub mod roster;
pub mod status;
#[cfg(test)]
mod test_support;
