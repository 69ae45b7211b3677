//! Query broker: authenticates clients, consults the risk accountant for
//! admission, and runs differentially private processors over the data
//! store.

pub mod config;
pub mod frontend;
pub mod metadata;
pub mod risk;
pub mod selection;
pub mod server;
