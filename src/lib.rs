//! Command line inspection of memcached servers.
//!
//! Lists, dumps and searches the items stored on one or more servers, and runs
//! direct get/set/incr/decr/delete/flush/stats commands against each of them in
//! turn. Protocol access sits behind the [`client::Connector`] and
//! [`inspector::BulkInspector`] traits so the dispatcher can be driven by test
//! doubles as well as real servers.

pub mod client;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod inspector;
pub mod item;
pub mod output;
pub mod servers;
