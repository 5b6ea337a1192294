pub mod attendance;
pub mod config;
pub mod db;
pub mod exceptions;
pub mod location;
pub mod model;
pub mod remote;
pub mod roster;
pub mod session;
pub mod sync;
