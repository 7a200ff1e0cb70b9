//! Delivery side of courier: channel senders, the worker pool that drives
//! them, the intake consumer and the websocket push gateway.

pub mod channels;
pub mod gateway;
pub mod intake;
pub mod template;
pub mod worker;
