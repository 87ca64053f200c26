pub mod broker;
pub mod dispatcher;
pub mod generator;
pub mod memory;
pub mod queue;
pub mod status;
pub mod worker;
