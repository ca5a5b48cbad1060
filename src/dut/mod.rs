// Module: DUT
// The TCP simulator side: device model, fault injector, server loop.

pub mod device;
pub mod faults;
pub mod server;
