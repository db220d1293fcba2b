//! `fleetsh` runs one command across a fleet of hosts through persistent SSH
//! shells and groups the answers by subnet.

pub mod fleet;
