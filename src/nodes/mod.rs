//! Abstractions for the node types, currently the [`MonitoringNode`][monitoring::MonitoringNode].

pub mod monitoring;
