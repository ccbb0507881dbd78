// Testing Tools Library
//
// Development utilities for exercising a running reading sync fabric.
// Currently includes:
// - sync-test-client: scenario runner over real TCP and UDP sockets

pub mod output;
pub mod scenarios;
pub mod tcp_client;
pub mod udp_client;
