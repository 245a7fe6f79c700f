//! Autonomous irrigation controller: soil-moisture telemetry in, relay
//! commands and JSONL event logs out.

pub mod clock;
pub mod config;
pub mod controller;
pub mod decision;
pub mod digest;
pub mod eventlog;
pub mod http;
pub mod mqtt;
pub mod offtimer;
pub mod relay;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod web;
