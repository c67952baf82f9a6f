pub mod adb;
pub mod cec;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod perf;
pub mod watchdog;

#[cfg(test)]
pub mod testutil;
