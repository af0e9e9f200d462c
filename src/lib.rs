pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod paths;
pub mod secrets;
pub mod template;
#[cfg(test)]
pub mod test_support;
pub mod vault;
