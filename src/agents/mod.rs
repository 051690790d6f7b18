pub mod analysis;
pub mod config_storage;
pub mod deploy_execution;
pub mod grouper;
pub mod notifier;
pub mod update_planner;
pub mod version_resolver;
