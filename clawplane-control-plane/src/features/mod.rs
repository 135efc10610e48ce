pub mod instance_management;
pub mod terminal_bridge;
