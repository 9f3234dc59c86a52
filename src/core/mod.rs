pub mod events;
pub mod logging;
pub mod settings;
