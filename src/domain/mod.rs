pub mod models;
pub mod player;
pub mod settings;
