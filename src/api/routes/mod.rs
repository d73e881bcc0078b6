pub mod health;
pub mod targets;
pub mod tiles;
