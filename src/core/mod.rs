pub mod assistant;
pub mod controller;
pub mod domain;
pub mod editor;
pub mod output;
pub mod relay;
pub mod session;
pub mod traits;
