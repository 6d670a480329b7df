pub mod consensus;
pub mod kelly;
pub mod report;
pub mod score_model;
pub mod selection;
pub mod signals;
pub mod strategy;

pub use strategy::{EngineSettings, PickEngine};
