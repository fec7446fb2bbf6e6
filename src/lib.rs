pub mod config;
pub mod dataset;
pub mod export;
pub mod inria;
pub mod model;
pub mod train;
pub mod tud;
