pub mod logging;
pub mod config;
pub mod metadata;
pub mod paths;
pub mod sets;
pub mod quality;
pub mod engine;
pub mod runner;
pub mod results;
pub mod estimate;
pub mod aggregate;
pub mod stream;
pub mod pipeline;
