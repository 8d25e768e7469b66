pub mod advisor;
pub mod generator;
pub mod indicators;
