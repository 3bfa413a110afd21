// not every test binary uses every helper
#![allow(dead_code)]

pub mod cmd;
pub mod project;
pub mod runner;
