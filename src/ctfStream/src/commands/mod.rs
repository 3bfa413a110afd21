pub mod run;
pub mod status;
pub mod validate;
pub mod mics;
pub mod recalc;
