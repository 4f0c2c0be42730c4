pub mod assembler;
pub mod cli;
pub mod config;
pub mod cpmfs;
pub mod driver;
pub mod error;
pub mod format;
pub mod resolver;
pub mod shuffle;
pub mod toolchain;

pub use driver::run;
