pub mod apps;
pub mod reset;
pub mod run;
pub mod setup;
pub mod utils;
