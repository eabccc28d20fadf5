// ABOUTME: Library side of the hatchery binary: logging setup, the agent runner process and volume reports
// ABOUTME: Kept out of the binary so the command behavior can be tested directly

pub mod logging;
pub mod run;
pub mod shutdown;
pub mod volumes;
