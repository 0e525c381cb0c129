pub mod common;
pub mod flasher;
pub mod port;
pub mod protocol;
pub mod reset;
