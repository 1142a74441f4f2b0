pub mod barrier;
pub mod transfer_command;
