mod handshake;
mod launch;

pub use handshake::handshake_command;
pub use launch::launch_command;
