//! Live-migration channel: wire protocol, dirty-page tracking, and the
//! control-channel dispatcher.

pub mod channel;
pub mod dirty;
pub mod wire;

pub use channel::{MigrationChannel, MigrationOps};
pub use dirty::DirtyPageMap;
pub use wire::{Command, Completion, Opcode, RawCommand, StatusCode};
