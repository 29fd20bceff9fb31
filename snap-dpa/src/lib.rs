pub mod error;
pub mod mailbox;
pub mod offload;
pub mod p2p;
pub mod process;

pub use error::{DpaError, DpaResult};
pub use mailbox::Mailbox;
pub use offload::{DuarMapping, OffloadedVirtq, VirtqCreateParams};
pub use p2p::{CreditEndpoint, MsgType, P2pMsg};
pub use process::{DpaProcess, DpaTcb, DpaThread, DpaThreadAttr};
