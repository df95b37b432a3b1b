pub mod mailbox;

pub use mailbox::{FrameMailbox, MailboxStats};
