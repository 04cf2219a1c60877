//! Line-oriented header block plus raw body, as it travels over the sockets:
//!
//! ```text
//! key1:value1\n
//! key2:value2\n
//! body-len:<n>\n
//! \n
//! <n bytes of body>
//! ```
//!
//! There is no delimiter after the body, the next message's header starts right away.

pub mod assembler;
pub mod message;

pub use assembler::MessageAssembler;
pub use message::{Message, BODY_LEN};
