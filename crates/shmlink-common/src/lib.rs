pub mod channel;
pub mod child;
pub mod parent;
pub mod peer;
pub mod protocol;
pub mod region;
pub mod signal;


pub use channel::{ReceiverChannel, SenderChannel};
pub use child::ChildEndpoint;
pub use parent::ParentEndpoint;
pub use protocol::{HandleSlots, LinkError};
