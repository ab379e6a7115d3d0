//! Chat transport seam. A concrete transport (the chat network client) lives
//! outside this crate and plugs in through [`Transport`] and [`Session`].

pub mod traits;

pub use traits::{Connected, EventStream, Session, SessionDyn, Transport, TransportDyn};
