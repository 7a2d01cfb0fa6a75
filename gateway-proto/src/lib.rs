//! Wire types shared by the gateway, its worker peers, and remote clients.
//!
//! Everything here is pure data plus (de)serialization and signing helpers —
//! no sockets, no tokio. The gateway crate owns all I/O; this crate only
//! defines the shapes that cross a wire and the canonical way to sign them.

pub mod event;
pub mod filter;
pub mod frame;
pub mod registration;
pub mod signing;
pub mod token;

pub use event::NostrEvent;
pub use filter::Filter;
pub use frame::{ClientFrame, FrameError, ServerFrame};
pub use registration::{RegistrationPayload, RelayMetadata, Signed};
pub use token::{TokenCodecError, TokenEnvelope, TokenPayload};
