pub mod dialer;
pub mod registry;

pub use dialer::{ActiveLink, Dialer, TcpDialer};
pub use registry::{PassiveRegistry, PassiveUpdate};
