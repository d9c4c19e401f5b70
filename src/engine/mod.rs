pub mod manager;
pub mod reconnect;
pub mod sessions;
pub mod terminal;
pub mod transport;
pub mod variants;

pub use manager::{EngineConfig, ShellEngine};
pub use reconnect::{Affordance, ConfirmedReconnect, ReconnectPrompt};
pub use sessions::{Dispatch, SessionTable};
pub use terminal::{TerminalEvent, TerminalPort};
pub use transport::{ConnectionState, Connector, TransportEvent, TransportLink};
pub use variants::{PickerState, VariantPicker};
