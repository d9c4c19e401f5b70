pub mod http;
pub mod tui;
pub mod ws;

pub use http::{ConsoleClient, CreatePassiveRequest, Page};
pub use tui::{attach, ExitReason, RawTerminal};
pub use ws::WsConnector;
