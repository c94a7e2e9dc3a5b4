//! Bridge to a hosted interpreter process over a line protocol.

mod error;
mod events;
mod instance;
mod process;
mod script;
mod state;
mod stream;

pub use error::*;
pub use events::*;
pub use instance::*;
pub use process::*;
pub use script::*;
pub use state::*;
pub use stream::*;
