//! Script/Scene/Room engine: routes one inbound request to exactly one
//! room's response while advancing per-player narrative state.

mod room;
mod scene;
mod script;

pub use room::{Room, RoomContext};
pub use scene::{Choices, Scene};
pub use script::{SceneAndNextState, Script};
