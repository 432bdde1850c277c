pub mod relay;
pub mod state;

pub use relay::Relay;
pub use state::{ConnectionId, EmptyRoomPolicy, Room, RoomRegistry};
