pub mod config;
pub mod slot;
pub mod types;

pub use config::NodeConfig;
pub use slot::{SLOTS, crc16, key_slot, slot_in};
pub use types::*;
