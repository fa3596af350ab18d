/// Message bus transport: wire codec and connection lifecycle
pub mod client;
pub mod frame;

pub use client::{BusClient, BusCommand, BusConfig, BusEvent, ConnectionStatus};
pub use frame::{Frame, FrameCommand};
