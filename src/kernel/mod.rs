//! Kernel side: the cachefiles wire format, device capabilities and the
//! poll/dispatch bridge.

pub mod bridge;
pub mod device;
pub mod wire;

pub use bridge::{register, BridgeConfig, BridgeStats, KernelBridge, MessageHandler};
pub use device::{CacheDevice, DevCacheFiles, ObjectFile, PollOutcome};
pub use wire::{Command, Message};
