//! Ranking network for DeepCINET.
//!
//! - [`ranking_network`]: Siamese feed-forward embedding on candle
//! - [`device`]: compute device selection

pub mod device;
pub mod ranking_network;

pub use device::{device_label, select_device};
pub use ranking_network::RankingNetwork;
