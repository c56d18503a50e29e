mod chan_network;

pub use chan_network::{ChanNetwork, NetworkControl};
