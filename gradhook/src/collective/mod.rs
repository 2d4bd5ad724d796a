mod broadcast_coalesced;

pub use broadcast_coalesced::{
    broadcast_coalesced, broadcast_coalesced_from, broadcast_coalesced_with_config, partition_runs,
};
