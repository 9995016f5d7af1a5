pub mod gateway_discovery;

pub use gateway_discovery::{discover_gateways, expand_targets};
