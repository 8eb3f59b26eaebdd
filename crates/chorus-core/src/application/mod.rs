pub mod ports;

pub mod forward;
pub mod ingress;
pub mod nack_origin;
pub mod peer;
