//! Database entities

pub mod tunnel;
pub mod tunnel_traffic;

pub use tunnel::Entity as TunnelEntity;
pub use tunnel_traffic::Entity as TunnelTraffic;

pub mod prelude {
    pub use super::tunnel::Entity as TunnelEntity;
    pub use super::tunnel_traffic::Entity as TunnelTraffic;
}
