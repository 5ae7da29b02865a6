//! SeaORM entities for the panel store.

pub mod admin;
pub mod group;
pub mod inbound;
pub mod node;
pub mod sync_attempt;
pub mod sync_job;
pub mod system_setting;
pub mod traffic_sample;
pub mod user;
pub mod user_group;

pub mod prelude {
    pub use super::admin::Entity as Admin;
    pub use super::group::Entity as Group;
    pub use super::inbound::Entity as Inbound;
    pub use super::node::Entity as Node;
    pub use super::sync_attempt::Entity as SyncAttempt;
    pub use super::sync_job::Entity as SyncJob;
    pub use super::system_setting::Entity as SystemSetting;
    pub use super::traffic_sample::Entity as TrafficSample;
    pub use super::user::Entity as User;
    pub use super::user_group::Entity as UserGroup;
}
