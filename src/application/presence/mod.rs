//! Presence services: publication, subscriptions and anonymous fetch

pub mod anonymous_fetch;
pub mod publish;
pub mod subscribe;

pub use anonymous_fetch::AnonymousFetchManager;
pub use publish::{PublishManager, ENTITY_TAG_EXPIRATION_KEY, ENTITY_TAG_KEY};
pub use subscribe::{SubscribeManager, SubscriptionKind};
