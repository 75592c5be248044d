pub mod bus;
pub mod event;
pub mod lifecycle;
pub mod plugin;

#[cfg(feature = "test-utils")]
pub mod plugin_test_util;

pub use bus::{Delivery, EventBus, EventHandler, SubscriptionId};
pub use event::Event;
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use plugin::{CommandSpec, Plugin, PluginContext, PluginError, PluginHost, RegistryError};
