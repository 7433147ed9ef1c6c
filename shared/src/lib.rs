mod day_range;
mod identity;
mod lock_key;
mod provider;
mod totals;
mod window;

#[cfg(feature = "client")]
pub mod fetcher;

#[cfg(feature = "client")]
pub mod github;

#[cfg(feature = "client")]
pub mod gitlab;

pub use day_range::*;
pub use identity::*;
pub use lock_key::*;
pub use provider::*;
pub use totals::*;
pub use window::*;

pub use strum::IntoEnumIterator;
