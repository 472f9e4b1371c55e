//! Provider adapters.

pub mod mock;

pub use mock::{MockProvider, MockResponse};
