//! Infrastructure: host-environment concerns.

pub mod settings;

pub use settings::GateSettings;
