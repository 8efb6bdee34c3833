//! User preferences
//!
//! The currency follows the signed-in user across devices. The theme is a
//! device-local setting.

pub mod currency;
pub mod settings;
pub mod theme;

pub use crate::profile::CurrencyCode;
pub use currency::CurrencyPreferences;
pub use settings::SettingsStore;
pub use theme::{ThemeMode, ThemePreferences};
