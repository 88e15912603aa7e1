/// GATT sessions through [btleplug](https://github.com/deviceplug/btleplug).
/// Available when the `btleplug-provider` feature is selected.
#[cfg(feature = "btleplug-provider")]
pub mod btleplug_provider;
