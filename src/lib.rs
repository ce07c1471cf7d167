//! # pioneer-wyt
//!
//! Local Tuya protocol client for Pioneer WYT (Diamante) mini-split heat
//! pumps: encrypted LAN sessions, DP read/write, and a thermostat-shaped
//! command surface. No cloud.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pioneer_wyt::{DeviceBuilder, Thermostat};
//!
//! # async fn demo() -> pioneer_wyt::Result<()> {
//! let device = DeviceBuilder::new("bf1234567890abcdef12", "16-byte-localkey")
//!     .ip("10.0.0.20")
//!     .protocol(33)
//!     .build()?;
//! let thermostat = Thermostat::new(device);
//! thermostat.on().await?;
//! thermostat.set_target_temp(72.0).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod dps;
pub mod error;
pub mod protocol;
pub mod session;
pub mod thermostat;

pub use config::DeviceConfig;
pub use device::{Device, DeviceBuilder, DeviceEvent};
pub use discovery::{DiscoveredDevice, Discovery};
pub use dps::{DpValue, FanSpeed, HorizontalSwing, Mode, OperatingState, VerticalSwing};
pub use error::{Result, TuyaError};
pub use protocol::{FrameType, Version};
pub use thermostat::{Thermostat, ThermostatEvent};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[must_use]
pub fn version() -> &'static str {
    VERSION
}
