// Sleeplink - Sleep session transfer from a wearable to a phone over BLE GATT

pub mod ble;
pub mod config;
pub mod link;
pub mod session;

pub use config::{ConfigError, LinkConfig};
pub use link::client::{ClientSnapshot, LinkClient};
pub use link::server::{LinkServer, ServerEvent};
pub use link::{ConnectionState, LinkError, LinkStatus};
pub use session::store::{JsonFileSessionStore, MemorySessionStore, ReceivedSession, SessionStore, StoreError};
pub use session::{SessionRecorder, SleepQuality, SleepSession};
