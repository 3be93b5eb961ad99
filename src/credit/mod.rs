//! Pay-as-you-go credit: top-up codes and the manager that redeems them.

pub mod clock;
pub mod codes;
mod config;
mod error;
mod key;
mod manager;
mod manager_builder;
mod persist;
mod rate_limit;
pub mod storage;

pub use clock::{Clock, FakeClock, SystemClock};
pub use codes::{Code, Period};
pub use config::{ConfigPreset, PaygConfig};
pub use error::PaygError;
pub use key::SharedKey;
pub use manager::{CreditEvent, CreditManager, CreditStatus};
pub use manager_builder::CreditManagerBuilder;
