//! # PAYG
//!
//! Pay-as-you-go credit enforcement for leased computers.
//!
//! A leased machine only runs while it has credit. Credit is topped up by
//! typing in short numeric codes sold to the customer. This crate provides
//! both halves of that scheme:
//!
//! - **Codes** ([`credit::codes`]): 8-digit codes carrying a credit period,
//!   a uniqueness counter and a truncated HMAC-SHA-1 signature over a shared
//!   secret key
//! - **Credit manager** ([`CreditManager`]): redeems codes, refuses reused
//!   ones, rate-limits guessing, tracks the expiry time against a
//!   suspend-aware monotonic clock and persists its state atomically
//!
//! ## Quick Start
//!
//! ```rust
//! use payg::credit::codes::{calculate_code, format_code, Period};
//! use payg::credit::storage::FileStorage;
//! use payg::{CreditEvent, CreditManager, PaygError};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), PaygError> {
//! let key = b"a shared secret of at least sixty-four bytes, provisioned out of band".to_vec();
//!
//! // Vendor side: issue a code worth one day of credit
//! let code = format_code(calculate_code(Period::OneDay, 17, &key)?);
//!
//! // Machine side: redeem it
//! let mut manager = CreditManager::builder()
//!     .with_storage(Arc::new(FileStorage::new("/var/lib/payg")))
//!     .with_key(key)
//!     .build_and_init()
//!     .await?;
//! let mut events = manager.subscribe();
//!
//! manager.add_code_now(&code)?;
//! assert!(matches!(
//!     manager.add_code_now(&code),
//!     Err(PaygError::CodeAlreadyUsed)
//! ));
//!
//! while let Ok(event) = events.recv().await {
//!     if event == CreditEvent::Expired {
//!         println!("Out of credit");
//!         break;
//!     }
//! }
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`PaygConfig`] reads its defaults from the environment:
//!
//! ```bash
//! export PAYG_STATE_DIRECTORY=/var/lib/payg
//! export PAYG_KEY_FILE=/usr/local/share/payg/key
//! export PAYG_RATE_LIMIT_ATTEMPTS=10
//! export PAYG_RATE_LIMIT_WINDOW=1800
//! export PAYG_COUNT_MALFORMED_ATTEMPTS=true
//! ```
//!
//! `CreditManager::builder().with_file_storage()` keeps state in
//! `PAYG_STATE_DIRECTORY`.
//!
//! ## Architecture
//!
//! - **[`CreditManager`]**: the single owner of the credit state
//! - **[`credit::storage::StateStorage`]**: where state records are kept
//! - **[`Clock`]**: the authoritative and wallclock time sources
//! - **[`PaygError`]**: every failure mode, one variant each

use hmac::Hmac;
use sha1::Sha1;

pub mod credit;

// Re-export commonly used types
pub use credit::{
    Clock, ConfigPreset, CreditEvent, CreditManager, CreditStatus, PaygConfig, PaygError, Period,
    SharedKey,
};

/// Internal type alias for HMAC-SHA-1 operations.
type HmacSha1 = Hmac<Sha1>;
