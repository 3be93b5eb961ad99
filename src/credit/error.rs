use thiserror::Error;

/// Error types that can occur while generating, verifying or redeeming codes.
///
/// Every variant maps to a distinct user-facing message and to a distinct
/// remote error name (see [`PaygError::error_name`]).
///
/// # Error Categories
///
/// - **Code Errors**: `InvalidPeriod`, `InvalidKey`, `InvalidCode`, `InvalidSignature`
/// - **Manager Errors**: `CodeAlreadyUsed`, `TooManyAttempts`, `Disabled`, `ShutDown`
/// - **System Errors**: `StorageError`, `CorruptState`
///
/// # Example
///
/// ```rust
/// use payg::{CreditManager, PaygError};
///
/// # async fn example() -> Result<(), PaygError> {
/// let mut manager = CreditManager::builder()
///     .with_key(vec![b'k'; 64])
///     .build_and_init()
///     .await?;
///
/// match manager.add_code_now("12345678") {
///     Ok(()) => println!("Credit extended"),
///     Err(PaygError::CodeAlreadyUsed) => println!("Code already used"),
///     Err(PaygError::TooManyAttempts { retry_at }) => println!("Wait until {retry_at}"),
///     Err(e) => println!("Other error: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum PaygError {
    /// A period value outside the currently-assigned set.
    ///
    /// Values that fit in the 5-bit field but are not assigned yet are
    /// rejected too, so codes for future periods are never silently accepted.
    #[error("Unknown period {0}")]
    InvalidPeriod(u8),

    /// The shared key is shorter than the HMAC-SHA-1 block size.
    #[error("Key is too short; minimum length {} bytes", crate::credit::codes::KEY_MINIMUM_LENGTH_BYTES)]
    InvalidKey,

    /// The code string is malformed or the integer has high bits set.
    ///
    /// # When This Occurs
    ///
    /// - The string is not exactly 8 ASCII digits
    /// - The value does not fit in 26 bits
    #[error("Invalid code: {0}")]
    InvalidCode(String),

    /// The code is well-formed but its signature does not match.
    ///
    /// # When This Occurs
    ///
    /// - The code was mistyped
    /// - The code was forged
    /// - The code was generated with a different key
    #[error("Invalid signature on code {0}")]
    InvalidSignature(String),

    /// The counter embedded in the code has already been redeemed.
    #[error("This pay as you go code has already been used")]
    CodeAlreadyUsed,

    /// Too many failed attempts have been made recently.
    ///
    /// `retry_at` is the authoritative clock time (seconds) at which the
    /// limit lifts on its own.
    #[error("Too many invalid codes entered recently; please wait until {retry_at}")]
    TooManyAttempts {
        /// Time at which attempts will be accepted again.
        retry_at: u64,
    },

    /// Credit enforcement is turned off for this deployment.
    #[error("Pay as you go is disabled on this computer")]
    Disabled,

    /// The background persistence task has stopped.
    #[error("Pay as you go manager is shutting down")]
    ShutDown,

    /// Reading or writing persisted state failed.
    #[error("Storage error: {0}")]
    StorageError(String),

    /// A persisted state record was corrupt and has been discarded.
    #[error("Corrupt state: {0}")]
    CorruptState(String),
}

impl PaygError {
    /// Returns the stable dotted name used when this error crosses a
    /// remote-procedure boundary.
    pub fn error_name(&self) -> &'static str {
        match self {
            PaygError::InvalidPeriod(_) => "Payg.Error.InvalidPeriod",
            PaygError::InvalidKey => "Payg.Error.InvalidKey",
            PaygError::InvalidCode(_) => "Payg.Error.InvalidCode",
            PaygError::InvalidSignature(_) => "Payg.Error.InvalidSignature",
            PaygError::CodeAlreadyUsed => "Payg.Error.CodeAlreadyUsed",
            PaygError::TooManyAttempts { .. } => "Payg.Error.TooManyAttempts",
            PaygError::Disabled => "Payg.Error.Disabled",
            PaygError::ShutDown => "Payg.Error.ShutDown",
            PaygError::StorageError(_) => "Payg.Error.StorageError",
            PaygError::CorruptState(_) => "Payg.Error.CorruptState",
        }
    }

    /// Whether this failure is an attempt at guessing a code.
    ///
    /// Malformed input is reported separately since counting it is a
    /// policy decision (see `PaygConfig::count_malformed_attempts`).
    pub(crate) fn is_counted_attempt(&self) -> bool {
        matches!(
            self,
            PaygError::InvalidPeriod(_)
                | PaygError::InvalidSignature(_)
                | PaygError::CodeAlreadyUsed
        )
    }
}
