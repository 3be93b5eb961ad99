//! Generation and verification of 8-digit top-up codes.
//!
//! A code packs a [`Period`], an 8-bit counter and a 13-bit truncated
//! HMAC-SHA-1 signature into 26 bits:
//!
//! ```text
//!  25      21 20        13 12            0
//! +----------+------------+---------------+
//! |  period  |  counter   |   signature   |
//! +----------+------------+---------------+
//! ```
//!
//! The signature is the low 13 bits of the last two bytes of
//! `HMAC-SHA1(key, period || counter)`. Codes carry no timestamp; the period
//! is applied relative to the moment the code is redeemed.
//!
//! The bit layout, the period numbering and the truncation are a frozen
//! format: codes already handed to customers must keep verifying.

use std::fmt;
use std::str::FromStr;

use hmac::Mac;

use crate::HmacSha1;
use crate::credit::PaygError;

/// A packed 26-bit code. Always below 10^8 so it renders as 8 decimal digits.
pub type Code = u32;

/// Minimum length of the shared key: the HMAC-SHA-1 block size.
///
/// Shorter keys would be zero-padded by HMAC, which throws away entropy.
pub const KEY_MINIMUM_LENGTH_BYTES: usize = 64;

/// Number of decimal digits in a formatted code.
pub const CODE_LENGTH_DIGITS: usize = 8;

/// Regular expression describing the formatted code, for input widgets.
pub const CODE_FORMAT: &str = "^[0-9]{8}$";

/// Largest counter value; a key can issue at most 256 codes.
pub const COUNTER_MAX: u8 = u8::MAX;

const PERIOD_BITS: u32 = 5;
const COUNTER_BITS: u32 = 8;
const SIGNATURE_BITS: u32 = 13;

const COUNTER_SHIFT: u32 = SIGNATURE_BITS;
const PERIOD_SHIFT: u32 = SIGNATURE_BITS + COUNTER_BITS;
const CODE_BITS: u32 = PERIOD_BITS + COUNTER_BITS + SIGNATURE_BITS;

const PERIOD_MASK: Code = (1 << PERIOD_BITS) - 1;
const COUNTER_MASK: Code = (1 << COUNTER_BITS) - 1;
const SIGNATURE_MASK: u16 = (1 << SIGNATURE_BITS) - 1;

/// Exclusive upper bound of a structurally valid code.
pub const CODE_LIMIT: Code = 1 << CODE_BITS;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// The amount of credit a code adds.
///
/// The numeric value of each variant is part of the code format and must
/// never change once released. Values 25 to 30 are unassigned and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Period {
    FiveSeconds = 0,
    OneMinute = 1,
    FiveMinutes = 2,
    OneHour = 3,
    OneDay = 4,
    TwoDays = 5,
    ThreeDays = 6,
    FourDays = 7,
    FiveDays = 8,
    SixDays = 9,
    SevenDays = 10,
    EightDays = 11,
    NineDays = 12,
    TenDays = 13,
    ElevenDays = 14,
    TwelveDays = 15,
    ThirteenDays = 16,
    FourteenDays = 17,
    ThirtyDays = 18,
    SixtyDays = 19,
    NinetyDays = 20,
    OneHundredTwentyDays = 21,
    ThreeHundredSixtyFiveDays = 22,
    ThirtyMinutes = 23,
    EightHours = 24,
    /// Credit never runs out.
    Infinite = 31,
}

impl Period {
    /// Every assigned period, shortest first.
    pub const ALL: [Period; 26] = [
        Period::FiveSeconds,
        Period::OneMinute,
        Period::FiveMinutes,
        Period::ThirtyMinutes,
        Period::OneHour,
        Period::EightHours,
        Period::OneDay,
        Period::TwoDays,
        Period::ThreeDays,
        Period::FourDays,
        Period::FiveDays,
        Period::SixDays,
        Period::SevenDays,
        Period::EightDays,
        Period::NineDays,
        Period::TenDays,
        Period::ElevenDays,
        Period::TwelveDays,
        Period::ThirteenDays,
        Period::FourteenDays,
        Period::ThirtyDays,
        Period::SixtyDays,
        Period::NinetyDays,
        Period::OneHundredTwentyDays,
        Period::ThreeHundredSixtyFiveDays,
        Period::Infinite,
    ];

    /// The 5-bit value embedded in codes.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Length of the period in seconds, or `None` for [`Period::Infinite`].
    pub fn duration_secs(self) -> Option<u64> {
        let secs = match self {
            Period::FiveSeconds => 5,
            Period::OneMinute => 60,
            Period::FiveMinutes => 5 * 60,
            Period::ThirtyMinutes => 30 * 60,
            Period::OneHour => 60 * 60,
            Period::EightHours => 8 * 60 * 60,
            Period::OneDay => SECONDS_PER_DAY,
            Period::TwoDays
            | Period::ThreeDays
            | Period::FourDays
            | Period::FiveDays
            | Period::SixDays
            | Period::SevenDays
            | Period::EightDays
            | Period::NineDays
            | Period::TenDays
            | Period::ElevenDays
            | Period::TwelveDays
            | Period::ThirteenDays
            | Period::FourteenDays => {
                // 2 days is value 5, 14 days is value 17
                u64::from(self.value() - 3) * SECONDS_PER_DAY
            }
            Period::ThirtyDays => 30 * SECONDS_PER_DAY,
            Period::SixtyDays => 60 * SECONDS_PER_DAY,
            Period::NinetyDays => 90 * SECONDS_PER_DAY,
            Period::OneHundredTwentyDays => 120 * SECONDS_PER_DAY,
            Period::ThreeHundredSixtyFiveDays => 365 * SECONDS_PER_DAY,
            Period::Infinite => return None,
        };
        Some(secs)
    }

    /// Short token used on command lines, such as `5s`, `1d` or `infinite`.
    pub fn token(self) -> &'static str {
        match self {
            Period::FiveSeconds => "5s",
            Period::OneMinute => "1m",
            Period::FiveMinutes => "5m",
            Period::ThirtyMinutes => "30m",
            Period::OneHour => "1h",
            Period::EightHours => "8h",
            Period::OneDay => "1d",
            Period::TwoDays => "2d",
            Period::ThreeDays => "3d",
            Period::FourDays => "4d",
            Period::FiveDays => "5d",
            Period::SixDays => "6d",
            Period::SevenDays => "7d",
            Period::EightDays => "8d",
            Period::NineDays => "9d",
            Period::TenDays => "10d",
            Period::ElevenDays => "11d",
            Period::TwelveDays => "12d",
            Period::ThirteenDays => "13d",
            Period::FourteenDays => "14d",
            Period::ThirtyDays => "30d",
            Period::SixtyDays => "60d",
            Period::NinetyDays => "90d",
            Period::OneHundredTwentyDays => "120d",
            Period::ThreeHundredSixtyFiveDays => "365d",
            Period::Infinite => "infinite",
        }
    }

    /// Human-readable length, such as `5 seconds` or `Infinite`.
    pub fn description(self) -> String {
        match self {
            Period::FiveSeconds => "5 seconds".to_string(),
            Period::OneMinute => "1 minute".to_string(),
            Period::FiveMinutes => "5 minutes".to_string(),
            Period::ThirtyMinutes => "30 minutes".to_string(),
            Period::OneHour => "1 hour".to_string(),
            Period::EightHours => "8 hours".to_string(),
            Period::OneDay => "1 day".to_string(),
            Period::Infinite => "Infinite".to_string(),
            days => {
                let secs = days.duration_secs().unwrap_or_default();
                format!("{} days", secs / SECONDS_PER_DAY)
            }
        }
    }
}

impl TryFrom<u8> for Period {
    type Error = PaygError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Period::ALL
            .iter()
            .copied()
            .find(|period| period.value() == value)
            .ok_or(PaygError::InvalidPeriod(value))
    }
}

impl FromStr for Period {
    type Err = PaygError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .iter()
            .copied()
            .find(|period| period.token() == s)
            .ok_or_else(|| PaygError::InvalidCode(format!("unknown period '{s}'")))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Returns true if `period` is one of the assigned [`Period`] values.
pub fn validate_period(period: u8) -> bool {
    Period::try_from(period).is_ok()
}

/// Returns true if `code` fits in 26 bits.
pub fn validate_code(code: Code) -> bool {
    code < CODE_LIMIT
}

fn check_key(key: &[u8]) -> Result<(), PaygError> {
    if key.len() < KEY_MINIMUM_LENGTH_BYTES {
        return Err(PaygError::InvalidKey);
    }
    Ok(())
}

/// Computes the code for `period` and `counter` under `key`.
///
/// # Errors
///
/// Returns [`PaygError::InvalidKey`] if `key` is shorter than
/// [`KEY_MINIMUM_LENGTH_BYTES`].
///
/// # Example
///
/// ```rust
/// use payg::credit::codes::{calculate_code, Period};
///
/// let key = b"hello this has to be at least 64 bytes long so I am going to keep on typing.";
/// assert_eq!(calculate_code(Period::FiveSeconds, 0, key).unwrap(), 6996);
/// ```
pub fn calculate_code(period: Period, counter: u8, key: &[u8]) -> Result<Code, PaygError> {
    check_key(key)?;

    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| PaygError::InvalidKey)?;
    mac.update(&[period.value(), counter]);
    let digest = mac.finalize().into_bytes();

    let signature = u16::from_be_bytes([digest[18], digest[19]]) & SIGNATURE_MASK;

    Ok((Code::from(period.value()) << PERIOD_SHIFT)
        | (Code::from(counter) << COUNTER_SHIFT)
        | Code::from(signature))
}

/// Authenticates `code` under `key` and returns its period and counter.
///
/// The expected code is recomputed with [`calculate_code`] and compared with
/// the input, so generation and verification cannot drift apart.
///
/// # Errors
///
/// - [`PaygError::InvalidCode`] if the code does not fit in 26 bits
/// - [`PaygError::InvalidKey`] if the key is too short
/// - [`PaygError::InvalidPeriod`] if the embedded period is unassigned
/// - [`PaygError::InvalidSignature`] if the signature does not match
pub fn verify_code(code: Code, key: &[u8]) -> Result<(Period, u8), PaygError> {
    if !validate_code(code) {
        return Err(PaygError::InvalidCode(format!(
            "code {code} is out of range"
        )));
    }
    check_key(key)?;

    let period = Period::try_from(((code >> PERIOD_SHIFT) & PERIOD_MASK) as u8)?;
    let counter = ((code >> COUNTER_SHIFT) & COUNTER_MASK) as u8;

    if calculate_code(period, counter, key)? != code {
        return Err(PaygError::InvalidSignature(format_code(code)));
    }

    Ok((period, counter))
}

/// Renders `code` as exactly 8 zero-padded digits.
///
/// `code` must be structurally valid; callers obtain codes from
/// [`calculate_code`] or [`parse_code`].
///
/// # Panics
///
/// Panics if `code` does not fit in 26 bits.
pub fn format_code(code: Code) -> String {
    assert!(validate_code(code), "code {code} is out of range");
    format!("{code:0width$}", width = CODE_LENGTH_DIGITS)
}

/// Parses a code entered by a user.
///
/// # Errors
///
/// Returns [`PaygError::InvalidCode`] unless `s` is exactly 8 ASCII digits
/// whose value fits in 26 bits.
pub fn parse_code(s: &str) -> Result<Code, PaygError> {
    if s.len() != CODE_LENGTH_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PaygError::InvalidCode(format!(
            "code must be {CODE_LENGTH_DIGITS} digits"
        )));
    }

    let code: Code = s
        .parse()
        .map_err(|e| PaygError::InvalidCode(format!("code '{s}' is not a number: {e}")))?;
    if !validate_code(code) {
        return Err(PaygError::InvalidCode(format!("code '{s}' is out of range")));
    }

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY1: &[u8] = b"hello this has to be at least 64 bytes long so I am going to keep on typing.";
    const KEY2: &[u8] = b"another key which is also at least 64 bytes long, since that is the rule.";

    #[test]
    fn test_validate_period() {
        for period in Period::ALL {
            assert!(validate_period(period.value()), "{period}");
        }
        for hole in 25..=30 {
            assert!(!validate_period(hole));
        }
        assert!(!validate_period(32));
        assert!(!validate_period(u8::MAX));
    }

    #[test]
    fn test_period_try_from() {
        assert_eq!(Period::try_from(0).unwrap(), Period::FiveSeconds);
        assert_eq!(Period::try_from(23).unwrap(), Period::ThirtyMinutes);
        assert_eq!(Period::try_from(31).unwrap(), Period::Infinite);
        assert!(matches!(
            Period::try_from(30),
            Err(PaygError::InvalidPeriod(30))
        ));
        assert!(matches!(
            Period::try_from(32),
            Err(PaygError::InvalidPeriod(32))
        ));
    }

    #[test]
    fn test_period_durations() {
        assert_eq!(Period::FiveSeconds.duration_secs(), Some(5));
        assert_eq!(Period::OneMinute.duration_secs(), Some(60));
        assert_eq!(Period::ThirtyMinutes.duration_secs(), Some(1800));
        assert_eq!(Period::EightHours.duration_secs(), Some(8 * 3600));
        assert_eq!(Period::OneDay.duration_secs(), Some(86_400));
        assert_eq!(Period::TwoDays.duration_secs(), Some(2 * 86_400));
        assert_eq!(Period::SevenDays.duration_secs(), Some(7 * 86_400));
        assert_eq!(Period::FourteenDays.duration_secs(), Some(14 * 86_400));
        assert_eq!(Period::ThreeHundredSixtyFiveDays.duration_secs(), Some(365 * 86_400));
        assert_eq!(Period::Infinite.duration_secs(), None);
    }

    #[test]
    fn test_period_tokens() {
        for period in Period::ALL {
            assert_eq!(period.token().parse::<Period>().unwrap(), period);
        }
        assert_eq!("infinite".parse::<Period>().unwrap(), Period::Infinite);
        assert!("2w".parse::<Period>().is_err());
        assert!("".parse::<Period>().is_err());
    }

    #[test]
    fn test_period_descriptions() {
        assert_eq!(Period::FiveSeconds.description(), "5 seconds");
        assert_eq!(Period::EightHours.description(), "8 hours");
        assert_eq!(Period::TwelveDays.description(), "12 days");
        assert_eq!(Period::ThreeHundredSixtyFiveDays.description(), "365 days");
        assert_eq!(Period::Infinite.description(), "Infinite");
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code(0));
        assert!(validate_code((1 << 26) - 1));
        assert!(!validate_code(1 << 26));
        assert!(!validate_code(Code::MAX));
    }

    #[test]
    fn test_calculate_code_vectors() {
        let vectors: &[(u8, u8, Code)] = &[
            (0, 0, 6996),
            (0, 1, 13963),
            (0, 2, 23105),
            (0, 3, 32552),
            (0, 4, 36698),
            (0, 5, 45721),
            (0, 6, 50472),
            (0, 7, 63462),
            (1, 100, 2919004),
            (2, 51, 4614445),
            (3, 12, 6395742),
            (4, 13, 8495508),
            (5, 46, 10866382),
            (6, 31, 12838372),
            (7, 0, 14684372),
            (8, 8, 16848988),
            (9, 65, 19411925),
            (10, 250, 23027316),
            (11, 46, 23453556),
            (12, 2, 25186550),
            (13, 89, 27992206),
            (14, 34, 29645509),
            (15, 46, 31840181),
            (16, 76, 34178837),
            (17, 66, 36195098),
            (18, 70, 38323642),
            (19, 64, 40373693),
            (20, 95, 42722623),
            (21, 43, 44396753),
            (22, 76, 46761597),
            (31, 32, 65277943),
        ];

        for &(period, counter, expected) in vectors {
            let period = Period::try_from(period).unwrap();
            let code = calculate_code(period, counter, KEY1).unwrap();
            assert_eq!(code, expected, "period {period}, counter {counter}");

            let (verified_period, verified_counter) = verify_code(code, KEY1).unwrap();
            assert_eq!(verified_period, period);
            assert_eq!(verified_counter, counter);
        }
    }

    #[test]
    fn test_calculate_code_errors() {
        assert!(matches!(
            calculate_code(Period::FiveSeconds, 0, b""),
            Err(PaygError::InvalidKey)
        ));
        assert!(matches!(
            calculate_code(Period::FiveSeconds, 0, &KEY1[..63]),
            Err(PaygError::InvalidKey)
        ));
        assert!(calculate_code(Period::FiveSeconds, 0, &KEY1[..64]).is_ok());
    }

    #[test]
    fn test_round_trip_all_counters() {
        for period in Period::ALL {
            for counter in 0..=COUNTER_MAX {
                let code = calculate_code(period, counter, KEY2).unwrap();
                assert!(validate_code(code));
                assert_eq!(verify_code(code, KEY2).unwrap(), (period, counter));
            }
        }
    }

    #[test]
    fn test_verify_code_errors() {
        assert!(matches!(
            verify_code(1 << 26, KEY1),
            Err(PaygError::InvalidCode(_))
        ));
        assert!(matches!(verify_code(15, b""), Err(PaygError::InvalidKey)));
        assert!(matches!(
            verify_code(30 << 21, KEY1),
            Err(PaygError::InvalidPeriod(30))
        ));
        assert!(matches!(
            verify_code(4 << 21, KEY1),
            Err(PaygError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_verify_code_wrong_key() {
        // 13 signature bits: roughly one code in 8192 verifies under any key.
        let rejected = (0..=COUNTER_MAX)
            .map(|counter| calculate_code(Period::OneDay, counter, KEY1).unwrap())
            .filter(|&code| matches!(verify_code(code, KEY2), Err(PaygError::InvalidSignature(_))))
            .count();
        assert!(rejected >= 250, "only {rejected} of 256 codes rejected");
    }

    #[test]
    fn test_format_code() {
        assert_eq!(format_code(0), "00000000");
        assert_eq!(format_code(123), "00000123");
        assert_eq!(format_code(12345678), "12345678");
        assert_eq!(format_code(CODE_LIMIT - 1), "67108863");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_format_code_out_of_range() {
        format_code(CODE_LIMIT);
    }

    #[test]
    fn test_parse_code() {
        assert_eq!(parse_code("00000000").unwrap(), 0);
        assert_eq!(parse_code("00000123").unwrap(), 123);
        assert_eq!(parse_code("12345678").unwrap(), 12345678);
        assert_eq!(parse_code("67108863").unwrap(), CODE_LIMIT - 1);

        for code in [0, 6996, 2919004, 65277943, CODE_LIMIT - 1] {
            assert_eq!(parse_code(&format_code(code)).unwrap(), code);
        }
    }

    #[test]
    fn test_parse_code_errors() {
        let bad = [
            "",
            "some words",
            "1234567",
            "123456789",
            "abcdefgh",
            "99999999",
            "67108864",
            "+1234567",
            " 1234567",
            "1234567\n",
            "１２３４５６７８",
        ];
        for input in bad {
            assert!(
                matches!(parse_code(input), Err(PaygError::InvalidCode(_))),
                "{input:?} should be rejected"
            );
        }
    }
}
