//! Issuing codes on one side and redeeming them on the other
//!
//! Run with: cargo test --test codes_tests

use std::sync::Arc;

use payg::credit::FakeClock;
use payg::credit::codes::{CODE_LENGTH_DIGITS, calculate_code, format_code, parse_code, verify_code};
use payg::{Clock, CreditManager, PaygError, Period, SharedKey};
use tempfile::TempDir;

fn key_file(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("key");
    let key: Vec<u8> = (0..=u8::MAX).collect();
    std::fs::write(&path, key).unwrap();
    path
}

#[tokio::test]
async fn test_every_period_redeems_for_its_duration() -> Result<(), PaygError> {
    let dir = TempDir::new().unwrap();
    let path = key_file(&dir);
    let key = SharedKey::from_file(&path).await?.expect("key file exists");
    assert_eq!(key.len(), 256);

    let clock = Arc::new(FakeClock::default());
    let mut manager = CreditManager::builder()
        .with_clock(clock.clone())
        .with_key_file(&path)
        .build_and_init()
        .await?;
    assert!(manager.enabled());

    for (counter, period) in Period::ALL.into_iter().enumerate() {
        let issued = format_code(calculate_code(period, counter as u8, key.as_bytes())?);
        assert_eq!(issued.len(), CODE_LENGTH_DIGITS);

        // Start each redemption from expired credit
        clock.advance(400 * 86_400);
        manager.add_code_now(&issued)?;

        let expected = match period.duration_secs() {
            Some(secs) => clock.time() + secs,
            None => u64::MAX,
        };
        assert_eq!(manager.expiry_time(), expected, "period {period}");
    }
    assert_eq!(manager.expiry_time(), u64::MAX);
    assert_eq!(manager.used_counters().len(), Period::ALL.len());
    Ok(())
}

#[tokio::test]
async fn test_codes_are_unique_per_key() -> Result<(), PaygError> {
    let key_a = [0x11u8; 64];
    let key_b = [0x22u8; 64];

    let from_a: Vec<String> = (0..=u8::MAX)
        .map(|counter| calculate_code(Period::OneDay, counter, &key_a).map(format_code))
        .collect::<Result<_, _>>()?;

    // Every counter gives a distinct code
    let mut sorted = from_a.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), from_a.len());

    let accepted_by_b = from_a
        .iter()
        .filter(|code| verify_code(parse_code(code).unwrap(), &key_b).is_ok())
        .count();
    assert!(accepted_by_b <= 6, "{accepted_by_b} codes accepted by the wrong key");
    Ok(())
}

#[tokio::test]
async fn test_short_key_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short-key");
    std::fs::write(&path, b"too short").unwrap();

    assert!(matches!(
        SharedKey::from_file(&path).await,
        Err(PaygError::InvalidKey)
    ));
    assert!(matches!(
        CreditManager::builder()
            .with_clock(Arc::new(FakeClock::default()))
            .with_key_file(&path)
            .build_and_init()
            .await,
        Err(PaygError::InvalidKey)
    ));
}

#[test]
fn test_code_strings_from_user_input() -> Result<(), PaygError> {
    let key = [0x42u8; 64];
    let code = calculate_code(Period::FourteenDays, 200, &key)?;
    let text = format_code(code);

    assert_eq!(parse_code(&text)?, code);
    assert!(matches!(parse_code(&format!(" {text}")), Err(PaygError::InvalidCode(_))));
    assert!(matches!(parse_code(&text[1..]), Err(PaygError::InvalidCode(_))));
    assert_eq!(verify_code(parse_code(&text)?, &key)?, (Period::FourteenDays, 200));
    Ok(())
}
