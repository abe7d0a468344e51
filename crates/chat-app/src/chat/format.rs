//! Timestamp labels and date separators for the message list.
//!
//! Relative labels bucket by elapsed 24-hour periods, not by calendar day:
//! a message sent at 23:50 yesterday is still "today" at 00:10. Date
//! separators, in contrast, compare calendar dates.

use std::fmt::Display;

use chrono::{DateTime, Local, TimeZone, Utc};
use rand::Rng;

use super::message::OptimisticId;

const MILLIS_PER_DAY: i64 = 86_400_000;
const OPTIMISTIC_SUFFIX_LEN: usize = 9;
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn elapsed_days<Tz: TimeZone>(timestamp: &DateTime<Tz>, now: &DateTime<Tz>) -> i64 {
    now.clone()
        .signed_duration_since(timestamp.clone())
        .num_milliseconds()
        .div_euclid(MILLIS_PER_DAY)
}

/// Time label for one message bubble, relative to `now`.
pub fn format_message_time<Tz>(timestamp: &DateTime<Tz>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match elapsed_days(timestamp, now) {
        days if days < 1 => timestamp.format("%H:%M").to_string(),
        1 => timestamp.format("Yesterday %H:%M").to_string(),
        2..=6 => timestamp.format("%a %H:%M").to_string(),
        _ => timestamp.format("%b %-d %H:%M").to_string(),
    }
}

/// [`format_message_time`] in the local timezone against the local clock.
pub fn format_message_time_local(timestamp: &DateTime<Utc>) -> String {
    format_message_time(&timestamp.with_timezone(&Local), &Local::now())
}

/// True for the first message and whenever the calendar date changes.
pub fn should_show_date_separator<Tz: TimeZone>(
    current: &DateTime<Tz>,
    previous: Option<&DateTime<Tz>>,
) -> bool {
    previous.is_none_or(|previous| previous.date_naive() != current.date_naive())
}

pub fn date_separator_text<Tz>(timestamp: &DateTime<Tz>, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match elapsed_days(timestamp, now) {
        days if days < 1 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        _ => timestamp.format("%A, %B %-d").to_string(),
    }
}

pub fn date_separator_text_local(timestamp: &DateTime<Utc>) -> String {
    date_separator_text(&timestamp.with_timezone(&Local), &Local::now())
}

/// Mints `optimistic-<epoch-ms>-<9 base36 chars>`.
///
/// Server ids are UUIDs, so the prefix alone keeps the two formats apart.
pub fn generate_optimistic_id() -> OptimisticId {
    let mut rng = rand::rng();
    let suffix = (0..OPTIMISTIC_SUFFIX_LEN)
        .map(|_| char::from(BASE36_ALPHABET[rng.random_range(0..BASE36_ALPHABET.len())]))
        .collect::<String>();
    OptimisticId::from_parts(Utc::now().timestamp_millis(), &suffix)
}
