use anyhow::{Result, bail};
use chrono::{DateTime, Local, NaiveTime, Utc};

pub fn format_timestamp(timestamp: Option<DateTime<Utc>>) -> String {
    let Some(ts) = timestamp else {
        return "-".to_string();
    };
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| anyhow::anyhow!("Invalid time of day '{value}', expected HH:MM"))
}

/// Weekday by name (`mon`, `Monday`) or number with Sunday as 0.
pub fn parse_weekday(value: &str) -> Result<u8> {
    let lower = value.trim().to_ascii_lowercase();
    if let Ok(day) = lower.parse::<u8>() {
        if day > 6 {
            bail!("Weekday must be 0-6 (Sunday = 0), got {day}");
        }
        return Ok(day);
    }
    let day = match lower.get(..3) {
        Some("sun") => 0,
        Some("mon") => 1,
        Some("tue") => 2,
        Some("wed") => 3,
        Some("thu") => 4,
        Some("fri") => 5,
        Some("sat") => 6,
        _ => bail!("Unknown weekday '{value}'"),
    };
    Ok(day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weekday() {
        assert_eq!(parse_weekday("mon").unwrap(), 1);
        assert_eq!(parse_weekday("Wednesday").unwrap(), 3);
        assert_eq!(parse_weekday("0").unwrap(), 0);
        assert!(parse_weekday("7").is_err());
        assert!(parse_weekday("xyz").is_err());
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(
            parse_time_of_day("09:30").unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }
}
