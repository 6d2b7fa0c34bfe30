use crate::classify::SkyLabel;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

const UNIT_SUFFIXES: [&str; 8] = ["km/h", "°c", "°", "cm", "mm", "mb", "%", "m"];
const PLACEHOLDERS: [&str; 4] = ["", "-", "nan", "n/a"];

/// Lowercases, drops unit markers and thousands separators.
pub fn strip_units(raw: &str) -> String {
    let mut text = raw.trim().to_lowercase();
    for unit in UNIT_SUFFIXES {
        text = text.replace(unit, " ");
    }
    drop_thousands_separators(&text).trim().to_string()
}

fn drop_thousands_separators(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, c) in chars.iter().enumerate() {
        if *c == ',' {
            let after_digit = i > 0 && chars[i - 1].is_ascii_digit();
            let group = chars.get(i + 1..i + 4).is_some_and(|g| g.iter().all(char::is_ascii_digit));
            let group_ends = chars.get(i + 4).is_none_or(|n| !n.is_ascii_digit());
            if after_digit && group && group_ends {
                continue;
            }
        }
        out.push(*c);
    }
    out
}

/// Every number in `text`, in order. A `-` directly after a digit separates
/// a range instead of signing the next number.
fn scan_numbers(text: &str) -> Vec<f64> {
    let chars: Vec<char> = text.chars().collect();
    let mut values = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next_is_digit = chars.get(i + 1).is_some_and(char::is_ascii_digit);
        let follows_digit = i > 0 && chars[i - 1].is_ascii_digit();
        let signed = c == '-' && next_is_digit && !follows_digit;

        if !(c.is_ascii_digit() || signed) {
            i += 1;
            continue;
        }

        let start = i;
        if signed {
            i += 1;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }

        let token: String = chars[start..i].iter().collect();
        if let Ok(value) = token.parse::<f64>() {
            values.push(value);
        }
    }

    values
}

fn is_placeholder(text: &str) -> bool {
    PLACEHOLDERS.contains(&text)
}

/// Range-aware coercion: "2-5cm" → 4, "-3" → -3, "trace" → 0, "-" → 0.
/// Halves round to even, so "0-1" → 0 and "2-3" → 2.
pub fn coerce_number(raw: &str) -> i64 {
    let text = strip_units(raw).replace("trace", "0");
    if is_placeholder(&text) {
        return 0;
    }
    let values = scan_numbers(&text);
    if values.is_empty() {
        return 0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    mean.round_ties_even() as i64
}

/// Single grouped integer such as "1,100 m". No range handling.
pub fn parse_grouped_int(raw: &str) -> Option<i64> {
    let text = strip_units(raw).replace(',', "");
    let text = text.trim();
    if is_placeholder(text) {
        return None;
    }
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().map(|v| v.round_ties_even() as i64))
}

/// First decimal in a reading like "-3.4°C"; placeholders give `None`.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let text = strip_units(raw);
    if is_placeholder(&text) {
        return None;
    }
    scan_numbers(&text).into_iter().next()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecipKind {
    Snow,
    Rain,
    None,
}

impl PrecipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrecipKind::Snow => "Snow",
            PrecipKind::Rain => "Rain",
            PrecipKind::None => "None",
        }
    }
}

pub fn classify_precipitation(snow: i64, rain: i64) -> (PrecipKind, i64) {
    if snow > 0 {
        (PrecipKind::Snow, snow)
    } else if rain > 0 {
        (PrecipKind::Rain, rain)
    } else {
        (PrecipKind::None, 0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SkyInputs {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub precipitating: bool,
    pub local_hour: u32,
    pub ai_label: Option<SkyLabel>,
}

pub fn sky_condition(inputs: &SkyInputs) -> String {
    let base = if inputs.precipitating {
        if inputs.temperature_c.is_some_and(|t| t > 0.0) {
            "Raining"
        } else {
            "Snowing"
        }
    } else if let Some(label) = inputs.ai_label {
        label.as_str()
    } else if let Some(humidity) = inputs.humidity_pct {
        humidity_band(humidity).as_str()
    } else if is_night(inputs.local_hour) {
        SkyLabel::Night.as_str()
    } else {
        SkyLabel::Cloudy.as_str()
    };

    match wind_tag(inputs.wind_speed_kmh) {
        Some(tag) => format!("{base} & {tag}"),
        None => base.to_string(),
    }
}

fn humidity_band(humidity: f64) -> SkyLabel {
    if humidity < 40.0 {
        SkyLabel::Bluebird
    } else if humidity < 70.0 {
        SkyLabel::Sunny
    } else if humidity < 85.0 {
        SkyLabel::Cloudy
    } else if humidity < 95.0 {
        SkyLabel::Overcast
    } else {
        SkyLabel::Foggy
    }
}

fn wind_tag(speed: Option<f64>) -> Option<&'static str> {
    match speed {
        Some(s) if s > 60.0 => Some("Stormy"),
        Some(s) if s > 35.0 => Some("Windy"),
        _ => None,
    }
}

pub fn is_night(local_hour: u32) -> bool {
    !(7..=17).contains(&local_hour)
}

pub fn local_hour(ts: DateTime<Utc>, tz: Tz) -> u32 {
    ts.with_timezone(&tz).hour()
}

/// Forecast edition from the local hour the report was issued.
pub fn edition_for_hour(local_hour: u32) -> &'static str {
    if local_hour < 12 {
        "AM"
    } else if local_hour < 18 {
        "PM"
    } else {
        "Night"
    }
}

/// Local wall time plus a constant number of hours, no DST.
pub fn fixed_offset_to_utc(local: NaiveDateTime, offset_hours: i64) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(local + TimeDelta::hours(offset_hours)))
}

/// Local wall time in a named zone. Times inside a DST gap shift forward an
/// hour.
pub fn zoned_to_utc(local: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + TimeDelta::hours(1))).earliest())
        .map(|ts| ts.with_timezone(&Utc))
}

/// A bare month/day more than six months ahead belongs to last year.
pub fn resolve_year(month: u32, today: NaiveDate) -> i32 {
    if month > today.month() + 6 {
        today.year() - 1
    } else {
        today.year()
    }
}

pub fn month_from_name(raw: &str) -> Option<u32> {
    let lower = raw.trim().to_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// "Dec 4", "December 04" or "Thu, Dec 4" resolved with [`resolve_year`].
pub fn parse_month_day(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let mut month = None;
    let mut day = None;
    for token in raw.split(|c: char| c.is_whitespace() || c == ',' || c == '.') {
        if token.is_empty() {
            continue;
        }
        if month.is_none()
            && token.chars().all(char::is_alphabetic)
            && let Some(m) = month_from_name(token)
        {
            month = Some(m);
            continue;
        }
        if month.is_some() && day.is_none() {
            let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
            if let Ok(d) = digits.parse::<u32>() {
                day = Some(d);
            }
        }
    }
    let (month, day) = (month?, day?);
    NaiveDate::from_ymd_opt(resolve_year(month, today), month, day)
}

/// Collapses runs of whitespace.
pub fn clean_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn coerces_ranges_signs_and_placeholders() {
        assert_eq!(coerce_number("2-5cm"), 4);
        assert_eq!(coerce_number("-3"), -3);
        assert_eq!(coerce_number("-5--2"), -4);
        assert_eq!(coerce_number("trace"), 0);
        assert_eq!(coerce_number("-"), 0);
        assert_eq!(coerce_number(""), 0);
        assert_eq!(coerce_number("nan"), 0);
        assert_eq!(coerce_number("12 cm"), 12);
        assert_eq!(coerce_number("1,100 m"), 1100);
    }

    #[test]
    fn range_midpoints_round_half_to_even() {
        assert_eq!(coerce_number("0-1"), 0);
        assert_eq!(coerce_number("2-3"), 2);
        assert_eq!(coerce_number("3-4 cm"), 4);
        assert_eq!(coerce_number("2.5-5"), 4);
    }

    #[test]
    fn grouped_ints_are_not_ranges() {
        assert_eq!(parse_grouped_int("1,100"), Some(1100));
        assert_eq!(parse_grouped_int("2,200 m"), Some(2200));
        assert_eq!(parse_grouped_int("-"), None);
        assert_eq!(parse_grouped_int("abc"), None);
        assert_eq!(parse_grouped_int("2.5"), Some(2));
    }

    #[test]
    fn parses_station_decimals() {
        assert_eq!(parse_decimal("-3.4°C"), Some(-3.4));
        assert_eq!(parse_decimal("87%"), Some(87.0));
        assert_eq!(parse_decimal("1,013.2 mb"), Some(1013.2));
        assert_eq!(parse_decimal("n/a"), None);
    }

    #[test]
    fn selects_precipitation_kind() {
        assert_eq!(classify_precipitation(3, 5), (PrecipKind::Snow, 3));
        assert_eq!(classify_precipitation(0, 5), (PrecipKind::Rain, 5));
        assert_eq!(classify_precipitation(0, 0), (PrecipKind::None, 0));
    }

    #[test]
    fn sky_condition_precedence() {
        let snowing = SkyInputs {
            temperature_c: Some(-4.0),
            humidity_pct: Some(50.0),
            wind_speed_kmh: Some(40.0),
            precipitating: true,
            local_hour: 12,
            ai_label: Some(SkyLabel::Bluebird),
        };
        assert_eq!(sky_condition(&snowing), "Snowing & Windy");

        let raining = SkyInputs {
            temperature_c: Some(2.0),
            precipitating: true,
            ..SkyInputs::default()
        };
        assert_eq!(sky_condition(&raining), "Raining");

        let ai = SkyInputs {
            humidity_pct: Some(99.0),
            ai_label: Some(SkyLabel::Sunny),
            wind_speed_kmh: Some(70.0),
            local_hour: 10,
            ..SkyInputs::default()
        };
        assert_eq!(sky_condition(&ai), "Sunny & Stormy");

        let humid = SkyInputs {
            humidity_pct: Some(90.0),
            local_hour: 10,
            ..SkyInputs::default()
        };
        assert_eq!(sky_condition(&humid), "Overcast");
    }

    #[test]
    fn humidity_missing_falls_back_to_time_of_day() {
        let night = SkyInputs {
            local_hour: 22,
            ..SkyInputs::default()
        };
        let day_time = SkyInputs {
            local_hour: 11,
            ..SkyInputs::default()
        };
        assert_eq!(sky_condition(&night), "Night");
        assert_eq!(sky_condition(&day_time), "Cloudy");
    }

    #[test]
    fn bare_dates_resolve_to_plausible_year() {
        let december = day(2025, 12, 10);
        assert_eq!(parse_month_day("Oct 15", december), Some(day(2025, 10, 15)));
        assert_eq!(parse_month_day("Dec 4", december), Some(day(2025, 12, 4)));

        let march = day(2026, 3, 10);
        assert_eq!(parse_month_day("Nov 20", march), Some(day(2025, 11, 20)));
        assert_eq!(parse_month_day("Thu, Mar 5", march), Some(day(2026, 3, 5)));
    }

    #[test]
    fn converts_local_times() {
        let local = NaiveDate::from_ymd_opt(2025, 12, 8)
            .unwrap()
            .and_hms_opt(16, 0, 0)
            .unwrap();
        assert_eq!(
            fixed_offset_to_utc(local, 8).to_rfc3339(),
            "2025-12-09T00:00:00+00:00"
        );
        assert_eq!(
            zoned_to_utc(local, chrono_tz::America::Vancouver)
                .unwrap()
                .to_rfc3339(),
            "2025-12-09T00:00:00+00:00"
        );
    }

    #[test]
    fn edition_tracks_issue_hour() {
        assert_eq!(edition_for_hour(6), "AM");
        assert_eq!(edition_for_hour(16), "PM");
        assert_eq!(edition_for_hour(20), "Night");
    }
}
