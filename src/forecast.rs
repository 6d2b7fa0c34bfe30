use crate::model::{Extracted, ForecastEntry, NextUpdate, PageMeta, RawRow};
use crate::normalize::{
    classify_precipitation, clean_text, coerce_number, edition_for_hour, fixed_offset_to_utc,
    local_hour, zoned_to_utc,
};
use crate::parser::{element_text, selector};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::debug;

const WIND_DIRECTIONS: [&str; 8] = [
    "northeast",
    "northwest",
    "southeast",
    "southwest",
    "north",
    "south",
    "east",
    "west",
];

static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
static UPDATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Updated:\s*(\d+)\s*(min|hour)").expect("valid regex"));
static ISSUED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Issued:\s*(\d{1,2})\s*(am|pm)\s+(\d{1,2})\s+([A-Za-z]+)\s+(\d{4})")
        .expect("valid regex")
});
static HIGH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"High\s*(-?\d+)").expect("valid regex"));
static LOW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Low\s*(-?\d+)").expect("valid regex"));
static GUST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gusting (?:to )?([\d-]+)").expect("valid regex"));

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn numbers_in(text: &str) -> Vec<i64> {
    DIGITS_RE
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

/// Repeats each cell value by its column span.
pub fn expand_colspan(cells: &[(String, usize)]) -> Vec<String> {
    cells
        .iter()
        .flat_map(|(value, span)| std::iter::repeat_n(value.clone(), (*span).max(1)))
        .collect()
}

fn colspan(cell: ElementRef<'_>) -> usize {
    cell.value()
        .attr("colspan")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1)
}

enum CellValue<'a> {
    Text,
    Inner(&'a Selector),
    Attr(&'a str),
}

fn table_row(table: ElementRef<'_>, name: &str, value: CellValue<'_>) -> Option<Vec<String>> {
    let row_sel = selector(&format!("tr[data-row=\"{name}\"]"))?;
    let td_sel = selector("td")?;
    let row = table.select(&row_sel).next()?;
    let cells: Vec<(String, usize)> = row
        .select(&td_sel)
        .map(|cell| {
            let text = match &value {
                CellValue::Text => element_text(cell),
                CellValue::Inner(inner) => cell
                    .select(inner)
                    .next()
                    .map(element_text)
                    .unwrap_or_else(|| "-".to_string()),
                CellValue::Attr(attr) => cell.value().attr(attr).unwrap_or("-").trim().to_string(),
            };
            (text, colspan(cell))
        })
        .collect();
    Some(expand_colspan(&cells))
}

fn wind_row(table: ElementRef<'_>) -> Option<Vec<(String, String)>> {
    let (row_sel, td_sel, val_sel, tip_sel) = (
        selector("tr[data-row=\"wind\"]")?,
        selector("td")?,
        selector(".wind-icon__val")?,
        selector(".wind-icon__tooltip")?,
    );
    let row = table.select(&row_sel).next()?;
    let mut out = Vec::new();
    for cell in row.select(&td_sel) {
        let speed = cell
            .select(&val_sel)
            .next()
            .map(element_text)
            .unwrap_or_else(|| "0".to_string());
        let direction = cell
            .select(&tip_sel)
            .next()
            .map(element_text)
            .unwrap_or_else(|| "Unknown".to_string());
        for _ in 0..colspan(cell).max(1) {
            out.push((speed.clone(), direction.clone()));
        }
    }
    Some(out)
}

fn document_text(document: &Html) -> String {
    clean_text(&document.root_element().text().collect::<Vec<_>>().join(" "))
}

fn table_report_time(document: &Html, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    if let Some(intro_sel) = selector("div.weather-intro")
        && let Some(intro) = document.select(&intro_sel).next()
    {
        let text = element_text(intro);
        if let Some(caps) = UPDATED_RE.captures(&text) {
            let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
            let delta = if caps.get(2)?.as_str() == "min" {
                TimeDelta::minutes(amount)
            } else {
                TimeDelta::hours(amount)
            };
            return Some(now - delta);
        }
    }

    let text = document_text(document);
    let caps = ISSUED_RE.captures(&text)?;
    let composed = format!(
        "{} {} {} {} {}",
        &caps[1],
        caps[2].to_uppercase(),
        &caps[3],
        &caps[4],
        &caps[5]
    );
    let local = NaiveDateTime::parse_from_str(&format!("{composed} 00"), "%I %p %d %b %Y %M").ok()?;
    zoned_to_utc(local, tz)
}

fn table_countdown(document: &Html) -> Option<NextUpdate> {
    let update = document.select(&selector("span.location-issued__update")?).next()?;
    let part = |css: &str| -> Option<i64> {
        let sel = selector(css)?;
        let text = update.select(&sel).next().map(element_text)?;
        text.trim().parse().ok()
    };
    let hours = part("span.hours").unwrap_or(0);
    let minutes = part("span.minutes").unwrap_or(0);
    Some(NextUpdate::Countdown(hours * 60 + minutes))
}

fn table_synopsis(document: &Html) -> Option<String> {
    let sel = selector("div.about-weather-summary__content p.about-weather-summary__text-block")?;
    document
        .select(&sel)
        .map(element_text)
        .find(|text| text.contains("Weather (Next 3 days):"))
        .map(|text| match text.split_once("):") {
            Some((_, rest)) => rest.trim().to_string(),
            None => text,
        })
}

/// Tabular six-day forecast. `now` anchors relative report times.
pub fn extract_table_forecast(html: &str, now: DateTime<Utc>, tz: Tz) -> Extracted {
    let document = Html::parse_document(html);
    let report_time = table_report_time(&document, now, tz).unwrap_or(now);
    let meta = PageMeta {
        report_time: Some(report_time),
        next_update: table_countdown(&document),
        synopsis: table_synopsis(&document),
        edition: Some(edition_for_hour(local_hour(report_time, tz)).to_string()),
        about: None,
    };

    let Some(table) = selector("table.forecast-table__table")
        .and_then(|sel| document.select(&sel).next())
    else {
        return Extracted {
            rows: Vec::new(),
            meta,
        };
    };

    let inner = |css: &str| selector(css);
    let (Some(phrase), Some(snow), Some(rain), Some(temp), Some(level)) = (
        inner(".forecast-table__phrase"),
        inner(".snow-amount__value"),
        inner(".rain-amount__value"),
        inner(".temp-value"),
        inner(".level-value"),
    ) else {
        return Extracted {
            rows: Vec::new(),
            meta,
        };
    };

    let dates = table_row(table, "days", CellValue::Attr("data-date")).unwrap_or_default();
    let width = dates.len();
    let filled = |values: Option<Vec<String>>, placeholder: &str| {
        let mut values = values.unwrap_or_default();
        values.resize(width, placeholder.to_string());
        values
    };

    let times: Vec<String> = filled(table_row(table, "time", CellValue::Text), "-")
        .into_iter()
        .map(|t| if t == "night" { "Night".to_string() } else { t })
        .collect();
    let phrases = filled(table_row(table, "phrases", CellValue::Inner(&phrase)), "-");
    let snows = filled(table_row(table, "snow", CellValue::Inner(&snow)), "-");
    let rains = filled(table_row(table, "rain", CellValue::Inner(&rain)), "-");
    let highs = filled(table_row(table, "temperature-max", CellValue::Inner(&temp)), "-");
    let lows = filled(table_row(table, "temperature-min", CellValue::Inner(&temp)), "-");
    let levels = filled(table_row(table, "freezing-level", CellValue::Inner(&level)), "-");
    let mut winds = wind_row(table).unwrap_or_default();
    winds.resize(width, ("0".to_string(), "Unknown".to_string()));

    let rows = (0..width)
        .map(|i| {
            let mut raw = RawRow::new();
            raw.insert("date".to_string(), dates[i].clone());
            raw.insert("period".to_string(), times[i].clone());
            raw.insert("summary".to_string(), phrases[i].clone());
            raw.insert("snow".to_string(), snows[i].clone());
            raw.insert("rain".to_string(), rains[i].clone());
            raw.insert("high".to_string(), highs[i].clone());
            raw.insert("low".to_string(), lows[i].clone());
            raw.insert("freezing".to_string(), levels[i].clone());
            raw.insert("wind_speed".to_string(), winds[i].0.clone());
            raw.insert("wind_direction".to_string(), winds[i].1.clone());
            raw
        })
        .collect();

    Extracted { rows, meta }
}

pub fn forecasts_from_table(
    extracted: &Extracted,
    elevation: &str,
    elevation_page_id: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<ForecastEntry> {
    let Some(report_time) = extracted.meta.report_time else {
        return Vec::new();
    };
    let field = |raw: &RawRow, key: &str| raw.get(key).cloned().unwrap_or_default();

    extracted
        .rows
        .iter()
        .filter_map(|raw| {
            let date_raw = field(raw, "date");
            let Some(forecast_date) = NaiveDate::parse_from_str(date_raw.trim(), "%Y-%m-%d").ok()
            else {
                debug!(%elevation, date = %date_raw, "forecast column without a date dropped");
                return None;
            };
            let (kind, amount) = classify_precipitation(
                coerce_number(&field(raw, "snow")),
                coerce_number(&field(raw, "rain")),
            );
            Some(ForecastEntry {
                elevation: elevation.to_string(),
                report_time,
                forecast_date,
                period: field(raw, "period"),
                summary: field(raw, "summary"),
                high_c: Some(coerce_number(&field(raw, "high"))),
                low_c: Some(coerce_number(&field(raw, "low"))),
                freezing_level_m: Some(coerce_number(&field(raw, "freezing"))),
                precip_type: kind.as_str().to_string(),
                precip_amount: amount,
                wind_speed_kmh: coerce_number(&field(raw, "wind_speed")),
                wind_direction: field(raw, "wind_direction"),
                wind_strength: None,
                synopsis: extracted.meta.synopsis.clone(),
                edition: extracted.meta.edition.clone(),
                next_update: extracted.meta.next_update.map(|n| n.timestamp(now)),
                about: None,
                elevation_page_id: elevation_page_id.map(ToString::to_string),
            })
        })
        .collect()
}

/// "December 8, 2025 3pm", optionally led by a weekday, as local time at a
/// fixed offset from UTC.
pub fn parse_alpine_time(raw: &str, offset_hours: i64) -> Option<DateTime<Utc>> {
    let text = clean_text(raw.trim().trim_end_matches('.')).to_uppercase();
    let candidates = match text.split_once(' ') {
        Some((first, rest)) if first.parse::<Weekday>().is_ok() => {
            vec![rest.to_string(), text.clone()]
        }
        _ => vec![text.clone()],
    };
    for candidate in candidates {
        if let Ok(local) = NaiveDateTime::parse_from_str(&candidate, "%B %d, %Y %I:%M%p") {
            return Some(fixed_offset_to_utc(local, offset_hours));
        }
        // Hour-only layouts: pin the minute so the time is complete.
        let pinned = format!("{candidate} 00");
        for format in ["%B %d, %Y %I%p %M", "%B %d %Y %I%p %M", "%B %d, %Y %I %p %M"] {
            if let Ok(local) = NaiveDateTime::parse_from_str(&pinned, format) {
                return Some(fixed_offset_to_utc(local, offset_hours));
            }
        }
    }
    None
}

fn after_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.split_once(marker).map(|(_, rest)| rest.trim())
}

fn card_meta(document: &Html, offset_hours: i64) -> PageMeta {
    let mut meta = PageMeta::default();

    if let (Some(block_sel), Some(span_sel)) =
        (selector("div.alpine__time-container"), selector("span"))
    {
        for block in document.select(&block_sel) {
            let text = element_text(block);
            if let Some(rest) = after_marker(&text, "Report date:") {
                let date_part = rest.split("Forecast type:").next().unwrap_or(rest);
                meta.report_time = parse_alpine_time(date_part, offset_hours);
                meta.edition = block
                    .select(&span_sel)
                    .next()
                    .map(element_text)
                    .filter(|t| !t.is_empty());
            }
            if let Some(rest) = after_marker(&text, "Next update:") {
                meta.next_update = parse_alpine_time(rest, offset_hours).map(NextUpdate::At);
            }
        }
    }

    if let (Some(summary_sel), Some(p_sel)) = (selector("div.summaryContent"), selector("p"))
        && let Some(summary) = document.select(&summary_sel).next()
    {
        let texts: Vec<String> = summary
            .select(&p_sel)
            .filter(|p| !p.value().classes().any(|c| c == "synopsis-title"))
            .map(element_text)
            .filter(|t| !t.is_empty())
            .collect();
        if !texts.is_empty() {
            meta.synopsis = Some(texts.join("\n"));
        }
    }

    meta.about = selector("p.typeDetails")
        .and_then(|sel| document.select(&sel).next())
        .map(element_text);

    meta
}

fn freezing_text(card: ElementRef<'_>) -> Option<String> {
    let candidates = selector("p, li, div")?;
    let span = selector("span")?;
    card.select(&candidates)
        .filter(|el| element_text(*el).contains("Freezing Level"))
        .filter_map(|el| el.select(&span).next().map(|s| (element_text(el).len(), element_text(s))))
        .min_by_key(|(len, _)| *len)
        .map(|(_, text)| text)
}

/// One `div.alpine__card` per forecast period.
pub fn extract_card_forecast(html: &str, now: DateTime<Utc>, offset_hours: i64) -> Extracted {
    let document = Html::parse_document(html);
    let mut meta = card_meta(&document, offset_hours);
    if meta.report_time.is_none() {
        meta.report_time = Some(now);
    }

    let Some(card_sel) = selector("div.alpine__card") else {
        return Extracted {
            rows: Vec::new(),
            meta,
        };
    };
    let text_of = |card: ElementRef<'_>, css: &str| {
        selector(css)
            .and_then(|sel| card.select(&sel).next())
            .map(element_text)
    };

    let rows = document
        .select(&card_sel)
        .filter_map(|card| {
            let day = text_of(card, "h3.alpine__card-period")?;
            let mut raw = RawRow::new();
            raw.insert("day".to_string(), day);
            let optional = [
                ("precip", text_of(card, "p[class*='precip']")),
                ("freezing", freezing_text(card)),
                ("temps", text_of(card, "p.alpine__card-temps")),
                ("wind", text_of(card, "p.alpine__card-wind")),
                ("summary", text_of(card, "p.alpine__card-summary")),
            ];
            for (key, value) in optional {
                if let Some(value) = value {
                    raw.insert(key.to_string(), value);
                }
            }
            Some(raw)
        })
        .collect();

    Extracted { rows, meta }
}

/// Calendar date a card label refers to, or `None` for labels that name no
/// day of the week.
pub fn resolve_card_date(
    label: &str,
    report_date: NaiveDate,
    has_today: bool,
) -> Option<NaiveDate> {
    let lower = label.trim().to_lowercase();
    if lower == "today" || lower == "tonight" {
        return Some(report_date);
    }
    let target = lower.parse::<Weekday>().ok()?;
    let current = report_date.weekday().num_days_from_monday() as i64;
    let mut ahead = (target.num_days_from_monday() as i64 - current + 7) % 7;
    if ahead == 0 && has_today {
        ahead = 7;
    }
    Some(report_date + TimeDelta::days(ahead))
}

fn wind_direction(text: &str) -> String {
    let lower = text.to_lowercase();
    WIND_DIRECTIONS
        .iter()
        .find(|d| lower.contains(*d))
        .map(|d| {
            let mut chars = d.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .unwrap_or_else(|| "Unknown".to_string())
}

pub fn forecasts_from_cards(
    extracted: &Extracted,
    elevation: &str,
    elevation_page_id: Option<&str>,
    now: DateTime<Utc>,
    offset_hours: i64,
) -> Vec<ForecastEntry> {
    let report_time = extracted.meta.report_time.unwrap_or(now);
    let report_date = (report_time - TimeDelta::hours(offset_hours)).date_naive();
    let day_of = |raw: &RawRow| raw.get("day").map(|d| d.trim().to_lowercase()).unwrap_or_default();
    let has_today = extracted.rows.iter().any(|raw| day_of(raw) == "today");

    extracted
        .rows
        .iter()
        .filter_map(|raw| {
            let label = raw.get("day")?.trim().to_string();
            let lower = day_of(raw);
            if lower == "tonight" && has_today {
                return None;
            }
            let Some(forecast_date) = resolve_card_date(&label, report_date, has_today) else {
                debug!(%elevation, day = %label, "card with unknown day name dropped");
                return None;
            };

            let precip = raw.get("precip").cloned().unwrap_or_default();
            let (precip_type, precip_amount) =
                if let Some(amount) = after_marker(&precip, "Snow:") {
                    ("Snow", coerce_number(amount).abs())
                } else if let Some(amount) = after_marker(&precip, "Rain:") {
                    ("Rain", coerce_number(amount).abs())
                } else {
                    ("None", 0)
                };

            let temps = raw.get("temps").cloned().unwrap_or_default();
            let temp = |re: &Regex| capture(re, &temps).and_then(|v| v.parse::<i64>().ok());

            let wind = raw.get("wind").cloned().unwrap_or_default();
            let gust = capture(&GUST_RE, &wind).map(|g| format!("{g} km/h"));

            Some(ForecastEntry {
                elevation: elevation.to_string(),
                report_time,
                forecast_date,
                period: if lower == "tonight" { "Night" } else { "Day" }.to_string(),
                summary: raw
                    .get("summary")
                    .cloned()
                    .unwrap_or_else(|| "No summary".to_string()),
                high_c: temp(&HIGH_RE),
                low_c: temp(&LOW_RE),
                freezing_level_m: raw
                    .get("freezing")
                    .and_then(|text| numbers_in(text).last().copied()),
                precip_type: precip_type.to_string(),
                precip_amount,
                wind_speed_kmh: numbers_in(&wind).first().copied().unwrap_or(0),
                wind_direction: wind_direction(&wind),
                wind_strength: gust,
                synopsis: extracted.meta.synopsis.clone(),
                edition: extracted.meta.edition.clone(),
                next_update: extracted.meta.next_update.map(|n| n.timestamp(now)),
                about: extracted.meta.about.clone(),
                elevation_page_id: elevation_page_id.map(ToString::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TABLE: &str = r#"
        <div class="weather-intro">Issued: 4 pm 8 Dec 2025 (local time)</div>
        <span class="location-issued__update"><span class="hours">02</span>h <span class="minutes">15</span>m</span>
        <div class="about-weather-summary__content">
          <p class="about-weather-summary__text-block">Whistler Blackcomb Weather (Next 3 days): Heavy snow Tuesday.</p>
        </div>
        <table class="forecast-table__table">
          <tr data-row="days"><td colspan="3" data-date="2025-12-09"></td></tr>
          <tr data-row="time"><td>AM</td><td>PM</td><td>night</td></tr>
          <tr data-row="phrases"><td colspan="3"><span class="forecast-table__phrase">snow</span></td></tr>
          <tr data-row="snow"><td><span class="snow-amount__value">5-10</span></td><td><span class="snow-amount__value">-</span></td><td></td></tr>
          <tr data-row="temperature-max"><td><span class="temp-value">-2</span></td><td><span class="temp-value">-1</span></td><td><span class="temp-value">-5</span></td></tr>
          <tr data-row="temperature-min"><td><span class="temp-value">-6</span></td><td><span class="temp-value">-4</span></td><td><span class="temp-value">-9</span></td></tr>
          <tr data-row="freezing-level"><td><span class="level-value">1,100</span></td><td><span class="level-value">1200</span></td><td><span class="level-value">900</span></td></tr>
        </table>
    "#;

    #[test]
    fn colspan_three_repeats_value() {
        let cells = vec![("V".to_string(), 3)];
        assert_eq!(expand_colspan(&cells), vec!["V", "V", "V"]);
    }

    #[test]
    fn table_layout_expands_columns_and_fills_placeholders() {
        let tz = chrono_tz::America::Vancouver;
        let now = Utc.with_ymd_and_hms(2025, 12, 9, 1, 0, 0).unwrap();
        let extracted = extract_table_forecast(TABLE, now, tz);

        assert_eq!(extracted.rows.len(), 3);
        assert_eq!(extracted.rows[2].get("period").map(String::as_str), Some("Night"));
        assert_eq!(extracted.rows[1].get("summary").map(String::as_str), Some("snow"));
        assert_eq!(extracted.rows[0].get("rain").map(String::as_str), Some("-"));
        assert_eq!(extracted.rows[0].get("wind_direction").map(String::as_str), Some("Unknown"));

        let meta = &extracted.meta;
        assert_eq!(
            meta.report_time,
            Some(Utc.with_ymd_and_hms(2025, 12, 9, 0, 0, 0).unwrap())
        );
        assert_eq!(meta.next_update, Some(NextUpdate::Countdown(135)));
        assert_eq!(meta.edition.as_deref(), Some("PM"));
        assert_eq!(meta.synopsis.as_deref(), Some("Heavy snow Tuesday."));

        let entries = forecasts_from_table(&extracted, "1480m", Some("elev-1"), now);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].precip_type, "Snow");
        assert_eq!(entries[0].precip_amount, 8);
        assert_eq!(entries[0].freezing_level_m, Some(1100));
        assert_eq!(entries[1].precip_type, "None");
        assert_eq!(entries[2].forecast_date, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
        assert_eq!(
            entries[0].next_update,
            Some(Utc.with_ymd_and_hms(2025, 12, 9, 3, 15, 0).unwrap())
        );
    }

    #[test]
    fn updated_minutes_ago_is_relative_to_now() {
        let now = Utc.with_ymd_and_hms(2025, 12, 9, 1, 0, 0).unwrap();
        let html = r#"<div class="weather-intro">Updated: 40 min ago</div>"#;
        let extracted = extract_table_forecast(html, now, chrono_tz::America::Vancouver);
        assert_eq!(
            extracted.meta.report_time,
            Some(Utc.with_ymd_and_hms(2025, 12, 9, 0, 20, 0).unwrap())
        );
        assert!(extracted.rows.is_empty());
    }

    #[test]
    fn parses_alpine_timestamps_at_fixed_offset() {
        assert_eq!(
            parse_alpine_time("Monday December 8, 2025 3pm.", 8),
            Some(Utc.with_ymd_and_hms(2025, 12, 8, 23, 0, 0).unwrap())
        );
        assert_eq!(
            parse_alpine_time("Tuesday December 9 2025 4am", 8),
            Some(Utc.with_ymd_and_hms(2025, 12, 9, 12, 0, 0).unwrap())
        );
        assert_eq!(parse_alpine_time("sometime soon", 8), None);
    }

    #[test]
    fn card_days_resolve_against_report_date() {
        let monday = NaiveDate::from_ymd_opt(2025, 12, 8).unwrap();
        assert_eq!(resolve_card_date("Today", monday, true), Some(monday));
        assert_eq!(
            resolve_card_date("Wednesday", monday, true),
            NaiveDate::from_ymd_opt(2025, 12, 10)
        );
        assert_eq!(
            resolve_card_date("Monday", monday, true),
            NaiveDate::from_ymd_opt(2025, 12, 15)
        );
        assert_eq!(resolve_card_date("Monday", monday, false), Some(monday));
        assert_eq!(resolve_card_date("Later", monday, true), None);
    }

    #[test]
    fn card_layout_end_to_end() {
        let html = r#"
            <div class="alpine__container">
              <div class="alpine__time-container">Report date: Monday December 8, 2025 3pm. Forecast type: <span>Regular</span></div>
              <div class="alpine__time-container">Next update: Tuesday December 9, 2025 4am</div>
              <div class="summaryContent"><p class="synopsis-title">Synopsis</p><p>A ridge builds.</p><p>Clearing later.</p></div>
              <p class="typeDetails">Forecast for the alpine.</p>
              <div class="alpine__card">
                <h3 class="alpine__card-period">Today</h3>
                <p class="alpine__card-precip">Snow: Trace-2cm</p>
                <p class="alpine__card-temps">High -3 Low -8</p>
                <p class="alpine__card-wind">Southwest 20 km/h gusting to 50</p>
                <p class="alpine__card-summary">Flurries.</p>
                <p>Freezing Level: <span>1200-1500 m</span></p>
              </div>
              <div class="alpine__card">
                <h3 class="alpine__card-period">Tonight</h3>
              </div>
              <div class="alpine__card">
                <h3 class="alpine__card-period">Tuesday</h3>
                <p class="alpine__card-precip">Rain: 4mm</p>
                <p class="alpine__card-wind">Light winds</p>
              </div>
            </div>
        "#;
        let now = Utc.with_ymd_and_hms(2025, 12, 9, 0, 0, 0).unwrap();
        let extracted = extract_card_forecast(html, now, 8);
        assert_eq!(extracted.rows.len(), 3);
        assert_eq!(extracted.meta.edition.as_deref(), Some("Regular"));
        assert_eq!(extracted.meta.synopsis.as_deref(), Some("A ridge builds.\nClearing later."));
        assert_eq!(extracted.meta.about.as_deref(), Some("Forecast for the alpine."));

        let entries = forecasts_from_cards(&extracted, "1800m", None, now, 8);
        assert_eq!(entries.len(), 2);

        let today = &entries[0];
        assert_eq!(today.forecast_date, NaiveDate::from_ymd_opt(2025, 12, 8).unwrap());
        assert_eq!(today.period, "Day");
        assert_eq!(today.precip_type, "Snow");
        assert_eq!(today.precip_amount, 1);
        assert_eq!(today.high_c, Some(-3));
        assert_eq!(today.low_c, Some(-8));
        assert_eq!(today.freezing_level_m, Some(1500));
        assert_eq!(today.wind_direction, "Southwest");
        assert_eq!(today.wind_speed_kmh, 20);
        assert_eq!(today.wind_strength.as_deref(), Some("50 km/h"));
        assert_eq!(
            today.next_update,
            Some(Utc.with_ymd_and_hms(2025, 12, 9, 12, 0, 0).unwrap())
        );

        let tuesday = &entries[1];
        assert_eq!(tuesday.forecast_date, NaiveDate::from_ymd_opt(2025, 12, 9).unwrap());
        assert_eq!(tuesday.precip_type, "Rain");
        assert_eq!(tuesday.precip_amount, 4);
        assert_eq!(tuesday.wind_speed_kmh, 0);
        assert_eq!(tuesday.summary, "No summary");
    }
}
