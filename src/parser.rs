use crate::classify::SkyLabel;
use crate::model::{Extracted, Lift, RawRow, SnowfallRecord, StationReading};
use crate::normalize::{
    SkyInputs, clean_text, coerce_number, local_hour, parse_decimal, parse_grouped_int,
    parse_month_day, sky_condition, zoned_to_utc,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

pub(crate) fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn absolutize_url(base_url: &str, value: &str) -> String {
    if value.starts_with("http://") || value.starts_with("https://") {
        return value.to_string();
    }

    if let Ok(base) = Url::parse(base_url)
        && let Ok(joined) = base.join(value)
    {
        return joined.to_string();
    }

    value.to_string()
}

fn row(pairs: &[(&str, String)]) -> RawRow {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// `div.row` blocks with name, bottom and top cells.
pub fn extract_lifts(html: &str) -> Extracted {
    let (Some(row_sel), Some(cell_sel)) = (selector("div.row"), selector("div.cell")) else {
        return Extracted::empty();
    };
    let document = Html::parse_document(html);
    let mut rows = Vec::new();

    for element in document.select(&row_sel) {
        let cells: Vec<String> = element.select(&cell_sel).map(element_text).collect();
        if cells.len() < 3 {
            continue;
        }
        let name = cells[0].trim();
        if name.is_empty() || name.eq_ignore_ascii_case("lift name") {
            continue;
        }
        rows.push(row(&[
            ("name", name.to_string()),
            ("bottom", cells[1].clone()),
            ("top", cells[2].clone()),
        ]));
    }

    Extracted {
        rows,
        ..Extracted::default()
    }
}

pub fn lifts_from_rows(rows: &[RawRow]) -> Vec<Lift> {
    rows.iter()
        .filter_map(|raw| {
            let name = raw.get("name")?.trim().to_string();
            let bottom = raw.get("bottom").and_then(|v| parse_grouped_int(v));
            let top = raw.get("top").and_then(|v| parse_grouped_int(v));
            match (bottom, top) {
                (Some(bottom_m), Some(top_m)) => Some(Lift {
                    name,
                    bottom_m,
                    top_m,
                }),
                _ => {
                    debug!(lift = %name, "lift row without numeric elevations dropped");
                    None
                }
            }
        })
        .collect()
}

/// Text lines of `#content_history` after the `Base` header, four per day.
pub fn extract_history(html: &str) -> Extracted {
    let Some(content_sel) = selector("#content_history") else {
        return Extracted::empty();
    };
    let document = Html::parse_document(html);
    let Some(content) = document.select(&content_sel).next() else {
        return Extracted::empty();
    };

    let lines: Vec<String> = content
        .text()
        .flat_map(|chunk| chunk.split('\n'))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();

    let Some(anchor) = lines.iter().position(|line| line == "Base") else {
        return Extracted::empty();
    };

    let rows = lines[anchor + 1..]
        .chunks_exact(4)
        .map(|chunk| {
            row(&[
                ("date", chunk[0].clone()),
                ("new_snow", chunk[1].clone()),
                ("season_total", chunk[2].clone()),
                ("base", chunk[3].clone()),
            ])
        })
        .collect();

    Extracted {
        rows,
        ..Extracted::default()
    }
}

pub fn history_from_rows(
    rows: &[RawRow],
    today: NaiveDate,
    season_page_id: Option<&str>,
) -> Vec<SnowfallRecord> {
    let number = |raw: &RawRow, key: &str| raw.get(key).map(|v| coerce_number(v)).unwrap_or(0);
    rows.iter()
        .filter_map(|raw| {
            let Some(date) = raw.get("date").and_then(|d| parse_month_day(d, today)) else {
                debug!(date = ?raw.get("date"), "history row with unreadable date dropped");
                return None;
            };
            Some(SnowfallRecord {
                date,
                new_snow_cm: number(raw, "new_snow"),
                season_total_cm: number(raw, "season_total"),
                base_cm: number(raw, "base"),
                season_page_id: season_page_id.map(ToString::to_string),
            })
        })
        .collect()
}

fn station_field(header: &str) -> Option<&'static str> {
    let label = header.to_lowercase();
    let field = if label.contains("chill") {
        "wind_chill"
    } else if label.contains("dir") {
        "wind_direction"
    } else if label.contains("speed") || label.contains("wind") {
        "wind_speed"
    } else if label.contains("temp") {
        "temp"
    } else if label.contains("humid") || label == "rh" {
        "humidity"
    } else if label.contains("press") || label.contains("baro") {
        "pressure"
    } else if label.contains("new") {
        "new_snow"
    } else if label.contains("depth") || label.contains("snow") {
        "snow_depth"
    } else if label.contains("precip") {
        "precip"
    } else if label.contains("time") || label.contains("date") {
        "time"
    } else {
        return None;
    };
    Some(field)
}

/// Header-driven `table.station-data`, falling back to the headline
/// `.tempValue` when the table is absent.
pub fn extract_station(html: &str) -> Extracted {
    let (Some(table_sel), Some(tr_sel), Some(th_sel), Some(td_sel), Some(temp_sel)) = (
        selector("table.station-data"),
        selector("tr"),
        selector("th"),
        selector("td"),
        selector(".tempValue"),
    ) else {
        return Extracted::empty();
    };
    let document = Html::parse_document(html);

    if let Some(table) = document.select(&table_sel).next() {
        let headers: Vec<Option<&'static str>> = table
            .select(&th_sel)
            .map(|th| station_field(&element_text(th)))
            .collect();
        let mut rows = Vec::new();
        for tr in table.select(&tr_sel) {
            let cells: Vec<String> = tr.select(&td_sel).map(element_text).collect();
            if cells.is_empty() || cells.len() < headers.len() {
                continue;
            }
            let mut raw = RawRow::new();
            for (field, value) in headers.iter().zip(cells) {
                if let Some(field) = field {
                    raw.insert((*field).to_string(), value);
                }
            }
            rows.push(raw);
        }
        return Extracted {
            rows,
            ..Extracted::default()
        };
    }

    match document.select(&temp_sel).next() {
        Some(temp) => Extracted {
            rows: vec![row(&[("temp", element_text(temp))])],
            ..Extracted::default()
        },
        None => Extracted::empty(),
    }
}

/// Webcam frame URLs for 1-based gallery positions.
pub fn extract_webcams(html: &str, indices: &[usize], page_url: &str) -> Vec<String> {
    let (Some(item_sel), Some(img_sel), Some(fallback_sel)) = (
        selector("#cam-gallery .thumbnail-list li"),
        selector("img"),
        selector(".container_wind img, .webcam-image img, img[src*='webcam']"),
    ) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let image_src = |img: ElementRef<'_>| {
        img.value()
            .attr("src")
            .or_else(|| img.value().attr("data-src"))
            .map(str::trim)
            .filter(|src| !src.is_empty())
            .map(ToString::to_string)
    };

    let gallery: Vec<ElementRef<'_>> = document.select(&item_sel).collect();
    let candidates: Vec<Option<String>> = if gallery.is_empty() {
        document.select(&fallback_sel).map(image_src).collect()
    } else {
        gallery
            .iter()
            .map(|li| li.select(&img_sel).next().and_then(image_src))
            .collect()
    };

    indices
        .iter()
        .filter_map(|index| index.checked_sub(1))
        .filter_map(|pos| candidates.get(pos).cloned().flatten())
        .map(|src| absolutize_url(page_url, &src))
        .collect()
}

/// Station-local timestamp in one of the layouts the station pages use.
pub fn parse_station_time(raw: &str, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = clean_text(raw);
    if text.is_empty() {
        return None;
    }
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(local) = NaiveDateTime::parse_from_str(&text, format) {
            return zoned_to_utc(local, tz);
        }
    }

    let today = now.with_timezone(&tz).date_naive();
    let parse_clock = |clock: &str| {
        NaiveTime::parse_from_str(clock, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(clock, "%I:%M %p"))
            .or_else(|_| NaiveTime::parse_from_str(clock, "%I:%M%p"))
            .ok()
    };

    if let Some(time) = parse_clock(&text) {
        return zoned_to_utc(today.and_time(time), tz);
    }

    let tokens: Vec<&str> = text.split(' ').collect();
    if tokens.len() < 3 {
        return None;
    }
    let date = parse_month_day(&tokens[..2].join(" "), today)?;
    let time = parse_clock(&tokens[2..].join(" "))?;
    zoned_to_utc(date.and_time(time), tz)
}

/// Typed readings for one station. The AI label, when present, only
/// applies to the most recent reading.
pub fn station_readings(
    rows: &[RawRow],
    station: &str,
    tz: Tz,
    now: DateTime<Utc>,
    ai_label: Option<SkyLabel>,
    webcams: &[String],
    station_page_id: Option<&str>,
) -> Vec<StationReading> {
    let mut readings: Vec<StationReading> = rows
        .iter()
        .filter_map(|raw| {
            let time = match raw.get("time") {
                Some(value) => match parse_station_time(value, tz, now) {
                    Some(time) => time,
                    None => {
                        debug!(%station, time = %value, "station row with unreadable time dropped");
                        return None;
                    }
                },
                None => now,
            };
            let decimal = |key: &str| raw.get(key).and_then(|v| parse_decimal(v));
            Some(StationReading {
                station: station.to_string(),
                time,
                temperature_c: decimal("temp"),
                wind_chill_c: decimal("wind_chill"),
                wind_speed_kmh: decimal("wind_speed"),
                wind_direction: raw
                    .get("wind_direction")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty() && v != "-"),
                humidity_pct: decimal("humidity"),
                pressure_mb: decimal("pressure"),
                snow_depth_cm: decimal("snow_depth"),
                new_snow_cm: decimal("new_snow"),
                precipitation_mm: decimal("precip"),
                condition: String::new(),
                webcams: Vec::new(),
                station_page_id: station_page_id.map(ToString::to_string),
            })
        })
        .collect();

    readings.sort_by_key(|reading| reading.time);
    let latest = readings.len().checked_sub(1);

    for (index, reading) in readings.iter_mut().enumerate() {
        let is_latest = Some(index) == latest;
        let precipitating = reading.new_snow_cm.is_some_and(|v| v > 0.0)
            || reading.precipitation_mm.is_some_and(|v| v > 0.0);
        reading.condition = sky_condition(&SkyInputs {
            temperature_c: reading.temperature_c,
            humidity_pct: reading.humidity_pct,
            wind_speed_kmh: reading.wind_speed_kmh,
            precipitating,
            local_hour: local_hour(reading.time, tz),
            ai_label: if is_latest { ai_label } else { None },
        });
        if is_latest {
            reading.webcams = webcams.to_vec();
        }
    }

    readings
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LIFTS: &str = r#"
        <div class="row"><div class="cell">Lift Name</div><div class="cell">Bottom</div><div class="cell">Top</div></div>
        <div class="row"><div class="cell">Lift A</div><div class="cell">1,100</div><div class="cell">2,200</div></div>
        <div class="row"><div class="cell">Broken</div><div class="cell">1,000</div></div>
    "#;

    #[test]
    fn lifts_end_to_end() {
        let extracted = extract_lifts(LIFTS);
        assert_eq!(extracted.rows.len(), 1);
        let lifts = lifts_from_rows(&extracted.rows);
        assert_eq!(lifts.len(), 1);
        assert_eq!(lifts[0].bottom_m, 1100);
        assert_eq!(lifts[0].top_m, 2200);
        assert_eq!(
            crate::model::CanonicalRow::identity_key(&lifts[0]).to_string(),
            "lift a"
        );
    }

    #[test]
    fn history_chunks_after_base_anchor() {
        let html = r#"
            <div id="content_history">
              <div>Date</div><div>Snowfall</div><div>Season</div><div>Base</div>
              <div>Dec 4</div><div>12 cm</div><div>180 cm</div><div>150 cm</div>
              <div>Dec 3</div><div>0 cm</div><div>168 cm</div><div>141 cm</div>
              <div>Dec 2</div><div>5 cm</div>
            </div>
        "#;
        let extracted = extract_history(html);
        assert_eq!(extracted.rows.len(), 2);

        let today = NaiveDate::from_ymd_opt(2025, 12, 10).unwrap();
        let records = history_from_rows(&extracted.rows, today, Some("season-1"));
        assert_eq!(records[0].date, NaiveDate::from_ymd_opt(2025, 12, 4).unwrap());
        assert_eq!(records[0].new_snow_cm, 12);
        assert_eq!(records[0].season_total_cm, 180);
        assert_eq!(records[0].base_cm, 150);
        assert_eq!(records[1].season_page_id.as_deref(), Some("season-1"));
    }

    #[test]
    fn history_without_anchor_is_empty() {
        assert!(extract_history("<div id=\"content_history\">nothing</div>").rows.is_empty());
        assert!(extract_history("<p>no container</p>").rows.is_empty());
    }

    #[test]
    fn station_table_maps_headers() {
        let html = r#"
            <table class="station-data">
              <tr><th>Time</th><th>Temp</th><th>Wind Speed</th><th>Wind Dir</th><th>RH</th><th>New Snow</th></tr>
              <tr><td>2025-12-08 09:00</td><td>-6.5°C</td><td>12 km/h</td><td>SW</td><td>72%</td><td>0 cm</td></tr>
              <tr><td>2025-12-08 10:00</td><td>-5.0°C</td><td>40 km/h</td><td>W</td><td>91%</td><td>2 cm</td></tr>
              <tr><td>short</td></tr>
            </table>
        "#;
        let extracted = extract_station(html);
        assert_eq!(extracted.rows.len(), 2);
        assert_eq!(extracted.rows[0].get("wind_direction").map(String::as_str), Some("SW"));

        let tz = chrono_tz::America::Vancouver;
        let now = Utc.with_ymd_and_hms(2025, 12, 8, 19, 0, 0).unwrap();
        let readings = station_readings(
            &extracted.rows,
            "Roundhouse",
            tz,
            now,
            Some(SkyLabel::Bluebird),
            &["https://cams.example/1.jpg".to_string()],
            None,
        );
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].time, Utc.with_ymd_and_hms(2025, 12, 8, 17, 0, 0).unwrap());
        assert_eq!(readings[0].condition, "Cloudy");
        assert!(readings[0].webcams.is_empty());
        assert_eq!(readings[1].condition, "Snowing & Windy");
        assert_eq!(readings[1].webcams.len(), 1);
    }

    #[test]
    fn station_falls_back_to_headline_temperature() {
        let extracted = extract_station(r#"<span class="tempValue">-2.1°C</span>"#);
        let now = Utc.with_ymd_and_hms(2025, 12, 8, 20, 0, 0).unwrap();
        let readings = station_readings(
            &extracted.rows,
            "Peak",
            chrono_tz::America::Vancouver,
            now,
            Some(SkyLabel::Sunny),
            &[],
            Some("station-1"),
        );
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].time, now);
        assert_eq!(readings[0].temperature_c, Some(-2.1));
        assert_eq!(readings[0].condition, "Sunny");
    }

    #[test]
    fn parses_month_day_station_times() {
        let tz = chrono_tz::America::Vancouver;
        let now = Utc.with_ymd_and_hms(2025, 12, 8, 20, 0, 0).unwrap();
        assert_eq!(
            parse_station_time("Dec 08 9:30 AM", tz, now),
            Some(Utc.with_ymd_and_hms(2025, 12, 8, 17, 30, 0).unwrap())
        );
        assert_eq!(
            parse_station_time("Dec 8 14:00", tz, now),
            Some(Utc.with_ymd_and_hms(2025, 12, 8, 22, 0, 0).unwrap())
        );
        assert_eq!(parse_station_time("soon", tz, now), None);
    }

    #[test]
    fn picks_gallery_frames_by_position() {
        let html = r#"
            <div id="cam-gallery"><ul class="thumbnail-list">
              <li><img src="/cams/one.jpg"></li>
              <li><img data-src="/cams/two.jpg"></li>
            </ul></div>
        "#;
        let urls = extract_webcams(html, &[2, 5], "https://whistlerpeak.com/temps/peak/");
        assert_eq!(urls, vec!["https://whistlerpeak.com/cams/two.jpg".to_string()]);

        let fallback = r#"<div class="webcam-image"><img src="https://cams.example/a.jpg"></div>"#;
        assert_eq!(
            extract_webcams(fallback, &[1], "https://whistlerpeak.com/temps/peak/"),
            vec!["https://cams.example/a.jpg".to_string()]
        );
    }
}
