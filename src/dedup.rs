use crate::model::{CanonicalRow, IdentityKey, SnowfallRecord, columns};
use crate::store::{Filter, RowStore, StoreError, query_all};
use std::collections::HashSet;
use tracing::debug;

/// Identity keys of every stored row matching `filter`.
pub fn existing_keys<R: CanonicalRow>(
    store: &dyn RowStore,
    database_id: &str,
    filter: Option<&Filter>,
) -> Result<HashSet<IdentityKey>, StoreError> {
    let rows = query_all(store, database_id, filter)?;
    let total = rows.len();
    let keys: HashSet<IdentityKey> = rows.iter().filter_map(R::key_from_stored).collect();
    debug!(
        database = %database_id,
        rows = total,
        keys = keys.len(),
        "loaded existing identity keys"
    );
    Ok(keys)
}

/// Rows whose key is neither stored nor already seen earlier in the batch,
/// in input order.
pub fn diff<R: CanonicalRow>(rows: Vec<R>, existing: &HashSet<IdentityKey>) -> Vec<R> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let key = row.identity_key();
            !existing.contains(&key) && seen.insert(key)
        })
        .collect()
}

/// Latest report rows for one elevation.
pub fn forecast_filter(elevation: &str) -> Filter {
    Filter::And(vec![
        Filter::TitleStartsWith {
            property: columns::FORECAST_TITLE.to_string(),
            value: elevation.to_string(),
        },
        Filter::FormulaCheckbox {
            property: columns::FORECAST_LATEST.to_string(),
            equals: true,
        },
    ])
}

pub fn station_filter(station: &str) -> Filter {
    Filter::TitleStartsWith {
        property: columns::CONDITION_NAME.to_string(),
        value: format!("{station} - "),
    }
}

/// Bounds the history query by the earliest scraped day.
pub fn history_filter(records: &[SnowfallRecord]) -> Option<Filter> {
    records
        .iter()
        .map(|record| record.date)
        .min()
        .map(|date| Filter::DateOnOrAfter {
            property: columns::HISTORY_DATE.to_string(),
            date,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Lift;
    use crate::store::{MemoryStore, PropertyValue};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn lift(name: &str) -> Lift {
        Lift {
            name: name.to_string(),
            bottom_m: 600,
            top_m: 1800,
        }
    }

    #[test]
    fn diff_keeps_only_unseen_keys_in_order() {
        let existing: HashSet<IdentityKey> =
            [IdentityKey::name("k1"), IdentityKey::name("k2")].into_iter().collect();
        let fresh = diff(vec![lift("K1"), lift("K2"), lift("K3")], &existing);
        assert_eq!(fresh, vec![lift("K3")]);
    }

    #[test]
    fn diff_drops_duplicates_within_batch() {
        let fresh = diff(vec![lift("A"), lift("B"), lift(" a ")], &HashSet::new());
        assert_eq!(fresh, vec![lift("A"), lift("B")]);
    }

    #[test]
    fn second_pass_finds_nothing_new() {
        let store = MemoryStore::default();
        store.create_database("lifts", &[]);
        let mut props = BTreeMap::new();
        props.insert(
            columns::LIFT_NAME.to_string(),
            PropertyValue::title("fitzsimmons express "),
        );
        store.seed("lifts", props);

        let existing = existing_keys::<Lift>(&store, "lifts", None).unwrap();
        let fresh = diff(vec![lift("Fitzsimmons Express")], &existing);
        assert!(fresh.is_empty());
    }

    #[test]
    fn history_filter_uses_earliest_day() {
        let record = |day: u32| SnowfallRecord {
            date: NaiveDate::from_ymd_opt(2025, 12, day).unwrap(),
            new_snow_cm: 0,
            season_total_cm: 0,
            base_cm: 0,
            season_page_id: None,
        };
        let filter = history_filter(&[record(4), record(2), record(3)]).unwrap();
        assert_eq!(
            filter,
            Filter::DateOnOrAfter {
                property: "date".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 12, 2).unwrap(),
            }
        );
        assert!(history_filter(&[]).is_none());
    }

    #[test]
    fn station_filter_includes_separator() {
        let filter = station_filter("Peak");
        assert_eq!(filter.to_json()["title"]["starts_with"], "Peak - ");
    }
}
